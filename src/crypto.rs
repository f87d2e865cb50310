//! Cryptographic primitives shared by every protocol surface.
//!
//! Ed25519 signing/verification via `ed25519-dalek`, SHA-256 via `sha2`,
//! deterministic JSON canonicalization (sorted keys, compact separators),
//! nonce and identifier generation, and millisecond-resolution ISO 8601
//! timestamps. All hex in the protocol is lowercase, unpadded, and
//! exact-length; decoding helpers here reject anything else.

use crate::Error;
use ed25519_dalek::{Signer, Verifier};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// An Ed25519 key pair with the hex encoding of its public half.
pub struct KeyPair {
    pub signing_key: ed25519_dalek::SigningKey,
    pub verifying_key: ed25519_dalek::VerifyingKey,
    pub public_key_hex: String,
}

/// Generate a fresh Ed25519 key pair from the system CSPRNG.
pub fn generate_key_pair() -> Result<KeyPair, Error> {
    let mut rng = rand::thread_rng();
    let mut secret = [0u8; 32];
    rng.fill_bytes(&mut secret);
    let kp = key_pair_from_private_key(&secret)?;
    // The stack copy of the seed is no longer needed once the signing key
    // owns it; SigningKey zeroes its own buffer on drop.
    secret.fill(0);
    Ok(kp)
}

/// Reconstruct a `KeyPair` from a 32-byte private key.
///
/// # Errors
/// Returns `Error::Crypto` if the slice is not exactly 32 bytes.
pub fn key_pair_from_private_key(bytes: &[u8]) -> Result<KeyPair, Error> {
    let secret: [u8; 32] = bytes.try_into().map_err(|_| {
        Error::Crypto(format!("private key must be 32 bytes, got {}", bytes.len()))
    })?;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(&secret);
    let verifying_key = signing_key.verifying_key();
    let public_key_hex = hex::encode(verifying_key.as_bytes());
    Ok(KeyPair {
        signing_key,
        verifying_key,
        public_key_hex,
    })
}

/// Parse a lowercase-hex Ed25519 public key.
///
/// # Errors
/// Returns `Error::Crypto` on malformed hex, wrong length, or a point
/// that is not a valid public key.
pub fn verifying_key_from_hex(public_key_hex: &str) -> Result<ed25519_dalek::VerifyingKey, Error> {
    let bytes = decode_hex_exact(public_key_hex, 32, "public key")?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Crypto("public key must be 32 bytes".to_string()))?;
    ed25519_dalek::VerifyingKey::from_bytes(&arr)
        .map_err(|e| Error::Crypto(format!("invalid public key: {e}")))
}

/// Decode a lowercase hex string of an exact byte length.
///
/// # Errors
/// Returns `Error::Crypto` on uppercase digits, non-hex characters, or a
/// length mismatch.
pub fn decode_hex_exact(s: &str, expected_len: usize, what: &str) -> Result<Vec<u8>, Error> {
    if s.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(Error::Crypto(format!("{what} hex must be lowercase")));
    }
    let bytes = hex::decode(s).map_err(|e| Error::Crypto(format!("malformed {what} hex: {e}")))?;
    if bytes.len() != expected_len {
        return Err(Error::Crypto(format!(
            "{what} must be {expected_len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Sign a message, returning the 64-byte detached signature.
pub fn sign(message: &[u8], signing_key: &ed25519_dalek::SigningKey) -> Result<Vec<u8>, Error> {
    let signature = signing_key.sign(message);
    Ok(signature.to_bytes().to_vec())
}

/// Verify a detached Ed25519 signature.
///
/// Never panics; any malformed input is treated as an invalid signature.
pub fn verify(
    message: &[u8],
    signature: &[u8],
    verifying_key: &ed25519_dalek::VerifyingKey,
) -> bool {
    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &sig).is_ok()
}

/// Verify a hex-encoded signature against a hex-encoded public key.
///
/// Convenience used by every document verifier; malformed hex on either
/// side yields `false` rather than an error.
pub fn verify_hex(message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
    let sig = match decode_hex_exact(signature_hex, 64, "signature") {
        Ok(b) => b,
        Err(_) => return false,
    };
    let vk = match verifying_key_from_hex(public_key_hex) {
        Ok(k) => k,
        Err(_) => return false,
    };
    verify(message, &sig, &vk)
}

/// SHA-256 of raw bytes, as the 32-byte digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of raw bytes, as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// SHA-256 of a UTF-8 string, as lowercase hex.
pub fn sha256_string(data: &str) -> String {
    sha256_hex(data.as_bytes())
}

/// SHA-256 of a JSON value after canonicalization.
///
/// Structurally equal values hash identically regardless of key order.
pub fn sha256_object(obj: &serde_json::Value) -> String {
    sha256_string(&canonicalize_json(obj))
}

/// Deterministic JSON serialization.
///
/// Recursively sorts object keys lexicographically, keeps arrays in
/// source order, and emits compact separators. Numbers take serde_json's
/// shortest round-trippable form. `null` values are preserved where they
/// appear; optional fields are elided before canonicalization by the
/// document types themselves.
pub fn canonicalize_json(obj: &serde_json::Value) -> String {
    let sorted = sort_keys(obj);
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted_map = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted_map.insert(key.clone(), sort_keys(v));
                }
            }
            serde_json::Value::Object(sorted_map)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

/// Generate the 16-byte random nonce carried by covenant documents.
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a random 32-byte identifier as 64 lowercase hex characters.
pub fn generate_id() -> String {
    let mut id = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut id);
    hex::encode(id)
}

/// Constant-time comparison of two byte slices.
///
/// True only when both slices have identical length and contents; the
/// comparison touches every byte to avoid timing side channels.
pub fn constant_time_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.sssZ`.
pub fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse an ISO 8601 timestamp, accepting RFC 3339 and the millisecond
/// form emitted by [`timestamp`].
pub fn parse_timestamp(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&chrono::Utc));
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3fZ") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return Some(dt.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_sign_verify() {
        let kp = generate_key_pair().unwrap();
        let message = b"bound by covenant";
        let sig = sign(message, &kp.signing_key).unwrap();
        assert!(verify(message, &sig, &kp.verifying_key));
        assert!(!verify(b"tampered", &sig, &kp.verifying_key));
    }

    #[test]
    fn test_verify_hex_rejects_malformed_inputs() {
        let kp = generate_key_pair().unwrap();
        let sig = sign(b"msg", &kp.signing_key).unwrap();
        let sig_hex = hex::encode(&sig);
        assert!(verify_hex(b"msg", &sig_hex, &kp.public_key_hex));
        assert!(!verify_hex(b"msg", "zz", &kp.public_key_hex));
        assert!(!verify_hex(b"msg", &sig_hex, "not-hex"));
        assert!(!verify_hex(b"msg", &sig_hex.to_uppercase(), &kp.public_key_hex));
    }

    #[test]
    fn test_verifying_key_from_hex_length() {
        assert!(verifying_key_from_hex("abcd").is_err());
    }

    #[test]
    fn test_sha256_known_value() {
        let hash = sha256_string("hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(hex::encode(sha256(b"hello")), hash);
    }

    #[test]
    fn test_canonicalize_json_sorts_keys() {
        let obj: serde_json::Value = serde_json::json!({"z": 1, "a": 2});
        assert_eq!(canonicalize_json(&obj), r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn test_canonicalize_json_preserves_null_and_arrays() {
        let obj = serde_json::json!({"b": [3, 1, 2], "a": null});
        assert_eq!(canonicalize_json(&obj), r#"{"a":null,"b":[3,1,2]}"#);
    }

    #[test]
    fn test_sha256_object_determinism() {
        let a = serde_json::json!({"z": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "z": 1});
        assert_eq!(sha256_object(&a), sha256_object(&b));
    }

    #[test]
    fn test_nonce_and_id_lengths() {
        assert_eq!(generate_nonce().len(), 16);
        let id = generate_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_id(), id);
    }

    #[test]
    fn test_constant_time_equal() {
        assert!(constant_time_equal(b"abc", b"abc"));
        assert!(!constant_time_equal(b"abc", b"abd"));
        assert!(!constant_time_equal(b"ab", b"abc"));
        assert!(constant_time_equal(b"", b""));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = timestamp();
        assert!(ts.ends_with('Z'));
        assert!(parse_timestamp(&ts).is_some());
        assert!(parse_timestamp("2026-01-01T00:00:00Z").is_some());
        assert!(parse_timestamp("not a time").is_none());
    }
}
