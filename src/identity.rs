//! Agent identity creation, evolution, and verification.
//!
//! An identity binds an operator key, a model attestation, a capability
//! manifest, and a deployment record into a content-addressed id. Every
//! change appends an operator-signed lineage entry, so the full history
//! of what an agent was is verifiable from the document alone.

use crate::covenant::{VerificationCheck, VerificationResult};
use crate::{crypto, BuildErrorKind, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Why a lineage entry was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    CapabilityChange,
    ModelUpdate,
    DeploymentChange,
    OperatorRotation,
    ReputationReset,
}

/// Attestation about the model powering an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAttestation {
    pub provider: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
    pub version: String,
    #[serde(rename = "attestationHash", skip_serializing_if = "Option::is_none")]
    pub attestation_hash: Option<String>,
}

/// Where and how an agent is deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// One operator-signed entry in an identity's lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEntry {
    #[serde(rename = "changeType")]
    pub change_type: ChangeType,
    pub description: String,
    pub timestamp: String,
    #[serde(rename = "identityHash")]
    pub identity_hash: String,
    /// Null for the root entry; the schema admits the explicit null.
    #[serde(rename = "parentHash")]
    pub parent_hash: Option<String>,
    #[serde(rename = "reputationCarryForward")]
    pub reputation_carry_forward: bool,
    /// Recorded only on `operator_rotation` entries: the outgoing key,
    /// which signs the handoff. Entries at or before a rotation verify
    /// under this key; entries after the last rotation verify under the
    /// identity's current operator key.
    #[serde(
        rename = "previousOperatorPublicKey",
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_operator_public_key: Option<String>,
    pub signature: String,
}

/// A complete agent identity with its lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub id: String,
    #[serde(rename = "operatorPublicKey")]
    pub operator_public_key: String,
    #[serde(rename = "operatorIdentifier")]
    pub operator_identifier: String,
    pub model: ModelAttestation,
    pub capabilities: Vec<String>,
    #[serde(rename = "capabilityManifestHash")]
    pub capability_manifest_hash: String,
    pub deployment: DeploymentRecord,
    pub version: u32,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    pub lineage: Vec<LineageEntry>,
}

/// Inputs for creating a new identity.
pub struct CreateIdentityOptions {
    pub signing_key: ed25519_dalek::SigningKey,
    pub operator_identifier: String,
    pub model: ModelAttestation,
    pub capabilities: Vec<String>,
    pub deployment: DeploymentRecord,
}

/// Updates applied by one evolution step. Absent fields carry over.
///
/// `new_operator_public_key` is required for an `operator_rotation`
/// change and rejected for every other change type; the handoff is
/// signed by the outgoing key in `signing_key`.
pub struct EvolveIdentityOptions {
    pub signing_key: ed25519_dalek::SigningKey,
    pub change_type: ChangeType,
    pub description: String,
    pub model: Option<ModelAttestation>,
    pub capabilities: Option<Vec<String>>,
    pub deployment: Option<DeploymentRecord>,
    pub new_operator_public_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Hash computation
// ---------------------------------------------------------------------------

/// Hash of the sorted capability list's canonical form.
pub fn capability_manifest_hash(capabilities: &[String]) -> String {
    let mut sorted = capabilities.to_vec();
    sorted.sort();
    let value = Value::Array(sorted.into_iter().map(Value::String).collect());
    crypto::sha256_string(&crypto::canonicalize_json(&value))
}

fn model_canonical(model: &ModelAttestation) -> String {
    crypto::canonicalize_json(&serde_json::to_value(model).unwrap_or_default())
}

fn deployment_canonical(deployment: &DeploymentRecord) -> String {
    crypto::canonicalize_json(&serde_json::to_value(deployment).unwrap_or_default())
}

/// Composite content-addressed identity hash.
///
/// SHA-256 over the concatenation of the operator public key, the
/// canonical model attestation, the capability manifest hash, and the
/// canonical deployment record.
pub fn compute_identity_hash(
    operator_public_key: &str,
    model: &ModelAttestation,
    manifest_hash: &str,
    deployment: &DeploymentRecord,
) -> String {
    let mut input = String::new();
    input.push_str(operator_public_key);
    input.push_str(&model_canonical(model));
    input.push_str(manifest_hash);
    input.push_str(&deployment_canonical(deployment));
    crypto::sha256_string(&input)
}

fn lineage_entry_payload(entry: &LineageEntry) -> String {
    let mut value = serde_json::to_value(entry).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("signature".to_string(), Value::String(String::new()));
    }
    crypto::canonicalize_json(&value)
}

fn sign_lineage_entry(
    entry: &mut LineageEntry,
    signing_key: &ed25519_dalek::SigningKey,
) -> Result<(), Error> {
    let payload = lineage_entry_payload(entry);
    let sig_bytes = crypto::sign(payload.as_bytes(), signing_key)?;
    entry.signature = hex::encode(&sig_bytes);
    Ok(())
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

fn missing(field: &str) -> Error {
    Error::Build {
        kind: BuildErrorKind::MissingField,
        message: format!("{field} is required"),
    }
}

/// Create a new agent identity.
///
/// Sorts the capabilities, derives the manifest hash and composite id,
/// and appends the root lineage entry (`created`, null parent,
/// reputation carried forward) signed by the operator key.
pub fn create_identity(opts: CreateIdentityOptions) -> Result<AgentIdentity, Error> {
    if opts.operator_identifier.is_empty() {
        return Err(missing("operatorIdentifier"));
    }
    if opts.model.provider.is_empty() || opts.model.model_id.is_empty() {
        return Err(missing("model.provider and model.modelId"));
    }
    if opts.capabilities.is_empty() {
        return Err(missing("capabilities"));
    }
    if opts.deployment.runtime.is_empty() {
        return Err(missing("deployment.runtime"));
    }

    let operator_public_key = hex::encode(opts.signing_key.verifying_key().as_bytes());
    let mut capabilities = opts.capabilities;
    capabilities.sort();

    let manifest_hash = capability_manifest_hash(&capabilities);
    let id = compute_identity_hash(&operator_public_key, &opts.model, &manifest_hash, &opts.deployment);
    let now = crypto::timestamp();

    let mut entry = LineageEntry {
        change_type: ChangeType::Created,
        description: "identity created".to_string(),
        timestamp: now.clone(),
        identity_hash: id.clone(),
        parent_hash: None,
        reputation_carry_forward: true,
        previous_operator_public_key: None,
        signature: String::new(),
    };
    sign_lineage_entry(&mut entry, &opts.signing_key)?;

    Ok(AgentIdentity {
        id,
        operator_public_key,
        operator_identifier: opts.operator_identifier,
        model: opts.model,
        capabilities,
        capability_manifest_hash: manifest_hash,
        deployment: opts.deployment,
        version: 1,
        created_at: now.clone(),
        updated_at: now,
        lineage: vec![entry],
    })
}

// ---------------------------------------------------------------------------
// Evolve
// ---------------------------------------------------------------------------

/// Evolve an identity by applying an update.
///
/// Recomputes the composite id over the updated fields, appends a
/// lineage entry whose parent is the previous id, and bumps the version.
/// Reputation carries forward for every change type except
/// `reputation_reset`.
///
/// An `operator_rotation` change hands the identity to
/// `new_operator_public_key`: the outgoing key signs the rotation entry,
/// the entry records that outgoing key, and the returned identity is
/// governed by the incoming key from then on.
///
/// # Errors
/// `Error::State` for a `created` change type outside the root entry or
/// a new operator key on a non-rotation change, `Error::Build` with
/// `missing_field` for a rotation without one, `Error::Crypto` when the
/// signing key is not the identity's current operator key.
pub fn evolve_identity(
    identity: &AgentIdentity,
    opts: EvolveIdentityOptions,
) -> Result<AgentIdentity, Error> {
    if opts.change_type == ChangeType::Created {
        return Err(Error::State(
            "'created' is only valid for the root lineage entry".to_string(),
        ));
    }
    if opts.description.is_empty() {
        return Err(missing("description"));
    }
    let signer_public_key = hex::encode(opts.signing_key.verifying_key().as_bytes());
    if signer_public_key != identity.operator_public_key {
        return Err(Error::Crypto(
            "evolution must be signed by the identity's current operator key".to_string(),
        ));
    }

    let operator_public_key = match (opts.change_type, &opts.new_operator_public_key) {
        (ChangeType::OperatorRotation, Some(new_key)) => {
            crypto::verifying_key_from_hex(new_key)?;
            new_key.clone()
        }
        (ChangeType::OperatorRotation, None) => return Err(missing("newOperatorPublicKey")),
        (_, Some(_)) => {
            return Err(Error::State(
                "newOperatorPublicKey is only valid with an operator_rotation change".to_string(),
            ))
        }
        (_, None) => identity.operator_public_key.clone(),
    };

    let model = opts.model.unwrap_or_else(|| identity.model.clone());
    let mut capabilities = opts
        .capabilities
        .unwrap_or_else(|| identity.capabilities.clone());
    capabilities.sort();
    let deployment = opts
        .deployment
        .unwrap_or_else(|| identity.deployment.clone());

    let manifest_hash = capability_manifest_hash(&capabilities);
    let new_id = compute_identity_hash(&operator_public_key, &model, &manifest_hash, &deployment);
    let now = crypto::timestamp();

    let mut entry = LineageEntry {
        change_type: opts.change_type,
        description: opts.description,
        timestamp: now.clone(),
        identity_hash: new_id.clone(),
        parent_hash: Some(identity.id.clone()),
        reputation_carry_forward: opts.change_type != ChangeType::ReputationReset,
        previous_operator_public_key: (opts.change_type == ChangeType::OperatorRotation)
            .then(|| identity.operator_public_key.clone()),
        signature: String::new(),
    };
    // The outgoing key signs the handoff; later entries are signed by
    // the incoming key.
    sign_lineage_entry(&mut entry, &opts.signing_key)?;

    let mut lineage = identity.lineage.clone();
    lineage.push(entry);

    Ok(AgentIdentity {
        id: new_id,
        operator_public_key,
        operator_identifier: identity.operator_identifier.clone(),
        model,
        capabilities,
        capability_manifest_hash: manifest_hash,
        deployment,
        version: identity.version + 1,
        created_at: identity.created_at.clone(),
        updated_at: now,
        lineage,
    })
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Verify an identity's composite hash, lineage, and manifest.
///
/// Check order: `id_match, lineage_signatures, lineage_chain,
/// capability_manifest, version_match`.
pub fn verify_identity(identity: &AgentIdentity) -> VerificationResult {
    let mut checks: Vec<VerificationCheck> = Vec::new();

    let expected_id = compute_identity_hash(
        &identity.operator_public_key,
        &identity.model,
        &identity.capability_manifest_hash,
        &identity.deployment,
    );
    checks.push(VerificationCheck::new(
        "id_match",
        identity.id == expected_id,
        if identity.id == expected_id {
            "identity id matches composite hash".to_string()
        } else {
            format!("id mismatch: expected {expected_id}, got {}", identity.id)
        },
    ));

    let mut bad_signatures: Vec<usize> = Vec::new();
    for (i, entry) in identity.lineage.iter().enumerate() {
        let payload = lineage_entry_payload(entry);
        let signer = lineage_signer_key(identity, i);
        if !crypto::verify_hex(payload.as_bytes(), &entry.signature, signer) {
            bad_signatures.push(i);
        }
    }
    checks.push(VerificationCheck::new(
        "lineage_signatures",
        bad_signatures.is_empty(),
        if bad_signatures.is_empty() {
            format!("all {} lineage signature(s) verify", identity.lineage.len())
        } else {
            format!("lineage entries {bad_signatures:?} have invalid signatures")
        },
    ));

    let (chain_ok, chain_msg) = check_lineage_chain(&identity.lineage);
    checks.push(VerificationCheck::new("lineage_chain", chain_ok, chain_msg));

    let expected_manifest = capability_manifest_hash(&identity.capabilities);
    checks.push(VerificationCheck::new(
        "capability_manifest",
        identity.capability_manifest_hash == expected_manifest,
        if identity.capability_manifest_hash == expected_manifest {
            "capability manifest hash matches".to_string()
        } else {
            "capability manifest hash does not match the capability list".to_string()
        },
    ));

    let version_ok = identity.version as usize == identity.lineage.len();
    checks.push(VerificationCheck::new(
        "version_match",
        version_ok,
        if version_ok {
            format!("version {} matches lineage length", identity.version)
        } else {
            format!(
                "version {} does not match lineage length {}",
                identity.version,
                identity.lineage.len()
            )
        },
    ));

    VerificationResult::from_checks(checks)
}

/// The key that signed lineage entry `index`.
///
/// A rotation entry is signed by the outgoing key it records, and so is
/// everything before it in the same era; entries after the last rotation
/// verify under the identity's current operator key.
fn lineage_signer_key<'a>(identity: &'a AgentIdentity, index: usize) -> &'a str {
    identity.lineage[index..]
        .iter()
        .find(|e| e.change_type == ChangeType::OperatorRotation)
        .and_then(|e| e.previous_operator_public_key.as_deref())
        .unwrap_or(&identity.operator_public_key)
}

fn check_lineage_chain(lineage: &[LineageEntry]) -> (bool, String) {
    let Some(first) = lineage.first() else {
        return (false, "lineage is empty".to_string());
    };
    if first.parent_hash.is_some() {
        return (false, "root lineage entry must have a null parent".to_string());
    }
    if first.change_type != ChangeType::Created {
        return (false, "root lineage entry must be 'created'".to_string());
    }

    for (i, entry) in lineage.iter().enumerate() {
        let is_rotation = entry.change_type == ChangeType::OperatorRotation;
        if is_rotation && entry.previous_operator_public_key.is_none() {
            return (
                false,
                format!("rotation entry {i} does not record the outgoing operator key"),
            );
        }
        if !is_rotation && entry.previous_operator_public_key.is_some() {
            return (
                false,
                format!("lineage entry {i} records an outgoing operator key without a rotation"),
            );
        }
    }

    let mut previous = first;
    for (i, entry) in lineage.iter().enumerate().skip(1) {
        match &entry.parent_hash {
            Some(parent) if *parent == previous.identity_hash => {}
            Some(_) => {
                return (
                    false,
                    format!("lineage entry {i} does not link to its predecessor"),
                )
            }
            None => return (false, format!("lineage entry {i} has no parent hash")),
        }
        let ordered = match (
            crypto::parse_timestamp(&previous.timestamp),
            crypto::parse_timestamp(&entry.timestamp),
        ) {
            (Some(a), Some(b)) => a <= b,
            _ => false,
        };
        if !ordered {
            return (
                false,
                format!("lineage entry {i} timestamp precedes its predecessor"),
            );
        }
        previous = entry;
    }

    (true, "lineage chain is valid".to_string())
}

// ---------------------------------------------------------------------------
// Wire serialization
// ---------------------------------------------------------------------------

/// Serialize an identity to its canonical JSON wire form.
pub fn serialize_identity(identity: &AgentIdentity) -> Result<String, Error> {
    let value = serde_json::to_value(identity)
        .map_err(|e| Error::Serialization(format!("serialize identity: {e}")))?;
    Ok(crypto::canonicalize_json(&value))
}

/// Deserialize and shape-check an identity from its wire form.
///
/// # Errors
/// `Error::Deserialize` naming the first missing or invalid field.
pub fn deserialize_identity(json: &str) -> Result<AgentIdentity, Error> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::Serialization(format!("identity is not valid JSON: {e}")))?;
    let obj = value.as_object().ok_or_else(|| Error::Deserialize {
        field: "identity".to_string(),
    })?;

    for field in [
        "id",
        "operatorPublicKey",
        "operatorIdentifier",
        "model",
        "capabilities",
        "capabilityManifestHash",
        "deployment",
        "version",
        "createdAt",
        "updatedAt",
        "lineage",
    ] {
        if !obj.contains_key(field) {
            return Err(Error::Deserialize {
                field: field.to_string(),
            });
        }
    }

    serde_json::from_value(value).map_err(|e| Error::Deserialize {
        field: e
            .to_string()
            .split('`')
            .nth(1)
            .unwrap_or("identity")
            .to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_options(kp: &crypto::KeyPair) -> CreateIdentityOptions {
        CreateIdentityOptions {
            signing_key: kp.signing_key.clone(),
            operator_identifier: "operator-1".to_string(),
            model: ModelAttestation {
                provider: "anthropic".to_string(),
                model_id: "claude-sonnet".to_string(),
                version: "4".to_string(),
                attestation_hash: None,
            },
            capabilities: vec!["write".to_string(), "read".to_string()],
            deployment: DeploymentRecord {
                runtime: "container".to_string(),
                region: Some("us-east".to_string()),
                endpoint: None,
            },
        }
    }

    #[test]
    fn test_create_identity() {
        let kp = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&kp)).unwrap();
        assert_eq!(identity.id.len(), 64);
        assert_eq!(identity.version, 1);
        assert_eq!(identity.lineage.len(), 1);
        assert_eq!(identity.lineage[0].change_type, ChangeType::Created);
        assert!(identity.lineage[0].parent_hash.is_none());
        // Capabilities are stored sorted.
        assert_eq!(identity.capabilities, ["read", "write"]);

        let report = verify_identity(&identity);
        assert!(report.valid, "failed: {:?}", report.first_failure());
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "id_match",
                "lineage_signatures",
                "lineage_chain",
                "capability_manifest",
                "version_match"
            ]
        );
    }

    #[test]
    fn test_evolve_links_lineage() {
        let kp = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&kp)).unwrap();
        let evolved = evolve_identity(
            &identity,
            EvolveIdentityOptions {
                signing_key: kp.signing_key.clone(),
                change_type: ChangeType::CapabilityChange,
                description: "added network capability".to_string(),
                model: None,
                capabilities: Some(vec![
                    "read".to_string(),
                    "write".to_string(),
                    "network".to_string(),
                ]),
                deployment: None,
                new_operator_public_key: None,
            },
        )
        .unwrap();

        assert_ne!(evolved.id, identity.id);
        assert_eq!(evolved.version, 2);
        assert_eq!(evolved.lineage.len(), 2);
        assert_eq!(evolved.lineage[1].parent_hash.as_deref(), Some(identity.id.as_str()));
        assert!(evolved.lineage[1].reputation_carry_forward);
        assert!(verify_identity(&evolved).valid);
    }

    #[test]
    fn test_reputation_reset_drops_carry_forward() {
        let kp = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&kp)).unwrap();
        let reset = evolve_identity(
            &identity,
            EvolveIdentityOptions {
                signing_key: kp.signing_key.clone(),
                change_type: ChangeType::ReputationReset,
                description: "fresh start".to_string(),
                model: None,
                capabilities: None,
                deployment: None,
                new_operator_public_key: None,
            },
        )
        .unwrap();
        assert!(!reset.lineage[1].reputation_carry_forward);
    }

    #[test]
    fn test_evolve_rejects_foreign_key() {
        let kp = crypto::generate_key_pair().unwrap();
        let intruder = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&kp)).unwrap();
        let err = evolve_identity(
            &identity,
            EvolveIdentityOptions {
                signing_key: intruder.signing_key,
                change_type: ChangeType::ModelUpdate,
                description: "hijack".to_string(),
                model: None,
                capabilities: None,
                deployment: None,
                new_operator_public_key: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_operator_rotation_hands_off_to_new_key() {
        let old_kp = crypto::generate_key_pair().unwrap();
        let new_kp = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&old_kp)).unwrap();

        let rotated = evolve_identity(
            &identity,
            EvolveIdentityOptions {
                signing_key: old_kp.signing_key.clone(),
                change_type: ChangeType::OperatorRotation,
                description: "quarterly key rotation".to_string(),
                model: None,
                capabilities: None,
                deployment: None,
                new_operator_public_key: Some(new_kp.public_key_hex.clone()),
            },
        )
        .unwrap();

        assert_eq!(rotated.operator_public_key, new_kp.public_key_hex);
        assert_ne!(rotated.id, identity.id);
        assert_eq!(
            rotated.lineage[1].previous_operator_public_key.as_deref(),
            Some(old_kp.public_key_hex.as_str())
        );
        let report = verify_identity(&rotated);
        assert!(report.valid, "failed: {:?}", report.first_failure());

        // The outgoing key no longer governs the identity.
        let stale = evolve_identity(
            &rotated,
            EvolveIdentityOptions {
                signing_key: old_kp.signing_key.clone(),
                change_type: ChangeType::ModelUpdate,
                description: "signed with the retired key".to_string(),
                model: None,
                capabilities: None,
                deployment: None,
                new_operator_public_key: None,
            },
        );
        assert!(matches!(stale, Err(Error::Crypto(_))));

        // The incoming key does, and the mixed-era lineage still verifies.
        let evolved = evolve_identity(
            &rotated,
            EvolveIdentityOptions {
                signing_key: new_kp.signing_key.clone(),
                change_type: ChangeType::CapabilityChange,
                description: "added audit capability".to_string(),
                model: None,
                capabilities: Some(vec!["read".to_string(), "audit".to_string()]),
                deployment: None,
                new_operator_public_key: None,
            },
        )
        .unwrap();
        assert_eq!(evolved.version, 3);
        assert!(verify_identity(&evolved).valid);
    }

    #[test]
    fn test_rotation_requires_new_key_and_only_rotation_carries_one() {
        let kp = crypto::generate_key_pair().unwrap();
        let other = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&kp)).unwrap();

        let err = evolve_identity(
            &identity,
            EvolveIdentityOptions {
                signing_key: kp.signing_key.clone(),
                change_type: ChangeType::OperatorRotation,
                description: "rotation without a key".to_string(),
                model: None,
                capabilities: None,
                deployment: None,
                new_operator_public_key: None,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Build {
                kind: BuildErrorKind::MissingField,
                ..
            }
        ));

        let err = evolve_identity(
            &identity,
            EvolveIdentityOptions {
                signing_key: kp.signing_key.clone(),
                change_type: ChangeType::ModelUpdate,
                description: "key smuggled into a model update".to_string(),
                model: None,
                capabilities: None,
                deployment: None,
                new_operator_public_key: Some(other.public_key_hex.clone()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_tampered_rotation_record_fails_verification() {
        let old_kp = crypto::generate_key_pair().unwrap();
        let new_kp = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&old_kp)).unwrap();
        let mut rotated = evolve_identity(
            &identity,
            EvolveIdentityOptions {
                signing_key: old_kp.signing_key.clone(),
                change_type: ChangeType::OperatorRotation,
                description: "rotation".to_string(),
                model: None,
                capabilities: None,
                deployment: None,
                new_operator_public_key: Some(new_kp.public_key_hex.clone()),
            },
        )
        .unwrap();

        // Erasing the outgoing-key record breaks the chain check.
        rotated.lineage[1].previous_operator_public_key = None;
        let report = verify_identity(&rotated);
        assert!(!report.valid);
        assert_eq!(report.first_failure().unwrap().name, "lineage_signatures");
    }

    #[test]
    fn test_tampered_capabilities_fail_verification() {
        let kp = crypto::generate_key_pair().unwrap();
        let mut identity = create_identity(base_options(&kp)).unwrap();
        identity.capabilities.push("admin".to_string());
        let report = verify_identity(&identity);
        assert!(!report.valid);
        assert_eq!(report.first_failure().unwrap().name, "capability_manifest");
    }

    #[test]
    fn test_serialize_roundtrip_preserves_report() {
        let kp = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&kp)).unwrap();
        let json = serialize_identity(&identity).unwrap();
        let restored = deserialize_identity(&json).unwrap();
        assert_eq!(identity.id, restored.id);
        assert_eq!(verify_identity(&identity).valid, verify_identity(&restored).valid);
    }

    #[test]
    fn test_deserialize_names_missing_field() {
        let kp = crypto::generate_key_pair().unwrap();
        let identity = create_identity(base_options(&kp)).unwrap();
        let json = serialize_identity(&identity).unwrap();
        let mut value: Value = serde_json::from_str(&json).unwrap();
        value.as_object_mut().unwrap().remove("lineage");
        let err = deserialize_identity(&value.to_string()).unwrap_err();
        assert!(matches!(err, Error::Deserialize { field } if field == "lineage"));
    }
}
