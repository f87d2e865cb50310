//! Covenant document building, verification, chaining, and serialization.
//!
//! A covenant is a content-addressed, signed commitment between an issuer
//! and a beneficiary, carrying CCL constraints that govern the
//! beneficiary's behavior. Covenants chain through delegation references;
//! a child covenant may only narrow what its ancestors permit.

use crate::{ccl, crypto, BuildErrorKind, ChainErrorKind, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Protocol version accepted by this implementation.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Maximum number of CCL statements a covenant may carry.
pub const MAX_CONSTRAINTS: usize = 256;

/// Maximum depth of a delegation chain.
pub const MAX_CHAIN_DEPTH: u32 = 16;

/// Maximum canonical document size in bytes (128 KiB).
pub const MAX_DOCUMENT_SIZE: usize = 131_072;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Role a party plays in a covenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyRole {
    Issuer,
    Beneficiary,
}

/// How a chained covenant relates to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRelation {
    Delegates,
    Restricts,
    Amends,
}

/// Declared enforcement mechanism for a covenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementKind {
    Capability,
    Monitor,
    Audit,
    Bond,
}

/// Declared proof mechanism for a covenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    CapabilityManifest,
    AuditLog,
    Zkp,
    Tee,
}

/// A participant in a covenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub role: PartyRole,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Enforcement declaration: a kind tag plus opaque configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementDeclaration {
    pub kind: EnforcementKind,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

/// Proof declaration: a kind tag plus opaque configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofDeclaration {
    pub kind: ProofKind,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

/// Reference to a parent covenant in a delegation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainReference {
    #[serde(rename = "parentId")]
    pub parent_id: String,
    pub relation: ChainRelation,
    pub depth: u32,
}

/// Optional descriptive metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CovenantMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// A countersignature added by a third party (auditor, regulator, ...).
///
/// Countersigners sign a detached payload naming the covenant id, so a
/// countersignature never perturbs the covenant's own id or signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Countersignature {
    #[serde(rename = "signerPublicKey")]
    pub signer_public_key: String,
    #[serde(rename = "signerRole")]
    pub signer_role: String,
    pub timestamp: String,
    pub signature: String,
}

/// A complete, signed covenant document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CovenantDocument {
    pub version: String,
    pub id: String,
    pub issuer: Party,
    pub beneficiary: Party,
    pub constraints: String,
    pub nonce: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "activatesAt", skip_serializing_if = "Option::is_none")]
    pub activates_at: Option<String>,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement: Option<EnforcementDeclaration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<ProofDeclaration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CovenantMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countersignatures: Option<Vec<Countersignature>>,
    pub signature: String,
}

/// A single verification check and its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationCheck {
    pub name: String,
    pub passed: bool,
    pub message: String,
}

impl VerificationCheck {
    pub(crate) fn new(name: &str, passed: bool, message: String) -> Self {
        VerificationCheck {
            name: name.to_string(),
            passed,
            message,
        }
    }
}

/// Complete result of verifying a document.
#[derive(Debug, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub checks: Vec<VerificationCheck>,
}

impl VerificationResult {
    pub(crate) fn from_checks(checks: Vec<VerificationCheck>) -> Self {
        let valid = checks.iter().all(|c| c.passed);
        VerificationResult { valid, checks }
    }

    /// The first failing check, if any; callers surface it as the
    /// primary reason.
    pub fn first_failure(&self) -> Option<&VerificationCheck> {
        self.checks.iter().find(|c| !c.passed)
    }
}

/// Inputs for building a new covenant.
pub struct CovenantBuilderOptions {
    pub issuer: Party,
    pub beneficiary: Party,
    pub constraints: String,
    pub signing_key: ed25519_dalek::SigningKey,
    pub activates_at: Option<String>,
    pub expires_at: Option<String>,
    pub enforcement: Option<EnforcementDeclaration>,
    pub proof: Option<ProofDeclaration>,
    pub chain: Option<ChainReference>,
    pub metadata: Option<CovenantMetadata>,
}

/// Yields covenant ancestors by id during chain resolution.
pub trait CovenantResolver {
    fn resolve(&self, id: &str) -> Option<CovenantDocument>;
}

// ---------------------------------------------------------------------------
// Canonical forms
// ---------------------------------------------------------------------------

fn canonical_value(doc: &CovenantDocument, signature_filled: bool) -> Result<Value, Error> {
    let value = serde_json::to_value(doc)
        .map_err(|e| Error::Serialization(format!("covenant to JSON value: {e}")))?;
    let Value::Object(mut obj) = value else {
        return Err(Error::Serialization("covenant must serialize to an object".to_string()));
    };
    obj.insert("id".to_string(), Value::String(String::new()));
    if !signature_filled {
        obj.insert("signature".to_string(), Value::String(String::new()));
    }
    obj.remove("countersignatures");
    Ok(Value::Object(obj))
}

/// Canonical form the issuer signs: `id` and `signature` empty,
/// countersignatures stripped.
pub fn signing_form(doc: &CovenantDocument) -> Result<String, Error> {
    Ok(crypto::canonicalize_json(&canonical_value(doc, false)?))
}

/// Canonical form the id commits to: `id` empty, `signature` filled,
/// countersignatures stripped.
pub fn id_form(doc: &CovenantDocument) -> Result<String, Error> {
    Ok(crypto::canonicalize_json(&canonical_value(doc, true)?))
}

/// Recompute the content-addressed document id.
pub fn compute_id(doc: &CovenantDocument) -> Result<String, Error> {
    Ok(crypto::sha256_string(&id_form(doc)?))
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

fn build_err(kind: BuildErrorKind, message: impl Into<String>) -> Error {
    Error::Build {
        kind,
        message: message.into(),
    }
}

fn validate_party(party: &Party, label: &str, expected: PartyRole) -> Result<(), Error> {
    if party.id.is_empty() {
        return Err(build_err(
            BuildErrorKind::MissingParty,
            format!("{label}.id is required"),
        ));
    }
    if party.public_key.is_empty() {
        return Err(build_err(
            BuildErrorKind::MissingParty,
            format!("{label}.publicKey is required"),
        ));
    }
    if party.role != expected {
        return Err(build_err(
            BuildErrorKind::WrongRole,
            format!("{label}.role must be {expected:?}"),
        ));
    }
    crypto::decode_hex_exact(&party.public_key, 32, &format!("{label} public key"))
        .map_err(|e| build_err(BuildErrorKind::KeyLength, e.to_string()))?;
    Ok(())
}

/// Build a new, signed covenant document.
///
/// Validates every precondition, parses the constraints, generates the
/// nonce and creation timestamp, signs the canonical form with the
/// issuer's key, and derives the content-addressed id.
///
/// # Errors
/// Returns `Error::Build` carrying the failed precondition kind
/// (`missing_party`, `wrong_role`, `key_length`, `ccl_parse`,
/// `chain_depth_out_of_range`, `invalid_window`, `document_too_large`).
pub fn build_covenant(opts: CovenantBuilderOptions) -> Result<CovenantDocument, Error> {
    validate_party(&opts.issuer, "issuer", PartyRole::Issuer)?;
    validate_party(&opts.beneficiary, "beneficiary", PartyRole::Beneficiary)?;

    if opts.constraints.trim().is_empty() {
        return Err(build_err(BuildErrorKind::CclParse, "constraints is required"));
    }
    let parsed = ccl::parse(&opts.constraints)
        .map_err(|e| build_err(BuildErrorKind::CclParse, e.to_string()))?;
    if parsed.statements.len() > MAX_CONSTRAINTS {
        return Err(build_err(
            BuildErrorKind::CclParse,
            format!(
                "constraints exceed the maximum of {MAX_CONSTRAINTS} statements (got {})",
                parsed.statements.len()
            ),
        ));
    }

    if let Some(chain) = &opts.chain {
        if chain.parent_id.is_empty() {
            return Err(build_err(
                BuildErrorKind::MissingField,
                "chain.parentId is required",
            ));
        }
        if chain.depth < 1 || chain.depth > MAX_CHAIN_DEPTH {
            return Err(build_err(
                BuildErrorKind::ChainDepthOutOfRange,
                format!(
                    "chain.depth must be between 1 and {MAX_CHAIN_DEPTH} (got {})",
                    chain.depth
                ),
            ));
        }
    }

    let activates = opts
        .activates_at
        .as_deref()
        .map(|s| {
            crypto::parse_timestamp(s)
                .ok_or_else(|| build_err(BuildErrorKind::InvalidWindow, format!("activatesAt '{s}' is not a timestamp")))
        })
        .transpose()?;
    let expires = opts
        .expires_at
        .as_deref()
        .map(|s| {
            crypto::parse_timestamp(s)
                .ok_or_else(|| build_err(BuildErrorKind::InvalidWindow, format!("expiresAt '{s}' is not a timestamp")))
        })
        .transpose()?;
    if let (Some(a), Some(e)) = (activates, expires) {
        if a > e {
            return Err(build_err(
                BuildErrorKind::InvalidWindow,
                "activatesAt must not be after expiresAt",
            ));
        }
    }

    let mut doc = CovenantDocument {
        version: PROTOCOL_VERSION.to_string(),
        id: String::new(),
        issuer: opts.issuer,
        beneficiary: opts.beneficiary,
        constraints: opts.constraints,
        nonce: hex::encode(crypto::generate_nonce()),
        created_at: crypto::timestamp(),
        activates_at: opts.activates_at,
        expires_at: opts.expires_at,
        enforcement: opts.enforcement,
        proof: opts.proof,
        chain: opts.chain,
        metadata: opts.metadata,
        countersignatures: None,
        signature: String::new(),
    };

    let signing = signing_form(&doc)?;
    let sig_bytes = crypto::sign(signing.as_bytes(), &opts.signing_key)?;
    doc.signature = hex::encode(&sig_bytes);
    doc.id = compute_id(&doc)?;

    let canonical_size = serialize_covenant(&doc)?.len();
    if canonical_size > MAX_DOCUMENT_SIZE {
        return Err(build_err(
            BuildErrorKind::DocumentTooLarge,
            format!("canonical document is {canonical_size} bytes, maximum is {MAX_DOCUMENT_SIZE}"),
        ));
    }

    Ok(doc)
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Verify a covenant document, producing the full check battery.
///
/// The check order is fixed so callers and tests can assert by name:
/// `id_match, signature_valid, ccl_parses, not_expired, active,
/// enforcement_valid, proof_valid, chain_depth, document_size,
/// countersignatures, nonce_present`. `valid` is the conjunction of all
/// checks; verification never raises for a malformed document.
pub fn verify_covenant(doc: &CovenantDocument) -> VerificationResult {
    let (id_form_text, signing_text) = match (id_form(doc), signing_form(doc)) {
        (Ok(i), Ok(s)) => (i, s),
        _ => {
            return VerificationResult::from_checks(vec![VerificationCheck::new(
                "id_match",
                false,
                "document could not be canonicalized".to_string(),
            )])
        }
    };

    let mut checks: Vec<VerificationCheck> = Vec::new();

    let expected_id = crypto::sha256_string(&id_form_text);
    checks.push(VerificationCheck::new(
        "id_match",
        doc.id == expected_id,
        if doc.id == expected_id {
            "document id matches canonical hash".to_string()
        } else {
            format!("id mismatch: expected {expected_id}, got {}", doc.id)
        },
    ));

    let sig_valid = crypto::verify_hex(
        signing_text.as_bytes(),
        &doc.signature,
        &doc.issuer.public_key,
    );
    checks.push(VerificationCheck::new(
        "signature_valid",
        sig_valid,
        if sig_valid {
            "issuer signature is valid".to_string()
        } else {
            "issuer signature verification failed".to_string()
        },
    ));

    let (ccl_ok, ccl_msg) = match ccl::parse(&doc.constraints) {
        Ok(parsed) if parsed.statements.len() > MAX_CONSTRAINTS => (
            false,
            format!("constraints exceed the maximum of {MAX_CONSTRAINTS} statements"),
        ),
        Ok(parsed) => (
            true,
            format!("constraints parsed ({} statement(s))", parsed.statements.len()),
        ),
        Err(e) => (false, e.to_string()),
    };
    checks.push(VerificationCheck::new("ccl_parses", ccl_ok, ccl_msg));

    let now = chrono::Utc::now();
    checks.push(match &doc.expires_at {
        None => VerificationCheck::new("not_expired", true, "no expiry set".to_string()),
        Some(s) => match crypto::parse_timestamp(s) {
            Some(expires) => VerificationCheck::new(
                "not_expired",
                now < expires,
                if now < expires {
                    "document has not expired".to_string()
                } else {
                    format!("document expired at {s}")
                },
            ),
            None => VerificationCheck::new(
                "not_expired",
                false,
                format!("expiresAt '{s}' is not a timestamp"),
            ),
        },
    });

    checks.push(match &doc.activates_at {
        None => VerificationCheck::new("active", true, "no activation time set".to_string()),
        Some(s) => match crypto::parse_timestamp(s) {
            Some(activates) => VerificationCheck::new(
                "active",
                now >= activates,
                if now >= activates {
                    "document is active".to_string()
                } else {
                    format!("document activates at {s}")
                },
            ),
            None => VerificationCheck::new(
                "active",
                false,
                format!("activatesAt '{s}' is not a timestamp"),
            ),
        },
    });

    // Enforcement and proof kinds are closed enums; a document that
    // deserialized carries a recognized tag by construction.
    checks.push(VerificationCheck::new(
        "enforcement_valid",
        true,
        match &doc.enforcement {
            Some(e) => format!("enforcement kind {:?} is recognized", e.kind),
            None => "no enforcement declaration".to_string(),
        },
    ));
    checks.push(VerificationCheck::new(
        "proof_valid",
        true,
        match &doc.proof {
            Some(p) => format!("proof kind {:?} is recognized", p.kind),
            None => "no proof declaration".to_string(),
        },
    ));

    checks.push(match &doc.chain {
        None => VerificationCheck::new("chain_depth", true, "no chain reference".to_string()),
        Some(chain) => {
            let ok = (1..=MAX_CHAIN_DEPTH).contains(&chain.depth);
            VerificationCheck::new(
                "chain_depth",
                ok,
                if ok {
                    format!("chain depth {} is within limit", chain.depth)
                } else {
                    format!("chain depth {} is outside [1, {MAX_CHAIN_DEPTH}]", chain.depth)
                },
            )
        }
    });

    let size = serialize_covenant(doc).map(|s| s.len()).unwrap_or(usize::MAX);
    checks.push(VerificationCheck::new(
        "document_size",
        size <= MAX_DOCUMENT_SIZE,
        if size <= MAX_DOCUMENT_SIZE {
            format!("canonical size {size} bytes is within limit")
        } else {
            format!("canonical size exceeds {MAX_DOCUMENT_SIZE} bytes")
        },
    ));

    let countersigs = doc.countersignatures.as_deref().unwrap_or(&[]);
    let mut failed_signers: Vec<String> = Vec::new();
    for cs in countersigs {
        let payload = countersign_payload(&doc.id, &cs.signer_public_key, &cs.signer_role, &cs.timestamp);
        if !crypto::verify_hex(payload.as_bytes(), &cs.signature, &cs.signer_public_key) {
            let truncated: String = cs.signer_public_key.chars().take(16).collect();
            failed_signers.push(truncated);
        }
    }
    checks.push(VerificationCheck::new(
        "countersignatures",
        failed_signers.is_empty(),
        if countersigs.is_empty() {
            "no countersignatures present".to_string()
        } else if failed_signers.is_empty() {
            format!("all {} countersignature(s) are valid", countersigs.len())
        } else {
            format!("invalid countersignature(s) from: {}", failed_signers.join(", "))
        },
    ));

    let nonce_ok = doc.nonce.len() == 32
        && doc
            .nonce
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    checks.push(VerificationCheck::new(
        "nonce_present",
        nonce_ok,
        if nonce_ok {
            "nonce is a 32-char hex string".to_string()
        } else {
            format!("nonce is malformed: expected 32 hex chars, got '{}'", doc.nonce)
        },
    ));

    VerificationResult::from_checks(checks)
}

// ---------------------------------------------------------------------------
// Countersign
// ---------------------------------------------------------------------------

fn countersign_payload(covenant_id: &str, signer_public_key: &str, signer_role: &str, timestamp: &str) -> String {
    crypto::canonicalize_json(&serde_json::json!({
        "covenantId": covenant_id,
        "signerPublicKey": signer_public_key,
        "signerRole": signer_role,
        "timestamp": timestamp,
    }))
}

/// Append a countersignature to a covenant.
///
/// The signer commits to `{covenantId, signerPublicKey, signerRole,
/// timestamp}`, so countersignatures are mutually independent and leave
/// the covenant's id and issuer signature untouched. Returns a new
/// document; the input is not mutated.
pub fn countersign_covenant(
    doc: &CovenantDocument,
    kp: &crypto::KeyPair,
    role: &str,
) -> Result<CovenantDocument, Error> {
    let timestamp = crypto::timestamp();
    let payload = countersign_payload(&doc.id, &kp.public_key_hex, role, &timestamp);
    let sig_bytes = crypto::sign(payload.as_bytes(), &kp.signing_key)?;

    let countersig = Countersignature {
        signer_public_key: kp.public_key_hex.clone(),
        signer_role: role.to_string(),
        timestamp,
        signature: hex::encode(&sig_bytes),
    };

    let mut new_doc = doc.clone();
    new_doc
        .countersignatures
        .get_or_insert_with(Vec::new)
        .push(countersig);
    Ok(new_doc)
}

// ---------------------------------------------------------------------------
// Chain resolution
// ---------------------------------------------------------------------------

/// Resolve a covenant's ancestor chain, immediate parent first.
///
/// # Errors
/// `Error::Chain` with `cycle_detected` when a parent id repeats,
/// `depth_exceeded` past [`MAX_CHAIN_DEPTH`], or `ancestor_not_found`
/// when the resolver cannot produce a referenced parent.
pub fn resolve_chain(
    doc: &CovenantDocument,
    resolver: &dyn CovenantResolver,
) -> Result<Vec<CovenantDocument>, Error> {
    let mut ancestors: Vec<CovenantDocument> = Vec::new();
    let mut visited: HashSet<String> = HashSet::from([doc.id.clone()]);
    let mut next = doc.chain.as_ref().map(|c| c.parent_id.clone());

    while let Some(parent_id) = next {
        if !visited.insert(parent_id.clone()) {
            return Err(Error::Chain {
                kind: ChainErrorKind::CycleDetected,
                message: format!("covenant {parent_id} appears twice in its own ancestry"),
            });
        }
        if ancestors.len() as u32 >= MAX_CHAIN_DEPTH {
            return Err(Error::Chain {
                kind: ChainErrorKind::DepthExceeded,
                message: format!("chain exceeds maximum depth of {MAX_CHAIN_DEPTH}"),
            });
        }
        let parent = resolver.resolve(&parent_id).ok_or_else(|| Error::Chain {
            kind: ChainErrorKind::AncestorNotFound,
            message: format!("ancestor {parent_id} could not be resolved"),
        })?;
        next = parent.chain.as_ref().map(|c| c.parent_id.clone());
        ancestors.push(parent);
    }

    Ok(ancestors)
}

/// Fold the covenant's policy with its ancestors' into one effective
/// policy, preserving deny-wins semantics.
///
/// The document's own policy comes first, then each ancestor in
/// parent-first order, merged pairwise via [`ccl::merge`].
pub fn compute_effective_constraints(
    doc: &CovenantDocument,
    ancestors: &[CovenantDocument],
) -> Result<ccl::CclDocument, Error> {
    let mut effective = ccl::parse(&doc.constraints)?;
    for ancestor in ancestors {
        let parsed = ccl::parse(&ancestor.constraints)?;
        effective = ccl::merge(&effective, &parsed);
    }
    Ok(effective)
}

/// Validate that a child covenant's constraints only narrow the parent's.
pub fn validate_chain_narrowing(
    child: &CovenantDocument,
    parent: &CovenantDocument,
) -> Result<ccl::NarrowingResult, Error> {
    let parent_ccl = ccl::parse(&parent.constraints)?;
    let child_ccl = ccl::parse(&child.constraints)?;
    Ok(ccl::validate_narrowing(&parent_ccl, &child_ccl))
}

// ---------------------------------------------------------------------------
// Wire serialization
// ---------------------------------------------------------------------------

/// Serialize a covenant to its canonical JSON wire form.
pub fn serialize_covenant(doc: &CovenantDocument) -> Result<String, Error> {
    let value = serde_json::to_value(doc)
        .map_err(|e| Error::Serialization(format!("serialize covenant: {e}")))?;
    Ok(crypto::canonicalize_json(&value))
}

fn require_field<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Result<&'a Value, Error> {
    obj.get(field).ok_or_else(|| Error::Deserialize {
        field: field.to_string(),
    })
}

fn require_str<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Result<&'a str, Error> {
    require_field(obj, field)?.as_str().ok_or_else(|| Error::Deserialize {
        field: field.to_string(),
    })
}

fn check_party_shape(value: &Value, label: &str, expected_role: &str) -> Result<(), Error> {
    let obj = value.as_object().ok_or_else(|| Error::Deserialize {
        field: label.to_string(),
    })?;
    for field in ["id", "publicKey", "role"] {
        if !obj.get(field).is_some_and(Value::is_string) {
            return Err(Error::Deserialize {
                field: format!("{label}.{field}"),
            });
        }
    }
    if obj["role"].as_str() != Some(expected_role) {
        return Err(Error::Deserialize {
            field: format!("{label}.role"),
        });
    }
    Ok(())
}

/// Check a declaration's raw `kind` tag against its closed set before
/// typed deserialization, so an unknown tag surfaces as the build-error
/// kind it names rather than a generic shape failure.
fn check_declaration_kind<K: serde::de::DeserializeOwned>(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    error_kind: BuildErrorKind,
) -> Result<(), Error> {
    let Some(declaration) = obj.get(field) else {
        return Ok(());
    };
    let kind_tag = declaration
        .get("kind")
        .ok_or_else(|| Error::Deserialize {
            field: format!("{field}.kind"),
        })?;
    if serde_json::from_value::<K>(kind_tag.clone()).is_err() {
        return Err(Error::Build {
            kind: error_kind,
            message: format!("unrecognized {field} kind {kind_tag}"),
        });
    }
    Ok(())
}

/// Deserialize and shape-check a covenant from its wire form.
///
/// # Errors
/// `Error::Deserialize` naming the first missing or invalid field; the
/// protocol version must be one this implementation accepts. An
/// enforcement or proof declaration with an unrecognized kind tag fails
/// as `Error::Build` with `invalid_enforcement_type` /
/// `invalid_proof_type`.
pub fn deserialize_covenant(json: &str) -> Result<CovenantDocument, Error> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Error::Serialization(format!("covenant is not valid JSON: {e}")))?;
    let obj = value.as_object().ok_or_else(|| Error::Deserialize {
        field: "document".to_string(),
    })?;

    for field in ["version", "id", "issuer", "beneficiary", "constraints", "nonce", "createdAt", "signature"] {
        require_field(obj, field)?;
    }
    if require_str(obj, "version")? != PROTOCOL_VERSION {
        return Err(Error::Deserialize {
            field: "version".to_string(),
        });
    }
    check_party_shape(&obj["issuer"], "issuer", "issuer")?;
    check_party_shape(&obj["beneficiary"], "beneficiary", "beneficiary")?;
    check_declaration_kind::<EnforcementKind>(
        obj,
        "enforcement",
        BuildErrorKind::InvalidEnforcementType,
    )?;
    check_declaration_kind::<ProofKind>(obj, "proof", BuildErrorKind::InvalidProofType)?;

    serde_json::from_value(value).map_err(|e| Error::Deserialize {
        field: e
            .to_string()
            .split('`')
            .nth(1)
            .unwrap_or("document")
            .to_string(),
    })
}
