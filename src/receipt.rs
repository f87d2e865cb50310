//! Execution receipts, endorsements, and stakes.
//!
//! A receipt is the signed, content-addressed record of one covenant
//! execution; receipts link into a per-agent chain through
//! `previousReceiptHash`. Endorsements are signed vouches between
//! identities, and stakes bind a numeric commitment to an
//! (agent, covenant) pair with one-way resolution.

use crate::ccl::Severity;
use crate::{crypto, BuildErrorKind, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// Outcome of one covenant execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptOutcome {
    Fulfilled,
    Partial,
    Failed,
    Breached,
}

/// A signed, content-addressed record of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub id: String,
    #[serde(rename = "covenantId")]
    pub covenant_id: String,
    #[serde(rename = "agentIdentityHash")]
    pub agent_identity_hash: String,
    #[serde(rename = "principalPublicKey")]
    pub principal_public_key: String,
    pub outcome: ReceiptOutcome,
    #[serde(rename = "breachSeverity", skip_serializing_if = "Option::is_none")]
    pub breach_severity: Option<Severity>,
    #[serde(rename = "proofHash")]
    pub proof_hash: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "completedAt")]
    pub completed_at: String,
    /// Null for the first receipt in an agent's chain; the schema admits
    /// the explicit null, so it is always serialized.
    #[serde(rename = "previousReceiptHash")]
    pub previous_receipt_hash: Option<String>,
    #[serde(rename = "receiptHash")]
    pub receipt_hash: String,
    #[serde(rename = "agentSignature")]
    pub agent_signature: String,
}

/// Inputs for creating a receipt.
pub struct ReceiptOptions {
    pub covenant_id: String,
    pub agent_identity_hash: String,
    pub principal_public_key: String,
    pub outcome: ReceiptOutcome,
    pub breach_severity: Option<Severity>,
    pub proof_hash: String,
    pub duration_ms: u64,
    pub previous_receipt_hash: Option<String>,
    pub signing_key: ed25519_dalek::SigningKey,
}

fn receipt_payload(receipt: &ExecutionReceipt) -> String {
    let mut value = serde_json::to_value(receipt).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("receiptHash".to_string(), Value::String(String::new()));
        obj.insert("agentSignature".to_string(), Value::String(String::new()));
    }
    crypto::canonicalize_json(&value)
}

/// Create a signed execution receipt.
///
/// # Errors
/// `Error::Build` with `invalid_outcome` when a breached outcome lacks a
/// severity (or a severity is attached to a non-breach), `missing_field`
/// for absent inputs, or `Error::Crypto` for a malformed proof hash.
pub fn create_receipt(opts: ReceiptOptions) -> Result<ExecutionReceipt, Error> {
    if opts.covenant_id.is_empty() || opts.agent_identity_hash.is_empty() {
        return Err(Error::Build {
            kind: BuildErrorKind::MissingField,
            message: "covenantId and agentIdentityHash are required".to_string(),
        });
    }
    match (opts.outcome, opts.breach_severity) {
        (ReceiptOutcome::Breached, None) => {
            return Err(Error::Build {
                kind: BuildErrorKind::InvalidOutcome,
                message: "breached receipts must carry a breachSeverity".to_string(),
            })
        }
        (ReceiptOutcome::Breached, Some(_)) => {}
        (_, Some(_)) => {
            return Err(Error::Build {
                kind: BuildErrorKind::InvalidOutcome,
                message: "breachSeverity is only valid with a breached outcome".to_string(),
            })
        }
        _ => {}
    }
    crypto::decode_hex_exact(&opts.proof_hash, 32, "proof hash")?;

    let mut receipt = ExecutionReceipt {
        id: crypto::generate_id(),
        covenant_id: opts.covenant_id,
        agent_identity_hash: opts.agent_identity_hash,
        principal_public_key: opts.principal_public_key,
        outcome: opts.outcome,
        breach_severity: opts.breach_severity,
        proof_hash: opts.proof_hash,
        duration_ms: opts.duration_ms,
        completed_at: crypto::timestamp(),
        previous_receipt_hash: opts.previous_receipt_hash,
        receipt_hash: String::new(),
        agent_signature: String::new(),
    };

    let payload = receipt_payload(&receipt);
    receipt.receipt_hash = crypto::sha256_string(&payload);
    let sig_bytes = crypto::sign(payload.as_bytes(), &opts.signing_key)?;
    receipt.agent_signature = hex::encode(&sig_bytes);

    Ok(receipt)
}

/// Verify one receipt's content hash and agent signature.
pub fn verify_receipt(receipt: &ExecutionReceipt, agent_public_key_hex: &str) -> bool {
    if receipt.outcome == ReceiptOutcome::Breached && receipt.breach_severity.is_none() {
        return false;
    }
    let payload = receipt_payload(receipt);
    let expected_hash = crypto::sha256_string(&payload);
    if !crypto::constant_time_equal(expected_hash.as_bytes(), receipt.receipt_hash.as_bytes()) {
        return false;
    }
    crypto::verify_hex(payload.as_bytes(), &receipt.agent_signature, agent_public_key_hex)
}

/// Verify a per-agent receipt chain.
///
/// The chain is a linear list: the first entry carries a null
/// `previousReceiptHash`, each subsequent entry links to the prior
/// entry's `receiptHash`, and every receipt verifies individually.
pub fn verify_receipt_chain(receipts: &[ExecutionReceipt], agent_public_key_hex: &str) -> bool {
    for (i, receipt) in receipts.iter().enumerate() {
        let expected_previous = if i == 0 {
            None
        } else {
            Some(receipts[i - 1].receipt_hash.clone())
        };
        if receipt.previous_receipt_hash != expected_previous {
            return false;
        }
        if !verify_receipt(receipt, agent_public_key_hex) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Endorsements
// ---------------------------------------------------------------------------

/// Summary of the prior interactions an endorsement is based on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndorsementBasis {
    #[serde(rename = "interactionCount")]
    pub interaction_count: u64,
    #[serde(rename = "firstInteractionAt", skip_serializing_if = "Option::is_none")]
    pub first_interaction_at: Option<String>,
    #[serde(rename = "lastInteractionAt", skip_serializing_if = "Option::is_none")]
    pub last_interaction_at: Option<String>,
}

/// A signed vouch by one identity for another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endorsement {
    pub id: String,
    #[serde(rename = "endorserIdentityHash")]
    pub endorser_identity_hash: String,
    #[serde(rename = "endorsedIdentityHash")]
    pub endorsed_identity_hash: String,
    pub scopes: Vec<String>,
    pub weight: f64,
    pub basis: EndorsementBasis,
    #[serde(rename = "endorserPublicKey")]
    pub endorser_public_key: String,
    pub timestamp: String,
    pub signature: String,
}

/// Inputs for creating an endorsement.
pub struct EndorsementOptions {
    pub endorser_identity_hash: String,
    pub endorsed_identity_hash: String,
    pub scopes: Vec<String>,
    pub weight: f64,
    pub basis: EndorsementBasis,
    pub signing_key: ed25519_dalek::SigningKey,
}

fn endorsement_payload(endorsement: &Endorsement) -> String {
    let mut value = serde_json::to_value(endorsement).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("signature".to_string(), Value::String(String::new()));
    }
    crypto::canonicalize_json(&value)
}

/// Create a signed endorsement.
///
/// # Errors
/// `Error::Build` with `invalid_weight` unless the weight lies in (0, 1].
pub fn create_endorsement(opts: EndorsementOptions) -> Result<Endorsement, Error> {
    if !(opts.weight > 0.0 && opts.weight <= 1.0) {
        return Err(Error::Build {
            kind: BuildErrorKind::InvalidWeight,
            message: format!("weight must be in (0, 1], got {}", opts.weight),
        });
    }

    let mut endorsement = Endorsement {
        id: crypto::generate_id(),
        endorser_identity_hash: opts.endorser_identity_hash,
        endorsed_identity_hash: opts.endorsed_identity_hash,
        scopes: opts.scopes,
        weight: opts.weight,
        basis: opts.basis,
        endorser_public_key: hex::encode(opts.signing_key.verifying_key().as_bytes()),
        timestamp: crypto::timestamp(),
        signature: String::new(),
    };

    let payload = endorsement_payload(&endorsement);
    let sig_bytes = crypto::sign(payload.as_bytes(), &opts.signing_key)?;
    endorsement.signature = hex::encode(&sig_bytes);

    Ok(endorsement)
}

/// Verify an endorsement standalone: weight bounds plus signature.
pub fn verify_endorsement(endorsement: &Endorsement) -> bool {
    if !(endorsement.weight > 0.0 && endorsement.weight <= 1.0) {
        return false;
    }
    let payload = endorsement_payload(endorsement);
    crypto::verify_hex(
        payload.as_bytes(),
        &endorsement.signature,
        &endorsement.endorser_public_key,
    )
}

// ---------------------------------------------------------------------------
// Stakes
// ---------------------------------------------------------------------------

/// Lifecycle state of a stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StakeStatus {
    Active,
    Released,
    Burned,
}

/// A numeric commitment bound to an (agent, covenant) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stake {
    pub id: String,
    #[serde(rename = "agentIdentityHash")]
    pub agent_identity_hash: String,
    #[serde(rename = "covenantId")]
    pub covenant_id: String,
    pub amount: f64,
    pub status: StakeStatus,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "resolvedAt", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

/// Create an active stake.
///
/// # Errors
/// `Error::Build` with `invalid_amount` unless the amount lies in [0, 1].
pub fn create_stake(
    agent_identity_hash: &str,
    covenant_id: &str,
    amount: f64,
) -> Result<Stake, Error> {
    if !(0.0..=1.0).contains(&amount) {
        return Err(Error::Build {
            kind: BuildErrorKind::InvalidAmount,
            message: format!("amount must be in [0, 1], got {amount}"),
        });
    }
    Ok(Stake {
        id: crypto::generate_id(),
        agent_identity_hash: agent_identity_hash.to_string(),
        covenant_id: covenant_id.to_string(),
        amount,
        status: StakeStatus::Active,
        created_at: crypto::timestamp(),
        resolved_at: None,
    })
}

impl Stake {
    fn resolve(&mut self, status: StakeStatus, verb: &str) -> Result<(), Error> {
        if self.status != StakeStatus::Active {
            return Err(Error::State(format!(
                "stake {} is already resolved as {:?} and cannot be {verb}",
                self.id, self.status
            )));
        }
        self.status = status;
        self.resolved_at = Some(crypto::timestamp());
        Ok(())
    }

    /// Release the stake back to the agent. One-way.
    pub fn release(&mut self) -> Result<(), Error> {
        self.resolve(StakeStatus::Released, "released")
    }

    /// Burn the stake after a breach. One-way.
    pub fn burn(&mut self) -> Result<(), Error> {
        self.resolve(StakeStatus::Burned, "burned")
    }
}
