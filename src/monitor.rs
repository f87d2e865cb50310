//! Runtime enforcement monitor with a tamper-evident audit log.
//!
//! A monitor is attached to one covenant and gates each action the agent
//! attempts. Every evaluation appends a hash-chained audit entry; the log
//! exposes a Merkle root and per-entry inclusion proofs so observers can
//! verify both ordering and membership without the full log.

use crate::covenant::EnforcementKind;
use crate::{ccl, crypto, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Link value for the first audit entry (32 zero bytes).
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the monitor does with a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    /// Denials are raised as [`Error::MonitorDenied`]; the caller must
    /// not execute the action.
    Enforce,
    /// Denials are recorded but the caller proceeds.
    LogOnly,
    /// Like `log_only`, with entries marked for offline analysis.
    Canary,
}

/// How the monitor behaves when the policy itself is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    #[default]
    FailClosed,
    FailOpen,
}

/// Recorded outcome of one gated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Executed,
    Denied,
    Impossible,
}

/// One append-only audit log entry.
///
/// `previous_hash` is [`GENESIS_HASH`] for the first entry and the prior
/// entry's `hash` afterwards; `hash` commits to the whole entry including
/// that link, so the log's order is part of what each hash attests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(rename = "covenantId")]
    pub covenant_id: String,
    pub action: String,
    pub resource: String,
    #[serde(rename = "contextFingerprint")]
    pub context_fingerprint: String,
    pub outcome: AuditOutcome,
    pub timestamp: String,
    pub canary: bool,
    #[serde(rename = "previousHash")]
    pub previous_hash: String,
    pub hash: String,
}

/// The monitor's answer for one action.
#[derive(Debug)]
pub struct Decision {
    pub permitted: bool,
    pub reason: String,
    pub severity: Option<ccl::Severity>,
}

/// Details handed to the violation callback before a denial is raised.
#[derive(Debug)]
pub struct Violation {
    pub action: String,
    pub resource: String,
    pub rule: String,
    pub severity: Option<ccl::Severity>,
    pub reason: String,
}

/// Synchronous observer invoked on every denial.
pub type ViolationCallback = Box<dyn FnMut(&Violation)>;

/// Inputs for constructing a [`Monitor`].
pub struct MonitorConfig {
    pub covenant_id: String,
    pub constraints: String,
    pub mode: MonitorMode,
    pub failure_mode: FailureMode,
    /// The covenant's declared enforcement kind, if any. A `capability`
    /// declaration means denied actions are physically unreachable, so
    /// they are recorded as `IMPOSSIBLE` rather than `DENIED`.
    pub enforcement: Option<EnforcementKind>,
    pub on_violation: Option<ViolationCallback>,
}

/// A per-covenant enforcement monitor.
///
/// The audit log is the only mutable state in the protocol core; a
/// monitor must not be shared across threads without external
/// serialization.
pub struct Monitor {
    covenant_id: String,
    constraints: String,
    mode: MonitorMode,
    failure_mode: FailureMode,
    enforcement: Option<EnforcementKind>,
    on_violation: Option<ViolationCallback>,
    policy: Option<Result<ccl::CclDocument, String>>,
    entries: Vec<AuditEntry>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Monitor {
            covenant_id: config.covenant_id,
            constraints: config.constraints,
            mode: config.mode,
            failure_mode: config.failure_mode,
            enforcement: config.enforcement,
            on_violation: config.on_violation,
            policy: None,
            entries: Vec::new(),
        }
    }

    pub fn covenant_id(&self) -> &str {
        &self.covenant_id
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate one action against the covenant's constraints.
    ///
    /// Records an audit entry for every call. In `enforce` mode a denial
    /// is returned as [`Error::MonitorDenied`], after the violation
    /// callback has fired; in the logging modes the caller receives the
    /// decision and decides for itself.
    pub fn evaluate(
        &mut self,
        action: &str,
        resource: &str,
        context: &Value,
    ) -> Result<Decision, Error> {
        if self.policy.is_none() {
            self.policy = Some(ccl::parse(&self.constraints).map_err(|e| e.to_string()));
        }

        let evaluation = match self.policy.as_ref() {
            Some(Ok(doc)) => ccl::evaluate(doc, action, resource, context),
            Some(Err(msg)) => self.failure_evaluation(msg),
            None => self.failure_evaluation("policy not loaded"),
        };

        let outcome = if evaluation.permitted {
            AuditOutcome::Executed
        } else if self.enforcement == Some(EnforcementKind::Capability) {
            AuditOutcome::Impossible
        } else {
            AuditOutcome::Denied
        };
        self.append_entry(action, resource, context, outcome);

        if !evaluation.permitted {
            let rule = evaluation
                .matched_rule
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default();
            warn!(
                covenant = %self.covenant_id,
                action,
                resource,
                reason = %evaluation.reason,
                "action denied"
            );
            let violation = Violation {
                action: action.to_string(),
                resource: resource.to_string(),
                rule: rule.clone(),
                severity: evaluation.severity,
                reason: evaluation.reason.clone(),
            };
            if let Some(cb) = self.on_violation.as_mut() {
                cb(&violation);
            }
            if self.mode == MonitorMode::Enforce {
                return Err(Error::MonitorDenied {
                    action: violation.action,
                    resource: violation.resource,
                    rule: violation.rule,
                    severity: violation.severity,
                    reason: violation.reason,
                });
            }
        }

        Ok(Decision {
            permitted: evaluation.permitted,
            reason: evaluation.reason,
            severity: evaluation.severity,
        })
    }

    fn failure_evaluation(&self, message: &str) -> ccl::Evaluation {
        let permitted = self.failure_mode == FailureMode::FailOpen;
        ccl::Evaluation {
            permitted,
            reason: format!("policy unavailable ({message})"),
            matched_rule: None,
            severity: None,
        }
    }

    fn append_entry(&mut self, action: &str, resource: &str, context: &Value, outcome: AuditOutcome) {
        let previous_hash = self
            .entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut entry = AuditEntry {
            covenant_id: self.covenant_id.clone(),
            action: action.to_string(),
            resource: resource.to_string(),
            context_fingerprint: crypto::sha256_string(&crypto::canonicalize_json(context)),
            outcome,
            timestamp: crypto::timestamp(),
            canary: self.mode == MonitorMode::Canary,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry_hash(&entry);

        debug!(
            covenant = %self.covenant_id,
            action,
            resource,
            outcome = ?outcome,
            index = self.entries.len(),
            "audit entry appended"
        );
        self.entries.push(entry);
    }

    /// Merkle root over the current entry hashes.
    ///
    /// Recomputed on every read; the empty log commits to
    /// [`GENESIS_HASH`].
    pub fn merkle_root(&self) -> String {
        let hashes: Vec<String> = self.entries.iter().map(|e| e.hash.clone()).collect();
        merkle_root(&hashes)
    }

    /// Recompute every entry hash and re-walk the chain links.
    ///
    /// True only when no entry has been altered, inserted, removed, or
    /// reordered since it was appended.
    pub fn verify_audit_log_integrity(&self) -> bool {
        let mut expected_previous = GENESIS_HASH.to_string();
        for entry in &self.entries {
            if entry.previous_hash != expected_previous {
                return false;
            }
            if entry_hash(entry) != entry.hash {
                return false;
            }
            expected_previous = entry.hash.clone();
        }
        true
    }

    /// Produce an inclusion proof for the entry at `index`.
    pub fn generate_merkle_proof(&self, index: usize) -> Option<MerkleProof> {
        let hashes: Vec<String> = self.entries.iter().map(|e| e.hash.clone()).collect();
        generate_merkle_proof(&hashes, index)
    }
}

fn entry_hash(entry: &AuditEntry) -> String {
    let mut value = serde_json::to_value(entry).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("hash".to_string(), Value::String(String::new()));
    }
    crypto::sha256_string(&crypto::canonicalize_json(&value))
}

// ---------------------------------------------------------------------------
// Merkle commitment
// ---------------------------------------------------------------------------

/// An inclusion proof for one leaf of the audit log's Merkle tree.
///
/// `path[i]` is true when the node at level `i` is a right child, i.e.
/// its sibling hashes in on the left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: String,
    pub siblings: Vec<String>,
    pub path: Vec<bool>,
    pub root: String,
}

fn leaf_bytes(hash_hex: &str) -> Vec<u8> {
    hex::decode(hash_hex).unwrap_or_else(|_| crypto::sha256(hash_hex.as_bytes()).to_vec())
}

fn parent_digest(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(left.len() + right.len());
    combined.extend_from_slice(left);
    combined.extend_from_slice(right);
    crypto::sha256(&combined).to_vec()
}

/// Binary Merkle root over a hash sequence.
///
/// Odd levels duplicate their last node; the empty sequence commits to
/// [`GENESIS_HASH`].
pub fn merkle_root(hashes: &[String]) -> String {
    if hashes.is_empty() {
        return GENESIS_HASH.to_string();
    }
    let mut level: Vec<Vec<u8>> = hashes.iter().map(|h| leaf_bytes(h)).collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1].clone());
        }
        level = level
            .chunks(2)
            .map(|pair| parent_digest(&pair[0], &pair[1]))
            .collect();
    }
    hex::encode(&level[0])
}

/// Build an inclusion proof for `hashes[index]`.
pub fn generate_merkle_proof(hashes: &[String], index: usize) -> Option<MerkleProof> {
    if index >= hashes.len() {
        return None;
    }

    let mut siblings: Vec<String> = Vec::new();
    let mut path: Vec<bool> = Vec::new();
    let mut level: Vec<Vec<u8>> = hashes.iter().map(|h| leaf_bytes(h)).collect();
    let mut idx = index;

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1].clone());
        }
        let sibling_idx = idx ^ 1;
        siblings.push(hex::encode(&level[sibling_idx]));
        path.push(idx % 2 == 1);
        level = level
            .chunks(2)
            .map(|pair| parent_digest(&pair[0], &pair[1]))
            .collect();
        idx /= 2;
    }

    Some(MerkleProof {
        leaf: hashes[index].clone(),
        siblings,
        path,
        root: hex::encode(&level[0]),
    })
}

/// Recompute the root from a proof and compare.
pub fn verify_merkle_proof(proof: &MerkleProof) -> bool {
    if proof.siblings.len() != proof.path.len() {
        return false;
    }
    let mut current = leaf_bytes(&proof.leaf);
    for (sibling_hex, is_right) in proof.siblings.iter().zip(proof.path.iter()) {
        let sibling = leaf_bytes(sibling_hex);
        current = if *is_right {
            parent_digest(&sibling, &current)
        } else {
            parent_digest(&current, &sibling)
        };
    }
    hex::encode(current) == proof.root
}
