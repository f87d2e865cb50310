//! Pactum: an accountability protocol for autonomous agents.
//!
//! The crate provides the core primitives for binding an agent to declared
//! behavioral constraints and turning its observed behavior into
//! independently verifiable evidence:
//!
//! - **crypto**: Ed25519 signing/verification, SHA-256 hashing, canonical JSON
//! - **ccl**: Covenant Constraint Language parser and evaluator
//! - **covenant**: covenant building, verification, countersigning, chaining
//! - **monitor**: runtime enforcement with a hash-chained audit log
//! - **receipt**: signed execution receipts, endorsements, and stakes
//! - **reputation**: weighted scoring over receipt chains
//! - **identity**: agent identity creation, evolution, and verification
//! - **breach**: breach attestations and trust-graph propagation
//! - **store**: in-memory document storage

pub mod breach;
pub mod ccl;
pub mod covenant;
pub mod crypto;
pub mod identity;
pub mod monitor;
pub mod receipt;
pub mod reputation;
pub mod store;

/// Precondition failures raised while constructing protocol documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildErrorKind {
    MissingParty,
    WrongRole,
    InvalidEnforcementType,
    InvalidProofType,
    ChainDepthOutOfRange,
    CclParse,
    KeyLength,
    DocumentTooLarge,
    InvalidWindow,
    InvalidOutcome,
    InvalidWeight,
    InvalidAmount,
    MissingField,
}

impl std::fmt::Display for BuildErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MissingParty => "missing_party",
            Self::WrongRole => "wrong_role",
            Self::InvalidEnforcementType => "invalid_enforcement_type",
            Self::InvalidProofType => "invalid_proof_type",
            Self::ChainDepthOutOfRange => "chain_depth_out_of_range",
            Self::CclParse => "ccl_parse",
            Self::KeyLength => "key_length",
            Self::DocumentTooLarge => "document_too_large",
            Self::InvalidWindow => "invalid_window",
            Self::InvalidOutcome => "invalid_outcome",
            Self::InvalidWeight => "invalid_weight",
            Self::InvalidAmount => "invalid_amount",
            Self::MissingField => "missing_field",
        };
        write!(f, "{s}")
    }
}

/// Failures while resolving a covenant delegation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorKind {
    CycleDetected,
    DepthExceeded,
    AncestorNotFound,
}

impl std::fmt::Display for ChainErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CycleDetected => "cycle_detected",
            Self::DepthExceeded => "depth_exceeded",
            Self::AncestorNotFound => "ancestor_not_found",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur throughout the Pactum protocol.
///
/// Pure verification surfaces return structured reports instead of this
/// type; mutating operations (document construction, enforce-mode monitor
/// evaluation, stake transitions) return it directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("parse error at line {line}, column {column}: {reason}")]
    Parse {
        line: usize,
        column: usize,
        reason: String,
    },

    #[error("build error ({kind}): {message}")]
    Build {
        kind: BuildErrorKind,
        message: String,
    },

    #[error("denied {action} on {resource}: {reason}")]
    MonitorDenied {
        action: String,
        resource: String,
        rule: String,
        severity: Option<ccl::Severity>,
        reason: String,
    },

    #[error("deserialize error: missing or invalid field '{field}'")]
    Deserialize { field: String },

    #[error("chain error ({kind}): {message}")]
    Chain {
        kind: ChainErrorKind,
        message: String,
    },

    #[error("invalid state: {0}")]
    State(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
