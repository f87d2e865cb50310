//! Reputation scoring over receipt chains and endorsements.
//!
//! Receipts are the ground truth: the score blends the outcome
//! distribution with a severity-weighted breach penalty, folds in
//! endorsements from other identities, and down-weights agents that have
//! not yet accumulated a meaningful execution history.

use crate::ccl::Severity;
use crate::monitor;
use crate::receipt::{Endorsement, ExecutionReceipt, ReceiptOutcome};
use crate::crypto;
use serde::{Deserialize, Serialize};

/// Executions below which the score is scaled down for low confidence.
pub const MINIMUM_EXECUTIONS: u64 = 10;

/// Share of the final score contributed by endorsements, when present.
const ENDORSEMENT_SHARE: f64 = 0.2;

/// Aggregated reputation for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationScore {
    #[serde(rename = "agentIdentityHash")]
    pub agent_identity_hash: String,
    #[serde(rename = "totalExecutions")]
    pub total_executions: u64,
    pub fulfilled: u64,
    pub partial: u64,
    pub failed: u64,
    pub breached: u64,
    #[serde(rename = "successRate")]
    pub success_rate: f64,
    #[serde(rename = "weightedScore")]
    pub weighted_score: f64,
    #[serde(rename = "receiptsMerkleRoot")]
    pub receipts_merkle_root: String,
    #[serde(rename = "lastUpdatedAt")]
    pub last_updated_at: String,
}

/// How much one breach of a given severity subtracts, before averaging.
fn breach_penalty(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.1,
        Severity::Medium => 0.2,
        Severity::High => 0.3,
        Severity::Critical => 0.5,
    }
}

/// Compute an agent's reputation from its receipts and endorsements.
///
/// Only receipts whose `agentIdentityHash` matches `agent_identity_hash`
/// are scored, and only endorsements naming the agent count. The result
/// is bounded to [0, 1]; agents with fewer than [`MINIMUM_EXECUTIONS`]
/// receipts are scaled by `total / MINIMUM_EXECUTIONS`.
///
/// Endorsements blend in as a plain mean of endorser weights; nothing
/// caps the combined influence of many small endorsements.
pub fn compute_reputation_score(
    agent_identity_hash: &str,
    receipts: &[ExecutionReceipt],
    endorsements: &[Endorsement],
) -> ReputationScore {
    let scored: Vec<&ExecutionReceipt> = receipts
        .iter()
        .filter(|r| r.agent_identity_hash == agent_identity_hash)
        .collect();

    let mut fulfilled = 0u64;
    let mut partial = 0u64;
    let mut failed = 0u64;
    let mut breached = 0u64;
    let mut penalty_sum = 0.0f64;

    for receipt in &scored {
        match receipt.outcome {
            ReceiptOutcome::Fulfilled => fulfilled += 1,
            ReceiptOutcome::Partial => partial += 1,
            ReceiptOutcome::Failed => failed += 1,
            ReceiptOutcome::Breached => {
                breached += 1;
                penalty_sum += breach_penalty(receipt.breach_severity.unwrap_or(Severity::High));
            }
        }
    }

    let total = scored.len() as u64;
    let denominator = total.max(1) as f64;
    let success_rate = (fulfilled as f64 + 0.5 * partial as f64) / denominator;
    let behavior = (success_rate - penalty_sum / denominator).clamp(0.0, 1.0);

    let relevant: Vec<&Endorsement> = endorsements
        .iter()
        .filter(|e| e.endorsed_identity_hash == agent_identity_hash)
        .collect();
    let blended = if relevant.is_empty() {
        behavior
    } else {
        let mean =
            relevant.iter().map(|e| e.weight).sum::<f64>() / relevant.len() as f64;
        (1.0 - ENDORSEMENT_SHARE) * behavior + ENDORSEMENT_SHARE * mean.clamp(0.0, 1.0)
    };

    let confidence = (total as f64 / MINIMUM_EXECUTIONS as f64).min(1.0);
    let weighted_score = (blended * confidence).clamp(0.0, 1.0);

    let hashes: Vec<String> = scored.iter().map(|r| r.receipt_hash.clone()).collect();

    ReputationScore {
        agent_identity_hash: agent_identity_hash.to_string(),
        total_executions: total,
        fulfilled,
        partial,
        failed,
        breached,
        success_rate,
        weighted_score,
        receipts_merkle_root: monitor::merkle_root(&hashes),
        last_updated_at: crypto::timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::{create_receipt, ReceiptOptions};

    fn make_receipts(
        kp: &crypto::KeyPair,
        agent: &str,
        outcomes: &[(ReceiptOutcome, Option<Severity>)],
    ) -> Vec<ExecutionReceipt> {
        let mut receipts: Vec<ExecutionReceipt> = Vec::new();
        for (outcome, severity) in outcomes {
            let previous = receipts.last().map(|r| r.receipt_hash.clone());
            receipts.push(
                create_receipt(ReceiptOptions {
                    covenant_id: "c".repeat(64),
                    agent_identity_hash: agent.to_string(),
                    principal_public_key: "b".repeat(64),
                    outcome: *outcome,
                    breach_severity: *severity,
                    proof_hash: crypto::sha256_string("proof"),
                    duration_ms: 10,
                    previous_receipt_hash: previous,
                    signing_key: kp.signing_key.clone(),
                })
                .unwrap(),
            );
        }
        receipts
    }

    #[test]
    fn test_success_rate_counts_partial_as_half() {
        let kp = crypto::generate_key_pair().unwrap();
        let agent = "a".repeat(64);
        let receipts = make_receipts(
            &kp,
            &agent,
            &[
                (ReceiptOutcome::Fulfilled, None),
                (ReceiptOutcome::Partial, None),
                (ReceiptOutcome::Failed, None),
                (ReceiptOutcome::Fulfilled, None),
            ],
        );
        let score = compute_reputation_score(&agent, &receipts, &[]);
        assert_eq!(score.total_executions, 4);
        assert_eq!(score.fulfilled, 2);
        assert_eq!(score.partial, 1);
        assert!((score.success_rate - 2.5 / 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_breach_penalty_and_bounds() {
        let kp = crypto::generate_key_pair().unwrap();
        let agent = "a".repeat(64);
        let clean: Vec<(ReceiptOutcome, Option<Severity>)> =
            (0..10).map(|_| (ReceiptOutcome::Fulfilled, None)).collect();
        let clean_score =
            compute_reputation_score(&agent, &make_receipts(&kp, &agent, &clean), &[]);
        assert!((clean_score.weighted_score - 1.0).abs() < 1e-9);

        let mut with_breach = clean.clone();
        with_breach[9] = (ReceiptOutcome::Breached, Some(Severity::Critical));
        let breach_score =
            compute_reputation_score(&agent, &make_receipts(&kp, &agent, &with_breach), &[]);
        assert!(breach_score.weighted_score < clean_score.weighted_score);
        assert_eq!(breach_score.breached, 1);
        assert!(breach_score.weighted_score >= 0.0);
    }

    #[test]
    fn test_low_history_is_confidence_scaled() {
        let kp = crypto::generate_key_pair().unwrap();
        let agent = "a".repeat(64);
        let receipts = make_receipts(&kp, &agent, &[(ReceiptOutcome::Fulfilled, None)]);
        let score = compute_reputation_score(&agent, &receipts, &[]);
        // One perfect execution out of a ten-execution confidence floor.
        assert!((score.weighted_score - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_foreign_receipts_are_ignored() {
        let kp = crypto::generate_key_pair().unwrap();
        let agent = "a".repeat(64);
        let other = "f".repeat(64);
        let receipts = make_receipts(&kp, &other, &[(ReceiptOutcome::Breached, Some(Severity::High))]);
        let score = compute_reputation_score(&agent, &receipts, &[]);
        assert_eq!(score.total_executions, 0);
        assert_eq!(score.weighted_score, 0.0);
        assert_eq!(score.receipts_merkle_root, monitor::GENESIS_HASH);
    }

    #[test]
    fn test_endorsements_blend_in() {
        let kp = crypto::generate_key_pair().unwrap();
        let agent = "a".repeat(64);
        let outcomes: Vec<(ReceiptOutcome, Option<Severity>)> =
            (0..10).map(|_| (ReceiptOutcome::Partial, None)).collect();
        let receipts = make_receipts(&kp, &agent, &outcomes);

        let base = compute_reputation_score(&agent, &receipts, &[]);

        let endorser = crypto::generate_key_pair().unwrap();
        let endorsement = crate::receipt::create_endorsement(crate::receipt::EndorsementOptions {
            endorser_identity_hash: "e".repeat(64),
            endorsed_identity_hash: agent.clone(),
            scopes: vec!["general".to_string()],
            weight: 1.0,
            basis: crate::receipt::EndorsementBasis {
                interaction_count: 3,
                first_interaction_at: None,
                last_interaction_at: None,
            },
            signing_key: endorser.signing_key,
        })
        .unwrap();

        let boosted = compute_reputation_score(&agent, &receipts, &[endorsement]);
        assert!(boosted.weighted_score > base.weighted_score);
        assert!(boosted.weighted_score <= 1.0);
    }
}
