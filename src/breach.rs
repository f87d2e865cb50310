//! Breach attestations and trust-graph propagation.
//!
//! A breach attestation is a reporter-signed, content-addressed record
//! that a covenant's constraints were violated. The trust graph maps
//! identity hashes to trust statuses and dependency edges; processing an
//! attestation degrades the affected agent and ripples weakened
//! degradations out to its dependents breadth-first.

use crate::ccl::Severity;
use crate::{crypto, BuildErrorKind, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::warn;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Trust standing of an identity. Ordered worst-last; breach processing
/// only ever moves a node rightward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Trusted,
    Degraded,
    Restricted,
    Revoked,
}

impl TrustStatus {
    /// One level less severe, saturating at `Trusted`.
    fn one_below(self) -> TrustStatus {
        match self {
            TrustStatus::Revoked => TrustStatus::Restricted,
            TrustStatus::Restricted => TrustStatus::Degraded,
            TrustStatus::Degraded | TrustStatus::Trusted => TrustStatus::Trusted,
        }
    }
}

/// Remediation suggested by an attestation, derived from its severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendedAction {
    Note,
    Degrade,
    Restrict,
    Revoke,
}

impl RecommendedAction {
    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Low => RecommendedAction::Note,
            Severity::Medium => RecommendedAction::Degrade,
            Severity::High => RecommendedAction::Restrict,
            Severity::Critical => RecommendedAction::Revoke,
        }
    }
}

/// A signed report that a covenant's constraints were violated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreachAttestation {
    pub id: String,
    #[serde(rename = "covenantId")]
    pub covenant_id: String,
    #[serde(rename = "affectedAgent")]
    pub affected_agent: String,
    #[serde(rename = "violatedConstraint")]
    pub violated_constraint: String,
    pub severity: Severity,
    #[serde(rename = "deniedAction")]
    pub denied_action: String,
    #[serde(rename = "deniedResource")]
    pub denied_resource: String,
    #[serde(rename = "evidenceHash")]
    pub evidence_hash: String,
    #[serde(rename = "relatedCovenants")]
    pub related_covenants: Vec<String>,
    #[serde(rename = "reporterPublicKey")]
    pub reporter_public_key: String,
    #[serde(rename = "recommendedAction")]
    pub recommended_action: RecommendedAction,
    pub timestamp: String,
    pub signature: String,
}

/// Inputs for creating a breach attestation.
pub struct BreachAttestationOptions {
    pub covenant_id: String,
    pub affected_agent: String,
    pub violated_constraint: String,
    pub severity: Severity,
    pub denied_action: String,
    pub denied_resource: String,
    pub evidence_hash: String,
    pub related_covenants: Vec<String>,
    pub signing_key: ed25519_dalek::SigningKey,
}

/// One status transition produced by [`TrustGraph::process_breach`].
#[derive(Debug, Clone, Serialize)]
pub struct BreachEvent {
    #[serde(rename = "affectedAgent")]
    pub affected_agent: String,
    #[serde(rename = "previousStatus")]
    pub previous_status: TrustStatus,
    #[serde(rename = "newStatus")]
    pub new_status: TrustStatus,
    #[serde(rename = "propagationDepth")]
    pub propagation_depth: u32,
    #[serde(rename = "attestationId")]
    pub attestation_id: String,
}

// ---------------------------------------------------------------------------
// Attestation build / verify
// ---------------------------------------------------------------------------

fn attestation_value(att: &BreachAttestation, signature_filled: bool) -> Value {
    let mut value = serde_json::to_value(att).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("id".to_string(), Value::String(String::new()));
        if !signature_filled {
            obj.insert("signature".to_string(), Value::String(String::new()));
        }
    }
    value
}

/// Create a signed breach attestation.
///
/// The reporter signs the canonical payload with `id` and `signature`
/// empty; the id is then the content hash over the finalized payload
/// (signature filled, id still empty).
pub fn create_breach_attestation(
    opts: BreachAttestationOptions,
) -> Result<BreachAttestation, Error> {
    if opts.covenant_id.is_empty() || opts.affected_agent.is_empty() {
        return Err(Error::Build {
            kind: BuildErrorKind::MissingField,
            message: "covenantId and affectedAgent are required".to_string(),
        });
    }
    crypto::decode_hex_exact(&opts.evidence_hash, 32, "evidence hash")?;

    let mut att = BreachAttestation {
        id: String::new(),
        covenant_id: opts.covenant_id,
        affected_agent: opts.affected_agent,
        violated_constraint: opts.violated_constraint,
        severity: opts.severity,
        denied_action: opts.denied_action,
        denied_resource: opts.denied_resource,
        evidence_hash: opts.evidence_hash,
        related_covenants: opts.related_covenants,
        reporter_public_key: hex::encode(opts.signing_key.verifying_key().as_bytes()),
        recommended_action: RecommendedAction::from_severity(opts.severity),
        timestamp: crypto::timestamp(),
        signature: String::new(),
    };

    let signing_payload = crypto::canonicalize_json(&attestation_value(&att, false));
    let sig_bytes = crypto::sign(signing_payload.as_bytes(), &opts.signing_key)?;
    att.signature = hex::encode(&sig_bytes);
    att.id = crypto::sha256_string(&crypto::canonicalize_json(&attestation_value(&att, true)));

    Ok(att)
}

/// Verify an attestation's id, signature, and severity derivation.
///
/// Tampering any field falsifies at least one of the three.
pub fn verify_breach_attestation(att: &BreachAttestation) -> bool {
    if att.recommended_action != RecommendedAction::from_severity(att.severity) {
        return false;
    }
    let expected_id = crypto::sha256_string(&crypto::canonicalize_json(&attestation_value(att, true)));
    if expected_id != att.id {
        return false;
    }
    let signing_payload = crypto::canonicalize_json(&attestation_value(att, false));
    crypto::verify_hex(
        signing_payload.as_bytes(),
        &att.signature,
        &att.reporter_public_key,
    )
}

// ---------------------------------------------------------------------------
// Trust graph
// ---------------------------------------------------------------------------

struct TrustNode {
    identity_hash: String,
    status: TrustStatus,
    /// Arena indices of identities whose trust depends on this one,
    /// in registration order, deduplicated.
    dependents: Vec<usize>,
}

/// Handle returned by [`TrustGraph::on_breach`], used to remove the
/// listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(usize);

type BreachListener = Box<dyn FnMut(&BreachEvent)>;

/// Directed dependency graph over identity hashes with monotone status
/// degradation.
///
/// Nodes live in an arena and reference each other by index, so the
/// dependency edges never need shared ownership of node storage.
#[derive(Default)]
pub struct TrustGraph {
    nodes: Vec<TrustNode>,
    index: HashMap<String, usize>,
    listeners: Vec<Option<BreachListener>>,
}

impl TrustGraph {
    pub fn new() -> Self {
        TrustGraph::default()
    }

    fn intern(&mut self, identity_hash: &str) -> usize {
        if let Some(&idx) = self.index.get(identity_hash) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(TrustNode {
            identity_hash: identity_hash.to_string(),
            status: TrustStatus::Trusted,
            dependents: Vec::new(),
        });
        self.index.insert(identity_hash.to_string(), idx);
        idx
    }

    /// Record that `dependent`'s trust depends on `provider`.
    ///
    /// Unknown identities are created as trusted nodes.
    pub fn register_dependency(&mut self, provider: &str, dependent: &str) {
        let provider_idx = self.intern(provider);
        let dependent_idx = self.intern(dependent);
        if !self.nodes[provider_idx].dependents.contains(&dependent_idx) {
            self.nodes[provider_idx].dependents.push(dependent_idx);
        }
    }

    /// Current status; unknown identities are trusted by default.
    pub fn status(&self, identity_hash: &str) -> TrustStatus {
        self.index
            .get(identity_hash)
            .map(|&idx| self.nodes[idx].status)
            .unwrap_or(TrustStatus::Trusted)
    }

    pub fn is_trusted(&self, identity_hash: &str) -> bool {
        self.status(identity_hash) == TrustStatus::Trusted
    }

    /// Register a callback fired once per [`BreachEvent`], before
    /// [`process_breach`](Self::process_breach) returns.
    pub fn on_breach(&mut self, listener: BreachListener) -> ListenerHandle {
        self.listeners.push(Some(listener));
        ListenerHandle(self.listeners.len() - 1)
    }

    /// Remove a previously registered listener. Returns whether it was
    /// still installed.
    pub fn remove_listener(&mut self, handle: ListenerHandle) -> bool {
        match self.listeners.get_mut(handle.0) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn emit(&mut self, events: &mut Vec<BreachEvent>, event: BreachEvent) {
        for slot in self.listeners.iter_mut() {
            if let Some(listener) = slot.as_mut() {
                listener(&event);
            }
        }
        events.push(event);
    }

    /// Apply a breach attestation to the graph.
    ///
    /// An invalid attestation mutates nothing and yields no events. The
    /// affected agent moves to the severity's target status only when
    /// that is strictly worse than its current one; dependents then
    /// degrade breadth-first, each to one level below its provider's new
    /// status, visited at most once. Events come back in BFS order.
    pub fn process_breach(&mut self, att: &BreachAttestation) -> Vec<BreachEvent> {
        if !verify_breach_attestation(att) {
            warn!(attestation = %att.id, "rejecting unverifiable breach attestation");
            return Vec::new();
        }

        let target = match att.severity {
            Severity::Critical => TrustStatus::Revoked,
            Severity::High => TrustStatus::Restricted,
            Severity::Medium | Severity::Low => TrustStatus::Degraded,
        };

        let root = self.intern(&att.affected_agent);
        let current = self.nodes[root].status;
        if target <= current {
            return Vec::new();
        }

        let mut events: Vec<BreachEvent> = Vec::new();
        self.nodes[root].status = target;
        warn!(
            agent = %self.nodes[root].identity_hash,
            from = ?current,
            to = ?target,
            "trust status degraded by breach"
        );
        self.emit(
            &mut events,
            BreachEvent {
                affected_agent: att.affected_agent.clone(),
                previous_status: current,
                new_status: target,
                propagation_depth: 0,
                attestation_id: att.id.clone(),
            },
        );

        let mut visited: HashSet<usize> = HashSet::from([root]);
        let mut queue: VecDeque<(usize, TrustStatus, u32)> = VecDeque::new();
        queue.push_back((root, target, 0));

        while let Some((node_idx, provider_status, depth)) = queue.pop_front() {
            let dependent_target = provider_status.one_below();
            let dependents = self.nodes[node_idx].dependents.clone();
            for dep_idx in dependents {
                if !visited.insert(dep_idx) {
                    continue;
                }
                let previous = self.nodes[dep_idx].status;
                if dependent_target > previous {
                    self.nodes[dep_idx].status = dependent_target;
                    let agent = self.nodes[dep_idx].identity_hash.clone();
                    warn!(
                        agent = %agent,
                        from = ?previous,
                        to = ?dependent_target,
                        depth = depth + 1,
                        "trust degradation propagated to dependent"
                    );
                    self.emit(
                        &mut events,
                        BreachEvent {
                            affected_agent: agent,
                            previous_status: previous,
                            new_status: dependent_target,
                            propagation_depth: depth + 1,
                            attestation_id: att.id.clone(),
                        },
                    );
                }
                queue.push_back((dep_idx, dependent_target, depth + 1));
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn make_attestation(severity: Severity, agent: &str) -> BreachAttestation {
        let kp = crypto::generate_key_pair().unwrap();
        create_breach_attestation(BreachAttestationOptions {
            covenant_id: "c".repeat(64),
            affected_agent: agent.to_string(),
            violated_constraint: "deny tool.sendData on '**'".to_string(),
            severity,
            denied_action: "tool.sendData".to_string(),
            denied_resource: "/api/export".to_string(),
            evidence_hash: crypto::sha256_string("audit entry"),
            related_covenants: vec![],
            signing_key: kp.signing_key,
        })
        .unwrap()
    }

    #[test]
    fn test_attestation_verify_and_tamper() {
        let att = make_attestation(Severity::High, &"a".repeat(64));
        assert_eq!(att.recommended_action, RecommendedAction::Restrict);
        assert!(verify_breach_attestation(&att));

        let mut tampered = att.clone();
        tampered.denied_resource = "/elsewhere".to_string();
        assert!(!verify_breach_attestation(&tampered));

        let mut resigned = att.clone();
        resigned.severity = Severity::Low;
        resigned.recommended_action = RecommendedAction::Note;
        assert!(!verify_breach_attestation(&resigned));
    }

    #[test]
    fn test_recommended_action_mapping() {
        assert_eq!(RecommendedAction::from_severity(Severity::Low), RecommendedAction::Note);
        assert_eq!(RecommendedAction::from_severity(Severity::Medium), RecommendedAction::Degrade);
        assert_eq!(RecommendedAction::from_severity(Severity::High), RecommendedAction::Restrict);
        assert_eq!(RecommendedAction::from_severity(Severity::Critical), RecommendedAction::Revoke);
    }

    #[test]
    fn test_unknown_identities_default_to_trusted() {
        let graph = TrustGraph::new();
        assert_eq!(graph.status("nobody"), TrustStatus::Trusted);
        assert!(graph.is_trusted("nobody"));
    }

    #[test]
    fn test_breach_propagates_in_bfs_order() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let c = "c".repeat(64);
        let mut graph = TrustGraph::new();
        graph.register_dependency(&a, &b);
        graph.register_dependency(&b, &c);

        let events = graph.process_breach(&make_attestation(Severity::Critical, &a));
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].affected_agent, a);
        assert_eq!(events[0].new_status, TrustStatus::Revoked);
        assert_eq!(events[1].affected_agent, b);
        assert_eq!(events[1].new_status, TrustStatus::Restricted);
        assert_eq!(events[1].propagation_depth, 1);
        assert_eq!(events[2].affected_agent, c);
        assert_eq!(events[2].new_status, TrustStatus::Degraded);
        assert_eq!(events[2].propagation_depth, 2);

        assert!(!graph.is_trusted(&a));
        assert_eq!(graph.status(&c), TrustStatus::Degraded);
    }

    #[test]
    fn test_weaker_attestation_is_idempotent() {
        let a = "a".repeat(64);
        let mut graph = TrustGraph::new();
        graph.register_dependency(&a, &"b".repeat(64));

        assert_eq!(graph.process_breach(&make_attestation(Severity::Critical, &a)).len(), 2);
        // A later, weaker attestation does not resurrect the node.
        assert!(graph.process_breach(&make_attestation(Severity::Low, &a)).is_empty());
        assert_eq!(graph.status(&a), TrustStatus::Revoked);
    }

    #[test]
    fn test_stronger_attestation_escalates() {
        let a = "a".repeat(64);
        let mut graph = TrustGraph::new();
        let first = graph.process_breach(&make_attestation(Severity::Medium, &a));
        assert_eq!(first[0].new_status, TrustStatus::Degraded);

        let second = graph.process_breach(&make_attestation(Severity::Critical, &a));
        assert_eq!(second[0].previous_status, TrustStatus::Degraded);
        assert_eq!(second[0].new_status, TrustStatus::Revoked);
    }

    #[test]
    fn test_invalid_attestation_mutates_nothing() {
        let a = "a".repeat(64);
        let mut att = make_attestation(Severity::Critical, &a);
        att.affected_agent = "z".repeat(64);
        let mut graph = TrustGraph::new();
        assert!(graph.process_breach(&att).is_empty());
        assert!(graph.is_trusted(&"z".repeat(64)));
    }

    #[test]
    fn test_listeners_fire_and_can_be_removed() {
        let a = "a".repeat(64);
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);

        let mut graph = TrustGraph::new();
        let handle = graph.on_breach(Box::new(move |ev: &BreachEvent| {
            sink.borrow_mut().push(ev.affected_agent.clone());
        }));

        graph.process_breach(&make_attestation(Severity::Medium, &a));
        assert_eq!(seen.borrow().len(), 1);

        assert!(graph.remove_listener(handle));
        assert!(!graph.remove_listener(handle));
        graph.process_breach(&make_attestation(Severity::Critical, &a));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_diamond_dependency_visited_once() {
        let a = "a".repeat(64);
        let b = "b".repeat(64);
        let c = "c".repeat(64);
        let d = "d".repeat(64);
        let mut graph = TrustGraph::new();
        graph.register_dependency(&a, &b);
        graph.register_dependency(&a, &c);
        graph.register_dependency(&b, &d);
        graph.register_dependency(&c, &d);

        let events = graph.process_breach(&make_attestation(Severity::Critical, &a));
        let d_events: Vec<_> = events.iter().filter(|e| e.affected_agent == d).collect();
        assert_eq!(d_events.len(), 1);
        assert_eq!(d_events[0].new_status, TrustStatus::Degraded);
    }
}
