//! Protocol document storage.
//!
//! A trait-based storage boundary with an in-memory implementation.
//! `Store<T>` is the minimal keyed interface the protocol needs for
//! covenants, receipts, and identities; `MemoryStore<T>` backs it with a
//! `HashMap` for tests and single-process use. Persistent backends live
//! outside the core and only need to satisfy this trait.

use crate::covenant::{CovenantDocument, CovenantResolver};
use crate::Error;
use std::collections::HashMap;
use tracing::debug;

/// Keyed document storage.
///
/// Documents are keyed by their content-addressed id.
pub trait Store<T> {
    /// Store a document under `id`, overwriting any previous value.
    fn put(&mut self, id: &str, doc: T) -> Result<(), Error>;

    /// Retrieve a document by id.
    fn get(&self, id: &str) -> Option<&T>;

    /// Delete a document; returns whether it existed.
    fn delete(&mut self, id: &str) -> bool;

    /// All stored documents, in no particular order.
    fn list(&self) -> Vec<&T>;

    /// Whether a document with `id` exists.
    fn has(&self, id: &str) -> bool;

    /// Number of stored documents.
    fn count(&self) -> usize;
}

/// In-memory store backed by a `HashMap`.
///
/// Not persistent and not thread-safe; wrap in a `Mutex` for shared use.
pub struct MemoryStore<T> {
    documents: HashMap<String, T>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        MemoryStore {
            documents: HashMap::new(),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Store<T> for MemoryStore<T> {
    fn put(&mut self, id: &str, doc: T) -> Result<(), Error> {
        if id.is_empty() {
            return Err(Error::State("document id cannot be empty".to_string()));
        }
        debug!(id, "document stored");
        self.documents.insert(id.to_string(), doc);
        Ok(())
    }

    fn get(&self, id: &str) -> Option<&T> {
        self.documents.get(id)
    }

    fn delete(&mut self, id: &str) -> bool {
        let existed = self.documents.remove(id).is_some();
        if existed {
            debug!(id, "document deleted");
        }
        existed
    }

    fn list(&self) -> Vec<&T> {
        self.documents.values().collect()
    }

    fn has(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    fn count(&self) -> usize {
        self.documents.len()
    }
}

/// A covenant store doubles as the ancestor resolver for chain walks.
impl CovenantResolver for MemoryStore<CovenantDocument> {
    fn resolve(&self, id: &str) -> Option<CovenantDocument> {
        self.documents.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covenant::{self, CovenantBuilderOptions, Party, PartyRole};
    use crate::crypto;

    fn make_covenant(constraints: &str) -> CovenantDocument {
        let issuer_kp = crypto::generate_key_pair().unwrap();
        let beneficiary_kp = crypto::generate_key_pair().unwrap();
        covenant::build_covenant(CovenantBuilderOptions {
            issuer: Party {
                id: "issuer-1".to_string(),
                public_key: issuer_kp.public_key_hex.clone(),
                role: PartyRole::Issuer,
                display_name: None,
            },
            beneficiary: Party {
                id: "agent-1".to_string(),
                public_key: beneficiary_kp.public_key_hex,
                role: PartyRole::Beneficiary,
                display_name: None,
            },
            constraints: constraints.to_string(),
            signing_key: issuer_kp.signing_key,
            activates_at: None,
            expires_at: None,
            enforcement: None,
            proof: None,
            chain: None,
            metadata: None,
        })
        .unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let mut store: MemoryStore<CovenantDocument> = MemoryStore::new();
        let doc = make_covenant("permit read on '/data/**'");
        let id = doc.id.clone();

        store.put(&id, doc).unwrap();
        assert!(store.has(&id));
        assert_eq!(store.get(&id).unwrap().id, id);
        assert_eq!(store.count(), 1);

        assert!(store.delete(&id));
        assert!(!store.delete(&id));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_empty_id_rejected() {
        let mut store: MemoryStore<CovenantDocument> = MemoryStore::new();
        let doc = make_covenant("permit read on '/x'");
        assert!(store.put("", doc).is_err());
    }

    #[test]
    fn test_list() {
        let mut store: MemoryStore<CovenantDocument> = MemoryStore::new();
        for constraints in ["permit read on '/a'", "permit read on '/b'"] {
            let doc = make_covenant(constraints);
            store.put(&doc.id.clone(), doc).unwrap();
        }
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn test_resolves_chain_ancestors() {
        let root = make_covenant("permit read on '/data/**'");
        let mut store: MemoryStore<CovenantDocument> = MemoryStore::new();
        store.put(&root.id.clone(), root.clone()).unwrap();
        assert!(store.resolve(&root.id).is_some());
        assert!(store.resolve("missing").is_none());
    }
}
