//! Consistency checking between instances.
//!
//! Computes, per entity kind, a deterministic aggregate hash over all
//! non-erased rows plus the maximum synced change id. Two instances are
//! consistent iff both the per-kind hashes and the max synced id agree.
//! Invoked operationally (after a suspected partition or bug), never as part
//! of a regular sync cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::change::{EntityKind, row_hash};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    /// Aggregate content hash per entity kind, keyed by wire name.
    pub entity_hashes: BTreeMap<String, String>,
    pub max_entity_change_id: i64,
}

impl ConsistencyReport {
    /// True when both sides hold the same content and the same log frontier.
    pub fn agrees_with(&self, other: &ConsistencyReport) -> bool {
        self.entity_hashes == other.entity_hashes
            && self.max_entity_change_id == other.max_entity_change_id
    }
}

/// Compute the consistency report for a store.
pub fn check(store: &Store) -> ConsistencyReport {
    let mut entity_hashes = BTreeMap::new();

    for kind in EntityKind::TABLES {
        let mut hasher = Sha256::new();
        // rows_of iterates in entity-id order, so the aggregate is
        // deterministic regardless of insertion history.
        for (entity_id, row) in store.rows_of(kind) {
            hasher.update(entity_id.as_bytes());
            hasher.update(b"|");
            hasher.update(row_hash(&row).as_bytes());
            hasher.update(b"\n");
        }
        entity_hashes.insert(kind.as_str().to_string(), hex::encode(hasher.finalize()));
    }

    ConsistencyReport {
        entity_hashes,
        max_entity_change_id: store.max_synced_id(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note(id: &str, title: &str) -> serde_json::Value {
        json!({"noteId": id, "title": title, "type": "text"})
    }

    #[test]
    fn test_identical_content_agrees() {
        let a = Store::new("a");
        let b = Store::new("b");

        // Insertion order differs; content does not.
        a.put_entity(EntityKind::Notes, "n1", note("n1", "one"), true).unwrap();
        a.put_entity(EntityKind::Notes, "n2", note("n2", "two"), true).unwrap();
        b.put_entity(EntityKind::Notes, "n2", note("n2", "two"), true).unwrap();
        b.put_entity(EntityKind::Notes, "n1", note("n1", "one"), true).unwrap();

        let ra = check(&a);
        let rb = check(&b);
        assert_eq!(ra.entity_hashes, rb.entity_hashes);
        // Same frontier too, since both appended two synced changes.
        assert!(ra.agrees_with(&rb));
    }

    #[test]
    fn test_divergent_content_detected() {
        let a = Store::new("a");
        let b = Store::new("b");

        a.put_entity(EntityKind::Notes, "n1", note("n1", "one"), true).unwrap();
        b.put_entity(EntityKind::Notes, "n1", note("n1", "ONE"), true).unwrap();

        let ra = check(&a);
        let rb = check(&b);
        assert_ne!(ra.entity_hashes["notes"], rb.entity_hashes["notes"]);
        assert!(!ra.agrees_with(&rb));
    }

    #[test]
    fn test_erased_rows_do_not_count() {
        let a = Store::new("a");
        let b = Store::new("b");

        a.put_entity(EntityKind::Notes, "n1", note("n1", "one"), true).unwrap();
        a.put_entity(EntityKind::Notes, "doomed", note("doomed", "x"), true).unwrap();
        a.erase_entity(EntityKind::Notes, "doomed").unwrap();
        b.put_entity(EntityKind::Notes, "n1", note("n1", "one"), true).unwrap();

        assert_eq!(
            check(&a).entity_hashes["notes"],
            check(&b).entity_hashes["notes"]
        );
    }

    #[test]
    fn test_report_wire_shape() {
        let store = Store::new("a");
        let report = check(&store);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"entityHashes\""));
        assert!(json.contains("\"maxEntityChangeId\":0"));
    }
}
