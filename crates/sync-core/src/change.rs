//! Change records: the unit of replication.
//!
//! A change record describes one mutation of one entity. Records are created
//! once, are immutable after an `id` is assigned, and are never updated — a
//! later mutation of the same entity produces a new record with a larger id.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Entity collections covered by the replication log.
///
/// A closed set: reducers match exhaustively and treat `Unknown` as a schema
/// error, since the client and server disagreeing on entity types makes any
/// partial application unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Notes,
    Branches,
    Attributes,
    Revisions,
    Attachments,
    Blobs,
    Options,
    NoteReordering,
    /// Forward-compatibility catch-all for entity types this build does not
    /// know about. Deserializes from any unrecognized name.
    #[serde(other)]
    Unknown,
}

impl EntityKind {
    /// Kinds backed by an entity table in the store. `note_reordering` is a
    /// virtual kind (its payload addresses branch rows) and has no table.
    pub const TABLES: [EntityKind; 7] = [
        EntityKind::Notes,
        EntityKind::Branches,
        EntityKind::Attributes,
        EntityKind::Revisions,
        EntityKind::Attachments,
        EntityKind::Blobs,
        EntityKind::Options,
    ];

    /// Wire name of the kind (the original table name).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Notes => "notes",
            EntityKind::Branches => "branches",
            EntityKind::Attributes => "attributes",
            EntityKind::Revisions => "revisions",
            EntityKind::Attachments => "attachments",
            EntityKind::Blobs => "blobs",
            EntityKind::Options => "options",
            EntityKind::NoteReordering => "note_reordering",
            EntityKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row in the replication log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Strictly increasing, assigned at append time. Total order within one
    /// log; a cursor value fully determines "everything already seen".
    pub id: i64,
    /// Globally unique id of the change itself, used for idempotent replay.
    pub change_id: String,
    /// Which entity table the change applies to.
    #[serde(rename = "entityName")]
    pub kind: EntityKind,
    /// Identifier of the affected entity, unique within its kind.
    pub entity_id: String,
    /// Content fingerprint of the row at the time of the change.
    pub hash: String,
    /// Identifier of the instance that produced the change.
    pub instance_id: String,
    /// Whether this record is eligible for replication. Local bookkeeping
    /// changes (e.g. per-instance options) are excluded.
    pub is_synced: bool,
    /// Whether the entity was permanently and irrecoverably deleted.
    pub is_erased: bool,
    /// UTC timestamp of the change, ISO formatted so string comparison
    /// orders chronologically. Drives last-writer-wins on push apply.
    pub utc_date_changed: String,
}

impl ChangeRecord {
    /// True if this record is an echo for the given instance.
    pub fn is_echo_for(&self, instance_id: &str) -> bool {
        self.instance_id == instance_id
    }
}

/// A change record together with the entity payload the receiving side needs
/// to apply it. The payload is absent when the entity was erased (and may be
/// absent for unsynced options).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    #[serde(rename = "entityChange")]
    pub change: ChangeRecord,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entity: Option<Value>,
}

/// Compute the content fingerprint of an entity row.
///
/// `serde_json::Value` objects keep keys sorted, so serialization is
/// deterministic across instances.
pub fn row_hash(row: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(row.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint recorded for an erased entity, where no row exists anymore.
pub fn erased_hash(kind: EntityKind, entity_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(entity_id.as_bytes());
    hasher.update(b"|erased");
    hex::encode(hasher.finalize())
}

/// Generate a fresh change id.
pub fn new_change_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current UTC time in the log's timestamp format.
pub fn now_utc() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&EntityKind::NoteReordering).unwrap(),
            "\"note_reordering\""
        );
        assert_eq!(serde_json::to_string(&EntityKind::Notes).unwrap(), "\"notes\"");
    }

    #[test]
    fn test_unrecognized_kind_deserializes_as_unknown() {
        let kind: EntityKind = serde_json::from_str("\"note_embeddings\"").unwrap();
        assert_eq!(kind, EntityKind::Unknown);
    }

    #[test]
    fn test_row_hash_deterministic_across_key_order() {
        let a = json!({"noteId": "n1", "title": "hello"});
        let b = json!({"title": "hello", "noteId": "n1"});
        assert_eq!(row_hash(&a), row_hash(&b));
    }

    #[test]
    fn test_row_hash_differs_on_content() {
        let a = json!({"noteId": "n1", "title": "hello"});
        let b = json!({"noteId": "n1", "title": "world"});
        assert_ne!(row_hash(&a), row_hash(&b));
    }

    #[test]
    fn test_change_record_wire_shape() {
        let rec = ChangeRecord {
            id: 7,
            change_id: "abc".into(),
            kind: EntityKind::Branches,
            entity_id: "b1".into(),
            hash: "h".into(),
            instance_id: "inst-a".into(),
            is_synced: true,
            is_erased: false,
            utc_date_changed: "2026-01-01 00:00:00.000Z".into(),
        };

        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"entityName\":\"branches\""));
        assert!(json.contains("\"entityId\":\"b1\""));
        assert!(json.contains("\"instanceId\":\"inst-a\""));
        assert!(json.contains("\"isSynced\":true"));
        assert!(json.contains("\"utcDateChanged\""));
    }

    #[test]
    fn test_envelope_omits_absent_entity() {
        let rec = ChangeRecord {
            id: 1,
            change_id: new_change_id(),
            kind: EntityKind::Notes,
            entity_id: "n1".into(),
            hash: erased_hash(EntityKind::Notes, "n1"),
            instance_id: "inst-a".into(),
            is_synced: true,
            is_erased: true,
            utc_date_changed: now_utc(),
        };
        let env = ChangeEnvelope { change: rec, entity: None };
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("\"entity\""));
        assert!(json.contains("\"entityChange\""));
    }

    #[test]
    fn test_timestamps_order_lexicographically() {
        let earlier = "2026-01-01 09:59:59.999Z";
        let later = "2026-01-01 10:00:00.000Z";
        assert!(earlier < later);
    }
}
