//! Pull service: serves an ordered, echo-filtered slice of the change log.
//!
//! Read-only and side-effect-free; safe under unbounded concurrency with any
//! number of in-flight pushes.

use tracing::info;

use sync_core::protocol::{PullRequest, PullResponse};
use sync_core::store::Store;

use crate::error::{Result, SyncError};

/// Raw rows read per internal iteration.
pub const PULL_PAGE_SIZE: usize = 1000;

/// Return changes with `id > lastEntityChangeId` that did not originate from
/// the requesting instance, capped at one page.
///
/// When a raw page is non-empty but consists purely of the caller's own
/// writes, the cursor is advanced past it and the read repeats; otherwise an
/// instance whose writes dominate the log tail would see an endless sequence
/// of empty responses. Each iteration advances the cursor by at least a full
/// raw page, so the loop is bounded.
pub fn changed(store: &Store, req: &PullRequest) -> Result<PullResponse> {
    if req.last_entity_change_id < 0 {
        return Err(SyncError::Validation(format!(
            "invalid last entity change id: {}",
            req.last_entity_change_id
        )));
    }

    let mut cursor = req.last_entity_change_id;
    let mut filtered = Vec::new();

    loop {
        let page = store.synced_changes_after(cursor, PULL_PAGE_SIZE);
        let Some(last_raw) = page.last() else {
            break;
        };
        let last_raw_id = last_raw.id;

        filtered = page
            .into_iter()
            .filter(|c| !c.is_echo_for(&req.instance_id))
            .collect();

        if filtered.is_empty() {
            // Pure echo page; skip past it and keep reading.
            cursor = last_raw_id;
        } else {
            break;
        }
    }

    let entity_changes = store.envelopes_for(&filtered);

    let last_entity_change_id = match filtered.last() {
        Some(last) => {
            info!(
                "returning {} entity changes to '{}'",
                filtered.len(),
                req.instance_id
            );
            last.id
        }
        None => cursor,
    };

    Ok(PullResponse {
        entity_changes,
        last_entity_change_id,
        outstanding_pull_count: store.outstanding_count(&req.instance_id, last_entity_change_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_core::{ChangeEnvelope, ChangeRecord, EntityKind, new_change_id};

    fn seed(store: &Store, entity_id: &str, origin: &str) {
        let row = json!({"noteId": entity_id, "title": entity_id, "type": "text"});
        let env = ChangeEnvelope {
            change: ChangeRecord {
                id: 0,
                change_id: new_change_id(),
                kind: EntityKind::Notes,
                entity_id: entity_id.into(),
                hash: sync_core::row_hash(&row),
                instance_id: origin.into(),
                is_synced: true,
                is_erased: false,
                utc_date_changed: sync_core::now_utc(),
            },
            entity: Some(row),
        };
        store.apply_batch(vec![env], origin).unwrap();
    }

    fn pull(store: &Store, instance: &str, cursor: i64) -> PullResponse {
        changed(
            store,
            &PullRequest {
                instance_id: instance.into(),
                last_entity_change_id: cursor,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_echo_suppression() {
        let store = Store::new("server");
        seed(&store, "n1", "a");
        seed(&store, "n2", "b");

        let resp = pull(&store, "b", 0);
        assert_eq!(resp.entity_changes.len(), 1);
        assert_eq!(resp.entity_changes[0].change.entity_id, "n1");
        assert!(resp.entity_changes.iter().all(|e| e.change.instance_id != "b"));
    }

    #[test]
    fn test_concrete_two_record_scenario() {
        // Records [{id:101-ish, origin:"A"}, {origin:"B"}], caller B:
        // only A's record comes back and nothing is outstanding.
        let store = Store::new("server");
        seed(&store, "n1", "A");
        seed(&store, "n2", "B");

        let resp = pull(&store, "B", 0);
        assert_eq!(resp.entity_changes.len(), 1);
        assert_eq!(resp.entity_changes[0].change.instance_id, "A");
        assert_eq!(resp.outstanding_pull_count, 0);
    }

    #[test]
    fn test_monotonic_cursor_never_returns_seen_records() {
        let store = Store::new("server");
        for i in 0..10 {
            seed(&store, &format!("n{i}"), "a");
        }

        let first = pull(&store, "b", 0);
        assert!(!first.entity_changes.is_empty());
        let c1 = first.last_entity_change_id;

        let second = pull(&store, "b", c1);
        assert!(second.entity_changes.iter().all(|e| e.change.id > c1));
    }

    #[test]
    fn test_pure_echo_tail_advances_cursor() {
        let store = Store::new("server");
        seed(&store, "n1", "other");
        // The caller's own writes dominate the tail of the log.
        for i in 0..5 {
            seed(&store, &format!("mine{i}"), "caller");
        }

        let first = pull(&store, "caller", 0);
        assert_eq!(first.entity_changes.len(), 1);
        assert_eq!(first.entity_changes[0].change.instance_id, "other");

        // Second pull from the returned cursor: the echo tail is skipped,
        // the cursor still moves forward past it, and nothing is outstanding.
        let second = pull(&store, "caller", first.last_entity_change_id);
        assert!(second.entity_changes.is_empty());
        assert!(second.last_entity_change_id >= first.last_entity_change_id);
        assert_eq!(second.outstanding_pull_count, 0);
    }

    #[test]
    fn test_outstanding_count_decreases_across_drains() {
        let store = Store::new("server");
        for i in 0..7 {
            seed(&store, &format!("n{i}"), "a");
        }

        let mut cursor = 0;
        let mut last_outstanding = usize::MAX;
        loop {
            let resp = pull(&store, "b", cursor);
            assert!(resp.outstanding_pull_count <= last_outstanding);
            last_outstanding = resp.outstanding_pull_count;
            cursor = resp.last_entity_change_id;
            if resp.entity_changes.is_empty() {
                break;
            }
        }
        assert_eq!(last_outstanding, 0);
    }

    #[test]
    fn test_negative_cursor_rejected() {
        let store = Store::new("server");
        let err = changed(
            &store,
            &PullRequest {
                instance_id: "b".into(),
                last_entity_change_id: -1,
            },
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_erased_changes_carry_no_payload() {
        let store = Store::new("server");
        seed(&store, "n1", "a");
        store.erase_entity(EntityKind::Notes, "n1").unwrap();

        let resp = pull(&store, "b", 0);
        let erased: Vec<_> = resp
            .entity_changes
            .iter()
            .filter(|e| e.change.is_erased)
            .collect();
        assert_eq!(erased.len(), 1);
        assert!(erased[0].entity.is_none());
    }
}
