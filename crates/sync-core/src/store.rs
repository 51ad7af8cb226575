//! The central store: an append-only change log plus current entity tables.
//!
//! The log is the single source of truth for replication order. Ids are
//! assigned at append time, never reused and never reordered, so replaying
//! from any cursor `c + 1` is always safe and always complete.
//!
//! The store handle is passed explicitly; there is no process-wide log or
//! hidden cursor state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::change::{
    ChangeEnvelope, ChangeRecord, EntityKind, erased_hash, new_change_id, now_utc, row_hash,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown entity kind for entity '{0}'; refusing the whole batch")]
    UnknownKind(String),

    #[error("empty entity row for {kind} '{entity_id}'")]
    MissingEntityRow { kind: EntityKind, entity_id: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Per-batch counters for a push apply, logged once per batch.
#[derive(Debug, Default)]
pub struct ApplyContext {
    /// Entity ids updated, keyed by kind.
    pub updated: HashMap<EntityKind, Vec<String>>,
    pub erased: usize,
    pub already_erased: usize,
    /// Changes skipped because their change id was already in the log.
    pub already_applied: usize,
}

impl ApplyContext {
    pub fn updated_count(&self) -> usize {
        self.updated.values().map(Vec::len).sum()
    }
}

#[derive(Default)]
struct Inner {
    /// Append-only, ordered by `id`.
    changes: Vec<ChangeRecord>,
    /// Change ids already present, for idempotent replay.
    change_ids: HashSet<String>,
    /// Index into `changes` of the latest change per entity.
    latest: HashMap<(EntityKind, String), usize>,
    /// Current entity rows per kind. BTreeMap so iteration order (and thus
    /// the consistency aggregate) is deterministic.
    tables: HashMap<EntityKind, BTreeMap<String, Value>>,
    next_id: i64,
    initialized: bool,
}

impl Inner {
    fn append(
        &mut self,
        kind: EntityKind,
        entity_id: &str,
        hash: String,
        change_id: String,
        instance_id: &str,
        is_synced: bool,
        is_erased: bool,
        utc_date_changed: String,
    ) -> ChangeRecord {
        let record = ChangeRecord {
            id: self.next_id,
            change_id,
            kind,
            entity_id: entity_id.to_string(),
            hash,
            instance_id: instance_id.to_string(),
            is_synced,
            is_erased,
            utc_date_changed,
        };
        self.next_id += 1;

        self.change_ids.insert(record.change_id.clone());
        self.latest
            .insert((kind, entity_id.to_string()), self.changes.len());
        self.changes.push(record.clone());
        record
    }

    fn latest_change(&self, kind: EntityKind, entity_id: &str) -> Option<&ChangeRecord> {
        self.latest
            .get(&(kind, entity_id.to_string()))
            .map(|&idx| &self.changes[idx])
    }

    fn table_mut(&mut self, kind: EntityKind) -> &mut BTreeMap<String, Value> {
        self.tables.entry(kind).or_default()
    }
}

/// Durable entity store for one instance: the change log plus the current
/// row of every live entity.
pub struct Store {
    instance_id: String,
    inner: RwLock<Inner>,
}

impl Store {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            inner: RwLock::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    /// This instance's origin tag. Every locally produced change carries it.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Local mutations
    // ------------------------------------------------------------------

    /// Insert or replace an entity row locally, appending a change record
    /// tagged with this instance's id.
    pub fn put_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
        row: Value,
        is_synced: bool,
    ) -> Result<ChangeRecord> {
        if kind == EntityKind::Unknown {
            return Err(StoreError::UnknownKind(entity_id.to_string()));
        }
        let hash = row_hash(&row);
        let mut inner = self.write();
        inner.table_mut(kind).insert(entity_id.to_string(), row);
        Ok(inner.append(
            kind,
            entity_id,
            hash,
            new_change_id(),
            &self.instance_id,
            is_synced,
            false,
            now_utc(),
        ))
    }

    /// Permanently erase an entity locally. The row is dropped; only the
    /// erasure record remains in the log.
    pub fn erase_entity(&self, kind: EntityKind, entity_id: &str) -> Result<ChangeRecord> {
        if kind == EntityKind::Unknown {
            return Err(StoreError::UnknownKind(entity_id.to_string()));
        }
        let mut inner = self.write();
        inner.table_mut(kind).remove(entity_id);
        Ok(inner.append(
            kind,
            entity_id,
            erased_hash(kind, entity_id),
            new_change_id(),
            &self.instance_id,
            true,
            true,
            now_utc(),
        ))
    }

    // ------------------------------------------------------------------
    // Log queries
    // ------------------------------------------------------------------

    /// Ordered slice of synced changes with `id > cursor`, capped at `limit`.
    pub fn synced_changes_after(&self, cursor: i64, limit: usize) -> Vec<ChangeRecord> {
        self.read()
            .changes
            .iter()
            .filter(|c| c.is_synced && c.id > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// How many synced, non-echo changes remain beyond `cursor` for the
    /// given instance. Advisory: concurrent appends may race the count.
    pub fn outstanding_count(&self, instance_id: &str, cursor: i64) -> usize {
        self.read()
            .changes
            .iter()
            .filter(|c| c.is_synced && c.id > cursor && !c.is_echo_for(instance_id))
            .count()
    }

    /// Maximum id among synced records, 0 when none.
    pub fn max_synced_id(&self) -> i64 {
        self.read()
            .changes
            .iter()
            .filter(|c| c.is_synced)
            .map(|c| c.id)
            .max()
            .unwrap_or(0)
    }

    pub fn has_change_id(&self, change_id: &str) -> bool {
        self.read().change_ids.contains(change_id)
    }

    /// The most recent change for an entity, if any.
    pub fn latest_change_for(&self, kind: EntityKind, entity_id: &str) -> Option<ChangeRecord> {
        self.read().latest_change(kind, entity_id).cloned()
    }

    // ------------------------------------------------------------------
    // Entity queries
    // ------------------------------------------------------------------

    pub fn entity_row(&self, kind: EntityKind, entity_id: &str) -> Option<Value> {
        self.read()
            .tables
            .get(&kind)
            .and_then(|t| t.get(entity_id))
            .cloned()
    }

    /// All current rows of a kind, in entity-id order.
    pub fn rows_of(&self, kind: EntityKind) -> Vec<(String, Value)> {
        self.read()
            .tables
            .get(&kind)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Wrap change records with the current entity payload a client needs
    /// to apply them. Erased changes carry no payload.
    pub fn envelopes_for(&self, changes: &[ChangeRecord]) -> Vec<ChangeEnvelope> {
        let inner = self.read();
        changes
            .iter()
            .map(|change| {
                let entity = if change.is_erased {
                    None
                } else {
                    inner
                        .tables
                        .get(&change.kind)
                        .and_then(|t| t.get(&change.entity_id))
                        .cloned()
                };
                ChangeEnvelope {
                    change: change.clone(),
                    entity,
                }
            })
            .collect()
    }

    /// Number of live rows per kind. Diagnostic only.
    pub fn entity_counts(&self) -> HashMap<EntityKind, usize> {
        self.read()
            .tables
            .iter()
            .map(|(kind, table)| (*kind, table.len()))
            .collect()
    }

    /// Whether the store has completed its first sync and holds a usable
    /// dataset.
    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Idempotent; called after the first sync finishes.
    pub fn set_initialized(&self) {
        self.write().initialized = true;
    }

    // ------------------------------------------------------------------
    // Push apply
    // ------------------------------------------------------------------

    /// Apply a fully reassembled push payload as one atomic operation.
    ///
    /// The batch is validated up front; any failure applies nothing. The
    /// apply phase itself cannot fail, and runs under a single write guard,
    /// so either every entity in the payload is applied or none are.
    pub fn apply_batch(
        &self,
        envelopes: Vec<ChangeEnvelope>,
        submitter_instance_id: &str,
    ) -> Result<ApplyContext> {
        let mut ctx = ApplyContext::default();
        if envelopes.is_empty() {
            return Ok(ctx);
        }

        // Validate phase: reject the whole submission before touching state.
        for env in &envelopes {
            let change = &env.change;
            match change.kind {
                EntityKind::Unknown => {
                    return Err(StoreError::UnknownKind(change.entity_id.clone()));
                }
                EntityKind::NoteReordering => {
                    if env.entity.as_ref().and_then(Value::as_object).is_none() {
                        return Err(StoreError::Validation(format!(
                            "note_reordering '{}' payload must be a position map",
                            change.entity_id
                        )));
                    }
                }
                // Unsynced options may legitimately arrive without a payload.
                EntityKind::Options if env.entity.is_none() && !change.is_synced => {}
                kind => {
                    if !change.is_erased && env.entity.is_none() {
                        return Err(StoreError::MissingEntityRow {
                            kind,
                            entity_id: change.entity_id.clone(),
                        });
                    }
                }
            }
        }

        let mut inner = self.write();

        for env in envelopes {
            let change = env.change;

            if inner.change_ids.contains(&change.change_id) {
                ctx.already_applied += 1;
                continue;
            }

            match change.kind {
                EntityKind::NoteReordering => {
                    Self::apply_reordering(&mut inner, &env.entity, &mut ctx);
                    Self::record_remote_change(&mut inner, &change, submitter_instance_id);
                }
                EntityKind::Options if env.entity.is_none() && !change.is_synced => {
                    // Bookkeeping-only option from another instance; ignore.
                }
                _ => {
                    Self::apply_normal(&mut inner, change, env.entity, submitter_instance_id, &mut ctx);
                }
            }
        }

        info!(
            updated = ctx.updated_count(),
            erased = ctx.erased,
            already_erased = ctx.already_erased,
            already_applied = ctx.already_applied,
            "applied push batch from '{}'",
            submitter_instance_id
        );

        Ok(ctx)
    }

    /// Reordering touches position fields on existing branch rows; it never
    /// creates or destroys entities. Validated as an object map up front.
    fn apply_reordering(inner: &mut Inner, entity: &Option<Value>, ctx: &mut ApplyContext) {
        let Some(positions) = entity.as_ref().and_then(Value::as_object) else {
            return;
        };
        let table = inner.table_mut(EntityKind::Branches);
        for (branch_id, position) in positions {
            if let Some(row) = table.get_mut(branch_id) {
                row["notePosition"] = position.clone();
                ctx.updated
                    .entry(EntityKind::Branches)
                    .or_default()
                    .push(branch_id.clone());
            } else {
                warn!("note_reordering references unknown branch '{}'", branch_id);
            }
        }
    }

    fn apply_normal(
        inner: &mut Inner,
        remote: ChangeRecord,
        entity: Option<Value>,
        submitter_instance_id: &str,
        ctx: &mut ApplyContext,
    ) {
        let local = inner.latest_change(remote.kind, &remote.entity_id).cloned();
        let local_is_newer = local
            .as_ref()
            .map(|l| l.utc_date_changed > remote.utc_date_changed)
            .unwrap_or(false);

        if local_is_newer {
            // Our row is newer; if content diverged, re-announce the local
            // change under a fresh id so the other side pulls it back.
            if let Some(local) = local {
                if local.hash != remote.hash || local.is_erased != remote.is_erased {
                    let instance_id = local.instance_id.clone();
                    inner.append(
                        local.kind,
                        &local.entity_id.clone(),
                        local.hash,
                        new_change_id(),
                        &instance_id,
                        local.is_synced,
                        local.is_erased,
                        local.utc_date_changed,
                    );
                }
            }
            return;
        }

        if remote.is_erased {
            inner.table_mut(remote.kind).remove(&remote.entity_id);
            if local.map(|l| l.is_erased).unwrap_or(false) {
                ctx.already_erased += 1;
            } else {
                ctx.erased += 1;
            }
        } else if let Some(row) = entity {
            inner
                .table_mut(remote.kind)
                .insert(remote.entity_id.clone(), row);
            ctx.updated
                .entry(remote.kind)
                .or_default()
                .push(remote.entity_id.clone());
        }

        Self::record_remote_change(inner, &remote, submitter_instance_id);
    }

    /// Record an applied remote change in our own log, tagged with the
    /// submitter's instance id so pulls never echo it back to them.
    fn record_remote_change(inner: &mut Inner, remote: &ChangeRecord, submitter_instance_id: &str) {
        inner.append(
            remote.kind,
            &remote.entity_id,
            remote.hash.clone(),
            remote.change_id.clone(),
            submitter_instance_id,
            remote.is_synced,
            remote.is_erased,
            remote.utc_date_changed.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_row(id: &str, title: &str) -> Value {
        json!({"noteId": id, "title": title, "type": "text", "mime": "text/html"})
    }

    fn envelope(
        kind: EntityKind,
        entity_id: &str,
        row: Option<Value>,
        instance: &str,
        utc: &str,
    ) -> ChangeEnvelope {
        let hash = row
            .as_ref()
            .map(row_hash)
            .unwrap_or_else(|| erased_hash(kind, entity_id));
        ChangeEnvelope {
            change: ChangeRecord {
                id: 0,
                change_id: new_change_id(),
                kind,
                entity_id: entity_id.into(),
                hash,
                instance_id: instance.into(),
                is_synced: true,
                is_erased: row.is_none(),
                utc_date_changed: utc.into(),
            },
            entity: row,
        }
    }

    #[test]
    fn test_append_assigns_strictly_increasing_ids() {
        let store = Store::new("inst-a");
        let c1 = store
            .put_entity(EntityKind::Notes, "n1", note_row("n1", "one"), true)
            .unwrap();
        let c2 = store
            .put_entity(EntityKind::Notes, "n2", note_row("n2", "two"), true)
            .unwrap();
        let c3 = store.erase_entity(EntityKind::Notes, "n1").unwrap();

        assert!(c1.id < c2.id && c2.id < c3.id);
        assert_eq!(store.max_synced_id(), c3.id);
        assert!(store.entity_row(EntityKind::Notes, "n1").is_none());
        assert_eq!(store.entity_counts()[&EntityKind::Notes], 1);
    }

    #[test]
    fn test_synced_changes_after_cursor() {
        let store = Store::new("inst-a");
        for i in 0..5 {
            store
                .put_entity(
                    EntityKind::Notes,
                    &format!("n{i}"),
                    note_row(&format!("n{i}"), "t"),
                    true,
                )
                .unwrap();
        }
        store
            .put_entity(EntityKind::Options, "local", json!({"name": "local", "value": "1"}), false)
            .unwrap();

        let page = store.synced_changes_after(2, 100);
        assert_eq!(page.len(), 3);
        assert!(page.iter().all(|c| c.id > 2 && c.is_synced));
    }

    #[test]
    fn test_apply_batch_is_idempotent() {
        let store = Store::new("server");
        let env = envelope(
            EntityKind::Notes,
            "n1",
            Some(note_row("n1", "hello")),
            "client",
            "2026-01-01 10:00:00.000Z",
        );

        let ctx = store.apply_batch(vec![env.clone()], "client").unwrap();
        assert_eq!(ctx.updated_count(), 1);

        let ctx = store.apply_batch(vec![env], "client").unwrap();
        assert_eq!(ctx.already_applied, 1);
        assert_eq!(ctx.updated_count(), 0);
    }

    #[test]
    fn test_apply_batch_records_submitter_as_origin() {
        let store = Store::new("server");
        let env = envelope(
            EntityKind::Notes,
            "n1",
            Some(note_row("n1", "hello")),
            "client",
            "2026-01-01 10:00:00.000Z",
        );
        store.apply_batch(vec![env], "client").unwrap();

        let latest = store.latest_change_for(EntityKind::Notes, "n1").unwrap();
        assert_eq!(latest.instance_id, "client");
        // Echo suppression: nothing outstanding for the submitter.
        assert_eq!(store.outstanding_count("client", 0), 0);
        assert_eq!(store.outstanding_count("other", 0), 1);
    }

    #[test]
    fn test_apply_batch_last_writer_wins() {
        let store = Store::new("server");
        store
            .put_entity(EntityKind::Notes, "n1", note_row("n1", "local"), true)
            .unwrap();
        let local = store.latest_change_for(EntityKind::Notes, "n1").unwrap();

        // Remote change older than our local one: row must not move, and the
        // local change is re-announced so the submitter pulls it back.
        let stale = envelope(
            EntityKind::Notes,
            "n1",
            Some(note_row("n1", "stale")),
            "client",
            "2000-01-01 00:00:00.000Z",
        );
        let before = store.max_synced_id();
        store.apply_batch(vec![stale], "client").unwrap();

        let row = store.entity_row(EntityKind::Notes, "n1").unwrap();
        assert_eq!(row["title"], "local");

        let reannounced = store.latest_change_for(EntityKind::Notes, "n1").unwrap();
        assert!(reannounced.id > before);
        assert_eq!(reannounced.hash, local.hash);
        assert_ne!(reannounced.change_id, local.change_id);
        // Re-announced under the original origin, not the submitter, so the
        // submitting instance will receive it on its next pull.
        assert_eq!(reannounced.instance_id, "server");
    }

    #[test]
    fn test_apply_batch_newer_remote_overwrites() {
        let store = Store::new("server");
        store
            .put_entity(EntityKind::Notes, "n1", note_row("n1", "local"), true)
            .unwrap();

        let newer = envelope(
            EntityKind::Notes,
            "n1",
            Some(note_row("n1", "remote")),
            "client",
            "2999-01-01 00:00:00.000Z",
        );
        store.apply_batch(vec![newer], "client").unwrap();

        let row = store.entity_row(EntityKind::Notes, "n1").unwrap();
        assert_eq!(row["title"], "remote");
    }

    #[test]
    fn test_apply_batch_erasure() {
        let store = Store::new("server");
        store
            .put_entity(EntityKind::Notes, "n1", note_row("n1", "doomed"), true)
            .unwrap();

        let erase = envelope(
            EntityKind::Notes,
            "n1",
            None,
            "client",
            "2999-01-01 00:00:00.000Z",
        );
        let ctx = store.apply_batch(vec![erase.clone()], "client").unwrap();
        assert_eq!(ctx.erased, 1);
        assert!(store.entity_row(EntityKind::Notes, "n1").is_none());

        // A second erasure (fresh change id) is counted but harmless.
        let mut again = erase;
        again.change.change_id = new_change_id();
        let ctx = store.apply_batch(vec![again], "client").unwrap();
        assert_eq!(ctx.already_erased, 1);
    }

    #[test]
    fn test_apply_batch_atomicity_on_validation_failure() {
        let store = Store::new("server");
        let good = envelope(
            EntityKind::Notes,
            "n1",
            Some(note_row("n1", "good")),
            "client",
            "2026-01-01 10:00:00.000Z",
        );
        // Non-erased change without a row: the whole batch must be rejected.
        let mut bad = envelope(
            EntityKind::Branches,
            "b1",
            Some(json!({})),
            "client",
            "2026-01-01 10:00:00.000Z",
        );
        bad.entity = None;
        bad.change.is_erased = false;

        let err = store.apply_batch(vec![good, bad], "client").unwrap_err();
        assert!(matches!(err, StoreError::MissingEntityRow { .. }));
        assert!(store.entity_row(EntityKind::Notes, "n1").is_none());
        assert_eq!(store.max_synced_id(), 0);
    }

    #[test]
    fn test_apply_batch_rejects_unknown_kind() {
        let store = Store::new("server");
        let mut env = envelope(
            EntityKind::Notes,
            "x1",
            Some(json!({"foo": 1})),
            "client",
            "2026-01-01 10:00:00.000Z",
        );
        env.change.kind = EntityKind::Unknown;

        let err = store.apply_batch(vec![env], "client").unwrap_err();
        assert!(matches!(err, StoreError::UnknownKind(_)));
    }

    #[test]
    fn test_apply_note_reordering_updates_positions() {
        let store = Store::new("server");
        store
            .put_entity(
                EntityKind::Branches,
                "b1",
                json!({"branchId": "b1", "noteId": "n1", "parentNoteId": "root", "notePosition": 10}),
                true,
            )
            .unwrap();

        let reorder = ChangeEnvelope {
            change: ChangeRecord {
                id: 0,
                change_id: new_change_id(),
                kind: EntityKind::NoteReordering,
                entity_id: "root".into(),
                hash: "reorder".into(),
                instance_id: "client".into(),
                is_synced: true,
                is_erased: false,
                utc_date_changed: now_utc(),
            },
            entity: Some(json!({"b1": 20})),
        };

        store.apply_batch(vec![reorder], "client").unwrap();
        let row = store.entity_row(EntityKind::Branches, "b1").unwrap();
        assert_eq!(row["notePosition"], 20);
    }

    #[test]
    fn test_envelopes_carry_current_rows() {
        let store = Store::new("inst-a");
        store
            .put_entity(EntityKind::Notes, "n1", note_row("n1", "v1"), true)
            .unwrap();
        store
            .put_entity(EntityKind::Notes, "n1", note_row("n1", "v2"), true)
            .unwrap();

        let changes = store.synced_changes_after(0, 100);
        let envelopes = store.envelopes_for(&changes);
        // Both records exist, but each envelope carries the current row.
        assert_eq!(envelopes.len(), 2);
        for env in &envelopes {
            assert_eq!(env.entity.as_ref().unwrap()["title"], "v2");
        }
    }
}
