//! Reconciliation of pulled change batches into the client cache.
//!
//! A batch runs in three phases:
//!
//! 1. Dispatch: every record is parsed and validated up front, then applied
//!    through a per-kind reducer. A parse failure or unrecognized entity
//!    kind rejects the whole batch before anything mutates.
//! 2. Repair scan: reducers queue note ids the cache now structurally needs
//!    (branch endpoints, inheritance-relation targets); one tree load
//!    fetches all of them and splices them in.
//! 3. Notify: a single `EntitiesReloaded` event with the aggregated
//!    `LoadResults`, only when the batch touched anything of interest.
//!
//! An erased note that is present in the cache aborts the batch and rebuilds
//! the cache from the initial tree instead; surgically unpicking an erasure
//! is not worth the complexity.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use sync_core::change::{ChangeEnvelope, EntityKind};
use sync_core::rows::{AttachmentRow, AttributeRow, BranchRow, NoteRow};

use crate::bus::{CacheEvent, EventBus};
use crate::cache::Cache;
use crate::entities::{CachedAttachment, CachedAttribute, CachedBranch};
use crate::load_results::LoadResults;
use crate::loader::{LoaderError, TreeLoader};

/// Options that change too often and carry no UI-relevant state to be worth
/// an event.
const IGNORED_OPTION_NAMES: [&str; 2] = ["openNoteContexts", "lastDailyBackupDate"];

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("change for '{entity_id}' has an unrecognized entity kind")]
    Schema { entity_id: String },
    #[error("malformed {kind} payload for '{entity_id}'")]
    Malformed {
        kind: EntityKind,
        entity_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Loader(#[from] LoaderError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch was applied incrementally.
    Applied,
    /// A cached note was erased; the cache was rebuilt from scratch and the
    /// rest of the batch was abandoned.
    FullReload,
}

/// A change record parsed into its typed payload. Construction validates the
/// whole batch before any reducer runs.
enum ParsedChange {
    Note {
        note_id: String,
        erased: bool,
        row: Option<NoteRow>,
    },
    Branch {
        branch_id: String,
        erased: bool,
        row: Option<BranchRow>,
    },
    Attribute {
        attribute_id: String,
        erased: bool,
        row: Option<AttributeRow>,
    },
    Attachment {
        attachment_id: String,
        erased: bool,
        row: Option<AttachmentRow>,
    },
    Blob {
        blob_id: String,
    },
    Revision {
        revision_id: String,
        note_id: Option<String>,
    },
    Option {
        name: String,
        value: Option<String>,
    },
    NoteReordering {
        parent_note_id: String,
        /// branch id -> new position.
        positions: HashMap<String, i64>,
    },
}

fn parse_row<T: DeserializeOwned>(
    kind: EntityKind,
    entity_id: &str,
    entity: Option<&Value>,
) -> Result<Option<T>> {
    match entity {
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|source| ReconcileError::Malformed {
                kind,
                entity_id: entity_id.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

fn parse_change(envelope: &ChangeEnvelope) -> Result<ParsedChange> {
    let change = &envelope.change;
    let entity_id = change.entity_id.clone();
    let erased = change.is_erased;
    let entity = envelope.entity.as_ref();

    match change.kind {
        EntityKind::Notes => Ok(ParsedChange::Note {
            row: if erased {
                None
            } else {
                parse_row(change.kind, &entity_id, entity)?
            },
            note_id: entity_id,
            erased,
        }),
        EntityKind::Branches => Ok(ParsedChange::Branch {
            row: if erased {
                None
            } else {
                parse_row(change.kind, &entity_id, entity)?
            },
            branch_id: entity_id,
            erased,
        }),
        EntityKind::Attributes => Ok(ParsedChange::Attribute {
            row: if erased {
                None
            } else {
                parse_row(change.kind, &entity_id, entity)?
            },
            attribute_id: entity_id,
            erased,
        }),
        EntityKind::Attachments => Ok(ParsedChange::Attachment {
            row: if erased {
                None
            } else {
                parse_row(change.kind, &entity_id, entity)?
            },
            attachment_id: entity_id,
            erased,
        }),
        EntityKind::Blobs => Ok(ParsedChange::Blob { blob_id: entity_id }),
        EntityKind::Revisions => Ok(ParsedChange::Revision {
            revision_id: entity_id,
            note_id: entity
                .and_then(|v| v.get("noteId"))
                .and_then(|v| v.as_str())
                .map(String::from),
        }),
        EntityKind::Options => Ok(ParsedChange::Option {
            name: entity_id,
            value: entity
                .and_then(|v| v.get("value"))
                .and_then(|v| v.as_str())
                .map(String::from),
        }),
        EntityKind::NoteReordering => {
            let positions = match entity {
                Some(value) => serde_json::from_value(value.clone()).map_err(|source| {
                    ReconcileError::Malformed {
                        kind: change.kind,
                        entity_id: entity_id.clone(),
                        source,
                    }
                })?,
                None => HashMap::new(),
            };
            Ok(ParsedChange::NoteReordering {
                parent_note_id: entity_id,
                positions,
            })
        }
        EntityKind::Unknown => Err(ReconcileError::Schema { entity_id }),
    }
}

pub struct Reconciler<L: TreeLoader> {
    cache: Cache,
    loader: L,
    bus: Arc<EventBus>,
}

impl<L: TreeLoader> Reconciler<L> {
    pub fn new(loader: L) -> Self {
        Self {
            cache: Cache::new(),
            loader,
            bus: Arc::new(EventBus::new()),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut Cache {
        &mut self.cache
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Apply one pulled batch. Batches must be applied in pull order; the
    /// `&mut self` receiver serializes them.
    pub async fn apply_batch(&mut self, batch: &[ChangeEnvelope]) -> Result<BatchOutcome> {
        let parsed = batch
            .iter()
            .map(parse_change)
            .collect::<Result<Vec<_>>>()?;

        let mut results = LoadResults::default();
        let mut missing: BTreeSet<String> = BTreeSet::new();
        let mut rewire: Vec<String> = Vec::new();

        for change in &parsed {
            if self.apply_one(change, &mut results, &mut missing, &mut rewire) {
                return self.full_reload().await;
            }
        }

        missing.retain(|id| !self.cache.notes.contains_key(id));
        if !missing.is_empty() {
            let note_ids: Vec<String> = missing.into_iter().collect();
            tracing::debug!(count = note_ids.len(), "fetching notes missing from the cache");
            let data = self.loader.load_tree(&note_ids).await?;
            self.cache.add_tree(data);
        }

        // Branches applied while an endpoint was still uncached were wired on
        // one side only; the fetch brings the endpoint in but not this branch,
        // so run the wiring again.
        for branch_id in rewire {
            if let Some(branch) = self.cache.branches.get(&branch_id).cloned() {
                self.cache.upsert_branch(&branch);
            }
        }

        if results.has_attribute_changes() {
            self.cache.clear_inherited_cache();
        }
        if !results.is_empty() {
            self.bus.emit(CacheEvent::EntitiesReloaded { results });
        }
        Ok(BatchOutcome::Applied)
    }

    /// Apply a single parsed change. Returns true when the cache must be
    /// rebuilt from scratch (a cached note was erased).
    fn apply_one(
        &mut self,
        change: &ParsedChange,
        results: &mut LoadResults,
        missing: &mut BTreeSet<String>,
        rewire: &mut Vec<String>,
    ) -> bool {
        match change {
            ParsedChange::Note { note_id, erased: true, .. } => {
                if self.cache.notes.contains_key(note_id) {
                    return true;
                }
            }
            ParsedChange::Note { note_id, row: Some(row), .. } => {
                let Some(old_blob_id) = self.cache.notes.get(note_id).map(|n| n.blob_id.clone())
                else {
                    return false; // not cached, not of interest
                };
                // Soft delete: evict without the full reload an erasure costs.
                if row.is_deleted {
                    self.cache.remove_note(note_id);
                    results.add_note(note_id);
                    return false;
                }
                if old_blob_id != row.blob_id {
                    self.cache.invalidate_blob(EntityKind::Notes, note_id);
                    results.add_note_content(note_id);
                }
                if let Some(note) = self.cache.notes.get_mut(note_id) {
                    note.update(row);
                }
                results.add_note(note_id);
            }
            ParsedChange::Note { .. } => {}

            ParsedChange::Branch { branch_id, erased: true, .. } => {
                if let Some(branch) = self.cache.remove_branch(branch_id) {
                    self.cache.resort_children(&branch.parent_note_id);
                    results.add_branch(branch_id, &branch.note_id, &branch.parent_note_id);
                }
            }
            ParsedChange::Branch { branch_id, row: Some(row), .. } => {
                if row.is_deleted {
                    if let Some(branch) = self.cache.remove_branch(branch_id) {
                        results.add_branch(branch_id, &branch.note_id, &branch.parent_note_id);
                    }
                    return false;
                }
                let child_cached = self.cache.notes.contains_key(&row.note_id);
                let parent_cached = self.cache.notes.contains_key(&row.parent_note_id);
                if !child_cached && !parent_cached && !self.cache.branches.contains_key(branch_id) {
                    return false;
                }
                // A cached branch must have both endpoints present. Fetching
                // the endpoint does not wire this branch into it, so the
                // branch is queued for a second wiring pass after the fetch.
                if !child_cached {
                    missing.insert(row.note_id.clone());
                }
                if !parent_cached {
                    missing.insert(row.parent_note_id.clone());
                }
                if !child_cached || !parent_cached {
                    rewire.push(branch_id.clone());
                }
                self.cache.upsert_branch(&CachedBranch::from_row(row));
                results.add_branch(branch_id, &row.note_id, &row.parent_note_id);
            }
            ParsedChange::Branch { .. } => {}

            ParsedChange::Attribute { attribute_id, erased: true, .. } => {
                if let Some(attr) = self.cache.remove_attribute(attribute_id) {
                    results.add_attribute(attribute_id, &attr.name, &attr.note_id);
                }
            }
            ParsedChange::Attribute { attribute_id, row: Some(row), .. } => {
                if row.is_deleted {
                    if let Some(attr) = self.cache.remove_attribute(attribute_id) {
                        results.add_attribute(attribute_id, &attr.name, &attr.note_id);
                    }
                    return false;
                }
                let owner_cached = self.cache.notes.contains_key(&row.note_id);
                if !owner_cached && !self.cache.attributes.contains_key(attribute_id) {
                    return false;
                }
                let attr = CachedAttribute::from_row(row);
                // Inheritance targets are structurally required: attribute
                // resolution on the owner traverses into them.
                if attr.is_inheritance_relation() && !self.cache.notes.contains_key(&attr.value) {
                    missing.insert(attr.value.clone());
                }
                self.cache.upsert_attribute(&attr);
                results.add_attribute(attribute_id, &row.name, &row.note_id);
            }
            ParsedChange::Attribute { .. } => {}

            ParsedChange::Attachment { attachment_id, erased: true, .. } => {
                if self.cache.remove_attachment(attachment_id).is_some() {
                    self.cache.invalidate_blob(EntityKind::Attachments, attachment_id);
                    results.add_attachment(attachment_id);
                }
            }
            ParsedChange::Attachment { attachment_id, row: Some(row), .. } => {
                if row.is_deleted {
                    if self.cache.remove_attachment(attachment_id).is_some() {
                        self.cache.invalidate_blob(EntityKind::Attachments, attachment_id);
                        results.add_attachment(attachment_id);
                    }
                    return false;
                }
                if !self.cache.notes.contains_key(&row.owner_id) {
                    return false;
                }
                let old_blob_id = self
                    .cache
                    .attachments
                    .get(attachment_id)
                    .and_then(|a| a.blob_id.clone());
                if old_blob_id != row.blob_id {
                    self.cache.invalidate_blob(EntityKind::Attachments, attachment_id);
                }
                self.cache.upsert_attachment(&CachedAttachment::from_row(row));
                results.add_attachment(attachment_id);
            }
            ParsedChange::Attachment { .. } => {}

            ParsedChange::Blob { blob_id } => {
                let note_owners: Vec<String> = self
                    .cache
                    .notes
                    .values()
                    .filter(|n| n.blob_id.as_deref() == Some(blob_id))
                    .map(|n| n.note_id.clone())
                    .collect();
                for note_id in note_owners {
                    self.cache.invalidate_blob(EntityKind::Notes, &note_id);
                    results.add_note_content(&note_id);
                }

                let attachment_owners: Vec<String> = self
                    .cache
                    .attachments
                    .values()
                    .filter(|a| a.blob_id.as_deref() == Some(blob_id))
                    .map(|a| a.attachment_id.clone())
                    .collect();
                for attachment_id in attachment_owners {
                    self.cache.invalidate_blob(EntityKind::Attachments, &attachment_id);
                    results.add_attachment(&attachment_id);
                }
            }

            ParsedChange::Revision { revision_id, note_id } => {
                results.add_revision(revision_id, note_id.as_deref());
            }

            ParsedChange::Option { name, value } => {
                if let Some(value) = value {
                    self.cache.set_option(name, value);
                }
                if !IGNORED_OPTION_NAMES.contains(&name.as_str()) {
                    results.add_option(name);
                }
            }

            ParsedChange::NoteReordering { parent_note_id, positions } => {
                let mut touched = false;
                for (branch_id, position) in positions {
                    if let Some(branch) = self.cache.branches.get_mut(branch_id) {
                        branch.note_position = *position;
                        touched = true;
                    }
                }
                if touched {
                    self.cache.resort_children(parent_note_id);
                    results.add_note_reordering(parent_note_id);
                }
            }
        }
        false
    }

    async fn full_reload(&mut self) -> Result<BatchOutcome> {
        tracing::info!("cached note was erased, rebuilding the cache from the initial tree");
        let data = self.loader.load_initial_tree().await?;
        self.cache.clear();
        self.cache.add_tree(data);
        self.bus.emit(CacheEvent::FullReloadRequired);
        Ok(BatchOutcome::FullReload)
    }
}
