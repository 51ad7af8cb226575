//! In-memory entity cache with bidirectional relationship indices.
//!
//! The cache holds a lazily loaded portion of the note tree. Invariants it
//! maintains:
//!
//! - a cached branch is reachable from both endpoints: the parent's
//!   `children`/`child_to_branch` and the child's `parents`/`parent_to_branch`
//!   point at it whenever the respective note is cached;
//! - a note's `children` list stays sorted by the connecting branch's
//!   position;
//! - relation attributes are indexed on the target note's `target_relations`.
//!
//! Inherited-attribute lookups are memoized and the memo is dropped whenever
//! tree structure or attributes change.

use std::collections::{HashMap, HashSet, VecDeque};

use sync_core::EntityKind;
use sync_core::rows::TreeData;

use crate::entities::{CachedAttachment, CachedAttribute, CachedBranch, CachedNote};

/// The fixed id of the tree root. The root has no parents and terminates
/// every upward traversal.
pub const ROOT_NOTE_ID: &str = "root";

#[derive(Default)]
pub struct Cache {
    pub notes: HashMap<String, CachedNote>,
    pub branches: HashMap<String, CachedBranch>,
    pub attributes: HashMap<String, CachedAttribute>,
    pub attachments: HashMap<String, CachedAttachment>,

    /// Keys of entity contents known to be cached downstream (e.g. fetched
    /// note bodies). Invalidated when the owning entity's blob changes.
    blob_cache: HashSet<String>,
    /// note id -> ids of all attributes visible on it, own and inherited.
    inherited_cache: HashMap<String, Vec<String>>,
    /// Process-wide option state, name -> value, kept current by pulled
    /// option changes.
    options: HashMap<String, String>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splice a tree-load response into the cache: upsert notes, wire
    /// branches on both ends, index attributes, and re-sort children of the
    /// touched parents.
    pub fn add_tree(&mut self, data: TreeData) {
        for row in &data.notes {
            match self.notes.get_mut(&row.note_id) {
                Some(note) => note.update(row),
                None => {
                    self.notes
                        .insert(row.note_id.clone(), CachedNote::from_row(row));
                }
            }
        }

        for row in &data.branches {
            self.upsert_branch(&CachedBranch::from_row(row));
        }

        for row in &data.attributes {
            self.upsert_attribute(&CachedAttribute::from_row(row));
        }

        self.inherited_cache.clear();
    }

    /// Insert or replace a branch and wire it into both endpoint notes. A
    /// branch that moved to a different parent is unwired from the old one
    /// first.
    pub fn upsert_branch(&mut self, branch: &CachedBranch) {
        if self.branches.contains_key(&branch.branch_id) {
            self.remove_branch(&branch.branch_id);
        }

        if let Some(parent) = self.notes.get_mut(&branch.parent_note_id) {
            if !parent.children.contains(&branch.note_id) {
                parent.children.push(branch.note_id.clone());
            }
            parent
                .child_to_branch
                .insert(branch.note_id.clone(), branch.branch_id.clone());
        }
        if let Some(child) = self.notes.get_mut(&branch.note_id) {
            if !child.parents.contains(&branch.parent_note_id) {
                child.parents.push(branch.parent_note_id.clone());
            }
            child
                .parent_to_branch
                .insert(branch.parent_note_id.clone(), branch.branch_id.clone());
        }

        self.branches.insert(branch.branch_id.clone(), branch.clone());
        self.resort_children(&branch.parent_note_id);
        self.inherited_cache.clear();
    }

    /// Remove a branch and unwire it from both endpoints.
    pub fn remove_branch(&mut self, branch_id: &str) -> Option<CachedBranch> {
        let branch = self.branches.remove(branch_id)?;

        if let Some(parent) = self.notes.get_mut(&branch.parent_note_id) {
            parent.children.retain(|id| id != &branch.note_id);
            parent.child_to_branch.remove(&branch.note_id);
        }
        if let Some(child) = self.notes.get_mut(&branch.note_id) {
            child.parents.retain(|id| id != &branch.parent_note_id);
            child.parent_to_branch.remove(&branch.parent_note_id);
        }

        self.inherited_cache.clear();
        Some(branch)
    }

    /// Insert or replace an attribute, indexing it on the owner and (for
    /// relations) on the target's back-references.
    pub fn upsert_attribute(&mut self, attr: &CachedAttribute) {
        // A retargeted relation leaves a stale back-reference behind.
        if let Some(old) = self.attributes.get(&attr.attribute_id) {
            if old.is_relation() && old.value != attr.value {
                let old_target = old.value.clone();
                if let Some(target) = self.notes.get_mut(&old_target) {
                    target.target_relations.retain(|id| id != &attr.attribute_id);
                }
            }
        }

        if let Some(owner) = self.notes.get_mut(&attr.note_id) {
            if !owner.attributes.contains(&attr.attribute_id) {
                owner.attributes.push(attr.attribute_id.clone());
            }
        }
        if attr.is_relation() {
            if let Some(target) = self.notes.get_mut(&attr.value) {
                if !target.target_relations.contains(&attr.attribute_id) {
                    target.target_relations.push(attr.attribute_id.clone());
                }
            }
        }

        self.attributes.insert(attr.attribute_id.clone(), attr.clone());
        self.inherited_cache.clear();
    }

    pub fn remove_attribute(&mut self, attribute_id: &str) -> Option<CachedAttribute> {
        let attr = self.attributes.remove(attribute_id)?;

        if let Some(owner) = self.notes.get_mut(&attr.note_id) {
            owner.attributes.retain(|id| id != attribute_id);
        }
        if attr.is_relation() {
            if let Some(target) = self.notes.get_mut(&attr.value) {
                target.target_relations.retain(|id| id != attribute_id);
            }
        }

        self.inherited_cache.clear();
        Some(attr)
    }

    pub fn upsert_attachment(&mut self, attachment: &CachedAttachment) {
        if let Some(owner) = self.notes.get_mut(&attachment.owner_id) {
            if !owner.attachments.contains(&attachment.attachment_id) {
                owner.attachments.push(attachment.attachment_id.clone());
            }
        }
        self.attachments
            .insert(attachment.attachment_id.clone(), attachment.clone());
    }

    pub fn remove_attachment(&mut self, attachment_id: &str) -> Option<CachedAttachment> {
        let attachment = self.attachments.remove(attachment_id)?;
        if let Some(owner) = self.notes.get_mut(&attachment.owner_id) {
            owner.attachments.retain(|id| id != attachment_id);
        }
        Some(attachment)
    }

    /// Evict a note (soft delete): connecting branches are unwired from both
    /// sides and the note's owned attributes and attachments go with it.
    pub fn remove_note(&mut self, note_id: &str) -> Option<CachedNote> {
        let note = self.notes.remove(note_id)?;

        let connected: Vec<String> = self
            .branches
            .values()
            .filter(|b| b.note_id == note_id || b.parent_note_id == note_id)
            .map(|b| b.branch_id.clone())
            .collect();
        for branch_id in connected {
            self.remove_branch(&branch_id);
        }
        for attribute_id in note.attributes.clone() {
            self.remove_attribute(&attribute_id);
        }
        for attachment_id in note.attachments.clone() {
            self.remove_attachment(&attachment_id);
        }

        self.blob_cache
            .remove(&Self::blob_key(EntityKind::Notes, note_id));
        self.inherited_cache.clear();
        Some(note)
    }

    /// Re-sort a parent's children by the connecting branch's position.
    /// Ties break on note id so the order is deterministic.
    pub fn resort_children(&mut self, parent_note_id: &str) {
        let Some(parent) = self.notes.get(parent_note_id) else {
            return;
        };

        let mut keyed: Vec<(i64, String)> = parent
            .children
            .iter()
            .map(|child_id| {
                let position = parent
                    .child_to_branch
                    .get(child_id)
                    .and_then(|branch_id| self.branches.get(branch_id))
                    .map(|branch| branch.note_position)
                    .unwrap_or(i64::MAX);
                (position, child_id.clone())
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        if let Some(parent) = self.notes.get_mut(parent_note_id) {
            parent.children = keyed.into_iter().map(|(_, id)| id).collect();
        }
    }

    /// All cached note ids reachable downward from `root_id`, including it.
    /// Cycle-safe via a visited set (clones can create diamond shapes).
    pub fn subtree_note_ids(&self, root_id: &str) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([root_id.to_string()]);
        let mut out = Vec::new();

        while let Some(note_id) = queue.pop_front() {
            if !visited.insert(note_id.clone()) {
                continue;
            }
            let Some(note) = self.notes.get(&note_id) else {
                continue;
            };
            out.push(note_id);
            for child_id in &note.children {
                queue.push_back(child_id.clone());
            }
        }
        out
    }

    /// Ids of all attributes visible on a note: its own, those brought in by
    /// `template`/`inherit` relations, and inheritable ones from ancestors.
    /// Memoized until the next structural or attribute change.
    pub fn inherited_attribute_ids(&mut self, note_id: &str) -> Vec<String> {
        if let Some(cached) = self.inherited_cache.get(note_id) {
            return cached.clone();
        }

        let mut visited: HashSet<String> = HashSet::new();
        let ids = self.collect_attributes(note_id, &mut visited, true);
        self.inherited_cache.insert(note_id.to_string(), ids.clone());
        ids
    }

    fn collect_attributes(
        &self,
        note_id: &str,
        visited: &mut HashSet<String>,
        own: bool,
    ) -> Vec<String> {
        // Template chains and clone trees can both contain cycles.
        if !visited.insert(note_id.to_string()) {
            return Vec::new();
        }
        let Some(note) = self.notes.get(note_id) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for attribute_id in &note.attributes {
            let Some(attr) = self.attributes.get(attribute_id) else {
                continue;
            };
            if own || attr.is_inheritable {
                out.push(attribute_id.clone());
            }
            if attr.is_inheritance_relation() && !attr.value.is_empty() {
                out.extend(self.collect_attributes(&attr.value, visited, true));
            }
        }

        if note_id != ROOT_NOTE_ID {
            for parent_id in &note.parents {
                out.extend(self.collect_attributes(parent_id, visited, false));
            }
        }
        out
    }

    pub fn clear_inherited_cache(&mut self) {
        self.inherited_cache.clear();
    }

    fn blob_key(kind: EntityKind, entity_id: &str) -> String {
        format!("{kind}-{entity_id}")
    }

    pub fn cache_blob(&mut self, kind: EntityKind, entity_id: &str) {
        self.blob_cache.insert(Self::blob_key(kind, entity_id));
    }

    pub fn has_cached_blob(&self, kind: EntityKind, entity_id: &str) -> bool {
        self.blob_cache.contains(&Self::blob_key(kind, entity_id))
    }

    pub fn invalidate_blob(&mut self, kind: EntityKind, entity_id: &str) -> bool {
        self.blob_cache.remove(&Self::blob_key(kind, entity_id))
    }

    pub fn set_option(&mut self, name: &str, value: &str) {
        self.options.insert(name.to_string(), value.to_string());
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Drop all tree state. Used before rebuilding from the initial tree;
    /// options are process-wide, not tree state, and survive the rebuild.
    pub fn clear(&mut self) {
        self.notes.clear();
        self.branches.clear();
        self.attributes.clear();
        self.attachments.clear();
        self.blob_cache.clear();
        self.inherited_cache.clear();
    }
}
