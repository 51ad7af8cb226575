//! Cached entity representations.
//!
//! These mirror the wire rows but additionally carry the relationship
//! indices the cache maintains: a note knows its parents, children, owned
//! attributes, incoming relations and attachments by id, so navigation
//! never scans the full maps.

use std::collections::HashMap;

use sync_core::rows::{AttachmentRow, AttributeRow, BranchRow, NoteRow};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedNote {
    pub note_id: String,
    pub title: String,
    pub note_type: String,
    pub mime: String,
    pub is_protected: bool,
    pub blob_id: Option<String>,

    /// Parent note ids, one per branch pointing at this note.
    pub parents: Vec<String>,
    /// Child note ids, kept sorted by the child branch's position.
    pub children: Vec<String>,
    /// parent note id -> branch id connecting us to that parent.
    pub parent_to_branch: HashMap<String, String>,
    /// child note id -> branch id connecting that child to us.
    pub child_to_branch: HashMap<String, String>,
    /// Ids of attributes owned by this note.
    pub attributes: Vec<String>,
    /// Ids of relation attributes on other notes targeting this note.
    pub target_relations: Vec<String>,
    /// Ids of attachments owned by this note.
    pub attachments: Vec<String>,
}

impl CachedNote {
    pub fn from_row(row: &NoteRow) -> Self {
        Self {
            note_id: row.note_id.clone(),
            title: row.title.clone(),
            note_type: row.note_type.clone(),
            mime: row.mime.clone(),
            is_protected: row.is_protected,
            blob_id: row.blob_id.clone(),
            parents: Vec::new(),
            children: Vec::new(),
            parent_to_branch: HashMap::new(),
            child_to_branch: HashMap::new(),
            attributes: Vec::new(),
            target_relations: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Refresh the scalar fields from a newer row, keeping the relationship
    /// indices intact.
    pub fn update(&mut self, row: &NoteRow) {
        self.title = row.title.clone();
        self.note_type = row.note_type.clone();
        self.mime = row.mime.clone();
        self.is_protected = row.is_protected;
        self.blob_id = row.blob_id.clone();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedBranch {
    pub branch_id: String,
    pub note_id: String,
    pub parent_note_id: String,
    pub note_position: i64,
    pub prefix: Option<String>,
    pub is_expanded: bool,
}

impl CachedBranch {
    pub fn from_row(row: &BranchRow) -> Self {
        Self {
            branch_id: row.branch_id.clone(),
            note_id: row.note_id.clone(),
            parent_note_id: row.parent_note_id.clone(),
            note_position: row.note_position,
            prefix: row.prefix.clone(),
            is_expanded: row.is_expanded,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAttribute {
    pub attribute_id: String,
    /// The owning note.
    pub note_id: String,
    pub attr_type: String,
    pub name: String,
    pub value: String,
    pub position: i64,
    pub is_inheritable: bool,
}

impl CachedAttribute {
    pub fn from_row(row: &AttributeRow) -> Self {
        Self {
            attribute_id: row.attribute_id.clone(),
            note_id: row.note_id.clone(),
            attr_type: row.attr_type.clone(),
            name: row.name.clone(),
            value: row.value.clone(),
            position: row.position,
            is_inheritable: row.is_inheritable,
        }
    }

    pub fn is_relation(&self) -> bool {
        self.attr_type == "relation"
    }

    pub fn is_inheritance_relation(&self) -> bool {
        self.is_relation() && (self.name == "template" || self.name == "inherit")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAttachment {
    pub attachment_id: String,
    pub owner_id: String,
    pub role: String,
    pub mime: String,
    pub title: String,
    pub blob_id: Option<String>,
    pub position: i64,
}

impl CachedAttachment {
    pub fn from_row(row: &AttachmentRow) -> Self {
        Self {
            attachment_id: row.attachment_id.clone(),
            owner_id: row.owner_id.clone(),
            role: row.role.clone(),
            mime: row.mime.clone(),
            title: row.title.clone(),
            blob_id: row.blob_id.clone(),
            position: row.position,
        }
    }
}
