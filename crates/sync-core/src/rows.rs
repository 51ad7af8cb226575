//! Typed entity rows used by the client cache and tree-load responses.
//!
//! The server-side store keeps rows as opaque JSON (the log's logical
//! contract does not depend on row shape); the client deserializes into
//! these when wiring up its relationship indices.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRow {
    pub note_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub note_type: String,
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub is_protected: bool,
    /// Content-addressed id of the note's blob. A changed blob id means the
    /// note content changed.
    #[serde(default)]
    pub blob_id: Option<String>,
    /// Soft-deleted rows still replicate (the row survives until erasure)
    /// but are evicted from client caches.
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRow {
    pub branch_id: String,
    pub note_id: String,
    pub parent_note_id: String,
    pub note_position: i64,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub is_expanded: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRow {
    pub attribute_id: String,
    /// The owning note.
    pub note_id: String,
    /// "label" or "relation".
    #[serde(rename = "type")]
    pub attr_type: String,
    pub name: String,
    /// For relations, the target note id.
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub is_inheritable: bool,
    #[serde(default)]
    pub is_deleted: bool,
}

impl AttributeRow {
    pub fn is_relation(&self) -> bool {
        self.attr_type == "relation"
    }

    /// Relations whose target participates in attribute inheritance. These
    /// make the target note structurally required in the cache.
    pub fn is_inheritance_relation(&self) -> bool {
        self.is_relation() && (self.name == "template" || self.name == "inherit")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRow {
    pub attachment_id: String,
    pub owner_id: String,
    pub role: String,
    #[serde(default)]
    pub mime: String,
    pub title: String,
    #[serde(default)]
    pub blob_id: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Tree-load response: the subset of entities needed to splice one or more
/// notes (with their parent branches and attributes) into the client cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeData {
    pub notes: Vec<NoteRow>,
    pub branches: Vec<BranchRow>,
    pub attributes: Vec<AttributeRow>,
}
