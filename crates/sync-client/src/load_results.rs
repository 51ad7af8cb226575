//! Aggregated summary of what one reconciled batch touched.
//!
//! Consumers (tree widgets, editors) receive a single `LoadResults` per
//! batch instead of one event per change record, so they can refresh once.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchChange {
    pub branch_id: String,
    pub note_id: String,
    pub parent_note_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeChange {
    pub attribute_id: String,
    pub name: String,
    /// The owning note.
    pub note_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionChange {
    pub revision_id: String,
    pub note_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResults {
    /// Notes whose metadata changed.
    pub note_ids: Vec<String>,
    pub branches: Vec<BranchChange>,
    pub attributes: Vec<AttributeChange>,
    pub revisions: Vec<RevisionChange>,
    pub attachment_ids: Vec<String>,
    pub option_names: Vec<String>,
    /// Notes whose content (blob) changed and must be refetched.
    pub content_note_ids: Vec<String>,
    /// Parents whose children were repositioned.
    pub reordered_parent_ids: Vec<String>,
}

impl LoadResults {
    pub fn add_note(&mut self, note_id: &str) {
        if !self.note_ids.iter().any(|id| id == note_id) {
            self.note_ids.push(note_id.to_string());
        }
    }

    pub fn add_branch(&mut self, branch_id: &str, note_id: &str, parent_note_id: &str) {
        self.branches.push(BranchChange {
            branch_id: branch_id.to_string(),
            note_id: note_id.to_string(),
            parent_note_id: parent_note_id.to_string(),
        });
    }

    pub fn add_attribute(&mut self, attribute_id: &str, name: &str, note_id: &str) {
        self.attributes.push(AttributeChange {
            attribute_id: attribute_id.to_string(),
            name: name.to_string(),
            note_id: note_id.to_string(),
        });
    }

    pub fn add_revision(&mut self, revision_id: &str, note_id: Option<&str>) {
        self.revisions.push(RevisionChange {
            revision_id: revision_id.to_string(),
            note_id: note_id.map(String::from),
        });
    }

    pub fn add_attachment(&mut self, attachment_id: &str) {
        if !self.attachment_ids.iter().any(|id| id == attachment_id) {
            self.attachment_ids.push(attachment_id.to_string());
        }
    }

    pub fn add_option(&mut self, name: &str) {
        if !self.option_names.iter().any(|n| n == name) {
            self.option_names.push(name.to_string());
        }
    }

    pub fn add_note_content(&mut self, note_id: &str) {
        if !self.content_note_ids.iter().any(|id| id == note_id) {
            self.content_note_ids.push(note_id.to_string());
        }
    }

    pub fn add_note_reordering(&mut self, parent_note_id: &str) {
        if !self.reordered_parent_ids.iter().any(|id| id == parent_note_id) {
            self.reordered_parent_ids.push(parent_note_id.to_string());
        }
    }

    pub fn is_note_content_reloaded(&self, note_id: &str) -> bool {
        self.content_note_ids.iter().any(|id| id == note_id)
    }

    pub fn has_attribute_changes(&self) -> bool {
        !self.attributes.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.note_ids.is_empty()
            && self.branches.is_empty()
            && self.attributes.is_empty()
            && self.revisions.is_empty()
            && self.attachment_ids.is_empty()
            && self.option_names.is_empty()
            && self.content_note_ids.is_empty()
            && self.reordered_parent_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_until_first_change() {
        let mut results = LoadResults::default();
        assert!(results.is_empty());

        results.add_note("n1");
        assert!(!results.is_empty());
        assert!(!results.has_attribute_changes());
    }

    #[test]
    fn test_note_ids_deduplicated() {
        let mut results = LoadResults::default();
        results.add_note("n1");
        results.add_note("n1");
        results.add_note_content("n1");
        results.add_note_content("n1");

        assert_eq!(results.note_ids, vec!["n1"]);
        assert_eq!(results.content_note_ids, vec!["n1"]);
        assert!(results.is_note_content_reloaded("n1"));
        assert!(!results.is_note_content_reloaded("n2"));
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let mut results = LoadResults::default();
        results.add_attribute("a1", "template", "n1");

        let json = serde_json::to_string(&results).unwrap();
        assert!(json.contains("\"attributeId\":\"a1\""));
        assert!(json.contains("\"noteIds\":[]"));
    }
}
