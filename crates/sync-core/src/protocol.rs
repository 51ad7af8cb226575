//! Protocol DTOs shared by server and client, plus push-payload pagination.
//!
//! Field names match the original wire protocol (camelCase). Pagination
//! headers travel outside the body so continuation pages can carry raw
//! payload fragments.

use serde::{Deserialize, Serialize};

use crate::change::ChangeEnvelope;

/// Header carrying the total number of pages in a push submission.
pub const PAGE_COUNT_HEADER: &str = "pageCount";
/// Header carrying the zero-based index of this page.
pub const PAGE_INDEX_HEADER: &str = "pageIndex";
/// Header identifying a multi-page submission. Required when `pageCount > 1`.
pub const REQUEST_ID_HEADER: &str = "requestId";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub instance_id: String,
    /// Cursor: the last change id this instance has already seen.
    pub last_entity_change_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub entity_changes: Vec<ChangeEnvelope>,
    /// New cursor: pass this in the next request to continue.
    pub last_entity_change_id: i64,
    /// Changes not yet returned by this instance. Advisory only.
    pub outstanding_pull_count: usize,
}

/// Body of a push submission (the fully reassembled payload for paginated
/// submissions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub instance_id: String,
    pub entities: Vec<ChangeEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub initialized: bool,
    pub outstanding_pull_count: usize,
}

/// Split a serialized push body into page fragments of roughly `page_size`
/// bytes, respecting char boundaries: a fragment may exceed `page_size` when
/// a single character is wider than the page. The receiving side
/// concatenates the fragments in page order and parses the result as the
/// full payload.
pub fn paginate(body: &str, page_size: usize) -> Vec<String> {
    let page_size = page_size.max(1);
    if body.len() <= page_size {
        return vec![body.to_string()];
    }

    let mut pages = Vec::new();
    let mut start = 0;
    while start < body.len() {
        let mut end = usize::min(start.saturating_add(page_size), body.len());
        while end > start && !body.is_char_boundary(end) {
            end -= 1;
        }
        // A page narrower than the character at `start` must still make
        // progress: widen to the next boundary instead.
        if end == start {
            end += 1;
            while end < body.len() && !body.is_char_boundary(end) {
                end += 1;
            }
        }
        pages.push(body[start..end].to_string());
        start = end;
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paginate_small_body_single_page() {
        let pages = paginate("{\"a\":1}", 1024);
        assert_eq!(pages, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn test_paginate_reassembles_exactly() {
        let body = "x".repeat(2500);
        let pages = paginate(&body, 1000);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages.concat(), body);
    }

    #[test]
    fn test_paginate_respects_char_boundaries() {
        let body = "é".repeat(100); // 2 bytes per char
        let pages = paginate(&body, 3);
        assert_eq!(pages.concat(), body);
        for page in pages {
            assert!(!page.is_empty());
        }
    }

    #[test]
    fn test_paginate_page_narrower_than_one_char_still_progresses() {
        // 2-byte chars with a 1-byte page: every fragment widens to a full
        // character instead of looping on an empty slice.
        let body = "éé";
        let pages = paginate(body, 1);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages.concat(), body);
        assert!(pages.iter().all(|page| !page.is_empty()));
    }

    #[test]
    fn test_pull_response_wire_shape() {
        let resp = PullResponse {
            entity_changes: vec![],
            last_entity_change_id: 42,
            outstanding_pull_count: 0,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"lastEntityChangeId\":42"));
        assert!(json.contains("\"outstandingPullCount\":0"));
    }
}
