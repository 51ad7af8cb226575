//! Error taxonomy for the replication services.
//!
//! Validation and protocol errors reject the request with no state change;
//! schema errors (unknown entity kind) signal a client/server version
//! mismatch and are surfaced distinctly so operators do not just retry.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use sync_core::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed request input (bad cursor, missing field).
    #[error("validation error: {0}")]
    Validation(String),

    /// Pagination protocol violation (unknown requestId, page mismatch,
    /// missing headers).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reassembled payload failed to parse; nothing was applied.
    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn status(&self) -> StatusCode {
        match self {
            SyncError::Validation(_) | SyncError::Protocol(_) | SyncError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            SyncError::Store(StoreError::UnknownKind(_)) => StatusCode::CONFLICT,
            SyncError::Store(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        warn!("sync request rejected: {}", self);
        (self.status(), Json(json!({ "message": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::EntityKind;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            SyncError::Validation("bad cursor".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SyncError::Protocol("orphan page".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SyncError::Store(StoreError::UnknownKind("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            SyncError::Store(StoreError::MissingEntityRow {
                kind: EntityKind::Notes,
                entity_id: "n1".into()
            })
            .status(),
            StatusCode::BAD_REQUEST
        );
    }
}
