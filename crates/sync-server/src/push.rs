//! Push service: accepts (possibly paginated) batches of change records and
//! applies them to the store as a single atomic transaction.
//!
//! Pagination protocol: a submission split into `pageCount` ordered pages
//! shares a `requestId`. Page 0 opens a buffer, continuation pages append
//! their raw fragment, and the final page parses the assembled payload and
//! applies it. A continuation page with an unknown request id is rejected;
//! it indicates a duplicate or out-of-order page.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use sync_core::protocol::PushRequest;
use sync_core::store::{ApplyContext, Store};

use crate::error::{Result, SyncError};
use crate::partial::PartialRequests;

/// Pagination headers of one push page.
#[derive(Debug, Clone, Copy)]
pub struct PageHeaders {
    pub page_count: usize,
    pub page_index: usize,
}

pub struct PushService {
    store: Arc<Store>,
    partial: Arc<Mutex<PartialRequests>>,
}

impl PushService {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            partial: Arc::new(Mutex::new(PartialRequests::new())),
        }
    }

    /// Shared buffer map, for wiring up the background sweeper.
    pub fn buffers(&self) -> Arc<Mutex<PartialRequests>> {
        Arc::clone(&self.partial)
    }

    /// Handle one push page.
    ///
    /// Returns `Ok(None)` for buffered non-final pages (nothing applied yet)
    /// and `Ok(Some(ctx))` once a complete payload has been applied.
    pub async fn update(
        &self,
        headers: &PageHeaders,
        request_id: Option<&str>,
        body: &str,
    ) -> Result<Option<ApplyContext>> {
        if headers.page_count == 0 || headers.page_index >= headers.page_count {
            return Err(SyncError::Protocol(format!(
                "invalid page {} of {}",
                headers.page_index + 1,
                headers.page_count
            )));
        }

        let payload = if headers.page_count == 1 {
            body.to_string()
        } else {
            let request_id = request_id
                .ok_or_else(|| SyncError::Protocol("missing request id".to_string()))?;

            let mut partial = self.partial.lock().await;

            if headers.page_index == 0 {
                partial.open(request_id);
            }

            if !partial.append(request_id, body) {
                return Err(SyncError::Protocol(format!(
                    "partial request '{}', page {} of {} does not have expected record",
                    request_id,
                    headers.page_index + 1,
                    headers.page_count
                )));
            }

            info!(
                "receiving partial request '{}', page {} out of {} pages",
                request_id,
                headers.page_index + 1,
                headers.page_count
            );

            if headers.page_index != headers.page_count - 1 {
                return Ok(None);
            }

            partial.take(request_id).ok_or_else(|| {
                SyncError::Protocol(format!("partial request '{}' vanished", request_id))
            })?
        };

        // Parse failure here is a hard error: the buffer is already gone and
        // nothing has been applied.
        let request: PushRequest = serde_json::from_str(&payload)?;

        let ctx = self
            .store
            .apply_batch(request.entities, &request.instance_id)?;

        Ok(Some(ctx))
    }
}
