//! HTTP surface for the change-log protocol.
//!
//! Only the four protocol endpoints live here; everything else about the
//! application (tree endpoints, editor, search) is outside this service.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use sync_core::consistency::{self, ConsistencyReport};
use sync_core::protocol::{
    PAGE_COUNT_HEADER, PAGE_INDEX_HEADER, PullRequest, PullResponse, REQUEST_ID_HEADER,
    StatsResponse,
};
use sync_core::store::Store;

use crate::error::{Result, SyncError};
use crate::pull;
use crate::push::{PageHeaders, PushService};

/// Shared application state.
pub struct AppState {
    pub store: Arc<Store>,
    pub push: PushService,
}

impl AppState {
    pub fn new(store: Arc<Store>) -> Self {
        let push = PushService::new(Arc::clone(&store));
        Self { store, push }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sync/changed", get(get_changed))
        .route("/api/sync/update", put(put_update))
        .route("/api/sync/check", get(get_check))
        .route("/api/sync/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Query parameters arrive as strings; the cursor is validated here so a
/// malformed value is a 400, not a deserialization panic upstream.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangedQuery {
    instance_id: String,
    last_entity_change_id: String,
}

async fn get_changed(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChangedQuery>,
) -> Result<Json<PullResponse>> {
    let last_entity_change_id: i64 = query.last_entity_change_id.parse().map_err(|_| {
        SyncError::Validation(format!(
            "missing or invalid last entity change id: '{}'",
            query.last_entity_change_id
        ))
    })?;

    let response = pull::changed(
        &state.store,
        &PullRequest {
            instance_id: query.instance_id,
            last_entity_change_id,
        },
    )?;

    Ok(Json(response))
}

async fn put_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Response> {
    let page_count = header_usize(&headers, PAGE_COUNT_HEADER)?;
    let page_index = header_usize(&headers, PAGE_INDEX_HEADER)?;
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok());

    let applied = state
        .push
        .update(&PageHeaders { page_count, page_index }, request_id, &body)
        .await?;

    Ok(match applied {
        // Non-final page: buffered, nothing to report yet.
        None => StatusCode::NO_CONTENT.into_response(),
        Some(_) => StatusCode::OK.into_response(),
    })
}

async fn get_check(State(state): State<Arc<AppState>>) -> Json<ConsistencyReport> {
    Json(consistency::check(&state.store))
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let store = &state.store;
    Json(StatsResponse {
        initialized: store.is_initialized(),
        outstanding_pull_count: store.outstanding_count(store.instance_id(), 0),
    })
}

fn header_usize(headers: &HeaderMap, name: &str) -> Result<usize> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| SyncError::Validation(format!("missing or invalid header '{name}'")))
}
