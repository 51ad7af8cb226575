//! sync-server library: change-log replication services.
//!
//! Exposes the Pull service (ordered, echo-filtered log slices), the Push
//! service (paginated submissions reassembled and applied atomically), the
//! partial-request buffer with its background sweeper, and the thin HTTP
//! surface for the four change-log-protocol endpoints.

pub mod error;
pub mod partial;
pub mod pull;
pub mod push;
pub mod routes;

pub use error::SyncError;
pub use partial::{BufferSweeper, PartialRequests};
pub use pull::{PULL_PAGE_SIZE, changed};
pub use push::{PageHeaders, PushService};
pub use routes::{AppState, router};
