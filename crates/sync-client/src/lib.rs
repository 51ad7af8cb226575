//! Client-side half of the replication protocol: an in-memory entity cache
//! plus the reconciliation engine that applies pulled change batches to it.
//!
//! The cache holds a lazily loaded portion of the note tree with
//! bidirectional relationship indices. The reconciler keeps it consistent as
//! batches arrive, fetching whatever the changes make structurally necessary
//! and emitting one aggregated event per batch.

pub mod bus;
pub mod cache;
pub mod entities;
pub mod load_results;
pub mod loader;
pub mod reconcile;

pub use bus::{CacheEvent, EventBus, Subscription};
pub use cache::{Cache, ROOT_NOTE_ID};
pub use entities::{CachedAttachment, CachedAttribute, CachedBranch, CachedNote};
pub use load_results::LoadResults;
pub use loader::{LoaderError, TreeLoader};
pub use reconcile::{BatchOutcome, ReconcileError, Reconciler};
