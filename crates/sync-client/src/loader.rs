//! Abstraction over the transport that fetches tree data from the server.
//!
//! The reconciler never talks HTTP directly; it asks a `TreeLoader` for the
//! notes it is missing. A response must be self-contained: each requested
//! note comes with its parent branches and its attributes, so splicing the
//! response into the cache restores the completeness invariants.

use async_trait::async_trait;
use thiserror::Error;

use sync_core::rows::TreeData;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("tree load failed: {0}")]
    Transport(String),
    #[error("malformed tree response")]
    Malformed(#[from] serde_json::Error),
}

#[async_trait]
pub trait TreeLoader: Send + Sync {
    /// Fetch the given notes together with their parent branches and
    /// attributes.
    async fn load_tree(&self, note_ids: &[String]) -> Result<TreeData, LoaderError>;

    /// Fetch the initial tree (the root and everything eagerly loaded with
    /// it). Used to rebuild the cache from scratch.
    async fn load_initial_tree(&self) -> Result<TreeData, LoaderError>;
}
