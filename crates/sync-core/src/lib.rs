//! sync-core: Shared library for entity-change replication.
//!
//! This crate provides the core functionality for:
//! - Change records, the unit of replication (one row per entity mutation)
//! - The central store: an append-only change log plus current entity tables
//! - Consistency checking (per-entity-type content hashes, max synced id)
//! - Protocol DTOs shared by server and client, with push-payload pagination

pub mod change;
pub mod consistency;
pub mod protocol;
pub mod rows;
pub mod store;

pub use change::{ChangeEnvelope, ChangeRecord, EntityKind, new_change_id, now_utc, row_hash};
pub use consistency::{ConsistencyReport, check};
pub use protocol::{PullRequest, PullResponse, PushRequest, StatsResponse, paginate};
pub use rows::{AttachmentRow, AttributeRow, BranchRow, NoteRow, TreeData};
pub use store::{ApplyContext, Store, StoreError};
