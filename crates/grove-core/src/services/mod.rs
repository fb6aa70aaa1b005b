//! Application services
//!
//! Shared handles used by the CLI and the sync server: database access and
//! the sync front end.

mod database;
mod sync;

pub use database::DatabaseService;
pub use sync::{PeerSyncResult, SyncService, SyncTarget};
