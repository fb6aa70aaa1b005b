//! grove-core - Core library for Grove
//!
//! Models, storage, change ledger, merge engine, peer registry and the
//! peer-to-peer sync protocol shared by the `grove` CLI and its sync server.

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod merge;
pub mod models;
pub mod peers;
pub mod services;
pub mod sync;
pub mod transport;
pub mod util;

pub use error::{Error, Result};
pub use models::{Note, NoteId};
