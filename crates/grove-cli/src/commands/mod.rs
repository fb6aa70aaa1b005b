pub mod common;
pub mod conflicts;
pub mod identity;
pub mod notes;
pub mod peers;
pub mod serve;
pub mod sync;
pub mod tags;
