//! Sync conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

use super::change::{EntitySnapshot, EntityType};
use super::device::DeviceId;
use super::id::uuid_id;

uuid_id! {
    /// A unique identifier for a recorded conflict
    ConflictId
}

/// Lifecycle of a conflict; every status except `Open` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    ResolvedLocal,
    ResolvedRemote,
    ResolvedMerge,
}

impl ConflictStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::ResolvedLocal => "resolved_local",
            Self::ResolvedRemote => "resolved_remote",
            Self::ResolvedMerge => "resolved_merge",
        }
    }

    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "resolved_local" => Ok(Self::ResolvedLocal),
            "resolved_remote" => Ok(Self::ResolvedRemote),
            "resolved_merge" => Ok(Self::ResolvedMerge),
            other => Err(Error::Database(format!("unknown conflict status: {other}"))),
        }
    }
}

/// Operator choice when resolving a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// Keep the local snapshot
    Local,
    /// Overwrite local with the remote snapshot
    Remote,
    /// Combine both using the entity's merge rule
    Merge,
}

impl ResolutionChoice {
    pub const fn resulting_status(self) -> ConflictStatus {
        match self {
            Self::Local => ConflictStatus::ResolvedLocal,
            Self::Remote => ConflictStatus::ResolvedRemote,
            Self::Merge => ConflictStatus::ResolvedMerge,
        }
    }
}

impl FromStr for ResolutionChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "keep_local" => Ok(Self::Local),
            "remote" | "keep_remote" => Ok(Self::Remote),
            "merge" => Ok(Self::Merge),
            other => Err(Error::validation(
                "choice",
                format!("expected local, remote or merge, got {other}"),
            )),
        }
    }
}

/// Two snapshots of one entity that could not be reconciled automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Local state when the conflict was detected
    pub local_snapshot: EntitySnapshot,
    /// Incoming state that was not applied
    pub remote_snapshot: EntitySnapshot,
    pub remote_device_id: Option<DeviceId>,
    pub remote_device_name: Option<String>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    pub status: ConflictStatus,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ConflictStatus::Open,
            ConflictStatus::ResolvedLocal,
            ConflictStatus::ResolvedRemote,
            ConflictStatus::ResolvedMerge,
        ] {
            assert_eq!(status.as_str().parse::<ConflictStatus>().unwrap(), status);
        }
    }

    #[test]
    fn choice_parses_aliases() {
        assert_eq!("keep_local".parse::<ResolutionChoice>().unwrap(), ResolutionChoice::Local);
        assert_eq!(" Remote ".parse::<ResolutionChoice>().unwrap(), ResolutionChoice::Remote);
        assert_eq!("merge".parse::<ResolutionChoice>().unwrap(), ResolutionChoice::Merge);
        assert!("both".parse::<ResolutionChoice>().is_err());
    }

    #[test]
    fn only_open_is_not_terminal() {
        assert!(ConflictStatus::Open.is_open());
        assert!(!ResolutionChoice::Merge.resulting_status().is_open());
    }
}
