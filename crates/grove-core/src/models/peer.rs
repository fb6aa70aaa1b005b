//! Peer model

use serde::{Deserialize, Serialize};

use crate::identity::Fingerprint;

use super::device::DeviceId;

/// A remote Grove device this one synchronizes with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// The remote device's id
    pub peer_id: DeviceId,
    pub peer_name: String,
    /// Base URL, without trailing slash
    pub peer_url: String,
    /// Pinned certificate fingerprint, `None` until first contact
    pub certificate_fingerprint: Option<Fingerprint>,
    /// Start time of the last fully successful sync round (Unix ms)
    pub last_sync_at: Option<i64>,
    /// Registration timestamp (Unix ms)
    pub created_at: i64,
    /// Last registry update (Unix ms)
    pub updated_at: i64,
}

impl Peer {
    pub fn uses_tls(&self) -> bool {
        self.peer_url.starts_with("https://")
    }
}

/// Unvalidated peer registration input, as entered by an operator or read from config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRegistration {
    pub peer_id: String,
    pub peer_name: String,
    pub peer_url: String,
    #[serde(default)]
    pub certificate_fingerprint: Option<String>,
}
