//! Device model

use serde::{Deserialize, Serialize};

use super::id::uuid_id;

uuid_id! {
    /// Identifier of one Grove installation; never regenerated once persisted
    DeviceId
}

/// This device or a remote one, as announced during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub device_name: String,
}
