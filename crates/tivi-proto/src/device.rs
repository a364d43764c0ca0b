//! Device descriptions exchanged at registration and in presence lists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operating system family reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Macos,
    Windows,
    Linux,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Feature flags an agent advertises.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    #[serde(default)]
    pub screen_share: bool,
    #[serde(default)]
    pub remote_control: bool,
    #[serde(default)]
    pub file_transfer: bool,
    #[serde(default)]
    pub audio_share: bool,
    #[serde(default)]
    pub multi_monitor: bool,
    #[serde(default)]
    pub resolution: Resolution,
}

/// Payload of `device:register`, as sent by an agent.
///
/// Identity, online flag and last-seen stamp are never taken from the
/// client; the server fills them in when building a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub name: String,
    pub platform: Platform,
    pub os_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

/// A registered device as seen by other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub os_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub capabilities: DeviceCapabilities,
}

impl Device {
    /// Build the presence record for `id` from its registration payload.
    pub fn from_registration(id: impl Into<String>, reg: DeviceRegistration, seen: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: reg.name,
            platform: reg.platform,
            os_version: reg.os_version,
            mac_address: reg.mac_address,
            ip_address: reg.ip_address,
            online: true,
            last_seen: seen,
            capabilities: reg.capabilities,
        }
    }
}
