use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::{fmt, net::Ipv4Addr, time::SystemTime};
use uuid::Uuid;

const DEFAULT_AP_SSID_PREFIX: &str = "wifi-setup";

/// Authoritative network mode. Exactly one value holds at any instant.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    #[default]
    Unknown,
    Disconnected,
    ClientConnecting,
    ClientConnected,
    ApActive,
    Degraded,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkMode::Unknown => "unknown",
            NetworkMode::Disconnected => "disconnected",
            NetworkMode::ClientConnecting => "client connecting",
            NetworkMode::ClientConnected => "client connected",
            NetworkMode::ApActive => "access point active",
            NetworkMode::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Saved credentials of one wireless network. The SSID is the unique key.
#[derive(Clone, Deserialize, PartialEq, Eq, Serialize, Validate)]
pub struct SavedNetwork {
    #[validate(min_length = 1)]
    #[validate(max_length = 32)]
    pub ssid: String,
    #[serde(default)]
    pub secret: String,
}

impl SavedNetwork {
    pub fn new(ssid: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            secret: secret.into(),
        }
    }
}

// keeps secrets out of logs
impl fmt::Debug for SavedNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SavedNetwork")
            .field("ssid", &self.ssid)
            .field("secret", &"***")
            .finish()
    }
}

/// Identity broadcast in AP mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApIdentity {
    pub ssid: String,
    /// `None` broadcasts an open network.
    pub secret: Option<String>,
}

impl ApIdentity {
    /// Fallback identity used when the operator did not configure one.
    pub fn generated() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();

        Self {
            ssid: format!("{DEFAULT_AP_SSID_PREFIX}-{}", &suffix[..4]),
            secret: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failed(String),
}

/// One try to join one saved network during a pass. Never persisted.
#[derive(Clone, Debug)]
pub struct ConnectionAttempt {
    pub target: SavedNetwork,
    pub started_at: SystemTime,
    pub outcome: AttemptOutcome,
}

impl ConnectionAttempt {
    pub fn start(target: SavedNetwork) -> Self {
        Self {
            target,
            started_at: SystemTime::now(),
            outcome: AttemptOutcome::Pending,
        }
    }
}

/// Raw facts reported by the probe, before the orchestrator interprets them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// SSID of the network the interface is associated with as a station.
    pub client_ssid: Option<String>,
    pub access_point_active: bool,
    pub ip: Option<Ipv4Addr>,
}

/// Status surface consumed by the web UI and monitors.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub mode: NetworkMode,
    pub ssid: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub internet_reachable: bool,
    pub attempt_count: u32,
    pub next_retry_secs: Option<u64>,
    pub detail: Option<String>,
}
