use serde::{Deserialize, Serialize};

use crate::environments::types::EnvironmentId;

/// Numeric node identifier assigned by the directory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// One enrolled agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub uuid: String,
    /// Per-enrollment credential presented on every request.
    pub node_key: String,
    pub hostname: String,
    pub platform: String,
    pub environment: String,
    pub environment_id: EnvironmentId,
    pub ip_address: String,
    pub osquery_version: String,
    pub enrolled_at: u64,
    /// Milliseconds since the epoch of the last request from this node.
    pub last_seen: u64,
}

impl Node {
    /// A node is active when it was seen within `inactive_hours`; zero disables the window.
    pub fn is_active(&self, inactive_hours: u64, now: u64) -> bool {
        if inactive_hours == 0 {
            return true;
        }
        let window = inactive_hours.saturating_mul(3_600_000);
        now.saturating_sub(self.last_seen) <= window
    }
}

/// Data a node presents when enrolling, plus the seed-file shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewNode {
    pub uuid: String,
    pub hostname: String,
    #[serde(default)]
    pub platform: String,
    pub environment: String,
    #[serde(default)]
    pub node_key: Option<String>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub osquery_version: String,
    /// Seed files may backdate nodes to exercise the inactivity window.
    #[serde(default)]
    pub last_seen_hours_ago: u64,
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
