use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentId(pub u64);

/// A tenant partition of the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvironmentId,
    pub uuid: String,
    pub name: String,
    /// Secret nodes present when enrolling.
    #[serde(default)]
    pub enroll_secret: String,
    /// Raw osquery configuration served to nodes verbatim.
    #[serde(default = "empty_object")]
    pub configuration: String,
    /// Command-line flags for the agent.
    #[serde(default)]
    pub flags: String,
    /// Nodes of this environment receive the accelerated polling hint.
    #[serde(default)]
    pub accelerate: bool,
}

/// Seed-file shape: the id is assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEnvironment {
    #[serde(default)]
    pub uuid: Option<String>,
    pub name: String,
    #[serde(default)]
    pub enroll_secret: String,
    #[serde(default)]
    pub configuration: Option<serde_json::Value>,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub accelerate: bool,
}

fn empty_object() -> String {
    "{}".to_string()
}
