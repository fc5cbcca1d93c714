//! Wire types of the osquery TLS remote API.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const ENDPOINT_ENROLL: &str = "/:env/enroll";
pub const ENDPOINT_CONFIG: &str = "/:env/config";
pub const ENDPOINT_LOG: &str = "/:env/log";
pub const ENDPOINT_QUERY_READ: &str = "/:env/read";
pub const ENDPOINT_QUERY_WRITE: &str = "/:env/write";
pub const ENDPOINT_CARVE_INIT: &str = "/:env/init";
pub const ENDPOINT_CARVE_BLOCK: &str = "/:env/block";

/// Largest Log payload accepted after gzip inflation.
pub const MAX_LOG_BODY: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenericRequest {
    #[serde(default)]
    pub node_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenericResponse {
    pub node_invalid: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollRequest {
    #[serde(default)]
    pub enroll_secret: String,
    #[serde(default)]
    pub host_identifier: String,
    #[serde(default)]
    pub platform_type: String,
    #[serde(default)]
    pub host_details: HostDetails,
}

/// Subset of the tables osquery attaches to an enrollment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostDetails {
    #[serde(default)]
    pub os_version: OsVersion,
    #[serde(default)]
    pub osquery_info: OsqueryInfo,
    #[serde(default)]
    pub system_info: SystemInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OsqueryInfo {
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrollResponse {
    pub node_key: String,
    pub node_invalid: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRequest {
    #[serde(default)]
    pub node_key: String,
    #[serde(default)]
    pub log_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryReadResponse {
    pub queries: BTreeMap<String, String>,
    pub node_invalid: bool,
    /// Seconds between polls while the environment is accelerated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accelerate: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryWriteRequest {
    #[serde(default)]
    pub node_key: String,
    /// Query name -> result rows as sent by the agent.
    #[serde(default)]
    pub queries: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub statuses: HashMap<String, i64>,
    #[serde(default)]
    pub messages: HashMap<String, String>,
}

/// One query result as handed to the log sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryWriteData {
    pub name: String,
    pub result: serde_json::Value,
    pub status: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarveInitRequest {
    #[serde(default)]
    pub node_key: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub block_count: u64,
    #[serde(default, deserialize_with = "number_or_string")]
    pub block_size: u64,
    #[serde(default, deserialize_with = "number_or_string")]
    pub carve_size: u64,
    #[serde(default, alias = "carve_guid")]
    pub carve_id: String,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarveInitResponse {
    pub success: bool,
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarveBlockRequest {
    #[serde(deserialize_with = "number_or_string")]
    pub block_id: u64,
    pub session_id: String,
    pub request_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarveBlockResponse {
    pub success: bool,
}

/// Agents send some counters as JSON strings depending on their version.
fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
