use crate::environments::types::EnvironmentId;
use crate::error::FleetError;
use crate::nodes::types::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Standard,
    Carve,
}

impl QueryType {
    /// Legacy classification used when a caller does not state the type:
    /// any SQL mentioning `carve` is treated as a carve query, including a
    /// standard query that merely references the word.
    pub fn classify(sql: &str) -> Self {
        if sql.contains("carve") {
            QueryType::Carve
        } else {
            QueryType::Standard
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Environment,
    Platform,
    Uuid,
    Hostname,
}

/// One filter clause of a query or carve.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryTarget {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub value: String,
}

/// Filter dimensions supplied when dispatching. An empty list adds no constraint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetFilters {
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub uuids: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl TargetFilters {
    pub fn to_targets(&self) -> Vec<QueryTarget> {
        let dims = [
            (TargetType::Environment, &self.environments),
            (TargetType::Platform, &self.platforms),
            (TargetType::Uuid, &self.uuids),
            (TargetType::Hostname, &self.hosts),
        ];
        dims.iter()
            .flat_map(|(target_type, values)| {
                values
                    .iter()
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .map(move |v| QueryTarget {
                        target_type: *target_type,
                        value: v.to_string(),
                    })
            })
            .collect()
    }

    /// Human-readable descriptor stored with the query, e.g. `platform:darwin,uuid:ABC`.
    pub fn describe(&self) -> String {
        self.to_targets()
            .iter()
            .map(|t| format!("{}:{}", t.target_type, t.value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Environment => "environment",
            TargetType::Platform => "platform",
            TargetType::Uuid => "uuid",
            TargetType::Hostname => "hostname",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedQuery {
    pub id: QueryId,
    pub name: String,
    pub query: String,
    pub creator: String,
    pub expected: usize,
    pub executions: usize,
    pub errors: usize,
    pub active: bool,
    pub completed: bool,
    pub expired: bool,
    pub deleted: bool,
    pub hidden: bool,
    /// Milliseconds since the epoch; `None` never expires.
    pub expiration: Option<u64>,
    pub query_type: QueryType,
    pub target: String,
    pub environment_id: EnvironmentId,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DistributedQuery {
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expiration.map(|e| e <= now).unwrap_or(false)
    }

    /// Every expected node has reported, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.expected > 0 && self.executions + self.errors >= self.expected
    }
}

/// Input for `QueryManager::create`.
#[derive(Debug, Clone)]
pub struct NewQuery {
    /// Generated as `query_<random>` or `carve_<random>` when absent.
    pub name: Option<String>,
    pub query: String,
    pub creator: String,
    /// Falls back to `QueryType::classify` when absent.
    pub query_type: Option<QueryType>,
    pub hidden: bool,
    /// Zero means no expiration.
    pub expiration_hours: u64,
    pub environment_id: EnvironmentId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeQueryStatus {
    Pending,
    Completed,
    Error,
}

/// Assignment of one query to one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeQuery {
    pub node_id: NodeId,
    pub query_id: QueryId,
    pub status: NodeQueryStatus,
    pub updated_at: u64,
}

impl NodeQuery {
    pub fn executed(&self) -> bool {
        self.status != NodeQueryStatus::Pending
    }
}

/// Poll result for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingQueries {
    pub queries: BTreeMap<String, String>,
    /// Seconds of accelerated polling to request, when the environment enables it.
    pub accelerate: Option<u64>,
}

/// A named SQL snippet kept per creator for later reuse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedQuery {
    pub name: String,
    pub creator: String,
    pub query: String,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryAction {
    Complete,
    Expire,
    Activate,
    Delete,
}

impl FromStr for QueryAction {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(QueryAction::Complete),
            "expire" => Ok(QueryAction::Expire),
            "activate" => Ok(QueryAction::Activate),
            "delete" => Ok(QueryAction::Delete),
            other => Err(FleetError::Malformed(format!("unknown query action {}", other))),
        }
    }
}

/// Listing filters for the admin API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListTarget {
    All,
    #[default]
    Active,
    Completed,
    Expired,
    Deleted,
    Hidden,
    Carves,
}

impl ListTarget {
    pub fn matches(&self, q: &DistributedQuery) -> bool {
        match self {
            ListTarget::All => !q.deleted,
            ListTarget::Active => q.active && !q.deleted && !q.expired && !q.hidden,
            ListTarget::Completed => q.completed && !q.deleted && !q.hidden,
            ListTarget::Expired => q.expired && !q.deleted,
            ListTarget::Deleted => q.deleted,
            ListTarget::Hidden => q.hidden && !q.deleted,
            ListTarget::Carves => q.query_type == QueryType::Carve && !q.deleted,
        }
    }
}
