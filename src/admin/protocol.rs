use crate::carves::types::CarvedFile;
use crate::queries::types::{
    DistributedQuery, ListTarget, NodeQuery, QueryAction, QueryTarget, QueryType, TargetFilters,
};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_QUERIES: &str = "/api/v1/queries/:env";
pub const ENDPOINT_QUERY: &str = "/api/v1/queries/:env/:name";
pub const ENDPOINT_QUERY_ACTION: &str = "/api/v1/queries/:env/:name/:action";
pub const ENDPOINT_CARVES: &str = "/api/v1/carves/:env";
/// `GET` takes a session id, `DELETE` a carve id.
pub const ENDPOINT_CARVE: &str = "/api/v1/carves/:env/:id";
pub const ENDPOINT_CARVE_ARCHIVE: &str = "/api/v1/carves/:env/:id/archive";
pub const ENDPOINT_CARVE_DOWNLOAD: &str = "/api/v1/carves/:env/:id/download";
pub const ENDPOINT_SAVED: &str = "/api/v1/saved/:creator";
pub const ENDPOINT_SAVED_QUERY: &str = "/api/v1/saved/:creator/:name";

fn default_creator() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueryRequest {
    pub query: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_creator")]
    pub creator: String,
    /// Classified from the SQL when omitted.
    #[serde(default)]
    pub query_type: Option<QueryType>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub expiration_hours: u64,
    #[serde(default)]
    pub targets: TargetFilters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCarveRequest {
    pub path: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_creator")]
    pub creator: String,
    #[serde(default)]
    pub expiration_hours: u64,
    #[serde(default)]
    pub targets: TargetFilters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunResponse {
    pub name: String,
    pub query_type: QueryType,
    pub expected: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQueriesParams {
    #[serde(default)]
    pub target: ListTarget,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListCarvesParams {
    /// Restricts the listing to carves scheduled by this query.
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDetails {
    pub query: DistributedQuery,
    pub targets: Vec<QueryTarget>,
    pub assignments: Vec<NodeQuery>,
    /// Carves the query scheduled; empty for standard queries.
    pub carves: Vec<CarvedFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResponse {
    pub name: String,
    pub action: QueryAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteCarveResponse {
    pub carve_id: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveQueryRequest {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSavedRequest {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteSavedResponse {
    pub name: String,
    pub creator: String,
    pub deleted: bool,
}
