use super::protocol::*;
use crate::batch::types::WriteEvent;
use crate::carves::types::{CarveInit, ScheduledCarve};
use crate::environments::types::Environment;
use crate::fleet::Fleet;
use crate::logging::sink::LogType;
use crate::nodes::types::{NewNode, Node};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

pub async fn handle_enroll(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<EnrollResponse>), StatusCode> {
    let env = environment(&fleet, &env)?;

    if env.enroll_secret.is_empty() || req.enroll_secret.trim() != env.enroll_secret {
        tracing::warn!(
            "Invalid enroll secret for environment {} from {:?}",
            env.name,
            req.host_identifier
        );
        return Err(StatusCode::FORBIDDEN);
    }
    if req.host_identifier.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let details = &req.host_details;
    let new = NewNode {
        uuid: req.host_identifier.clone(),
        hostname: first_non_empty(&details.system_info.hostname, &req.host_identifier),
        platform: first_non_empty(&details.os_version.platform, &req.platform_type),
        environment: env.name.clone(),
        node_key: None,
        ip_address: client_ip(&headers, peer),
        osquery_version: details.osquery_info.version.clone(),
        last_seen_hours_ago: 0,
    };

    match fleet.nodes.enroll(new) {
        Ok(node) => Ok((
            StatusCode::OK,
            Json(EnrollResponse {
                node_key: node.node_key,
                node_invalid: false,
            }),
        )),
        Err(e) => {
            tracing::error!("Failed to enroll {}: {}", req.host_identifier, e);
            Ok((
                StatusCode::OK,
                Json(EnrollResponse {
                    node_key: String::new(),
                    node_invalid: true,
                }),
            ))
        }
    }
}

/// Serves the environment configuration verbatim.
pub async fn handle_config(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<GenericRequest>,
) -> Result<Response, StatusCode> {
    let env = environment(&fleet, &env)?;
    let Some(node) = authenticate(&fleet, &env, &req.node_key) else {
        return Ok(invalid(true).into_response());
    };
    seen(&fleet, &node, &headers, peer);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        env.configuration,
    )
        .into_response())
}

/// Takes the raw body so gzip-encoded payloads can be inflated first.
pub async fn handle_log(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<GenericResponse>), StatusCode> {
    let env = environment(&fleet, &env)?;

    let raw = decode_body(&headers, &body).map_err(|status| {
        tracing::debug!("Rejected log body for {}: {}", env.name, status);
        status
    })?;
    let req: LogRequest = serde_json::from_slice(&raw).map_err(|e| {
        tracing::debug!("Malformed log request for {}: {}", env.name, e);
        StatusCode::BAD_REQUEST
    })?;

    let Some(node) = authenticate(&fleet, &env, &req.node_key) else {
        return Ok(invalid(true));
    };
    seen(&fleet, &node, &headers, peer);

    let log_type = LogType::parse(&req.log_type).map_err(|e| {
        tracing::debug!("Node {}: {}", node.uuid, e);
        StatusCode::BAD_REQUEST
    })?;
    let records = match req.data {
        serde_json::Value::Array(records) => records,
        serde_json::Value::Null => Vec::new(),
        other => vec![other],
    };

    for record in &records {
        let bytes = match serde_json::to_vec(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Skipping unserialisable {} record: {}", log_type, e);
                continue;
            }
        };
        if let Err(e) = fleet.sink.send(log_type, &bytes, &env.name, &node.uuid).await {
            tracing::warn!("Log sink {} rejected a {} record: {}", fleet.sink.name(), log_type, e);
        }
    }
    tracing::debug!(
        "Node {} in {} sent {} {} records ({} bytes)",
        node.uuid,
        env.name,
        records.len(),
        log_type,
        body.len()
    );

    Ok(invalid(false))
}

pub async fn handle_query_read(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<GenericRequest>,
) -> Result<(StatusCode, Json<QueryReadResponse>), StatusCode> {
    let env = environment(&fleet, &env)?;
    let invalid_read = || {
        (
            StatusCode::OK,
            Json(QueryReadResponse {
                queries: BTreeMap::new(),
                node_invalid: true,
                accelerate: None,
            }),
        )
    };

    let Some(node) = authenticate(&fleet, &env, &req.node_key) else {
        return Ok(invalid_read());
    };
    seen(&fleet, &node, &headers, peer);

    match fleet.queries.node_queries(&node) {
        Ok(pending) => {
            if !pending.queries.is_empty() {
                tracing::debug!("Node {} picks up {} queries", node.uuid, pending.queries.len());
            }
            Ok((
                StatusCode::OK,
                Json(QueryReadResponse {
                    queries: pending.queries,
                    node_invalid: false,
                    accelerate: pending.accelerate,
                }),
            ))
        }
        Err(e) => {
            tracing::error!("Failed to load queries for node {}: {}", node.uuid, e);
            Ok(invalid_read())
        }
    }
}

/// Records per-query results, forwards them to the log sink and schedules
/// any carves announced in the result rows.
pub async fn handle_query_write(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<QueryWriteRequest>,
) -> Result<(StatusCode, Json<GenericResponse>), StatusCode> {
    let env = environment(&fleet, &env)?;
    let Some(node) = authenticate(&fleet, &env, &req.node_key) else {
        return Ok(invalid(true));
    };
    seen(&fleet, &node, &headers, peer);

    for (name, result) in &req.queries {
        let scheduled = schedule_carves(&fleet, &node, name, result);
        if scheduled > 0 {
            tracing::info!("Node {} scheduled {} carves for {}", node.uuid, scheduled, name);
        }

        let status = req.statuses.get(name).copied().unwrap_or(0);
        if let Err(e) = fleet.queries.record_result(name, env.id, node.id, status) {
            tracing::debug!("No result recorded for {} on {}: {}", name, node.uuid, e);
        }

        let data = QueryWriteData {
            name: name.clone(),
            result: result.clone(),
            status,
            message: req.messages.get(name).cloned().unwrap_or_default(),
        };
        match serde_json::to_vec(&data) {
            Ok(bytes) => {
                if let Err(e) = fleet.sink.send(LogType::Query, &bytes, &env.name, &node.uuid).await {
                    tracing::warn!("Log sink {} rejected result of {}: {}", fleet.sink.name(), name, e);
                }
            }
            Err(e) => tracing::warn!("Failed to serialise result of {}: {}", name, e),
        }
    }

    Ok(invalid(false))
}

/// Pairs a scheduled carve with a new session. The node is refreshed
/// immediately since its block stream follows right away.
pub async fn handle_carve_init(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CarveInitRequest>,
) -> Result<(StatusCode, Json<CarveInitResponse>), StatusCode> {
    let env = environment(&fleet, &env)?;
    let Some(node) = authenticate(&fleet, &env, &req.node_key) else {
        return Ok(init_response(None));
    };

    let ip = client_ip(&headers, peer);
    if let Err(e) = fleet.nodes.refresh_metadata(node.id, &ip) {
        tracing::warn!("Failed to refresh node {}: {}", node.uuid, e);
    }

    let block_count = u32::try_from(req.block_count).map_err(|_| StatusCode::BAD_REQUEST)?;
    let init = CarveInit {
        carve_id: req.carve_id,
        request_id: req.request_id,
        block_count,
        block_size: req.block_size,
        carve_size: req.carve_size,
    };

    match fleet.carves.init_carve(&node, &init) {
        Ok(session_id) => Ok(init_response(Some(session_id))),
        Err(e) => {
            tracing::warn!(
                "Carve init for {} from node {} refused: {}",
                init.request_id,
                node.uuid,
                e
            );
            Ok(init_response(None))
        }
    }
}

/// Blocks carry no node key: the session id and request id are the credential.
pub async fn handle_carve_block(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CarveBlockRequest>,
) -> Result<(StatusCode, Json<CarveBlockResponse>), StatusCode> {
    let env = environment(&fleet, &env)?;
    let block = |success| (StatusCode::OK, Json(CarveBlockResponse { success }));

    let carve = match fleet.carves.check(&req.session_id, &req.request_id) {
        Ok(carve) if carve.environment_id == env.id => carve,
        Ok(carve) => {
            tracing::warn!("Block for carve {} sent to environment {}", carve.carve_id, env.name);
            return Ok(block(false));
        }
        Err(e) => {
            tracing::debug!("Rejected block for session {}: {}", req.session_id, e);
            return Ok(block(false));
        }
    };
    fleet
        .batch
        .add_event(WriteEvent::new(carve.node_id, client_ip(&headers, peer)));

    let Ok(block_id) = u32::try_from(req.block_id) else {
        return Ok(block(false));
    };
    match fleet
        .carves
        .ingest_block(&req.session_id, &req.request_id, block_id, &req.data)
        .await
    {
        Ok(outcome) => {
            tracing::debug!(
                "Block {} of session {} accepted (duplicate={}, completed={})",
                block_id,
                req.session_id,
                outcome.duplicate,
                outcome.completed
            );
            Ok(block(true))
        }
        Err(e) => {
            tracing::warn!("Block {} of session {} refused: {}", block_id, req.session_id, e);
            Ok(block(false))
        }
    }
}

/// Resolves the path environment. A malformed UUID is a 400, an unknown one a 404.
fn environment(fleet: &Fleet, env: &str) -> Result<Environment, StatusCode> {
    let uuid = uuid::Uuid::parse_str(env).map_err(|_| {
        tracing::debug!("Rejected request for malformed environment {:?}", env);
        StatusCode::BAD_REQUEST
    })?;
    fleet.environments.get_by_uuid(&uuid.to_string()).map_err(|e| {
        tracing::debug!("Rejected request: {}", e);
        e.status_code()
    })
}

/// The node owning `node_key`, if it is enrolled in `env`.
fn authenticate(fleet: &Fleet, env: &Environment, node_key: &str) -> Option<Node> {
    match fleet.nodes.get_by_key(node_key) {
        Ok(node) if node.environment_id == env.id => Some(node),
        Ok(node) => {
            tracing::debug!("Node {} used its key against environment {}", node.uuid, env.name);
            None
        }
        Err(e) => {
            tracing::debug!("Invalid node key for environment {}: {}", env.name, e);
            None
        }
    }
}

fn seen(fleet: &Fleet, node: &Node, headers: &HeaderMap, peer: SocketAddr) {
    fleet
        .batch
        .add_event(WriteEvent::new(node.id, client_ip(headers, peer)));
}

/// Schedules every `carve=1` row of a result. Results that are not carve rows are ignored.
fn schedule_carves(fleet: &Fleet, node: &Node, query_name: &str, result: &serde_json::Value) -> usize {
    let rows: Vec<ScheduledCarve> = match serde_json::from_value(result.clone()) {
        Ok(rows) => rows,
        Err(_) => return 0,
    };

    let mut scheduled = 0;
    for row in rows.iter().filter(|r| r.is_carve()) {
        match fleet.carves.schedule(row, node, query_name) {
            Ok(_) => scheduled += 1,
            Err(e) => tracing::warn!("Failed to schedule carve from {}: {}", query_name, e),
        }
    }
    scheduled
}

/// First address of `X-Forwarded-For`, then `X-Real-IP`, then the peer.
pub(crate) fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    forwarded
        .or_else(real)
        .unwrap_or_else(|| peer.ip().to_string())
}

/// Inflates gzip bodies, refusing anything that grows past `MAX_LOG_BODY`.
fn decode_body(headers: &HeaderMap, body: &[u8]) -> Result<Vec<u8>, StatusCode> {
    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);
    let raw = if gzip {
        let mut inflated = Vec::new();
        GzDecoder::new(body)
            .take(MAX_LOG_BODY + 1)
            .read_to_end(&mut inflated)
            .map_err(|_| StatusCode::BAD_REQUEST)?;
        inflated
    } else {
        body.to_vec()
    };
    if raw.len() as u64 > MAX_LOG_BODY {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    Ok(raw)
}

fn invalid(node_invalid: bool) -> (StatusCode, Json<GenericResponse>) {
    (StatusCode::OK, Json(GenericResponse { node_invalid }))
}

fn init_response(session_id: Option<String>) -> (StatusCode, Json<CarveInitResponse>) {
    (
        StatusCode::OK,
        Json(CarveInitResponse {
            success: session_id.is_some(),
            session_id: session_id.unwrap_or_default(),
        }),
    )
}

fn first_non_empty(preferred: &str, fallback: &str) -> String {
    if preferred.trim().is_empty() {
        fallback.trim().to_string()
    } else {
        preferred.trim().to_string()
    }
}
