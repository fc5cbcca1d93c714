use super::protocol::*;
use crate::carves::types::{ArchiveResult, CarvedFile, DownloadTarget};
use crate::environments::types::Environment;
use crate::error::{FleetError, FleetResult};
use crate::fleet::Fleet;
use crate::queries::manager::QueryManager;
use crate::queries::types::{DistributedQuery, NewQuery, QueryAction, QueryType, SavedQuery};

use axum::body::Body;
use axum::extract::{Path, Query};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Extension, Json};
use std::sync::Arc;

pub async fn handle_run_query(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    Json(req): Json<RunQueryRequest>,
) -> FleetResult<(StatusCode, Json<RunResponse>)> {
    let env = fleet.environments.resolve(&env)?;
    let new = NewQuery {
        name: req.name,
        query: req.query,
        creator: req.creator,
        query_type: req.query_type,
        hidden: req.hidden,
        expiration_hours: req.expiration_hours,
        environment_id: env.id,
    };
    let dispatched = fleet.queries.dispatch(new, &req.targets)?;

    Ok((StatusCode::CREATED, Json(run_response(&dispatched.query))))
}

/// Carves are queries over the `carves` table of the selected nodes.
pub async fn handle_run_carve(
    Path(env): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    Json(req): Json<RunCarveRequest>,
) -> FleetResult<(StatusCode, Json<RunResponse>)> {
    let env = fleet.environments.resolve(&env)?;
    if req.path.trim().is_empty() {
        return Err(FleetError::Malformed("carve path is empty".to_string()));
    }
    let new = NewQuery {
        name: req.name,
        query: QueryManager::carve_query(req.path.trim()),
        creator: req.creator,
        query_type: Some(QueryType::Carve),
        hidden: false,
        expiration_hours: req.expiration_hours,
        environment_id: env.id,
    };
    let dispatched = fleet.queries.dispatch(new, &req.targets)?;
    tracing::info!(
        "Carve of {} dispatched as {} to {} nodes",
        req.path,
        dispatched.query.name,
        dispatched.targets.len()
    );

    Ok((StatusCode::CREATED, Json(run_response(&dispatched.query))))
}

pub async fn handle_list_queries(
    Path(env): Path<String>,
    Query(params): Query<ListQueriesParams>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<Vec<DistributedQuery>>)> {
    let env = fleet.environments.resolve(&env)?;
    Ok((StatusCode::OK, Json(fleet.queries.list(params.target, env.id))))
}

pub async fn handle_get_query(
    Path((env, name)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<QueryDetails>)> {
    let env = fleet.environments.resolve(&env)?;
    let query = fleet.queries.get(&name, env.id)?;
    let details = QueryDetails {
        targets: fleet.queries.targets(&name, env.id)?,
        assignments: fleet.queries.assignments(&name, env.id)?,
        carves: match query.query_type {
            QueryType::Carve => in_environment(fleet.carves.list_by_query(&name), &env),
            QueryType::Standard => Vec::new(),
        },
        query,
    };
    Ok((StatusCode::OK, Json(details)))
}

pub async fn handle_query_action(
    Path((env, name, action)): Path<(String, String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<ActionResponse>)> {
    let env = fleet.environments.resolve(&env)?;
    let action: QueryAction = action.parse()?;
    fleet.queries.apply(action, &name, env.id)?;
    tracing::info!("Query {} in {}: {:?}", name, env.name, action);

    Ok((StatusCode::OK, Json(ActionResponse { name, action })))
}

pub async fn handle_list_carves(
    Path(env): Path<String>,
    Query(params): Query<ListCarvesParams>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<Vec<CarvedFile>>)> {
    let env = fleet.environments.resolve(&env)?;
    let carves = match params.query {
        Some(query) => fleet.carves.list_by_query(&query),
        None => fleet.carves.list(),
    };
    Ok((StatusCode::OK, Json(in_environment(carves, &env))))
}

pub async fn handle_get_carve(
    Path((env, session_id)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<CarvedFile>)> {
    let env = fleet.environments.resolve(&env)?;
    let carve = carve_in(&fleet, &env, &session_id)?;
    Ok((StatusCode::OK, Json(carve)))
}

pub async fn handle_archive_carve(
    Path((env, session_id)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<ArchiveResult>)> {
    let env = fleet.environments.resolve(&env)?;
    carve_in(&fleet, &env, &session_id)?;
    let result = fleet.carves.archive(&session_id).await?;
    Ok((StatusCode::OK, Json(result)))
}

/// Serves a local archive as an attachment, or redirects to a pre-signed S3 URL.
pub async fn handle_download_carve(
    Path((env, session_id)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<Response> {
    let env = fleet.environments.resolve(&env)?;
    carve_in(&fleet, &env, &session_id)?;

    match fleet.carves.download(&session_id).await? {
        DownloadTarget::Redirect(url) => Ok(Redirect::temporary(&url).into_response()),
        DownloadTarget::Local(path) => {
            let bytes = tokio::fs::read(&path).await?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}.tar", session_id));
            let body = Body::from(bytes);
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}\"", filename),
                    ),
                ],
                body,
            )
                .into_response())
        }
    }
}

pub async fn handle_delete_carve(
    Path((env, carve_id)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<DeleteCarveResponse>)> {
    let env = fleet.environments.resolve(&env)?;
    let carve = fleet.carves.get(&carve_id)?;
    if carve.environment_id != env.id {
        return Err(FleetError::NotFound(format!("carve {}", carve_id)));
    }
    fleet.carves.delete(&carve_id).await?;

    Ok((
        StatusCode::OK,
        Json(DeleteCarveResponse {
            carve_id,
            deleted: true,
        }),
    ))
}

pub async fn handle_create_saved(
    Path(creator): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
    Json(req): Json<SaveQueryRequest>,
) -> FleetResult<(StatusCode, Json<SavedQuery>)> {
    let saved = fleet.queries.create_saved(&req.name, &req.query, &creator)?;
    Ok((StatusCode::CREATED, Json(saved)))
}

pub async fn handle_list_saved(
    Path(creator): Path<String>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<Vec<SavedQuery>>)> {
    Ok((StatusCode::OK, Json(fleet.queries.saved_by_creator(&creator))))
}

pub async fn handle_get_saved(
    Path((creator, name)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<SavedQuery>)> {
    Ok((StatusCode::OK, Json(fleet.queries.get_saved(&name, &creator)?)))
}

pub async fn handle_update_saved(
    Path((creator, name)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
    Json(req): Json<UpdateSavedRequest>,
) -> FleetResult<(StatusCode, Json<SavedQuery>)> {
    let saved = fleet.queries.update_saved(&name, &req.query, &creator)?;
    Ok((StatusCode::OK, Json(saved)))
}

pub async fn handle_delete_saved(
    Path((creator, name)): Path<(String, String)>,
    Extension(fleet): Extension<Arc<Fleet>>,
) -> FleetResult<(StatusCode, Json<DeleteSavedResponse>)> {
    fleet.queries.delete_saved(&name, &creator)?;
    Ok((
        StatusCode::OK,
        Json(DeleteSavedResponse {
            name,
            creator,
            deleted: true,
        }),
    ))
}

fn run_response(query: &DistributedQuery) -> RunResponse {
    RunResponse {
        name: query.name.clone(),
        query_type: query.query_type,
        expected: query.expected,
    }
}

/// The carve of `session_id`, provided it belongs to `env`.
fn carve_in(fleet: &Fleet, env: &Environment, session_id: &str) -> FleetResult<CarvedFile> {
    let carve = fleet.carves.get_by_session(session_id)?;
    if carve.environment_id != env.id {
        return Err(FleetError::NotFound(format!("carve session {}", session_id)));
    }
    Ok(carve)
}

fn in_environment(carves: Vec<CarvedFile>, env: &Environment) -> Vec<CarvedFile> {
    carves
        .into_iter()
        .filter(|c| c.environment_id == env.id)
        .collect()
}
