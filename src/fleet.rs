//! Service context and router assembly.
//!
//! `Fleet` bundles every component behind one `Extension` so node and admin
//! handlers share the same in-memory state.

use crate::admin::handlers::*;
use crate::admin::protocol::*;
use crate::batch::types::BatchConfig;
use crate::batch::writer::BatchWriter;
use crate::carves::manager::CarveManager;
use crate::config::Settings;
use crate::environments::store::EnvironmentStore;
use crate::environments::types::NewEnvironment;
use crate::error::FleetResult;
use crate::logging::sink::LogSink;
use crate::nodes::directory::{InMemoryNodeDirectory, NodeDirectory};
use crate::nodes::types::NewNode;
use crate::queries::manager::QueryManager;
use crate::tls::handlers::*;
use crate::tls::protocol::*;

use axum::routing::{get, post};
use axum::{Extension, Router};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct Fleet {
    pub environments: Arc<EnvironmentStore>,
    pub nodes: Arc<dyn NodeDirectory>,
    pub queries: Arc<QueryManager>,
    pub carves: Arc<CarveManager>,
    pub batch: Arc<BatchWriter>,
    pub sink: Arc<dyn LogSink>,
    pub settings: Settings,
}

impl Fleet {
    /// Wires the in-memory stores and starts the batch writer, so it must be
    /// called from inside a tokio runtime.
    pub fn new(
        carves: CarveManager,
        sink: Arc<dyn LogSink>,
        settings: Settings,
        batch: BatchConfig,
    ) -> Arc<Self> {
        let environments = Arc::new(EnvironmentStore::new());
        let nodes: Arc<dyn NodeDirectory> =
            Arc::new(InMemoryNodeDirectory::new(environments.clone()));
        let queries = Arc::new(QueryManager::new(
            nodes.clone(),
            environments.clone(),
            settings,
        ));
        let batch = BatchWriter::start(nodes.clone(), batch);

        Arc::new(Self {
            environments,
            nodes,
            queries,
            carves: Arc::new(carves),
            batch,
            sink,
            settings,
        })
    }

    /// Creates the seeded environments, then enrolls the seeded nodes.
    pub fn seed(&self, seed: SeedFile) -> FleetResult<()> {
        let (envs, nodes) = (seed.environments.len(), seed.nodes.len());
        for env in seed.environments {
            self.environments.create(env)?;
        }
        for node in seed.nodes {
            self.nodes.enroll(node)?;
        }
        tracing::info!("Seeded {} environments and {} nodes", envs, nodes);
        Ok(())
    }

    /// Flushes pending liveness events.
    pub async fn shutdown(&self) {
        self.batch.shutdown().await;
    }
}

/// JSON document used to populate the in-memory directory at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub environments: Vec<NewEnvironment>,
    #[serde(default)]
    pub nodes: Vec<NewNode>,
}

impl SeedFile {
    pub fn load(path: &Path) -> FleetResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

pub fn router(fleet: Arc<Fleet>) -> Router {
    Router::new()
        // Node protocol
        .route(ENDPOINT_ENROLL, post(handle_enroll))
        .route(ENDPOINT_CONFIG, post(handle_config))
        .route(ENDPOINT_LOG, post(handle_log))
        .route(ENDPOINT_QUERY_READ, post(handle_query_read))
        .route(ENDPOINT_QUERY_WRITE, post(handle_query_write))
        .route(ENDPOINT_CARVE_INIT, post(handle_carve_init))
        .route(ENDPOINT_CARVE_BLOCK, post(handle_carve_block))
        // Admin API
        .route(
            ENDPOINT_QUERIES,
            post(handle_run_query).get(handle_list_queries),
        )
        .route(ENDPOINT_QUERY, get(handle_get_query))
        .route(ENDPOINT_QUERY_ACTION, post(handle_query_action))
        .route(
            ENDPOINT_CARVES,
            post(handle_run_carve).get(handle_list_carves),
        )
        .route(
            ENDPOINT_CARVE,
            get(handle_get_carve).delete(handle_delete_carve),
        )
        .route(ENDPOINT_CARVE_ARCHIVE, post(handle_archive_carve))
        .route(ENDPOINT_CARVE_DOWNLOAD, get(handle_download_carve))
        .route(
            ENDPOINT_SAVED,
            post(handle_create_saved).get(handle_list_saved),
        )
        .route(
            ENDPOINT_SAVED_QUERY,
            get(handle_get_saved)
                .put(handle_update_saved)
                .delete(handle_delete_saved),
        )
        .layer(Extension(fleet))
}

/// Periodically completes finished queries and expires stale ones, one
/// environment at a time.
pub fn spawn_maintenance(
    queries: Arc<QueryManager>,
    environments: Arc<EnvironmentStore>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            for env in environments.list() {
                let completed = queries.cleanup_completed(env.id);
                let expired = queries.cleanup_expired(env.id);
                if !completed.is_empty() || !expired.is_empty() {
                    tracing::debug!(
                        "Query maintenance in {}: {} completed, {} expired",
                        env.name,
                        completed.len(),
                        expired.len()
                    );
                }
            }
        }
    })
}
