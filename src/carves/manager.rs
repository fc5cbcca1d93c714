//! Carve Manager
//!
//! Drives a file carve from the `carve=1` row that schedules it, through the
//! block transfer, to the reconstructed artifact.
//!
//! ## Responsibilities
//! - **Scheduling**: one record per `carve_guid`, however often the row is reported.
//! - **Sessions**: pairing a node's CarveInit with a scheduled carve and a fresh session id.
//! - **Block accounting**: distinct block ids counted under the record's entry lock, so
//!   completion happens exactly once.
//! - **Archiving**: one archive build per session at a time; later callers reuse the result.

use super::archive;
use super::blocks::{archive_file, BlockStore, DbBlockStore, LocalBlockStore, S3BlockStore};
use super::s3::{archive_key, ObjectStore, PRESIGN_EXPIRY};
use super::types::*;
use crate::config::CarverKind;
use crate::error::{FleetError, FleetResult};
use crate::nodes::types::{now_ms, Node};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Owns carve records, the session index and the configured block store.
pub struct CarveManager {
    /// Structure: `carve_id -> CarvedFile`. The entry lock serialises block accounting.
    carves: DashMap<String, CarvedFile>,
    /// Structure: `session_id -> carve_id`.
    sessions: DashMap<String, String>,
    /// Storage for block payloads, chosen by the carver.
    blocks: Arc<dyn BlockStore>,
    /// Required by the S3 carver for multipart copies and pre-signed downloads.
    objects: Option<Arc<dyn ObjectStore>>,
    /// Where `db` and `local` archives are written.
    archive_dir: PathBuf,
    /// Structure: `session_id -> lock` held while that session's archive is built.
    archiving: DashMap<String, Arc<Mutex<()>>>,
}

impl CarveManager {
    /// Builds the block store for `carver`. The S3 carver requires an object store.
    pub fn new(
        carver: CarverKind,
        carves_dir: impl Into<PathBuf>,
        objects: Option<Arc<dyn ObjectStore>>,
    ) -> FleetResult<Self> {
        let carves_dir = carves_dir.into();
        let blocks: Arc<dyn BlockStore> = match carver {
            CarverKind::Db => Arc::new(DbBlockStore::new()),
            CarverKind::Local => Arc::new(LocalBlockStore::new(carves_dir.join("blocks"))),
            CarverKind::S3 => {
                let objects = objects.clone().ok_or_else(|| {
                    FleetError::Malformed("the s3 carver needs S3 settings".to_string())
                })?;
                Arc::new(S3BlockStore::new(objects))
            }
        };
        Ok(Self::with_block_store(blocks, carves_dir, objects))
    }

    /// Builds a manager around an existing block store.
    pub fn with_block_store(
        blocks: Arc<dyn BlockStore>,
        archive_dir: impl Into<PathBuf>,
        objects: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            carves: DashMap::new(),
            sessions: DashMap::new(),
            blocks,
            objects,
            archive_dir: archive_dir.into(),
            archiving: DashMap::new(),
        }
    }

    /// The carver the block store was built for.
    pub fn carver(&self) -> CarverKind {
        self.blocks.kind()
    }

    /// Materialises a carve announced by a node's query results. Idempotent on `carve_guid`.
    pub fn schedule(&self, row: &ScheduledCarve, node: &Node, query_name: &str) -> FleetResult<CarvedFile> {
        if !row.is_carve() {
            return Err(FleetError::Malformed("row is not a carve".to_string()));
        }
        let carve_id = row.carve_guid.trim();
        if carve_id.is_empty() {
            return Err(FleetError::Malformed("carve_guid is empty".to_string()));
        }
        let request_id = match row.request_id.trim() {
            "" => query_name.to_string(),
            id => id.to_string(),
        };

        match self.carves.entry(carve_id.to_string()) {
            Entry::Occupied(existing) => {
                tracing::debug!("Carve {} already scheduled", carve_id);
                Ok(existing.get().clone())
            }
            Entry::Vacant(slot) => {
                let now = now_ms();
                let carve = CarvedFile {
                    carve_id: carve_id.to_string(),
                    request_id,
                    session_id: None,
                    query_name: query_name.to_string(),
                    node_id: node.id,
                    uuid: node.uuid.clone(),
                    environment: node.environment.clone(),
                    environment_id: node.environment_id,
                    path: row.path.clone(),
                    carve_size: row.size.trim().parse().unwrap_or(0),
                    block_size: 0,
                    total_blocks: 0,
                    completed_blocks: 0,
                    status: CarveStatus::Scheduled,
                    carver: self.carver(),
                    compressed: false,
                    archived: false,
                    archive_path: None,
                    created_at: now,
                    last_activity: now,
                    completed_at: None,
                    received: BTreeSet::new(),
                };
                tracing::info!(
                    "Scheduled carve {} of {} on node {} ({})",
                    carve.carve_id,
                    carve.path,
                    carve.uuid,
                    carve.request_id
                );
                slot.insert(carve.clone());
                Ok(carve)
            }
        }
    }

    /// Pairs a scheduled carve of `node` with a fresh session id.
    pub fn init_carve(&self, node: &Node, init: &CarveInit) -> FleetResult<String> {
        if init.block_count == 0 {
            return Err(FleetError::Malformed("block_count must be positive".to_string()));
        }
        let request_id = init.request_id.trim();
        let carve_id = init.carve_id.trim();

        // Collect the id first: mutating while iterating would deadlock on the shard.
        let candidate = self
            .carves
            .iter()
            .filter(|c| {
                c.node_id == node.id
                    && c.request_id == request_id
                    && c.status == CarveStatus::Scheduled
                    && (carve_id.is_empty() || c.carve_id == carve_id)
            })
            .min_by_key(|c| c.created_at)
            .map(|c| c.carve_id.clone())
            .ok_or_else(|| {
                FleetError::NotFound(format!("scheduled carve for request {}", request_id))
            })?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let previous = {
            let mut carve = self
                .carves
                .get_mut(&candidate)
                .ok_or_else(|| FleetError::NotFound(format!("carve {}", candidate)))?;
            if carve.status != CarveStatus::Scheduled {
                return Err(FleetError::InvalidState(format!(
                    "carve {} is {:?}",
                    candidate, carve.status
                )));
            }
            carve.total_blocks = init.block_count;
            carve.block_size = init.block_size;
            carve.carve_size = init.carve_size;
            carve.last_activity = now_ms();
            carve.session_id.replace(session_id.clone())
        };

        if let Some(previous) = previous {
            self.sessions.remove(&previous);
        }
        self.sessions.insert(session_id.clone(), candidate.clone());

        tracing::info!(
            "Carve {} initialised: session {} ({} blocks of {} bytes)",
            candidate,
            session_id,
            init.block_count,
            init.block_size
        );
        Ok(session_id)
    }

    /// Verifies the session/request pairing and returns the carve.
    pub fn check(&self, session_id: &str, request_id: &str) -> FleetResult<CarvedFile> {
        let carve = self.get_by_session(session_id)?;
        if carve.request_id.trim() != request_id.trim() {
            return Err(FleetError::NotFound(format!(
                "session {} does not belong to request {}",
                session_id, request_id
            )));
        }
        Ok(carve)
    }

    /// Stores a block and advances the carve. A block whose storage fails is
    /// still counted so the transfer can complete.
    pub async fn ingest_block(
        &self,
        session_id: &str,
        request_id: &str,
        block_id: u32,
        data: &str,
    ) -> FleetResult<IngestOutcome> {
        let carve = self.check(session_id, request_id)?;
        if !carve.status.is_open() {
            return Err(FleetError::InvalidState(format!(
                "carve {} is {:?}",
                carve.carve_id, carve.status
            )));
        }
        if block_id >= carve.total_blocks {
            return Err(FleetError::Malformed(format!(
                "block {} out of range for {} blocks",
                block_id, carve.total_blocks
            )));
        }
        let compressed = if block_id == 0 {
            Some(is_zstd(data)?)
        } else {
            None
        };

        let block = CarvedBlock {
            session_id: session_id.to_string(),
            request_id: carve.request_id.clone(),
            environment: carve.environment.clone(),
            block_id,
            size: data.len(),
            data: data.to_string(),
            object_key: None,
        };
        if let Err(e) = self.blocks.store(&carve, block).await {
            tracing::warn!(
                "Failed to store block {} of session {}: {}",
                block_id,
                session_id,
                e
            );
        }

        let outcome = {
            let mut row = self
                .carves
                .get_mut(&carve.carve_id)
                .ok_or_else(|| FleetError::NotFound(format!("carve {}", carve.carve_id)))?;
            if !row.status.is_open() {
                return Err(FleetError::InvalidState(format!(
                    "carve {} is {:?}",
                    row.carve_id, row.status
                )));
            }
            if let Some(compressed) = compressed {
                row.compressed = compressed;
            }
            let now = now_ms();
            row.last_activity = now;

            let duplicate = !row.received.insert(block_id);
            if !duplicate {
                row.completed_blocks += 1;
            }

            let transitioned = if row.is_completed() {
                row.status = CarveStatus::Completed;
                row.completed_at = Some(now);
                true
            } else {
                if row.status == CarveStatus::Scheduled {
                    row.status = CarveStatus::InProgress;
                }
                false
            };

            IngestOutcome {
                completed: row.is_completed(),
                transitioned,
                duplicate,
            }
        };

        if outcome.transitioned {
            tracing::info!("Carve {} completed (session {})", carve.carve_id, session_id);
            if self.carver() == CarverKind::S3 {
                if let Err(e) = self.archive(session_id).await {
                    tracing::error!("Failed to archive carve session {}: {}", session_id, e);
                }
            }
        }

        Ok(outcome)
    }

    /// Whether every block of the session has arrived.
    pub fn completed(&self, session_id: &str) -> FleetResult<bool> {
        Ok(self.get_by_session(session_id)?.is_completed())
    }

    /// Reconstructs the artifact of a completed carve. Failures leave the record untouched.
    ///
    /// Concurrent calls for one session queue behind a per-session lock; the
    /// ones that find the artifact already built return it as is.
    pub async fn archive(&self, session_id: &str) -> FleetResult<ArchiveResult> {
        self.get_by_session(session_id)?;
        let lock = self
            .archiving
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let carve = self.get_by_session(session_id)?;
        if carve.status != CarveStatus::Completed {
            return Err(FleetError::InvalidState(format!(
                "carve {} is {:?}, not completed",
                carve.carve_id, carve.status
            )));
        }

        let blocks = self.blocks.load(session_id).await?;
        if blocks.len() < carve.total_blocks as usize {
            let present: BTreeSet<u32> = blocks.iter().map(|b| b.block_id).collect();
            let missing: Vec<u32> = (0..carve.total_blocks).filter(|id| !present.contains(id)).collect();
            tracing::warn!(
                "Archiving session {} with missing blocks {:?}; the artifact will be incomplete",
                session_id,
                missing
            );
        }

        let result = match self.carver() {
            CarverKind::Db | CarverKind::Local => {
                let destination =
                    archive_file(&self.archive_dir, session_id, carve.archive_extension())?;
                match tokio::fs::metadata(&destination).await {
                    Ok(meta) => ArchiveResult {
                        location: destination.to_string_lossy().into_owned(),
                        size: meta.len(),
                    },
                    Err(_) => archive::concatenate(&blocks, &destination).await?,
                }
            }
            CarverKind::S3 => match carve.archive_path.clone() {
                Some(location) if carve.archived => ArchiveResult {
                    location,
                    size: blocks.iter().map(|b| b.size as u64).sum(),
                },
                _ => {
                    let objects = self.object_store()?;
                    let key = s3_archive_key(&carve);
                    archive::multipart_copy(objects.as_ref(), &blocks, &key).await?
                }
            },
        };

        if let Some(mut row) = self.carves.get_mut(&carve.carve_id) {
            row.archived = true;
            row.archive_path = Some(result.location.clone());
        }
        tracing::info!(
            "Archived carve {} to {} ({} bytes)",
            carve.carve_id,
            result.location,
            result.size
        );
        Ok(result)
    }

    /// Local archives are served as files; S3 archives as a short-lived pre-signed URL.
    pub async fn download(&self, session_id: &str) -> FleetResult<DownloadTarget> {
        let mut carve = self.get_by_session(session_id)?;
        if !carve.archived {
            self.archive(session_id).await?;
            carve = self.get_by_session(session_id)?;
        }

        match self.carver() {
            CarverKind::S3 => {
                let url = self
                    .object_store()?
                    .presign_get(&s3_archive_key(&carve), PRESIGN_EXPIRY)?;
                Ok(DownloadTarget::Redirect(url))
            }
            CarverKind::Db | CarverKind::Local => {
                let path = carve
                    .archive_path
                    .map(PathBuf::from)
                    .ok_or_else(|| FleetError::Storage(format!("carve {} has no archive", carve.carve_id)))?;
                Ok(DownloadTarget::Local(path))
            }
        }
    }

    /// Looks a carve up by its `carve_guid`.
    pub fn get(&self, carve_id: &str) -> FleetResult<CarvedFile> {
        self.carves
            .get(carve_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("carve {}", carve_id)))
    }

    pub fn get_by_session(&self, session_id: &str) -> FleetResult<CarvedFile> {
        let carve_id = self
            .sessions
            .get(session_id)
            .map(|id| id.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("carve session {}", session_id)))?;
        self.get(&carve_id)
    }

    /// Carves scheduled by one query, oldest first.
    pub fn list_by_query(&self, query_name: &str) -> Vec<CarvedFile> {
        self.list_where(|c| c.query_name == query_name)
    }

    /// Every carve, oldest first.
    pub fn list(&self) -> Vec<CarvedFile> {
        self.list_where(|_| true)
    }

    /// Removes the carve record, its session and its stored blocks.
    pub async fn delete(&self, carve_id: &str) -> FleetResult<()> {
        let (_, carve) = self
            .carves
            .remove(carve_id)
            .ok_or_else(|| FleetError::NotFound(format!("carve {}", carve_id)))?;
        if let Some(session_id) = &carve.session_id {
            self.sessions.remove(session_id);
            self.archiving.remove(session_id);
            self.blocks.delete(session_id).await?;
        }
        tracing::info!("Deleted carve {}", carve_id);
        Ok(())
    }

    /// Marks open carves idle for longer than `ttl` as `Failed`.
    pub fn reap_stalled(&self, ttl: Duration) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(ttl.as_millis() as u64);
        let mut failed = Vec::new();
        for mut carve in self.carves.iter_mut() {
            if carve.status.is_open() && carve.last_activity < cutoff {
                carve.status = CarveStatus::Failed;
                failed.push(carve.carve_id.clone());
            }
        }
        for carve_id in &failed {
            tracing::warn!("Carve {} stalled past {:?}, marked failed", carve_id, ttl);
        }
        failed
    }

    fn list_where<F>(&self, predicate: F) -> Vec<CarvedFile>
    where
        F: Fn(&CarvedFile) -> bool,
    {
        let mut carves: Vec<CarvedFile> = self
            .carves
            .iter()
            .filter(|c| predicate(c.value()))
            .map(|c| c.value().clone())
            .collect();
        carves.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.carve_id.cmp(&b.carve_id)));
        carves
    }

    fn object_store(&self) -> FleetResult<Arc<dyn ObjectStore>> {
        self.objects
            .clone()
            .ok_or_else(|| FleetError::Storage("no object store configured".to_string()))
    }
}

fn s3_archive_key(carve: &CarvedFile) -> String {
    archive_key(
        &carve.environment,
        &carve.uuid,
        carve.session_id.as_deref().unwrap_or_default(),
        &carve.path,
        carve.archive_extension(),
    )
}

/// Decodes a block and checks for the zstd frame magic.
pub fn is_zstd(data: &str) -> FleetResult<bool> {
    let decoded = STANDARD
        .decode(data.trim().as_bytes())
        .map_err(|e| FleetError::Malformed(format!("block is not base64: {}", e)))?;
    Ok(decoded.starts_with(&ZSTD_MAGIC))
}
