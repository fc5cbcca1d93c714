//! Block storage, one implementation per carver.

use super::s3::{block_key, ObjectStore};
use super::types::{CarvedBlock, CarvedFile};
use crate::config::CarverKind;
use crate::error::{FleetError, FleetResult};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[async_trait]
pub trait BlockStore: Send + Sync {
    fn kind(&self) -> CarverKind;

    /// Stores one block. A block id received again replaces the earlier payload.
    async fn store(&self, carve: &CarvedFile, block: CarvedBlock) -> FleetResult<()>;

    /// Every stored block of a session, ordered by block id.
    async fn load(&self, session_id: &str) -> FleetResult<Vec<CarvedBlock>>;

    async fn delete(&self, session_id: &str) -> FleetResult<()>;
}

/// Block rows kept alongside the carve records.
#[derive(Default)]
pub struct DbBlockStore {
    blocks: DashMap<String, BTreeMap<u32, CarvedBlock>>,
}

impl DbBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for DbBlockStore {
    fn kind(&self) -> CarverKind {
        CarverKind::Db
    }

    async fn store(&self, _carve: &CarvedFile, block: CarvedBlock) -> FleetResult<()> {
        self.blocks
            .entry(block.session_id.clone())
            .or_default()
            .insert(block.block_id, block);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> FleetResult<Vec<CarvedBlock>> {
        Ok(self
            .blocks
            .get(session_id)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, session_id: &str) -> FleetResult<()> {
        self.blocks.remove(session_id);
        Ok(())
    }
}

/// Writes each base64 block to `<dir>/<session>/<block_id>` as it arrives.
pub struct LocalBlockStore {
    dir: PathBuf,
}

impl LocalBlockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_dir(&self, session_id: &str) -> FleetResult<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(session_id))
    }
}

#[async_trait]
impl BlockStore for LocalBlockStore {
    fn kind(&self) -> CarverKind {
        CarverKind::Local
    }

    async fn store(&self, carve: &CarvedFile, block: CarvedBlock) -> FleetResult<()> {
        let dir = self.session_dir(&block.session_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(block.block_id.to_string()), block.data.as_bytes()).await?;
        tracing::trace!("Stored block {} of carve {} on disk", block.block_id, carve.carve_id);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> FleetResult<Vec<CarvedBlock>> {
        let dir = self.session_dir(session_id)?;
        let mut found: BTreeMap<u32, PathBuf> = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                found.insert(id, entry.path());
            }
        }

        let mut blocks = Vec::with_capacity(found.len());
        for (block_id, path) in found {
            let data = tokio::fs::read_to_string(&path).await?;
            blocks.push(CarvedBlock {
                session_id: session_id.to_string(),
                request_id: String::new(),
                environment: String::new(),
                block_id,
                size: data.len(),
                data,
                object_key: None,
            });
        }
        Ok(blocks)
    }

    async fn delete(&self, session_id: &str) -> FleetResult<()> {
        let dir = self.session_dir(session_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Uploads each decoded block as its own object; the index keeps the keys.
pub struct S3BlockStore {
    objects: Arc<dyn ObjectStore>,
    index: DashMap<String, BTreeMap<u32, CarvedBlock>>,
}

impl S3BlockStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            objects,
            index: DashMap::new(),
        }
    }
}

#[async_trait]
impl BlockStore for S3BlockStore {
    fn kind(&self) -> CarverKind {
        CarverKind::S3
    }

    async fn store(&self, carve: &CarvedFile, block: CarvedBlock) -> FleetResult<()> {
        let decoded = STANDARD.decode(block.data.as_bytes())?;
        let key = block_key(&carve.environment, &carve.uuid, &block.session_id, block.block_id);
        let size = decoded.len();
        self.objects.put_object(&key, decoded).await?;

        self.index.entry(block.session_id.clone()).or_default().insert(
            block.block_id,
            CarvedBlock {
                data: String::new(),
                size,
                object_key: Some(key),
                ..block
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> FleetResult<Vec<CarvedBlock>> {
        Ok(self
            .index
            .get(session_id)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, session_id: &str) -> FleetResult<()> {
        let removed = self.index.remove(session_id);
        if let Some((_, blocks)) = removed {
            for key in blocks.values().filter_map(|b| b.object_key.as_deref()) {
                if let Err(e) = self.objects.delete_object(key).await {
                    tracing::warn!("Failed to delete carve block {}: {}", key, e);
                }
            }
        }
        Ok(())
    }
}

/// Session ids become path components; only minted UUID-like ids are accepted.
pub(crate) fn validate_session_id(session_id: &str) -> FleetResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(FleetError::Malformed(format!("invalid session id {:?}", session_id)))
    }
}

pub(crate) fn archive_file(dir: &Path, session_id: &str, extension: &str) -> FleetResult<PathBuf> {
    validate_session_id(session_id)?;
    Ok(dir.join(format!("{}{}", session_id, extension)))
}
