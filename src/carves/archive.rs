//! Artifact reconstruction.

use super::s3::{s3_url, CompletedPart, ObjectStore};
use super::types::{ArchiveResult, CarvedBlock};
use crate::error::{FleetError, FleetResult};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Decodes the blocks in block-id order into `destination`.
///
/// The file is written under a per-attempt `.partial-<uuid>` name and renamed
/// when complete; a failed archive leaves nothing at `destination`.
pub async fn concatenate(blocks: &[CarvedBlock], destination: &Path) -> FleetResult<ArchiveResult> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = destination.with_extension(format!("partial-{}", uuid::Uuid::new_v4()));

    let written = write_blocks(blocks, &partial).await;
    let size = match written {
        Ok(size) => size,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
    };
    tokio::fs::rename(&partial, destination).await?;

    Ok(ArchiveResult {
        location: destination.to_string_lossy().into_owned(),
        size,
    })
}

async fn write_blocks(blocks: &[CarvedBlock], path: &Path) -> FleetResult<u64> {
    let mut ordered: Vec<&CarvedBlock> = blocks.iter().collect();
    ordered.sort_by_key(|b| b.block_id);

    let mut file = tokio::fs::File::create(path).await?;
    let mut size = 0u64;
    for block in ordered {
        let decoded = STANDARD.decode(block.data.trim().as_bytes())?;
        file.write_all(&decoded).await?;
        size += decoded.len() as u64;
    }
    file.flush().await?;
    Ok(size)
}

/// Stitches already-uploaded block objects into `key` with a server-side
/// multipart copy. Part numbers are `block_id + 1`.
pub async fn multipart_copy(
    objects: &dyn ObjectStore,
    blocks: &[CarvedBlock],
    key: &str,
) -> FleetResult<ArchiveResult> {
    let mut ordered: Vec<&CarvedBlock> = blocks.iter().collect();
    ordered.sort_by_key(|b| b.block_id);
    if ordered.is_empty() {
        return Err(FleetError::InvalidState(format!("no blocks to archive into {}", key)));
    }

    let upload_id = objects.create_multipart_upload(key).await?;

    match copy_parts(objects, &ordered, key, &upload_id).await {
        Ok(parts) => {
            objects.complete_multipart_upload(key, &upload_id, &parts).await?;
            Ok(ArchiveResult {
                location: s3_url(objects.bucket(), key),
                size: ordered.iter().map(|b| b.size as u64).sum(),
            })
        }
        Err(e) => {
            if let Err(abort) = objects.abort_multipart_upload(key, &upload_id).await {
                tracing::warn!("Failed to abort multipart upload {} for {}: {}", upload_id, key, abort);
            }
            Err(e)
        }
    }
}

async fn copy_parts(
    objects: &dyn ObjectStore,
    blocks: &[&CarvedBlock],
    key: &str,
    upload_id: &str,
) -> FleetResult<Vec<CompletedPart>> {
    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        let source = block.object_key.as_deref().ok_or_else(|| {
            FleetError::InvalidState(format!("block {} has no object key", block.block_id))
        })?;
        let part_number = block.block_id + 1;
        let etag = objects
            .upload_part_copy(key, upload_id, part_number, source)
            .await?;
        parts.push(CompletedPart { part_number, etag });
    }
    Ok(parts)
}
