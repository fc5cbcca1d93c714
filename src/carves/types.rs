use crate::config::CarverKind;
use crate::environments::types::EnvironmentId;
use crate::nodes::types::NodeId;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// First bytes of a zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CarveStatus {
    Scheduled,
    InProgress,
    Completed,
    /// Stalled past its TTL; blocks are no longer accepted.
    Failed,
}

impl CarveStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, CarveStatus::Scheduled | CarveStatus::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarvedFile {
    pub carve_id: String,
    /// Name of the query that scheduled the carve.
    pub request_id: String,
    pub session_id: Option<String>,
    pub query_name: String,
    pub node_id: NodeId,
    pub uuid: String,
    pub environment: String,
    pub environment_id: EnvironmentId,
    pub path: String,
    pub carve_size: u64,
    pub block_size: u64,
    pub total_blocks: u32,
    pub completed_blocks: u32,
    pub status: CarveStatus,
    pub carver: CarverKind,
    /// Block 0 starts with the zstd magic.
    pub compressed: bool,
    pub archived: bool,
    pub archive_path: Option<String>,
    pub created_at: u64,
    /// Last init or block arrival; the reaper measures staleness from here.
    pub last_activity: u64,
    pub completed_at: Option<u64>,
    #[serde(skip)]
    pub(crate) received: BTreeSet<u32>,
}

impl CarvedFile {
    pub fn is_completed(&self) -> bool {
        self.total_blocks > 0 && self.completed_blocks == self.total_blocks
    }

    pub fn archive_extension(&self) -> &'static str {
        if self.compressed {
            ".tar.zst"
        } else {
            ".tar"
        }
    }
}

/// One chunk of a carve as stored by a block store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CarvedBlock {
    pub session_id: String,
    pub request_id: String,
    pub environment: String,
    pub block_id: u32,
    /// Base64 payload for `db`/`local` carvers; empty when held in an object store.
    pub data: String,
    pub size: usize,
    /// Object key when the payload lives in S3.
    pub object_key: Option<String>,
}

/// A `carve=1` row embedded in a node's query-write payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledCarve {
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub carve_guid: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub carve: String,
}

impl ScheduledCarve {
    pub fn is_carve(&self) -> bool {
        self.carve.trim() == "1"
    }
}

/// Parameters of a CarveInit request.
#[derive(Debug, Clone, Default)]
pub struct CarveInit {
    pub carve_id: String,
    pub request_id: String,
    pub block_count: u32,
    pub block_size: u64,
    pub carve_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Every block has now been received.
    pub completed: bool,
    /// This block moved the carve to `Completed`.
    pub transitioned: bool,
    /// The block id had been received before.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveResult {
    /// Local file path or `s3://bucket/key`.
    pub location: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    Local(PathBuf),
    Redirect(String),
}
