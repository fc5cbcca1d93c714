//! Command-line and environment configuration.
//!
//! Every flag can also be provided through a `FLEET_*` environment variable so
//! the service can be configured from a container definition without arguments.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "fleet-dataplane")]
#[command(about = "Fleet data-plane: distributed queries, file carves and last-seen batching", long_about = None)]
pub struct Config {
    /// Address the HTTP listener binds to.
    #[arg(long, env = "FLEET_BIND", default_value = "127.0.0.1:9000")]
    pub bind: SocketAddr,

    #[arg(long, env = "FLEET_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// JSON file with environments and nodes used to populate the in-memory directory.
    #[arg(long, env = "FLEET_SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    /// Hours since last seen after which a node no longer counts as active (0 disables).
    #[arg(long, env = "FLEET_INACTIVE_HOURS", default_value_t = 72)]
    pub inactive_hours: u64,

    /// Polling interval hint handed to nodes of accelerated environments.
    #[arg(long, env = "FLEET_ACCELERATED_SECONDS", default_value_t = 60)]
    pub accelerated_seconds: u64,

    #[arg(long, env = "FLEET_BATCH_SIZE", default_value_t = 500)]
    pub batch_size: usize,

    #[arg(long, env = "FLEET_BATCH_TIMEOUT_SECS", default_value_t = 60)]
    pub batch_timeout_secs: u64,

    /// Capacity of the write-event channel feeding the batch writer.
    #[arg(long, env = "FLEET_BATCH_BUFFER", default_value_t = 2000)]
    pub batch_buffer: usize,

    #[arg(long, value_enum, env = "FLEET_CARVER", default_value = "db")]
    pub carver: CarverKind,

    /// Directory where reconstructed carve archives (and local carver blocks) are written.
    #[arg(long, env = "FLEET_CARVES_DIR", default_value = "carves")]
    pub carves_dir: PathBuf,

    /// Seconds without block activity before a carve is marked failed.
    #[arg(long, env = "FLEET_CARVE_TTL_SECS", default_value_t = 3600)]
    pub carve_ttl_secs: u64,

    #[arg(long, env = "FLEET_REAPER_INTERVAL_SECS", default_value_t = 60)]
    pub reaper_interval_secs: u64,

    #[arg(long, value_enum, env = "FLEET_LOGGER", default_value = "stdout")]
    pub logger: LoggerKind,

    #[arg(long, env = "FLEET_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, env = "FLEET_S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    /// Custom endpoint for S3-compatible stores; defaults to the AWS regional endpoint.
    #[arg(long, env = "FLEET_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "FLEET_S3_ACCESS_KEY")]
    pub s3_access_key: Option<String>,

    #[arg(long, env = "FLEET_S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            inactive_hours: self.inactive_hours,
            accelerated_seconds: self.accelerated_seconds,
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    pub fn carve_ttl(&self) -> Duration {
        Duration::from_secs(self.carve_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

/// Storage backend for carved blocks and reconstructed archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarverKind {
    /// Blocks kept as rows in the backing store.
    Db,
    /// Blocks written to the carves directory as they arrive.
    Local,
    /// Blocks uploaded to S3 and stitched with a multipart copy.
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LoggerKind {
    Stdout,
    None,
}

/// Read-only server settings consumed by the query and node components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub inactive_hours: u64,
    pub accelerated_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inactive_hours: 72,
            accelerated_seconds: 60,
        }
    }
}
