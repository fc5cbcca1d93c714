use crate::config::LoggerKind;
use crate::error::{FleetError, FleetResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Status,
    Result,
    /// On-demand query results from QueryWrite.
    Query,
}

impl LogType {
    pub fn parse(value: &str) -> FleetResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "status" => Ok(LogType::Status),
            "result" => Ok(LogType::Result),
            "query" => Ok(LogType::Query),
            other => Err(FleetError::Malformed(format!("unknown log type {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Status => "status",
            LogType::Result => "result",
            LogType::Query => "query",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for node logs.
#[async_trait]
pub trait LogSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        log_type: LogType,
        data: &[u8],
        environment: &str,
        uuid: &str,
    ) -> FleetResult<()>;
}

/// Emits every record as a structured tracing event on the `osquery` target.
pub struct StdoutSink;

#[async_trait]
impl LogSink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn send(
        &self,
        log_type: LogType,
        data: &[u8],
        environment: &str,
        uuid: &str,
    ) -> FleetResult<()> {
        let body = std::str::from_utf8(data)
            .map_err(|e| FleetError::Malformed(format!("log payload is not UTF-8: {}", e)))?;
        tracing::info!(
            target: "osquery",
            log_type = %log_type,
            environment,
            uuid,
            bytes = data.len(),
            "{}",
            body
        );
        Ok(())
    }
}

pub struct NoneSink;

#[async_trait]
impl LogSink for NoneSink {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn send(&self, _: LogType, _: &[u8], _: &str, _: &str) -> FleetResult<()> {
        Ok(())
    }
}

pub fn build_sink(kind: LoggerKind) -> Arc<dyn LogSink> {
    match kind {
        LoggerKind::Stdout => Arc::new(StdoutSink),
        LoggerKind::None => Arc::new(NoneSink),
    }
}
