use crate::nodes::types::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Liveness signal from one node request. Only the coalesced result is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEvent {
    pub node_id: NodeId,
    pub ip: String,
}

impl WriteEvent {
    pub fn new(node_id: NodeId, ip: impl Into<String>) -> Self {
        Self {
            node_id,
            ip: ip.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriterState {
    /// Nothing pending since the last flush.
    Idle,
    /// At least one event waiting for the next flush.
    Accumulating,
    /// Bulk update in progress.
    Flushing,
}

impl WriterState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            WriterState::Idle => 0,
            WriterState::Accumulating => 1,
            WriterState::Flushing => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => WriterState::Accumulating,
            2 => WriterState::Flushing,
            _ => WriterState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Distinct nodes that trigger a size flush.
    pub batch_size: usize,
    /// Maximum time between flushes while events are pending.
    pub timeout: Duration,
    /// Channel capacity; events beyond it are dropped.
    pub buffer: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            timeout: Duration::from_secs(60),
            buffer: 2000,
        }
    }
}
