//! Single-consumer coalescing writer.
//!
//! Producers call `add_event`, which never awaits: a full channel drops the
//! event and counts it. All pending-map mutation happens on the consumer task.

use super::types::*;
use crate::nodes::directory::NodeDirectory;
use crate::nodes::types::NodeId;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub struct BatchWriter {
    tx: mpsc::Sender<WriteEvent>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WriterStats>,
}

#[derive(Default)]
struct WriterStats {
    state: AtomicU8,
    dropped: AtomicU64,
    flushes: AtomicU64,
    flushed_nodes: AtomicU64,
}

impl WriterStats {
    fn set_state(&self, state: WriterState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

impl BatchWriter {
    /// Spawns the consumer task and returns the producer handle.
    pub fn start(directory: Arc<dyn NodeDirectory>, config: BatchConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(WriterStats::default());

        let consumer = Consumer {
            rx,
            shutdown: shutdown_rx,
            directory,
            batch_size: config.batch_size.max(1),
            timeout: config.timeout,
            pending: HashMap::with_capacity(config.batch_size.max(1)),
            stats: stats.clone(),
        };
        let worker = tokio::spawn(consumer.run());

        tracing::info!(
            "Batch writer started (batch_size={}, timeout={:?}, buffer={})",
            config.batch_size,
            config.timeout,
            config.buffer
        );

        Arc::new(Self {
            tx,
            shutdown,
            worker: Mutex::new(Some(worker)),
            stats,
        })
    }

    /// Queues a liveness event. Returns `false` when the event was dropped.
    pub fn add_event(&self, event: WriteEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Batch writer buffer full, dropping event for node {}",
                    event.node_id.0
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                tracing::warn!(
                    "Batch writer stopped, dropping event for node {}",
                    event.node_id.0
                );
                false
            }
        }
    }

    pub fn state(&self) -> WriterState {
        WriterState::from_u8(self.stats.state.load(Ordering::SeqCst))
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.stats.flushes.load(Ordering::Relaxed)
    }

    pub fn flushed_nodes(&self) -> u64 {
        self.stats.flushed_nodes.load(Ordering::Relaxed)
    }

    /// Stops the consumer after draining queued events into a final flush.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!("Batch writer task ended abnormally: {}", e);
            }
        }
    }
}

struct Consumer {
    rx: mpsc::Receiver<WriteEvent>,
    shutdown: watch::Receiver<bool>,
    directory: Arc<dyn NodeDirectory>,
    batch_size: usize,
    timeout: std::time::Duration,
    pending: HashMap<NodeId, WriteEvent>,
    stats: Arc<WriterStats>,
}

impl Consumer {
    async fn run(mut self) {
        let mut deadline = Instant::now() + self.timeout;

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(event) => {
                        self.accept(event);
                        if self.pending.len() >= self.batch_size {
                            tracing::debug!("Batch size reached ({}), flushing", self.pending.len());
                            self.flush();
                            deadline = Instant::now() + self.timeout;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if !self.pending.is_empty() {
                        tracing::debug!("Batch timeout reached, flushing {} nodes", self.pending.len());
                        self.flush();
                    }
                    deadline = Instant::now() + self.timeout;
                }
                _ = self.shutdown.changed() => {
                    while let Ok(event) = self.rx.try_recv() {
                        self.accept(event);
                    }
                    break;
                }
            }
        }

        if !self.pending.is_empty() {
            self.flush();
        }
        tracing::info!("Batch writer stopped");
    }

    fn accept(&mut self, event: WriteEvent) {
        if self.pending.is_empty() {
            self.stats.set_state(WriterState::Accumulating);
        }
        // Last event per node wins.
        self.pending.insert(event.node_id, event);
    }

    fn flush(&mut self) {
        self.stats.set_state(WriterState::Flushing);

        let mut batch: Vec<WriteEvent> = self.pending.drain().map(|(_, event)| event).collect();
        batch.sort_by_key(|event| event.node_id);

        match self.directory.refresh_last_seen_batch(&batch) {
            Ok(touched) => {
                tracing::debug!("Flushed last-seen for {} nodes ({} updated)", batch.len(), touched);
            }
            Err(e) => {
                tracing::error!("Failed to flush last-seen for {} nodes: {}", batch.len(), e);
            }
        }

        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .flushed_nodes
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats.set_state(WriterState::Idle);
    }
}
