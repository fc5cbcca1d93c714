use super::types::*;
use crate::batch::types::WriteEvent;
use crate::environments::store::EnvironmentStore;
use crate::error::{FleetError, FleetResult};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Read and liveness-write access to the enrolled fleet.
pub trait NodeDirectory: Send + Sync {
    fn get(&self, id: NodeId) -> FleetResult<Node>;

    fn get_by_key(&self, node_key: &str) -> FleetResult<Node>;

    fn get_by_uuid(&self, uuid: &str) -> FleetResult<Node>;

    fn get_by_hostname(&self, hostname: &str) -> Vec<Node>;

    fn active_in_environment(&self, environment: &str, inactive_hours: u64) -> Vec<Node>;

    fn active_by_platform(&self, platform: &str, inactive_hours: u64) -> Vec<Node>;

    /// Creates the node, or re-keys an existing one with the same UUID.
    fn enroll(&self, node: NewNode) -> FleetResult<Node>;

    /// Immediate single-node refresh of IP and last-seen.
    fn refresh_metadata(&self, id: NodeId, ip_address: &str) -> FleetResult<()>;

    /// One bulk write for every coalesced event of a batch. Returns the rows touched.
    fn refresh_last_seen_batch(&self, events: &[WriteEvent]) -> FleetResult<usize>;
}

/// `DashMap`-backed directory. Node keys and UUIDs are secondary indexes.
pub struct InMemoryNodeDirectory {
    nodes: Arc<DashMap<NodeId, Node>>,
    by_key: DashMap<String, NodeId>,
    by_uuid: DashMap<String, NodeId>,
    environments: Arc<EnvironmentStore>,
    next_id: AtomicU64,
}

impl InMemoryNodeDirectory {
    pub fn new(environments: Arc<EnvironmentStore>) -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            by_key: DashMap::new(),
            by_uuid: DashMap::new(),
            environments,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn filter_active<F>(&self, inactive_hours: u64, predicate: F) -> Vec<Node>
    where
        F: Fn(&Node) -> bool,
    {
        let now = now_ms();
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.is_active(inactive_hours, now) && predicate(n.value()))
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }
}

impl NodeDirectory for InMemoryNodeDirectory {
    fn get(&self, id: NodeId) -> FleetResult<Node> {
        self.nodes
            .get(&id)
            .map(|n| n.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("node {}", id.0)))
    }

    fn get_by_key(&self, node_key: &str) -> FleetResult<Node> {
        let id = self
            .by_key
            .get(node_key)
            .map(|id| *id)
            .ok_or_else(|| FleetError::NotFound("node key".to_string()))?;
        self.get(id)
    }

    fn get_by_uuid(&self, uuid: &str) -> FleetResult<Node> {
        let id = self
            .by_uuid
            .get(&uuid.to_uppercase())
            .map(|id| *id)
            .ok_or_else(|| FleetError::NotFound(format!("node uuid {}", uuid)))?;
        self.get(id)
    }

    fn get_by_hostname(&self, hostname: &str) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.hostname.eq_ignore_ascii_case(hostname))
            .map(|n| n.value().clone())
            .collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    fn active_in_environment(&self, environment: &str, inactive_hours: u64) -> Vec<Node> {
        self.filter_active(inactive_hours, |n| n.environment == environment)
    }

    fn active_by_platform(&self, platform: &str, inactive_hours: u64) -> Vec<Node> {
        self.filter_active(inactive_hours, |n| n.platform.eq_ignore_ascii_case(platform))
    }

    fn enroll(&self, new: NewNode) -> FleetResult<Node> {
        if new.uuid.trim().is_empty() {
            return Err(FleetError::Malformed("node uuid is empty".to_string()));
        }
        let env = self.environments.get_by_name(&new.environment)?;
        let uuid = new.uuid.trim().to_uppercase();
        let node_key = new
            .node_key
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = now_ms();
        let last_seen = now.saturating_sub(new.last_seen_hours_ago.saturating_mul(3_600_000));

        let id = match self.by_uuid.get(&uuid).map(|id| *id) {
            Some(existing) => {
                // Re-enrollment: the old key stops working.
                let mut node = self
                    .nodes
                    .get_mut(&existing)
                    .ok_or_else(|| FleetError::Storage(format!("dangling uuid index {}", uuid)))?;
                self.by_key.remove(&node.node_key);
                node.node_key = node_key.clone();
                node.hostname = new.hostname;
                node.platform = new.platform;
                node.environment = env.name.clone();
                node.environment_id = env.id;
                node.ip_address = new.ip_address;
                node.osquery_version = new.osquery_version;
                node.enrolled_at = now;
                node.last_seen = last_seen;
                tracing::info!("Re-enrolled node {} ({})", uuid, node.hostname);
                existing
            }
            None => {
                let id = NodeId(self.next_id.fetch_add(1, Ordering::SeqCst));
                let node = Node {
                    id,
                    uuid: uuid.clone(),
                    node_key: node_key.clone(),
                    hostname: new.hostname,
                    platform: new.platform,
                    environment: env.name.clone(),
                    environment_id: env.id,
                    ip_address: new.ip_address,
                    osquery_version: new.osquery_version,
                    enrolled_at: now,
                    last_seen,
                };
                tracing::info!("Enrolled node {} ({}) in {}", uuid, node.hostname, env.name);
                self.nodes.insert(id, node);
                self.by_uuid.insert(uuid, id);
                id
            }
        };
        self.by_key.insert(node_key, id);

        self.get(id)
    }

    fn refresh_metadata(&self, id: NodeId, ip_address: &str) -> FleetResult<()> {
        let mut node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FleetError::NotFound(format!("node {}", id.0)))?;
        if !ip_address.is_empty() {
            node.ip_address = ip_address.to_string();
        }
        node.last_seen = now_ms();
        Ok(())
    }

    fn refresh_last_seen_batch(&self, events: &[WriteEvent]) -> FleetResult<usize> {
        let now = now_ms();
        let mut touched = 0;
        for event in events {
            match self.nodes.get_mut(&event.node_id) {
                Some(mut node) => {
                    node.last_seen = now;
                    if !event.ip.is_empty() {
                        node.ip_address = event.ip.clone();
                    }
                    touched += 1;
                }
                None => {
                    tracing::debug!("Skipping last-seen refresh for unknown node {}", event.node_id.0);
                }
            }
        }
        Ok(touched)
    }
}
