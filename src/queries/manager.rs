//! Query Manager
//!
//! Owns distributed query headers, their per-node assignments and the saved
//! query library. Everything lives in DashMaps so the node poll path and the
//! admin API can work concurrently without a global lock.
//!
//! ## Responsibilities
//! - **Dispatch**: create the header, resolve targets and record `expected` from the
//!   assignment rows actually created.
//! - **Poll contract**: hand each node its pending, active, unexpired queries.
//! - **Results**: move a node's row to completed or error exactly once.
//! - **Lifecycle**: explicit transitions plus the per-environment maintenance sweeps.
//! - **Saved queries**: named SQL kept per creator.

use super::targets;
use super::types::*;
use crate::config::Settings;
use crate::environments::store::EnvironmentStore;
use crate::environments::types::EnvironmentId;
use crate::error::{FleetError, FleetResult};
use crate::nodes::directory::NodeDirectory;
use crate::nodes::types::{now_ms, Node, NodeId};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of a full dispatch: the stored header and the nodes it was assigned to.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub query: DistributedQuery,
    pub targets: Vec<NodeId>,
}

pub struct QueryManager {
    /// Query headers by id.
    queries: DashMap<QueryId, DistributedQuery>,
    /// Unique name index per environment.
    names: DashMap<(EnvironmentId, String), QueryId>,
    /// Filters a query was created with, kept for display.
    targets: DashMap<QueryId, Vec<QueryTarget>>,
    /// Structure: `Node ID -> Query ID -> NodeQuery`, so the poll path touches one node's rows.
    assignments: DashMap<NodeId, DashMap<QueryId, NodeQuery>>,
    /// Structure: `(creator, name) -> SavedQuery`.
    saved: DashMap<(String, String), SavedQuery>,
    next_id: AtomicU64,
    nodes: Arc<dyn NodeDirectory>,
    environments: Arc<EnvironmentStore>,
    settings: Settings,
}

impl QueryManager {
    pub fn new(
        nodes: Arc<dyn NodeDirectory>,
        environments: Arc<EnvironmentStore>,
        settings: Settings,
    ) -> Self {
        Self {
            queries: DashMap::new(),
            names: DashMap::new(),
            targets: DashMap::new(),
            assignments: DashMap::new(),
            saved: DashMap::new(),
            next_id: AtomicU64::new(1),
            nodes,
            environments,
            settings,
        }
    }

    /// Persists a new query header. Fails with `Conflict` when the name is taken
    /// in the environment.
    pub fn create(&self, new: NewQuery, filters: &TargetFilters) -> FleetResult<DistributedQuery> {
        if new.query.trim().is_empty() {
            return Err(FleetError::Malformed("query is empty".to_string()));
        }
        self.environments.get(new.environment_id)?;

        let query_type = new
            .query_type
            .unwrap_or_else(|| QueryType::classify(&new.query));
        let name = match new.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            Some(_) => return Err(FleetError::Malformed("query name is empty".to_string())),
            None => generate_name(query_type),
        };

        let id = match self.names.entry((new.environment_id, name.clone())) {
            Entry::Occupied(_) => {
                return Err(FleetError::Conflict(format!("query {} already exists", name)));
            }
            Entry::Vacant(slot) => {
                let id = QueryId(self.next_id.fetch_add(1, Ordering::SeqCst));
                slot.insert(id);
                id
            }
        };

        let now = now_ms();
        let query = DistributedQuery {
            id,
            name,
            query: new.query,
            creator: new.creator,
            expected: 0,
            executions: 0,
            errors: 0,
            active: true,
            completed: false,
            expired: false,
            deleted: false,
            hidden: new.hidden,
            expiration: match new.expiration_hours {
                0 => None,
                hours => Some(now + hours.saturating_mul(3_600_000)),
            },
            query_type,
            target: filters.describe(),
            environment_id: new.environment_id,
            created_at: now,
            updated_at: now,
        };

        self.targets.insert(id, filters.to_targets());
        self.queries.insert(id, query.clone());
        tracing::info!(
            "Created {:?} query {} (targets: {})",
            query.query_type,
            query.name,
            query.target
        );
        Ok(query)
    }

    /// Active nodes matching every supplied filter dimension.
    pub fn resolve_targets(&self, filters: &TargetFilters) -> Vec<NodeId> {
        targets::resolve(self.nodes.as_ref(), filters, self.settings.inactive_hours)
    }

    /// Bulk-creates assignments. Existing assignments are never recreated.
    pub fn assign_targets(&self, node_ids: &[NodeId], query_id: QueryId) -> FleetResult<usize> {
        if !self.queries.contains_key(&query_id) {
            return Err(FleetError::NotFound(format!("query id {}", query_id.0)));
        }

        let now = now_ms();
        let mut created = 0;
        for node_id in node_ids {
            let node_rows = self.assignments.entry(*node_id).or_default();
            let entry = node_rows.entry(query_id);
            if let Entry::Vacant(slot) = entry {
                slot.insert(NodeQuery {
                    node_id: *node_id,
                    query_id,
                    status: NodeQueryStatus::Pending,
                    updated_at: now,
                });
                created += 1;
            }
        }

        tracing::debug!("Assigned query {} to {} nodes", query_id.0, created);
        Ok(created)
    }

    /// Overwrites the number of nodes expected to answer.
    pub fn set_expected(&self, name: &str, count: usize, env: EnvironmentId) -> FleetResult<()> {
        self.update(name, env, |q| q.expected = count)
    }

    /// Create, resolve, assign and record `expected` in one step.
    pub fn dispatch(&self, new: NewQuery, filters: &TargetFilters) -> FleetResult<Dispatched> {
        let env = new.environment_id;
        let query = self.create(new, filters)?;
        let node_ids = self.resolve_targets(filters);

        if !node_ids.is_empty() {
            self.assign_targets(&node_ids, query.id)?;
        }
        self.set_expected(&query.name, node_ids.len(), env)?;

        if node_ids.is_empty() {
            tracing::warn!("Query {} resolved to no targets", query.name);
        }

        Ok(Dispatched {
            query: self.get(&query.name, env)?,
            targets: node_ids,
        })
    }

    /// Pending queries for a node, plus the accelerate hint of its environment.
    pub fn node_queries(&self, node: &Node) -> FleetResult<PendingQueries> {
        let now = now_ms();
        let mut pending = PendingQueries::default();

        if let Some(rows) = self.assignments.get(&node.id) {
            for row in rows.iter().filter(|r| !r.executed()) {
                if let Some(q) = self.queries.get(&row.query_id) {
                    if q.active && !q.deleted && !q.expired && !q.is_expired_at(now) {
                        pending.queries.insert(q.name.clone(), q.query.clone());
                    }
                }
            }
        }

        let env = self.environments.get(node.environment_id)?;
        if env.accelerate {
            pending.accelerate = Some(self.settings.accelerated_seconds);
        }

        Ok(pending)
    }

    /// Marks a query completed; nodes stop receiving it.
    pub fn complete(&self, name: &str, env: EnvironmentId) -> FleetResult<()> {
        self.update(name, env, |q| {
            q.completed = true;
            q.active = false;
        })
    }

    /// Marks a query expired; nodes stop receiving it.
    pub fn expire(&self, name: &str, env: EnvironmentId) -> FleetResult<()> {
        self.update(name, env, |q| {
            q.expired = true;
            q.active = false;
        })
    }

    /// Puts a completed or expired query back in rotation.
    pub fn activate(&self, name: &str, env: EnvironmentId) -> FleetResult<()> {
        self.update(name, env, |q| {
            q.completed = false;
            q.expired = false;
            q.active = true;
        })
    }

    /// Soft delete: the header stays for listing under `deleted`.
    pub fn delete(&self, name: &str, env: EnvironmentId) -> FleetResult<()> {
        self.update(name, env, |q| {
            q.deleted = true;
            q.active = false;
        })
    }

    /// Runs the transition named by an admin action.
    pub fn apply(&self, action: QueryAction, name: &str, env: EnvironmentId) -> FleetResult<()> {
        match action {
            QueryAction::Complete => self.complete(name, env),
            QueryAction::Expire => self.expire(name, env),
            QueryAction::Activate => self.activate(name, env),
            QueryAction::Delete => self.delete(name, env),
        }?;
        tracing::info!("Query {} -> {:?}", name, action);
        Ok(())
    }

    /// Looks a query up by its name within the environment.
    pub fn get(&self, name: &str, env: EnvironmentId) -> FleetResult<DistributedQuery> {
        let id = self.id_of(name, env)?;
        self.queries
            .get(&id)
            .map(|q| q.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("query {}", name)))
    }

    /// Whether the name is taken in the environment, deleted queries included.
    pub fn exists(&self, name: &str, env: EnvironmentId) -> bool {
        self.names.contains_key(&(env, name.to_string()))
    }

    /// The filters the query was dispatched with.
    pub fn targets(&self, name: &str, env: EnvironmentId) -> FleetResult<Vec<QueryTarget>> {
        let id = self.id_of(name, env)?;
        Ok(self.targets.get(&id).map(|t| t.value().clone()).unwrap_or_default())
    }

    /// Queries of the environment matching `target`, newest first.
    pub fn list(&self, target: ListTarget, env: EnvironmentId) -> Vec<DistributedQuery> {
        let mut queries: Vec<DistributedQuery> = self
            .queries
            .iter()
            .filter(|q| q.environment_id == env && target.matches(q.value()))
            .map(|q| q.value().clone())
            .collect();
        queries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        queries
    }

    /// All assignments of a query, in node order.
    pub fn assignments(&self, name: &str, env: EnvironmentId) -> FleetResult<Vec<NodeQuery>> {
        let id = self.id_of(name, env)?;
        let mut rows: Vec<NodeQuery> = self
            .assignments
            .iter()
            .filter_map(|node_rows| node_rows.get(&id).map(|r| r.value().clone()))
            .collect();
        rows.sort_by_key(|r| r.node_id);
        Ok(rows)
    }

    /// Records a node's result for a query: status `0` is success, anything else an error.
    /// Counters move once per node; repeated writes only refresh the row.
    pub fn record_result(
        &self,
        name: &str,
        env: EnvironmentId,
        node_id: NodeId,
        status: i64,
    ) -> FleetResult<()> {
        let id = self.id_of(name, env)?;
        let new_status = if status == 0 {
            NodeQueryStatus::Completed
        } else {
            NodeQueryStatus::Error
        };

        let first_result = {
            let node_rows = self
                .assignments
                .get(&node_id)
                .ok_or_else(|| FleetError::NotFound(format!("assignment {} for node {}", name, node_id.0)))?;
            let mut row = node_rows
                .get_mut(&id)
                .ok_or_else(|| FleetError::NotFound(format!("assignment {} for node {}", name, node_id.0)))?;
            let first = !row.executed();
            row.status = new_status;
            row.updated_at = now_ms();
            first
        };

        if first_result {
            let mut query = self
                .queries
                .get_mut(&id)
                .ok_or_else(|| FleetError::NotFound(format!("query {}", name)))?;
            match new_status {
                NodeQueryStatus::Completed => query.executions += 1,
                _ => query.errors += 1,
            }
            query.updated_at = now_ms();
        }

        Ok(())
    }

    /// Completes the environment's active queries whose every expected node has reported.
    pub fn cleanup_completed(&self, env: EnvironmentId) -> Vec<String> {
        let mut done = Vec::new();
        for mut q in self.queries.iter_mut() {
            if q.environment_id == env && q.active && !q.completed && q.is_finished() {
                q.completed = true;
                q.active = false;
                q.updated_at = now_ms();
                done.push(q.name.clone());
            }
        }
        if !done.is_empty() {
            tracing::info!("Completed {} finished queries in environment {}", done.len(), env.0);
        }
        done
    }

    /// Expires the environment's active queries past their expiration timestamp.
    pub fn cleanup_expired(&self, env: EnvironmentId) -> Vec<String> {
        let now = now_ms();
        let mut expired = Vec::new();
        for mut q in self.queries.iter_mut() {
            if q.environment_id == env && q.active && !q.expired && q.is_expired_at(now) {
                q.expired = true;
                q.active = false;
                q.updated_at = now;
                expired.push(q.name.clone());
            }
        }
        if !expired.is_empty() {
            tracing::info!("Expired {} queries in environment {}", expired.len(), env.0);
        }
        expired
    }

    /// `SELECT` used to schedule a carve of `path`; a `%` switches to a glob match.
    pub fn carve_query(path: &str) -> String {
        let escaped = path.replace('\'', "''");
        if escaped.contains('%') {
            format!("SELECT * FROM carves WHERE carve=1 AND path LIKE '{}';", escaped)
        } else {
            format!("SELECT * FROM carves WHERE carve=1 AND path = '{}';", escaped)
        }
    }

    /// Stores a new saved query. Names are unique per creator.
    pub fn create_saved(&self, name: &str, query: &str, creator: &str) -> FleetResult<SavedQuery> {
        let (name, creator) = (name.trim(), creator.trim());
        if name.is_empty() || creator.is_empty() {
            return Err(FleetError::Malformed("saved query needs a name and a creator".to_string()));
        }
        if query.trim().is_empty() {
            return Err(FleetError::Malformed("query is empty".to_string()));
        }

        match self.saved.entry((creator.to_string(), name.to_string())) {
            Entry::Occupied(_) => Err(FleetError::Conflict(format!(
                "saved query {} of {} already exists",
                name, creator
            ))),
            Entry::Vacant(slot) => {
                let now = now_ms();
                let saved = SavedQuery {
                    name: name.to_string(),
                    creator: creator.to_string(),
                    query: query.to_string(),
                    created_at: now,
                    updated_at: now,
                };
                slot.insert(saved.clone());
                tracing::info!("Saved query {} for {}", name, creator);
                Ok(saved)
            }
        }
    }

    pub fn get_saved(&self, name: &str, creator: &str) -> FleetResult<SavedQuery> {
        self.saved
            .get(&saved_key(name, creator))
            .map(|s| s.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("saved query {} of {}", name, creator)))
    }

    /// Replaces the SQL of an existing saved query.
    pub fn update_saved(&self, name: &str, query: &str, creator: &str) -> FleetResult<SavedQuery> {
        if query.trim().is_empty() {
            return Err(FleetError::Malformed("query is empty".to_string()));
        }
        let mut saved = self
            .saved
            .get_mut(&saved_key(name, creator))
            .ok_or_else(|| FleetError::NotFound(format!("saved query {} of {}", name, creator)))?;
        saved.query = query.to_string();
        saved.updated_at = now_ms();
        let updated = saved.value().clone();
        Ok(updated)
    }

    pub fn delete_saved(&self, name: &str, creator: &str) -> FleetResult<()> {
        if self.saved.remove(&saved_key(name, creator)).is_none() {
            return Err(FleetError::NotFound(format!("saved query {} of {}", name, creator)));
        }
        tracing::info!("Deleted saved query {} of {}", name, creator);
        Ok(())
    }

    /// Saved queries of one creator, by name.
    pub fn saved_by_creator(&self, creator: &str) -> Vec<SavedQuery> {
        let creator = creator.trim();
        let mut saved: Vec<SavedQuery> = self
            .saved
            .iter()
            .filter(|s| s.creator == creator)
            .map(|s| s.value().clone())
            .collect();
        saved.sort_by(|a, b| a.name.cmp(&b.name));
        saved
    }

    fn id_of(&self, name: &str, env: EnvironmentId) -> FleetResult<QueryId> {
        self.names
            .get(&(env, name.to_string()))
            .map(|id| *id)
            .ok_or_else(|| FleetError::NotFound(format!("query {}", name)))
    }

    fn update<F>(&self, name: &str, env: EnvironmentId, mutate: F) -> FleetResult<()>
    where
        F: FnOnce(&mut DistributedQuery),
    {
        let id = self.id_of(name, env)?;
        let mut query = self
            .queries
            .get_mut(&id)
            .ok_or_else(|| FleetError::NotFound(format!("query {}", name)))?;
        mutate(query.value_mut());
        query.updated_at = now_ms();
        Ok(())
    }
}

fn saved_key(name: &str, creator: &str) -> (String, String) {
    (creator.trim().to_string(), name.trim().to_string())
}

fn generate_name(query_type: QueryType) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    match query_type {
        QueryType::Standard => format!("query_{}", suffix),
        QueryType::Carve => format!("carve_{}", suffix),
    }
}
