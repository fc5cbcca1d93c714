use super::types::*;
use crate::error::{FleetError, FleetResult};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory environment table keyed by UUID.
pub struct EnvironmentStore {
    environments: DashMap<String, Environment>,
    next_id: AtomicU64,
}

impl EnvironmentStore {
    pub fn new() -> Self {
        Self {
            environments: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new environment. Names and UUIDs are unique.
    pub fn create(&self, new: NewEnvironment) -> FleetResult<Environment> {
        if self.get_by_name(&new.name).is_ok() {
            return Err(FleetError::Conflict(format!(
                "environment {} already exists",
                new.name
            )));
        }

        let uuid = match new.uuid {
            Some(uuid) => uuid::Uuid::parse_str(&uuid)
                .map_err(|e| FleetError::Malformed(format!("environment uuid {}: {}", uuid, e)))?
                .to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let configuration = match new.configuration {
            Some(value) => serde_json::to_string(&value)?,
            None => "{}".to_string(),
        };

        let env = Environment {
            id: EnvironmentId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            uuid: uuid.clone(),
            name: new.name,
            enroll_secret: new.enroll_secret,
            configuration,
            flags: new.flags,
            accelerate: new.accelerate,
        };

        match self.environments.entry(uuid) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(FleetError::Conflict(format!(
                "environment uuid {} already exists",
                e.key()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!("Created environment {} ({})", env.name, env.uuid);
                slot.insert(env.clone());
                Ok(env)
            }
        }
    }

    pub fn get_by_uuid(&self, uuid: &str) -> FleetResult<Environment> {
        self.environments
            .get(uuid)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("environment {}", uuid)))
    }

    pub fn get_by_name(&self, name: &str) -> FleetResult<Environment> {
        self.environments
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("environment {}", name)))
    }

    pub fn get(&self, id: EnvironmentId) -> FleetResult<Environment> {
        self.environments
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FleetError::NotFound(format!("environment id {}", id.0)))
    }

    /// Accepts either a UUID or a name, as admin routes do.
    pub fn resolve(&self, identifier: &str) -> FleetResult<Environment> {
        self.get_by_uuid(identifier)
            .or_else(|_| self.get_by_name(identifier))
    }

    pub fn configuration(&self, uuid: &str) -> FleetResult<String> {
        self.get_by_uuid(uuid).map(|e| e.configuration)
    }

    pub fn flags(&self, uuid: &str) -> FleetResult<String> {
        self.get_by_uuid(uuid).map(|e| e.flags)
    }

    pub fn set_accelerate(&self, uuid: &str, accelerate: bool) -> FleetResult<()> {
        let mut env = self
            .environments
            .get_mut(uuid)
            .ok_or_else(|| FleetError::NotFound(format!("environment {}", uuid)))?;
        env.accelerate = accelerate;
        Ok(())
    }

    pub fn list(&self) -> Vec<Environment> {
        let mut envs: Vec<Environment> = self.environments.iter().map(|e| e.value().clone()).collect();
        envs.sort_by_key(|e| e.id);
        envs
    }
}

impl Default for EnvironmentStore {
    fn default() -> Self {
        Self::new()
    }
}
