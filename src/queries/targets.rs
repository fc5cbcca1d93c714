//! Target resolution.
//!
//! Each supplied dimension resolves to the set of active nodes matching any of
//! its values. The first supplied dimension seeds the result and every later
//! one narrows it, including dimensions that resolved to nothing.

use super::types::TargetFilters;
use crate::nodes::directory::NodeDirectory;
use crate::nodes::types::{now_ms, Node, NodeId};

use std::collections::BTreeSet;

pub fn resolve(nodes: &dyn NodeDirectory, filters: &TargetFilters, inactive_hours: u64) -> Vec<NodeId> {
    let now = now_ms();
    let mut result: Option<BTreeSet<NodeId>> = None;

    if let Some(values) = supplied(&filters.environments) {
        let set = values
            .iter()
            .flat_map(|env| nodes.active_in_environment(env, inactive_hours))
            .map(|n| n.id)
            .collect();
        result = narrow(result, set);
    }

    if let Some(values) = supplied(&filters.platforms) {
        let set = values
            .iter()
            .flat_map(|platform| nodes.active_by_platform(platform, inactive_hours))
            .map(|n| n.id)
            .collect();
        result = narrow(result, set);
    }

    if let Some(values) = supplied(&filters.uuids) {
        let set = values
            .iter()
            .filter_map(|uuid| nodes.get_by_uuid(uuid).ok())
            .filter(|n| n.is_active(inactive_hours, now))
            .map(|n| n.id)
            .collect();
        result = narrow(result, set);
    }

    if let Some(values) = supplied(&filters.hosts) {
        let set = values
            .iter()
            .flat_map(|host| nodes.get_by_hostname(host))
            .filter(|n: &Node| n.is_active(inactive_hours, now))
            .map(|n| n.id)
            .collect();
        result = narrow(result, set);
    }

    result.map(|set| set.into_iter().collect()).unwrap_or_default()
}

fn supplied(values: &[String]) -> Option<Vec<&str>> {
    let values: Vec<&str> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn narrow(acc: Option<BTreeSet<NodeId>>, dimension: BTreeSet<NodeId>) -> Option<BTreeSet<NodeId>> {
    match acc {
        None => Some(dimension),
        Some(acc) => Some(acc.intersection(&dimension).copied().collect()),
    }
}
