//! Node Directory Tests
//!
//! ## Test Scopes
//! - **Enrollment**: key minting, re-enrollment and uuid normalisation.
//! - **Activity**: the inactive-hours window used by target resolution.
//! - **Liveness writes**: single and bulk last-seen refresh.

#[cfg(test)]
mod tests {
    use crate::batch::types::WriteEvent;
    use crate::environments::store::EnvironmentStore;
    use crate::environments::types::NewEnvironment;
    use crate::nodes::directory::{InMemoryNodeDirectory, NodeDirectory};
    use crate::nodes::types::{now_ms, NewNode, NodeId};
    use std::sync::Arc;

    fn directory() -> InMemoryNodeDirectory {
        let envs = Arc::new(EnvironmentStore::new());
        for name in ["prod", "dev"] {
            envs.create(NewEnvironment {
                uuid: None,
                name: name.to_string(),
                enroll_secret: String::new(),
                configuration: None,
                flags: String::new(),
                accelerate: false,
            })
            .unwrap();
        }
        InMemoryNodeDirectory::new(envs)
    }

    fn node(uuid: &str, host: &str, platform: &str, env: &str, hours_ago: u64) -> NewNode {
        NewNode {
            uuid: uuid.to_string(),
            hostname: host.to_string(),
            platform: platform.to_string(),
            environment: env.to_string(),
            last_seen_hours_ago: hours_ago,
            ..Default::default()
        }
    }

    // ============================================================
    // TEST 1: Enrollment
    // ============================================================

    #[test]
    fn test_enroll_mints_key_and_indexes_node() {
        // ARRANGE
        let dir = directory();

        // ACT
        let enrolled = dir.enroll(node("abc-1", "web1", "darwin", "prod", 0)).unwrap();

        // ASSERT
        assert!(!enrolled.node_key.is_empty());
        assert_eq!(enrolled.uuid, "ABC-1");
        assert_eq!(dir.get_by_key(&enrolled.node_key).unwrap().id, enrolled.id);
        assert_eq!(dir.get_by_uuid("abc-1").unwrap().id, enrolled.id);
        assert_eq!(dir.get_by_hostname("WEB1").len(), 1);
    }

    #[test]
    fn test_reenroll_replaces_key_and_keeps_id() {
        let dir = directory();
        let first = dir.enroll(node("abc-1", "web1", "darwin", "prod", 0)).unwrap();

        let second = dir.enroll(node("ABC-1", "web1-renamed", "darwin", "dev", 0)).unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.node_key, second.node_key);
        assert!(dir.get_by_key(&first.node_key).unwrap_err().is_not_found());
        assert_eq!(second.environment, "dev");
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_enroll_unknown_environment_fails() {
        let dir = directory();

        let result = dir.enroll(node("abc-1", "web1", "darwin", "staging", 0));

        assert!(result.unwrap_err().is_not_found());
        assert!(dir.is_empty());
    }

    // ============================================================
    // TEST 2: Activity filtering
    // ============================================================

    #[test]
    fn test_active_filters_respect_inactive_hours() {
        // ARRANGE
        let dir = directory();
        dir.enroll(node("n1", "h1", "darwin", "prod", 0)).unwrap();
        dir.enroll(node("n2", "h2", "darwin", "prod", 100)).unwrap();
        dir.enroll(node("n3", "h3", "ubuntu", "dev", 1)).unwrap();

        // ACT
        let darwin = dir.active_by_platform("darwin", 72);
        let prod = dir.active_in_environment("prod", 72);
        let all_prod = dir.active_in_environment("prod", 0);

        // ASSERT
        assert_eq!(darwin.len(), 1);
        assert_eq!(darwin[0].uuid, "N1");
        assert_eq!(prod.len(), 1);
        assert_eq!(all_prod.len(), 2);
    }

    // ============================================================
    // TEST 3: Liveness writes
    // ============================================================

    #[test]
    fn test_bulk_refresh_updates_known_nodes_only() {
        // ARRANGE
        let dir = directory();
        let stale = dir.enroll(node("n1", "h1", "darwin", "prod", 200)).unwrap();
        let before = now_ms();

        // ACT
        let touched = dir
            .refresh_last_seen_batch(&[
                WriteEvent::new(stale.id, "192.168.1.10"),
                WriteEvent::new(NodeId(999), "10.0.0.1"),
            ])
            .unwrap();

        // ASSERT
        assert_eq!(touched, 1);
        let refreshed = dir.get(stale.id).unwrap();
        assert!(refreshed.last_seen >= before);
        assert_eq!(refreshed.ip_address, "192.168.1.10");
        assert_eq!(dir.active_by_platform("darwin", 72).len(), 1);
    }

    #[test]
    fn test_refresh_metadata_keeps_ip_when_empty() {
        let dir = directory();
        let mut new = node("n1", "h1", "darwin", "prod", 0);
        new.ip_address = "10.1.1.1".to_string();
        let enrolled = dir.enroll(new).unwrap();

        dir.refresh_metadata(enrolled.id, "").unwrap();

        assert_eq!(dir.get(enrolled.id).unwrap().ip_address, "10.1.1.1");
        assert!(dir.refresh_metadata(NodeId(42), "1.1.1.1").is_err());
    }
}
