//! Environment store tests: creation, uniqueness and lookups.

#[cfg(test)]
mod tests {
    use crate::environments::store::EnvironmentStore;
    use crate::environments::types::NewEnvironment;
    use crate::error::FleetError;

    fn new_env(name: &str) -> NewEnvironment {
        NewEnvironment {
            uuid: None,
            name: name.to_string(),
            enroll_secret: "secret".to_string(),
            configuration: Some(serde_json::json!({"options": {"host_identifier": "uuid"}})),
            flags: "--verbose".to_string(),
            accelerate: false,
        }
    }

    #[test]
    fn test_create_and_lookup_by_uuid_and_name() {
        let store = EnvironmentStore::new();

        let env = store.create(new_env("prod")).unwrap();

        assert_eq!(store.get_by_uuid(&env.uuid).unwrap().name, "prod");
        assert_eq!(store.get_by_name("prod").unwrap().uuid, env.uuid);
        assert_eq!(store.get(env.id).unwrap().name, "prod");
        assert_eq!(store.resolve("prod").unwrap().id, env.id);
        assert_eq!(store.resolve(&env.uuid).unwrap().id, env.id);
    }

    #[test]
    fn test_duplicate_name_is_conflict() {
        let store = EnvironmentStore::new();
        store.create(new_env("prod")).unwrap();

        let result = store.create(new_env("prod"));

        assert!(matches!(result, Err(FleetError::Conflict(_))));
    }

    #[test]
    fn test_configuration_and_flags_are_served_verbatim() {
        let store = EnvironmentStore::new();
        let env = store.create(new_env("dev")).unwrap();

        let config: serde_json::Value =
            serde_json::from_str(&store.configuration(&env.uuid).unwrap()).unwrap();

        assert_eq!(config["options"]["host_identifier"], "uuid");
        assert_eq!(store.flags(&env.uuid).unwrap(), "--verbose");
    }

    #[test]
    fn test_unknown_environment_is_not_found() {
        let store = EnvironmentStore::new();

        assert!(store.get_by_uuid("nope").unwrap_err().is_not_found());
        assert!(store.resolve("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_invalid_uuid_is_malformed() {
        let store = EnvironmentStore::new();
        let mut env = new_env("bad");
        env.uuid = Some("not-a-uuid".to_string());

        assert!(matches!(store.create(env), Err(FleetError::Malformed(_))));
    }

    #[test]
    fn test_set_accelerate_toggles_flag() {
        let store = EnvironmentStore::new();
        let env = store.create(new_env("fast")).unwrap();

        store.set_accelerate(&env.uuid, true).unwrap();

        assert!(store.get_by_uuid(&env.uuid).unwrap().accelerate);
    }
}
