//! Instance normalization
//!
//! Pure mapping from a validated listing record to the canonical
//! [`InstanceRecord`]. Optional provider fields get explicit defaults here
//! so nothing downstream has to deal with missing values.
//!
//! ## Environment classification
//!
//! Only the `Environment` tag is consulted, then `Env` if `Environment` is
//! absent (keys matched case-insensitively). Other tags that hint at an
//! environment (`Tier`, `Stage`, ...) are ignored. The value maps as:
//!
//! - `production` | `prod` -> Production
//! - `development` | `dev` | `test` | `staging` -> Development
//! - `poc` | `sandbox` -> Poc
//! - anything else, or no tag -> Unknown

use crate::provider::ListedInstance;
use crate::types::{Environment, InstanceRecord};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Tag keys consulted for the environment, in precedence order
pub const ENVIRONMENT_TAG_KEYS: &[&str] = &["Environment", "Env"];

/// Map a tag value to an environment
pub fn environment_from_value(value: &str) -> Environment {
    match value.trim().to_ascii_lowercase().as_str() {
        "production" | "prod" => Environment::Production,
        "development" | "dev" | "test" | "staging" => Environment::Development,
        "poc" | "sandbox" => Environment::Poc,
        _ => Environment::Unknown,
    }
}

/// Classify an instance by its tags
pub fn classify_environment(tags: &BTreeMap<String, String>) -> Environment {
    ENVIRONMENT_TAG_KEYS
        .iter()
        .find_map(|wanted| {
            tags.iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
                .map(|(_, value)| environment_from_value(value))
        })
        .unwrap_or(Environment::Unknown)
}

/// Build the canonical record for one listed instance
pub fn normalize(
    listed: ListedInstance,
    account_id: &str,
    region: &str,
    observed_at: DateTime<Utc>,
) -> InstanceRecord {
    let tags: BTreeMap<String, String> = listed.tags.into_iter().collect();
    let environment = classify_environment(&tags);

    InstanceRecord {
        account_id: account_id.to_string(),
        region: region.to_string(),
        instance_id: listed.instance_id,
        engine: listed.engine,
        engine_version: listed.engine_version.unwrap_or_default(),
        instance_class: listed.instance_class.unwrap_or_default(),
        status: listed.status.unwrap_or_else(|| "unknown".to_string()),
        multi_az: listed.multi_az.unwrap_or(false),
        storage_encrypted: listed.storage_encrypted.unwrap_or(false),
        deletion_protection: listed.deletion_protection.unwrap_or(false),
        backup_retention_days: listed.backup_retention_period.unwrap_or(0),
        tags,
        environment,
        last_seen: observed_at,
        removed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listed(tags: &[(&str, &str)]) -> ListedInstance {
        ListedInstance {
            instance_id: "orders-db".to_string(),
            engine: "postgres".to_string(),
            engine_version: Some("15.4".to_string()),
            instance_class: None,
            status: None,
            multi_az: Some(true),
            storage_encrypted: None,
            deletion_protection: None,
            backup_retention_period: None,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_environment_values() {
        for value in ["production", "PROD", " Prod "] {
            assert_eq!(environment_from_value(value), Environment::Production);
        }
        for value in ["development", "dev", "Test", "STAGING"] {
            assert_eq!(environment_from_value(value), Environment::Development);
        }
        for value in ["poc", "Sandbox"] {
            assert_eq!(environment_from_value(value), Environment::Poc);
        }
        assert_eq!(environment_from_value("qa"), Environment::Unknown);
        assert_eq!(environment_from_value(""), Environment::Unknown);
    }

    #[test]
    fn test_environment_key_precedence() {
        let record = normalize(
            listed(&[("env", "dev"), ("ENVIRONMENT", "prod"), ("Tier", "poc")]),
            "111111111111",
            "us-east-1",
            Utc::now(),
        );
        assert_eq!(record.environment, Environment::Production);

        let record = normalize(
            listed(&[("Env", "sandbox")]),
            "111111111111",
            "us-east-1",
            Utc::now(),
        );
        assert_eq!(record.environment, Environment::Poc);
    }

    #[test]
    fn test_unrelated_tags_are_ignored() {
        let record = normalize(
            listed(&[("Tier", "production"), ("Owner", "team-a")]),
            "111111111111",
            "us-east-1",
            Utc::now(),
        );
        assert_eq!(record.environment, Environment::Unknown);
        assert_eq!(record.tags.len(), 2);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let now = Utc::now();
        let record = normalize(listed(&[]), "111111111111", "eu-west-1", now);
        assert_eq!(record.account_id, "111111111111");
        assert_eq!(record.region, "eu-west-1");
        assert_eq!(record.engine_version, "15.4");
        assert_eq!(record.instance_class, "");
        assert_eq!(record.status, "unknown");
        assert!(record.multi_az);
        assert!(!record.storage_encrypted);
        assert_eq!(record.backup_retention_days, 0);
        assert_eq!(record.last_seen, now);
        assert!(!record.removed);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let now = Utc::now();
        let a = normalize(listed(&[("Environment", "dev")]), "1", "r", now);
        let b = normalize(listed(&[("Environment", "dev")]), "1", "r", now);
        assert_eq!(a, b);
    }
}
