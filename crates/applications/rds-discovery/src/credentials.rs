//! Credential broker
//!
//! Turns an [`AccountTarget`] into an [`AccessContext`]. The home account
//! uses ambient credentials with no network round trip. Remote accounts go
//! through a role exchange carrying the account's external id, retried
//! with the shared [`RetryPolicy`] on transient faults.
//!
//! A failure isolates only that account: it comes back as a
//! `cross_account_access` entry, and the caller moves on.

use crate::classify::{ErrorClassifier, ErrorEntry};
use crate::config::{AccountTarget, DiscoveryConfig};
use crate::provider::{AccessContext, ProviderFault, RoleExchange};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{info, warn};

/// STS limit on role session names
const MAX_SESSION_NAME_LEN: usize = 64;

/// Obtains scoped access contexts for accounts
pub struct CredentialBroker {
    exchange: Arc<dyn RoleExchange>,
    classifier: Arc<ErrorClassifier>,
    retry: RetryPolicy,
    partition: String,
    session_name: String,
}

impl CredentialBroker {
    /// Create a broker for one run
    pub fn new(
        exchange: Arc<dyn RoleExchange>,
        classifier: Arc<ErrorClassifier>,
        config: &DiscoveryConfig,
        run_id: &str,
    ) -> Self {
        Self {
            exchange,
            classifier,
            retry: config.retry_policy(),
            partition: config.partition.clone(),
            session_name: session_name(&config.session_name_prefix, run_id),
        }
    }

    /// Session name used for every role exchange in this run
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Acquire an access context, or a classified `cross_account_access` entry
    pub async fn acquire(&self, account: &AccountTarget) -> Result<AccessContext, ErrorEntry> {
        if account.is_home {
            return Ok(self.exchange.ambient(account));
        }

        let Some(role_arn) = account.role_arn(&self.partition) else {
            let fault = ProviderFault::service("MissingRoleName", "no role_name configured");
            return Err(self.classifier.cross_account(account, &fault));
        };

        let result = self
            .retry
            .run(
                "sts:AssumeRole",
                |fault: &ProviderFault| fault.is_transient(),
                || self.exchange.assume(account, &role_arn, &self.session_name),
            )
            .await;

        match result {
            Ok(ctx) => {
                info!(
                    account_id = %account.account_id,
                    account = %account.label(),
                    role_arn = %role_arn,
                    "🔑 Role assumed"
                );
                Ok(ctx)
            }
            Err(fault) => {
                warn!(
                    account_id = %account.account_id,
                    account = %account.label(),
                    role_arn = %role_arn,
                    error = %fault,
                    "Role exchange failed"
                );
                Err(self.classifier.cross_account(account, &fault))
            }
        }
    }
}

/// `<prefix>-<run id>`, restricted to the STS character set and length
fn session_name(prefix: &str, run_id: &str) -> String {
    let raw = format!("{}-{}", prefix, run_id);
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "+=,.@-_".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(MAX_SESSION_NAME_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ErrorType, Severity};
    use crate::config::{RegionTarget, RetrySettings};
    use crate::fixtures::FixtureProvider;
    use crate::provider::AccessSource;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::new(
            vec![
                AccountTarget::home("111111111111", "home"),
                AccountTarget::remote("222222222222", "analytics", "Reader", "tok-9"),
            ],
            vec![RegionTarget::new("us-east-1")],
        )
        .with_retry(RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        })
    }

    fn broker(provider: Arc<FixtureProvider>) -> CredentialBroker {
        let config = config();
        CredentialBroker::new(
            provider,
            Arc::new(ErrorClassifier::from_config(&config)),
            &config,
            "3f0c7a52-9a61-4f0e-8d0e-6c1c1b2f7d11",
        )
    }

    #[tokio::test]
    async fn test_home_account_uses_ambient_without_exchange() {
        let provider = Arc::new(FixtureProvider::new());
        let ctx = broker(provider.clone())
            .acquire(&config().accounts[0])
            .await
            .unwrap();
        assert!(ctx.is_ambient());
        assert_eq!(provider.assume_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_account_assumes_role() {
        let provider = Arc::new(FixtureProvider::new());
        let ctx = broker(provider.clone())
            .acquire(&config().accounts[1])
            .await
            .unwrap();
        assert_eq!(
            ctx.source,
            AccessSource::AssumedRole {
                role_arn: "arn:aws:iam::222222222222:role/Reader".to_string()
            }
        );
        assert!(ctx.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_throttled_exchange_is_retried() {
        let provider = Arc::new(FixtureProvider::new().with_assume_throttle("222222222222", 2));
        let result = broker(provider.clone()).acquire(&config().accounts[1]).await;
        tokio_test::assert_ok!(result);
        assert_eq!(provider.assume_calls(), 3);
    }

    #[tokio::test]
    async fn test_denied_exchange_is_not_retried() {
        let provider = Arc::new(FixtureProvider::new().with_assume_fault(
            "222222222222",
            ProviderFault::service("AccessDenied", "not authorized to perform sts:AssumeRole"),
        ));
        let entry = broker(provider.clone())
            .acquire(&config().accounts[1])
            .await
            .unwrap_err();

        assert_eq!(provider.assume_calls(), 1);
        assert_eq!(entry.error_type, ErrorType::CrossAccountAccess);
        assert_eq!(entry.severity, Severity::High);
        assert!(entry.remediation.contains("tok-9"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_classified_cross_account() {
        let provider = Arc::new(FixtureProvider::new().with_assume_throttle("222222222222", 10));
        let entry = broker(provider.clone())
            .acquire(&config().accounts[1])
            .await
            .unwrap_err();
        assert_eq!(provider.assume_calls(), 3);
        assert_eq!(entry.error_type, ErrorType::CrossAccountAccess);
    }

    #[test]
    fn test_session_name_is_sanitized_and_bounded() {
        let name = session_name("rds discovery/prod", &"x".repeat(80));
        assert!(name.starts_with("rds-discovery-prod-"));
        assert_eq!(name.len(), MAX_SESSION_NAME_LEN);
    }
}
