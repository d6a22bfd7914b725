//! AWS implementations of the provider seams
//!
//! - [`StsRoleExchange`]: STS `AssumeRole` with `ExternalId`; the returned
//!   temporary credentials are injected into a copy of the base `SdkConfig`.
//! - [`RdsInstanceLister`]: RDS `DescribeDBInstances` pages, and EC2
//!   `DescribeRegions` for the regions enabled in an account.
//!
//! The base configuration has the SDK retry layer disabled and explicit
//! connect/read timeouts; every call is additionally bounded by
//! `tokio::time::timeout`. Retries happen in [`crate::retry::RetryPolicy`].

use crate::config::{AccountTarget, TimeoutConfig};
use crate::provider::{AccessContext, InstanceLister, ProviderFault, RawInstance, RawPage, RawTag, RoleExchange};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_rds::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Region used for account-level calls when the environment names none
pub const FALLBACK_REGION: &str = "us-east-1";

/// Maximum page size accepted by `DescribeDBInstances`
pub const RDS_PAGE_SIZE: i32 = 100;

/// Role session lifetime requested from STS (the minimum)
pub const SESSION_DURATION_SECS: i32 = 900;

/// Load the ambient SDK configuration with engine timeouts and no SDK retries
pub async fn load_sdk_config(timeouts: &TimeoutConfig, region: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .timeout_config(
            aws_config::timeout::TimeoutConfig::builder()
                .connect_timeout(timeouts.connect())
                .read_timeout(timeouts.read())
                .build(),
        )
        .retry_config(aws_config::retry::RetryConfig::disabled());
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    loader.load().await
}

/// Convert an SDK error into a provider fault
pub fn fault_from_sdk<E, R>(err: SdkError<E, R>) -> ProviderFault
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug + 'static,
{
    let detail = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) => ProviderFault::timeout(detail),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => ProviderFault::timeout(detail),
        SdkError::ServiceError(_) => ProviderFault::service(
            err.code().unwrap_or("Unknown"),
            err.message().unwrap_or(detail.as_str()),
        ),
        _ if is_credential_failure(&detail) => ProviderFault::credentials(detail),
        _ => ProviderFault::transport(detail),
    }
}

fn is_credential_failure(detail: &str) -> bool {
    let lower = detail.to_ascii_lowercase();
    lower.contains("no credentials")
        || lower.contains("failed to load credentials")
        || lower.contains("credentials provider")
        || lower.contains("credentialsnotloaded")
}

/// Bound a provider call by `limit`
pub async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T, ProviderFault>
where
    F: Future<Output = Result<T, ProviderFault>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderFault::timeout(format!(
            "{} did not complete within {}s",
            operation,
            limit.as_secs()
        ))),
    }
}

fn to_chrono(dt: &aws_sdk_sts::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

/// STS-backed role exchange
pub struct StsRoleExchange {
    base: SdkConfig,
    client: aws_sdk_sts::Client,
    call_timeout: Duration,
}

impl StsRoleExchange {
    /// Create from the ambient configuration
    pub fn new(base: &SdkConfig, call_timeout: Duration) -> Self {
        Self {
            base: base.clone(),
            client: aws_sdk_sts::Client::new(base),
            call_timeout,
        }
    }
}

#[async_trait]
impl RoleExchange for StsRoleExchange {
    fn ambient(&self, account: &AccountTarget) -> AccessContext {
        AccessContext::ambient(&account.account_id).with_sdk_config(self.base.clone())
    }

    async fn assume(
        &self,
        account: &AccountTarget,
        role_arn: &str,
        session_name: &str,
    ) -> Result<AccessContext, ProviderFault> {
        let request = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .set_external_id(account.external_id.clone())
            .duration_seconds(SESSION_DURATION_SECS);

        let output = bounded(self.call_timeout, "sts:AssumeRole", async {
            request.send().await.map_err(fault_from_sdk)
        })
        .await?;

        let issued = output.credentials().ok_or_else(|| {
            ProviderFault::service("MissingCredentials", "AssumeRole returned no credentials")
        })?;

        let expires_at = to_chrono(issued.expiration());
        let credentials = Credentials::new(
            issued.access_key_id(),
            issued.secret_access_key(),
            Some(issued.session_token().to_string()),
            SystemTime::try_from(*issued.expiration()).ok(),
            "rds-discovery-assume-role",
        );

        let config = self
            .base
            .to_builder()
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .build();

        debug!(
            account_id = %account.account_id,
            role_arn = %role_arn,
            expires_at = ?expires_at,
            "Role assumed"
        );

        Ok(AccessContext::assumed(&account.account_id, role_arn, expires_at).with_sdk_config(config))
    }
}

/// RDS/EC2-backed instance lister
pub struct RdsInstanceLister {
    call_timeout: Duration,
    page_size: i32,
}

impl RdsInstanceLister {
    /// Create a lister with the per-call bound
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            call_timeout,
            page_size: RDS_PAGE_SIZE,
        }
    }

    fn sdk_config(ctx: &AccessContext) -> Result<&SdkConfig, ProviderFault> {
        ctx.sdk_config().ok_or_else(|| {
            ProviderFault::credentials(format!(
                "access context for account {} carries no AWS configuration",
                ctx.account_id
            ))
        })
    }
}

fn raw_instance(db: &aws_sdk_rds::types::DbInstance) -> RawInstance {
    RawInstance {
        identifier: db.db_instance_identifier().map(str::to_string),
        engine: db.engine().map(str::to_string),
        engine_version: db.engine_version().map(str::to_string),
        instance_class: db.db_instance_class().map(str::to_string),
        status: db.db_instance_status().map(str::to_string),
        multi_az: db.multi_az(),
        storage_encrypted: db.storage_encrypted(),
        deletion_protection: db.deletion_protection(),
        backup_retention_period: db.backup_retention_period(),
        tags: db
            .tag_list()
            .iter()
            .map(|t| RawTag {
                key: t.key().map(str::to_string),
                value: t.value().map(str::to_string),
            })
            .collect(),
    }
}

#[async_trait]
impl InstanceLister for RdsInstanceLister {
    async fn list_page(
        &self,
        ctx: &AccessContext,
        region: &str,
        marker: Option<String>,
    ) -> Result<RawPage, ProviderFault> {
        let config = aws_sdk_rds::config::Builder::from(Self::sdk_config(ctx)?)
            .region(Region::new(region.to_string()))
            .build();
        let client = aws_sdk_rds::Client::from_conf(config);

        let request = client
            .describe_db_instances()
            .set_marker(marker)
            .max_records(self.page_size);

        let output = bounded(self.call_timeout, "rds:DescribeDBInstances", async {
            request.send().await.map_err(fault_from_sdk)
        })
        .await?;

        Ok(RawPage {
            instances: output.db_instances().iter().map(raw_instance).collect(),
            next_marker: output.marker().map(str::to_string),
        })
    }

    async fn enabled_regions(&self, ctx: &AccessContext) -> Result<Vec<String>, ProviderFault> {
        let sdk_config = Self::sdk_config(ctx)?;
        let mut builder = aws_sdk_ec2::config::Builder::from(sdk_config);
        if sdk_config.region().is_none() {
            builder = builder.region(Region::new(FALLBACK_REGION));
        }
        let client = aws_sdk_ec2::Client::from_conf(builder.build());

        let request = client.describe_regions().all_regions(false);
        let output = bounded(self.call_timeout, "ec2:DescribeRegions", async {
            request.send().await.map_err(fault_from_sdk)
        })
        .await?;

        let mut regions: Vec<String> = output
            .regions()
            .iter()
            .filter_map(|r| r.region_name().map(str::to_string))
            .collect();
        regions.sort();
        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<(), ProviderFault> = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let fault = result.unwrap_err();
        assert_eq!(fault.kind, crate::provider::FaultKind::Timeout);
        assert!(fault.message.contains("slow"));
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), "fast", async { Ok::<_, ProviderFault>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn test_raw_instance_mapping() {
        let db = aws_sdk_rds::types::DbInstance::builder()
            .db_instance_identifier("orders-db")
            .engine("aurora-postgresql")
            .multi_az(true)
            .backup_retention_period(14)
            .tag_list(
                aws_sdk_rds::types::Tag::builder()
                    .key("Environment")
                    .value("prod")
                    .build(),
            )
            .build();

        let raw = raw_instance(&db);
        assert_eq!(raw.identifier.as_deref(), Some("orders-db"));
        assert_eq!(raw.engine.as_deref(), Some("aurora-postgresql"));
        assert_eq!(raw.multi_az, Some(true));
        assert_eq!(raw.backup_retention_period, Some(14));
        assert_eq!(raw.storage_encrypted, None);
        assert_eq!(raw.tags.len(), 1);
    }

    #[test]
    fn test_credential_failure_detection() {
        assert!(is_credential_failure("dispatch failure: no credentials in the property bag"));
        assert!(!is_credential_failure("dns error: failed to lookup address"));
    }

    #[test]
    fn test_lister_requires_sdk_config() {
        let ctx = AccessContext::ambient("111111111111");
        let err = RdsInstanceLister::sdk_config(&ctx).unwrap_err();
        assert_eq!(err.kind, crate::provider::FaultKind::Credentials);
    }
}
