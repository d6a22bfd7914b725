//! Provider seams
//!
//! The engine talks to a cloud provider through two traits only:
//! [`RoleExchange`] (credentials per account) and [`InstanceLister`]
//! (paginated listing per region). The AWS implementations live in
//! [`crate::aws`]; [`crate::fixtures`] drives the engine offline.
//!
//! Raw listing data is loose ([`RawInstance`] is all
//! `Option`s, named like the RDS API). It is validated in the scanner
//! and never crosses into the reconciler.

use crate::config::AccountTarget;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes providers use for throttling
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "SlowDown",
    "PriorRequestNotComplete",
];

/// Error codes for provider-side transient failures
pub const TRANSIENT_CODES: &[&str] = &[
    "InternalFailure",
    "InternalError",
    "InternalServerError",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "RequestTimeout",
    "RequestTimeoutException",
];

/// Broad shape of a provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The service answered with an error code
    Service,
    /// The call exceeded its time bound
    Timeout,
    /// Connection, DNS or TLS failure
    Transport,
    /// No usable credentials could be resolved locally
    Credentials,
}

/// A failure reported by a provider call, before classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFault {
    /// Broad shape
    pub kind: FaultKind,
    /// Provider error code, when the service sent one
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable detail
    pub message: String,
}

impl ProviderFault {
    /// Service error with a provider code
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Service,
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Call exceeded its bound
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Timeout,
            code: None,
            message: message.into(),
        }
    }

    /// Network-level failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Transport,
            code: None,
            message: message.into(),
        }
    }

    /// Local credential resolution failure
    pub fn credentials(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Credentials,
            code: None,
            message: message.into(),
        }
    }

    /// Provider code, or empty
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or("")
    }

    /// Throttling response
    pub fn is_throttling(&self) -> bool {
        THROTTLING_CODES.contains(&self.code())
    }

    /// Worth retrying within the same run
    pub fn is_transient(&self) -> bool {
        match self.kind {
            FaultKind::Timeout | FaultKind::Transport => true,
            FaultKind::Credentials => false,
            FaultKind::Service => self.is_throttling() || TRANSIENT_CODES.contains(&self.code()),
        }
    }
}

impl fmt::Display for ProviderFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => match self.kind {
                FaultKind::Timeout => write!(f, "timeout: {}", self.message),
                FaultKind::Transport => write!(f, "transport: {}", self.message),
                FaultKind::Credentials => write!(f, "credentials: {}", self.message),
                FaultKind::Service => f.write_str(&self.message),
            },
        }
    }
}

impl std::error::Error for ProviderFault {}

/// How an access context was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessSource {
    /// Process credentials, no exchange
    Ambient,
    /// Temporary credentials from a role exchange
    AssumedRole {
        /// Role that was assumed
        role_arn: String,
    },
}

/// Scoped credentials for one account
#[derive(Clone)]
pub struct AccessContext {
    /// Account the credentials act in
    pub account_id: String,
    /// How they were obtained
    pub source: AccessSource,
    /// Expiry of temporary credentials
    pub expires_at: Option<DateTime<Utc>>,
    sdk_config: Option<aws_config::SdkConfig>,
}

impl fmt::Debug for AccessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessContext")
            .field("account_id", &self.account_id)
            .field("source", &self.source)
            .field("expires_at", &self.expires_at)
            .field("sdk_config", &self.sdk_config.as_ref().map(|_| "<configured>"))
            .finish()
    }
}

impl AccessContext {
    /// Ambient credentials for the home account
    pub fn ambient(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            source: AccessSource::Ambient,
            expires_at: None,
            sdk_config: None,
        }
    }

    /// Temporary credentials from a role exchange
    pub fn assumed(
        account_id: impl Into<String>,
        role_arn: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            source: AccessSource::AssumedRole {
                role_arn: role_arn.into(),
            },
            expires_at,
            sdk_config: None,
        }
    }

    /// Attach the SDK configuration carrying these credentials
    pub fn with_sdk_config(mut self, config: aws_config::SdkConfig) -> Self {
        self.sdk_config = Some(config);
        self
    }

    /// SDK configuration, when built by the AWS exchange
    pub fn sdk_config(&self) -> Option<&aws_config::SdkConfig> {
        self.sdk_config.as_ref()
    }

    /// Ambient home-account credentials
    pub fn is_ambient(&self) -> bool {
        self.source == AccessSource::Ambient
    }
}

/// Tag as returned by the listing call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTag {
    /// Tag key
    #[serde(rename = "Key", default)]
    pub key: Option<String>,
    /// Tag value
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
}

/// One database instance as returned by the listing call
///
/// Field names follow `DescribeDBInstances` so fixture files can be taken
/// straight from `aws rds describe-db-instances` output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInstance {
    /// Instance identifier (required)
    #[serde(rename = "DBInstanceIdentifier", default)]
    pub identifier: Option<String>,

    /// Engine (required)
    #[serde(rename = "Engine", default)]
    pub engine: Option<String>,

    /// Engine version
    #[serde(rename = "EngineVersion", default)]
    pub engine_version: Option<String>,

    /// Instance class
    #[serde(rename = "DBInstanceClass", default)]
    pub instance_class: Option<String>,

    /// Status
    #[serde(rename = "DBInstanceStatus", default)]
    pub status: Option<String>,

    /// Multi-AZ
    #[serde(rename = "MultiAZ", default)]
    pub multi_az: Option<bool>,

    /// Encryption at rest
    #[serde(rename = "StorageEncrypted", default)]
    pub storage_encrypted: Option<bool>,

    /// Deletion protection
    #[serde(rename = "DeletionProtection", default)]
    pub deletion_protection: Option<bool>,

    /// Backup retention in days
    #[serde(rename = "BackupRetentionPeriod", default)]
    pub backup_retention_period: Option<i32>,

    /// Tags
    #[serde(rename = "TagList", default)]
    pub tags: Vec<RawTag>,
}

impl RawInstance {
    /// Check required fields and produce a listed instance
    pub fn validate(self) -> Result<ListedInstance, MissingField> {
        let instance_id = match self.identifier.filter(|s| !s.trim().is_empty()) {
            Some(id) => id,
            None => {
                return Err(MissingField {
                    field: "DBInstanceIdentifier",
                    identifier: None,
                });
            }
        };
        let engine = match self.engine.filter(|s| !s.trim().is_empty()) {
            Some(engine) => engine,
            None => {
                return Err(MissingField {
                    field: "Engine",
                    identifier: Some(instance_id),
                });
            }
        };

        let tags = self
            .tags
            .into_iter()
            .filter_map(|t| Some((t.key?, t.value.unwrap_or_default())))
            .collect();

        Ok(ListedInstance {
            instance_id,
            engine,
            engine_version: self.engine_version,
            instance_class: self.instance_class,
            status: self.status,
            multi_az: self.multi_az,
            storage_encrypted: self.storage_encrypted,
            deletion_protection: self.deletion_protection,
            backup_retention_period: self.backup_retention_period,
            tags,
        })
    }
}

/// A raw record missing a required field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingField {
    /// Missing field name
    pub field: &'static str,
    /// Identifier, when it was present
    pub identifier: Option<String>,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(id) => write!(f, "instance {} is missing required field {}", id, self.field),
            None => write!(f, "record is missing required field {}", self.field),
        }
    }
}

/// A raw record whose required fields are present
#[derive(Debug, Clone, PartialEq)]
pub struct ListedInstance {
    /// Instance identifier
    pub instance_id: String,
    /// Engine
    pub engine: String,
    /// Engine version
    pub engine_version: Option<String>,
    /// Instance class
    pub instance_class: Option<String>,
    /// Status
    pub status: Option<String>,
    /// Multi-AZ
    pub multi_az: Option<bool>,
    /// Encryption at rest
    pub storage_encrypted: Option<bool>,
    /// Deletion protection
    pub deletion_protection: Option<bool>,
    /// Backup retention in days
    pub backup_retention_period: Option<i32>,
    /// Tags with keys
    pub tags: Vec<(String, String)>,
}

/// One page of a listing call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    /// Records on this page
    #[serde(rename = "DBInstances", default)]
    pub instances: Vec<RawInstance>,
    /// Continuation marker
    #[serde(rename = "Marker", default)]
    pub next_marker: Option<String>,
}

/// Obtains scoped credentials for an account
#[async_trait]
pub trait RoleExchange: Send + Sync {
    /// Ambient credentials for the home account, without a network round trip
    fn ambient(&self, account: &AccountTarget) -> AccessContext;

    /// Exchange ambient credentials for a role in a remote account
    async fn assume(
        &self,
        account: &AccountTarget,
        role_arn: &str,
        session_name: &str,
    ) -> Result<AccessContext, ProviderFault>;
}

/// Lists database instances in one region of one account
#[async_trait]
pub trait InstanceLister: Send + Sync {
    /// Fetch one page, starting at `marker`
    async fn list_page(
        &self,
        ctx: &AccessContext,
        region: &str,
        marker: Option<String>,
    ) -> Result<RawPage, ProviderFault>;

    /// Regions enabled in the account
    async fn enabled_regions(&self, ctx: &AccessContext) -> Result<Vec<String>, ProviderFault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_instance_from_api_json() {
        let raw: RawInstance = serde_json::from_str(
            r#"{
                "DBInstanceIdentifier": "orders-db",
                "Engine": "postgres",
                "EngineVersion": "15.4",
                "DBInstanceClass": "db.r6g.large",
                "DBInstanceStatus": "available",
                "MultiAZ": true,
                "StorageEncrypted": true,
                "BackupRetentionPeriod": 7,
                "TagList": [ { "Key": "Environment", "Value": "prod" }, { "Value": "orphan" } ]
            }"#,
        )
        .unwrap();

        let listed = raw.validate().unwrap();
        assert_eq!(listed.instance_id, "orders-db");
        assert_eq!(listed.engine, "postgres");
        assert_eq!(listed.multi_az, Some(true));
        assert_eq!(listed.deletion_protection, None);
        assert_eq!(
            listed.tags,
            vec![("Environment".to_string(), "prod".to_string())]
        );
    }

    #[test]
    fn test_validate_missing_identifier() {
        let raw = RawInstance {
            engine: Some("mysql".to_string()),
            ..Default::default()
        };
        let err = raw.validate().unwrap_err();
        assert_eq!(err.field, "DBInstanceIdentifier");
        assert!(err.identifier.is_none());
    }

    #[test]
    fn test_validate_missing_engine_keeps_identifier() {
        let raw = RawInstance {
            identifier: Some("legacy-db".to_string()),
            engine: Some("  ".to_string()),
            ..Default::default()
        };
        let err = raw.validate().unwrap_err();
        assert_eq!(err.field, "Engine");
        assert_eq!(err.identifier.as_deref(), Some("legacy-db"));
        assert!(err.to_string().contains("legacy-db"));
    }

    #[test]
    fn test_fault_transience() {
        assert!(ProviderFault::service("Throttling", "Rate exceeded").is_throttling());
        assert!(ProviderFault::service("Throttling", "Rate exceeded").is_transient());
        assert!(ProviderFault::service("ServiceUnavailable", "try later").is_transient());
        assert!(ProviderFault::timeout("30s elapsed").is_transient());
        assert!(!ProviderFault::service("AccessDenied", "no").is_transient());
        assert!(!ProviderFault::credentials("no provider").is_transient());
    }

    #[test]
    fn test_fault_display() {
        let fault = ProviderFault::service("AccessDenied", "not authorized");
        assert_eq!(fault.to_string(), "AccessDenied: not authorized");
        assert_eq!(ProviderFault::timeout("5s").to_string(), "timeout: 5s");
    }

    #[test]
    fn test_access_context_debug_hides_config() {
        let ctx = AccessContext::assumed("222222222222", "arn:aws:iam::222222222222:role/R", None);
        assert!(!ctx.is_ambient());
        assert!(ctx.sdk_config().is_none());
        assert!(format!("{:?}", ctx).contains("AssumedRole"));
    }
}
