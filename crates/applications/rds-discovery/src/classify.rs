//! Error classification
//!
//! Every failure observed during a run ends up here as a [`ProviderFault`]
//! plus the scope it happened in, and leaves as an [`ErrorEntry`] with a
//! type from the fixed taxonomy, a severity and remediation text naming
//! the affected account, region and role.
//!
//! ## Taxonomy
//!
//! | Type                   | Severity | Signature                                   |
//! |------------------------|----------|---------------------------------------------|
//! | `cross_account_access` | High     | Role exchange failed after retries          |
//! | `region_not_enabled`   | Low      | `OptInRequired`, `InvalidToken`, ...        |
//! | `invalid_credentials`  | Critical | `InvalidClientTokenId`, `ExpiredToken`, ... |
//! | `rate_limit`           | Medium   | Throttling codes                            |
//! | `timeout`              | Medium   | Call bound exceeded, transport failures     |
//! | `permissions`          | High     | `AccessDenied`, and unrecognized codes      |

use crate::config::{AccountTarget, DiscoveryConfig};
use crate::provider::{FaultKind, MissingField, ProviderFault};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Codes meaning the caller's own credentials were rejected
const INVALID_CREDENTIAL_CODES: &[&str] = &[
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "SignatureDoesNotMatch",
    "ExpiredToken",
    "ExpiredTokenException",
    "InvalidAccessKeyId",
    "IncompleteSignature",
    "MissingAuthenticationToken",
];

/// Codes meaning the region is not usable in the account
const REGION_NOT_ENABLED_CODES: &[&str] = &[
    "OptInRequired",
    "InvalidToken",
    "InvalidIdentityToken",
    "SubscriptionRequiredException",
];

/// Codes meaning a read permission is missing
const PERMISSION_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "UnauthorizedOperation",
    "AuthorizationError",
    "AuthFailure",
    "UnauthorizedAccess",
];

/// Failure type (the six-value taxonomy)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Role exchange denied or missing
    CrossAccountAccess,
    /// Region disabled in the target account
    RegionNotEnabled,
    /// Execution identity rejected
    InvalidCredentials,
    /// Provider throttling
    RateLimit,
    /// Call exceeded its bound
    Timeout,
    /// Missing read permission
    Permissions,
}

impl ErrorType {
    /// Every taxonomy value
    pub const ALL: [ErrorType; 6] = [
        ErrorType::CrossAccountAccess,
        ErrorType::RegionNotEnabled,
        ErrorType::InvalidCredentials,
        ErrorType::RateLimit,
        ErrorType::Timeout,
        ErrorType::Permissions,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::CrossAccountAccess => "cross_account_access",
            ErrorType::RegionNotEnabled => "region_not_enabled",
            ErrorType::InvalidCredentials => "invalid_credentials",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Timeout => "timeout",
            ErrorType::Permissions => "permissions",
        }
    }

    /// Default severity
    pub fn severity(&self) -> Severity {
        match self {
            ErrorType::CrossAccountAccess => Severity::High,
            ErrorType::RegionNotEnabled => Severity::Low,
            ErrorType::InvalidCredentials => Severity::Critical,
            ErrorType::RateLimit => Severity::Medium,
            ErrorType::Timeout => Severity::Medium,
            ErrorType::Permissions => Severity::High,
        }
    }

    /// Classify a fault by signature alone
    pub fn from_fault(fault: &ProviderFault) -> ErrorType {
        match fault.kind {
            FaultKind::Credentials => ErrorType::InvalidCredentials,
            FaultKind::Timeout | FaultKind::Transport => ErrorType::Timeout,
            FaultKind::Service => {
                let code = fault.code();
                let message = fault.message.to_ascii_lowercase();
                if INVALID_CREDENTIAL_CODES.contains(&code) {
                    ErrorType::InvalidCredentials
                } else if fault.is_throttling() || code == "429" {
                    ErrorType::RateLimit
                } else if REGION_NOT_ENABLED_CODES.contains(&code)
                    || message.contains("not enabled")
                    || message.contains("opt-in")
                {
                    ErrorType::RegionNotEnabled
                } else if code.ends_with("Timeout") || code.ends_with("TimeoutException") {
                    ErrorType::Timeout
                } else {
                    // AccessDenied family, and anything unrecognized
                    ErrorType::Permissions
                }
            }
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ranked failure impact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational, no action needed this run
    Low,
    /// Degraded, usually self-resolving
    Medium,
    /// Coverage lost until someone acts
    High,
    /// Run-level failure
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

/// Granularity a failure is isolated at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Whole account
    Account,
    /// One region of one account
    Region,
    /// One database instance
    Instance,
}

/// A classified failure recorded in the run result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Isolation scope
    pub scope: Scope,

    /// Affected account
    pub account_id: String,

    /// Affected region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Affected instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Taxonomy type
    #[serde(rename = "type")]
    pub error_type: ErrorType,

    /// Severity
    pub severity: Severity,

    /// What happened
    pub message: String,

    /// What to do about it
    pub remediation: String,
}

impl ErrorEntry {
    /// Sort key for deterministic output
    pub fn sort_key(&self) -> (&str, &str, &str, ErrorType) {
        (
            self.account_id.as_str(),
            self.region.as_deref().unwrap_or(""),
            self.instance_id.as_deref().unwrap_or(""),
            self.error_type,
        )
    }
}

/// A non-fatal data-quality finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Isolation scope
    pub scope: Scope,

    /// Warning type (e.g., "malformed_record")
    #[serde(rename = "type")]
    pub warning_type: String,

    /// Severity
    pub severity: Severity,

    /// Affected account
    pub account_id: String,

    /// Affected region
    pub region: String,

    /// Affected instance, when identifiable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// What happened
    pub message: String,
}

impl Warning {
    /// Record skipped because a required field is missing
    pub fn malformed_record(account_id: &str, region: &str, missing: &MissingField) -> Self {
        Self {
            scope: Scope::Instance,
            warning_type: "malformed_record".to_string(),
            severity: Severity::Low,
            account_id: account_id.to_string(),
            region: region.to_string(),
            instance_id: missing.identifier.clone(),
            message: format!("{}; record skipped", missing),
        }
    }

    /// Sort key for deterministic output
    pub fn sort_key(&self) -> (&str, &str, &str, &str) {
        (
            self.account_id.as_str(),
            self.region.as_str(),
            self.instance_id.as_deref().unwrap_or(""),
            self.warning_type.as_str(),
        )
    }
}

/// Maps faults to typed entries with remediation text
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    home_account_id: Option<String>,
    partition: String,
    call_timeout_secs: u64,
    max_attempts: u32,
}

impl ErrorClassifier {
    /// Create a classifier
    pub fn new(home_account_id: Option<String>, partition: impl Into<String>) -> Self {
        Self {
            home_account_id,
            partition: partition.into(),
            call_timeout_secs: 30,
            max_attempts: 4,
        }
    }

    /// Classifier for a loaded configuration
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            home_account_id: config.home_account().map(|a| a.account_id.clone()),
            partition: config.partition.clone(),
            call_timeout_secs: config.timeouts.call_secs,
            max_attempts: config.retry.max_attempts,
        }
    }

    /// Classify a fault raised at account or region scope
    pub fn classify(
        &self,
        fault: &ProviderFault,
        scope: Scope,
        account: &AccountTarget,
        region: Option<&str>,
    ) -> ErrorEntry {
        let error_type = ErrorType::from_fault(fault);
        let message = match region {
            Some(region) => format!(
                "listing RDS instances in {} for account {} ({}) failed: {}",
                region,
                account.account_id,
                account.label(),
                fault
            ),
            None => format!(
                "account {} ({}) failed: {}",
                account.account_id,
                account.label(),
                fault
            ),
        };

        ErrorEntry {
            scope,
            account_id: account.account_id.clone(),
            region: region.map(str::to_string),
            instance_id: None,
            error_type,
            severity: error_type.severity(),
            message,
            remediation: self.remediation(error_type, account, region, fault),
        }
    }

    /// Role exchange failure, always `cross_account_access`
    pub fn cross_account(&self, account: &AccountTarget, fault: &ProviderFault) -> ErrorEntry {
        let role = account.role_name.as_deref().unwrap_or("<unset>");
        ErrorEntry {
            scope: Scope::Account,
            account_id: account.account_id.clone(),
            region: None,
            instance_id: None,
            error_type: ErrorType::CrossAccountAccess,
            severity: ErrorType::CrossAccountAccess.severity(),
            message: format!(
                "assuming role {} in account {} ({}) failed: {}",
                role,
                account.account_id,
                account.label(),
                fault
            ),
            remediation: self.remediation(ErrorType::CrossAccountAccess, account, None, fault),
        }
    }

    /// Trust policy the remote role needs
    pub fn trust_policy(&self, account: &AccountTarget) -> String {
        let home = self.home_account_id.as_deref().unwrap_or("HOME_ACCOUNT_ID");
        let policy = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "AWS": format!("arn:{}:iam::{}:root", self.partition, home) },
                "Action": "sts:AssumeRole",
                "Condition": {
                    "StringEquals": {
                        "sts:ExternalId": account.external_id.as_deref().unwrap_or("")
                    }
                }
            }]
        });
        policy.to_string()
    }

    fn remediation(
        &self,
        error_type: ErrorType,
        account: &AccountTarget,
        region: Option<&str>,
        fault: &ProviderFault,
    ) -> String {
        let region = region.unwrap_or("all regions");
        let principal = match (&account.role_name, account.is_home) {
            (Some(role), false) => format!("role {}", role),
            _ => "the discovery execution identity".to_string(),
        };

        match error_type {
            ErrorType::CrossAccountAccess => format!(
                "Create or fix role {} in account {} so it trusts the home account with the configured external id, then rerun discovery. Required trust policy: {}",
                account.role_name.as_deref().unwrap_or("<unset>"),
                account.account_id,
                self.trust_policy(account)
            ),
            ErrorType::RegionNotEnabled => format!(
                "Enable region {} in account {} (Account settings > AWS Regions) or remove it from the account's region list",
                region, account.account_id
            ),
            ErrorType::InvalidCredentials => format!(
                "Fix the execution identity used for account {}: its credentials were rejected ({}). Check the instance profile or environment credentials and their expiry",
                account.account_id,
                fault.code.as_deref().unwrap_or("no credentials")
            ),
            ErrorType::RateLimit => format!(
                "Self-resolving: RDS throttled requests in {} for account {} after {} attempts; the scope is retried on the next scheduled run",
                region, account.account_id, self.max_attempts
            ),
            ErrorType::Timeout => format!(
                "Increase timeouts.call_secs (currently {}s) or investigate the network path to RDS in {} for account {}",
                self.call_timeout_secs, region, account.account_id
            ),
            ErrorType::Permissions => format!(
                "Attach a read policy allowing rds:DescribeDBInstances and ec2:DescribeRegions to {} in account {}{}",
                principal,
                account.account_id,
                match &fault.code {
                    Some(code) if !PERMISSION_CODES.contains(&code.as_str()) => {
                        format!(" (provider code {})", code)
                    }
                    _ => String::new(),
                }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> AccountTarget {
        AccountTarget::remote("222222222222", "analytics", "RdsInventoryReader", "corr-token-42")
    }

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(Some("111111111111".to_string()), "aws")
    }

    #[test]
    fn test_signature_table() {
        let cases = [
            (ProviderFault::service("Throttling", "Rate exceeded"), ErrorType::RateLimit),
            (ProviderFault::service("AccessDenied", "nope"), ErrorType::Permissions),
            (ProviderFault::service("OptInRequired", "opt in"), ErrorType::RegionNotEnabled),
            (
                ProviderFault::service("InvalidClientTokenId", "bad token"),
                ErrorType::InvalidCredentials,
            ),
            (ProviderFault::credentials("no provider"), ErrorType::InvalidCredentials),
            (ProviderFault::timeout("30s"), ErrorType::Timeout),
            (ProviderFault::transport("dns failure"), ErrorType::Timeout),
            (
                ProviderFault::service("SomethingNew", "region is not enabled"),
                ErrorType::RegionNotEnabled,
            ),
            (ProviderFault::service("SomethingNew", "weird"), ErrorType::Permissions),
        ];
        for (fault, expected) in cases {
            assert_eq!(ErrorType::from_fault(&fault), expected, "{}", fault);
        }
    }

    #[test]
    fn test_every_type_has_remediation() {
        let c = classifier();
        let account = remote();
        let faults = [
            ProviderFault::service("Throttling", "x"),
            ProviderFault::service("AccessDenied", "x"),
            ProviderFault::service("OptInRequired", "x"),
            ProviderFault::service("ExpiredToken", "x"),
            ProviderFault::timeout("x"),
        ];
        for fault in faults {
            let entry = c.classify(&fault, Scope::Region, &account, Some("eu-west-1"));
            assert!(ErrorType::ALL.contains(&entry.error_type));
            assert!(!entry.remediation.is_empty());
            assert_eq!(entry.severity, entry.error_type.severity());
        }
        let entry = c.cross_account(&account, &ProviderFault::service("AccessDenied", "x"));
        assert!(!entry.remediation.is_empty());
    }

    #[test]
    fn test_cross_account_remediation_carries_trust_policy() {
        let entry = classifier().cross_account(
            &remote(),
            &ProviderFault::service("AccessDenied", "not authorized to perform sts:AssumeRole"),
        );
        assert_eq!(entry.error_type, ErrorType::CrossAccountAccess);
        assert_eq!(entry.severity, Severity::High);
        assert_eq!(entry.scope, Scope::Account);
        assert!(entry.remediation.contains("RdsInventoryReader"));
        assert!(entry.remediation.contains("corr-token-42"));
        assert!(entry.remediation.contains("arn:aws:iam::111111111111:root"));
        assert!(entry.remediation.contains("sts:ExternalId"));
    }

    #[test]
    fn test_trust_policy_without_home() {
        let c = ErrorClassifier::new(None, "aws-us-gov");
        let policy: serde_json::Value = serde_json::from_str(&c.trust_policy(&remote())).unwrap();
        assert_eq!(
            policy["Statement"][0]["Principal"]["AWS"],
            "arn:aws-us-gov:iam::HOME_ACCOUNT_ID:root"
        );
    }

    #[test]
    fn test_region_entry_fields() {
        let entry = classifier().classify(
            &ProviderFault::service("Throttling", "Rate exceeded"),
            Scope::Region,
            &remote(),
            Some("us-west-2"),
        );
        assert_eq!(entry.region.as_deref(), Some("us-west-2"));
        assert_eq!(entry.severity, Severity::Medium);
        assert!(entry.remediation.contains("next scheduled run"));
    }

    #[test]
    fn test_unrecognized_code_kept_in_remediation() {
        let entry = classifier().classify(
            &ProviderFault::service("DBSomethingFault", "odd"),
            Scope::Region,
            &remote(),
            Some("us-east-1"),
        );
        assert_eq!(entry.error_type, ErrorType::Permissions);
        assert!(entry.remediation.contains("DBSomethingFault"));
    }

    #[test]
    fn test_entry_serialization() {
        let entry = classifier().cross_account(&remote(), &ProviderFault::timeout("5s"));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "cross_account_access");
        assert_eq!(value["severity"], "High");
        assert_eq!(value["scope"], "account");
        assert!(value.get("region").is_none());
    }

    #[test]
    fn test_malformed_warning() {
        let missing = MissingField {
            field: "Engine",
            identifier: Some("legacy".to_string()),
        };
        let warning = Warning::malformed_record("111111111111", "us-east-1", &missing);
        assert_eq!(warning.severity, Severity::Low);
        assert_eq!(warning.scope, Scope::Instance);
        assert_eq!(warning.instance_id.as_deref(), Some("legacy"));
        assert_eq!(warning.warning_type, "malformed_record");
    }
}
