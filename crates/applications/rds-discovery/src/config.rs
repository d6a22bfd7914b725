//! Discovery configuration
//!
//! A single immutable [`DiscoveryConfig`] is loaded once at startup and
//! shared by `Arc` with every component. Nothing in the engine reads the
//! environment or global state after that.
//!
//! ```json
//! {
//!   "accounts": [
//!     { "account_id": "111111111111", "display_name": "payments", "is_home": true },
//!     { "account_id": "222222222222", "display_name": "analytics",
//!       "role_name": "RdsInventoryReader", "external_id": "s3cr3t-token",
//!       "regions": ["us-east-1"] }
//!   ],
//!   "regions": [ { "region_code": "us-east-1" }, { "region_code": "eu-west-1" } ],
//!   "store": { "kind": "file", "path": "./inventory" }
//! }
//! ```

use crate::error::{DiscoveryError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of accounts scanned concurrently
pub const DEFAULT_ACCOUNT_CONCURRENCY: usize = 5;

/// Default number of regions scanned concurrently within one account
pub const DEFAULT_REGION_CONCURRENCY: usize = 4;

/// Default wall-clock budget for one run (fits a 15 minute scheduler slot)
pub const DEFAULT_RUN_BUDGET_SECS: u64 = 840;

/// Stop dispatching new work this long before the budget expires
pub const DEFAULT_DISPATCH_MARGIN_SECS: u64 = 30;

/// Default STS session name prefix
pub const DEFAULT_SESSION_NAME_PREFIX: &str = "rds-discovery";

/// Default key prefix for the S3 inventory store
pub const DEFAULT_S3_PREFIX: &str = "rds-inventory";

fn default_true() -> bool {
    true
}

fn default_account_concurrency() -> usize {
    DEFAULT_ACCOUNT_CONCURRENCY
}

fn default_region_concurrency() -> usize {
    DEFAULT_REGION_CONCURRENCY
}

fn default_run_budget_secs() -> u64 {
    DEFAULT_RUN_BUDGET_SECS
}

fn default_dispatch_margin_secs() -> u64 {
    DEFAULT_DISPATCH_MARGIN_SECS
}

/// Region codes become store path and key segments: lowercase letters,
/// digits and dashes only
fn is_region_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn default_partition() -> String {
    "aws".to_string()
}

fn default_session_name_prefix() -> String {
    DEFAULT_SESSION_NAME_PREFIX.to_string()
}

fn default_s3_prefix() -> String {
    DEFAULT_S3_PREFIX.to_string()
}

/// A cloud account configured to be scanned
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountTarget {
    /// 12-digit account identifier
    pub account_id: String,

    /// Human-readable name
    #[serde(default)]
    pub display_name: String,

    /// Scanned with the ambient credentials of the running process
    #[serde(default)]
    pub is_home: bool,

    /// Role assumed in a remote account
    #[serde(default)]
    pub role_name: Option<String>,

    /// Correlation token passed as `ExternalId` on role exchange
    #[serde(default)]
    pub external_id: Option<String>,

    /// Disabled accounts are not attempted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-account region override (subset of region codes)
    #[serde(default)]
    pub regions: Option<Vec<String>>,
}

impl fmt::Debug for AccountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountTarget")
            .field("account_id", &self.account_id)
            .field("display_name", &self.display_name)
            .field("is_home", &self.is_home)
            .field("role_name", &self.role_name)
            .field("external_id", &self.external_id.as_ref().map(|_| "<redacted>"))
            .field("enabled", &self.enabled)
            .field("regions", &self.regions)
            .finish()
    }
}

impl AccountTarget {
    /// Home account, scanned with ambient credentials
    pub fn home(account_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            display_name: display_name.into(),
            is_home: true,
            role_name: None,
            external_id: None,
            enabled: true,
            regions: None,
        }
    }

    /// Remote account, scanned through role exchange
    pub fn remote(
        account_id: impl Into<String>,
        display_name: impl Into<String>,
        role_name: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            display_name: display_name.into(),
            is_home: false,
            role_name: Some(role_name.into()),
            external_id: Some(external_id.into()),
            enabled: true,
            regions: None,
        }
    }

    /// Restrict this account to the given region codes
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }

    /// Mark the account disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Role ARN for remote accounts
    pub fn role_arn(&self, partition: &str) -> Option<String> {
        self.role_name
            .as_ref()
            .map(|role| format!("arn:{}:iam::{}:role/{}", partition, self.account_id, role))
    }

    /// Display name, falling back to the account id
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.account_id
        } else {
            &self.display_name
        }
    }
}

/// A region configured to be scanned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionTarget {
    /// Region code (e.g., "us-east-1")
    pub region_code: String,

    /// Disabled regions are skipped for every account
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RegionTarget {
    /// Enabled region target
    pub fn new(region_code: impl Into<String>) -> Self {
        Self {
            region_code: region_code.into(),
            enabled: true,
        }
    }
}

/// How the per-account region list is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionDiscovery {
    /// Use configured region targets as-is
    #[default]
    Configured,
    /// Intersect configured targets with the regions enabled in each account
    EnabledInAccount,
}

/// Network call bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP/TLS connect timeout
    pub connect_secs: u64,
    /// Socket read timeout
    pub read_secs: u64,
    /// Upper bound on one provider call, enforced by the engine
    pub call_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 3,
            read_secs: 10,
            call_secs: 30,
        }
    }
}

impl TimeoutConfig {
    /// Connect timeout as a Duration
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    /// Read timeout as a Duration
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    /// Per-call timeout as a Duration
    pub fn call(&self) -> Duration {
        Duration::from_secs(self.call_secs)
    }
}

/// Retry budget as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Randomize each delay in `[0, delay]`
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Build the shared retry policy
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter)
    }
}

/// Where the inventory lives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process memory (lost on exit)
    #[default]
    Memory,
    /// One JSON file per scope under `path`
    File {
        /// Root directory
        path: PathBuf,
    },
    /// One S3 object per scope
    S3 {
        /// Bucket name
        bucket: String,
        /// Key prefix
        #[serde(default = "default_s3_prefix")]
        prefix: String,
        /// Bucket region (defaults to the ambient region)
        #[serde(default)]
        region: Option<String>,
    },
}

/// Immutable configuration for one discovery run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Accounts to scan
    pub accounts: Vec<AccountTarget>,

    /// Default region targets
    #[serde(default)]
    pub regions: Vec<RegionTarget>,

    /// Region list resolution mode
    #[serde(default)]
    pub region_discovery: RegionDiscovery,

    /// Accounts scanned concurrently
    #[serde(default = "default_account_concurrency")]
    pub account_concurrency: usize,

    /// Regions scanned concurrently within one account
    #[serde(default = "default_region_concurrency")]
    pub region_concurrency: usize,

    /// Network call bounds
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry budget for role exchange and listing calls
    #[serde(default)]
    pub retry: RetrySettings,

    /// Wall-clock budget for the whole run
    #[serde(default = "default_run_budget_secs")]
    pub run_budget_secs: u64,

    /// Stop dispatching this long before the budget expires
    #[serde(default = "default_dispatch_margin_secs")]
    pub dispatch_margin_secs: u64,

    /// ARN partition ("aws", "aws-cn", "aws-us-gov")
    #[serde(default = "default_partition")]
    pub partition: String,

    /// STS session name prefix
    #[serde(default = "default_session_name_prefix")]
    pub session_name_prefix: String,

    /// Inventory store
    #[serde(default)]
    pub store: StoreConfig,
}

impl DiscoveryConfig {
    /// Create a config with default budgets
    pub fn new(accounts: Vec<AccountTarget>, regions: Vec<RegionTarget>) -> Self {
        Self {
            accounts,
            regions,
            region_discovery: RegionDiscovery::default(),
            account_concurrency: DEFAULT_ACCOUNT_CONCURRENCY,
            region_concurrency: DEFAULT_REGION_CONCURRENCY,
            timeouts: TimeoutConfig::default(),
            retry: RetrySettings::default(),
            run_budget_secs: DEFAULT_RUN_BUDGET_SECS,
            dispatch_margin_secs: DEFAULT_DISPATCH_MARGIN_SECS,
            partition: default_partition(),
            session_name_prefix: default_session_name_prefix(),
            store: StoreConfig::default(),
        }
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: DiscoveryConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Set account concurrency
    pub fn with_account_concurrency(mut self, n: usize) -> Self {
        self.account_concurrency = n;
        self
    }

    /// Set region concurrency
    pub fn with_region_concurrency(mut self, n: usize) -> Self {
        self.region_concurrency = n;
        self
    }

    /// Set the run budget
    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.run_budget_secs = budget.as_secs();
        self
    }

    /// Set the dispatch margin
    pub fn with_dispatch_margin(mut self, margin: Duration) -> Self {
        self.dispatch_margin_secs = margin.as_secs();
        self
    }

    /// Set the retry budget
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Set call timeouts
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set region resolution mode
    pub fn with_region_discovery(mut self, mode: RegionDiscovery) -> Self {
        self.region_discovery = mode;
        self
    }

    /// Set the inventory store
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        if !self.accounts.iter().any(|a| a.enabled) {
            return Err(DiscoveryError::config("no enabled accounts configured"));
        }

        let homes = self.accounts.iter().filter(|a| a.is_home).count();
        if homes > 1 {
            return Err(DiscoveryError::config(format!(
                "{} home accounts configured, at most one is allowed",
                homes
            )));
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.account_id.len() != 12
                || !account.account_id.chars().all(|c| c.is_ascii_digit())
            {
                return Err(DiscoveryError::config(format!(
                    "account id '{}' is not a 12-digit identifier",
                    account.account_id
                )));
            }
            if !seen.insert(account.account_id.as_str()) {
                return Err(DiscoveryError::config(format!(
                    "account {} listed more than once",
                    account.account_id
                )));
            }
            if !account.is_home {
                let role_ok = account.role_name.as_deref().is_some_and(|r| !r.is_empty());
                let token_ok = account.external_id.as_deref().is_some_and(|t| !t.is_empty());
                if !role_ok || !token_ok {
                    return Err(DiscoveryError::config(format!(
                        "remote account {} needs role_name and external_id",
                        account.account_id
                    )));
                }
            }
            if let Some(regions) = &account.regions
                && let Some(bad) = regions.iter().find(|r| !is_region_code(r))
            {
                return Err(DiscoveryError::config(format!(
                    "account {} has an invalid region code '{}'",
                    account.account_id, bad
                )));
            }
        }

        let mut codes = HashSet::new();
        for region in &self.regions {
            if !is_region_code(&region.region_code) {
                return Err(DiscoveryError::config(format!(
                    "invalid region code '{}'",
                    region.region_code
                )));
            }
            if !codes.insert(region.region_code.as_str()) {
                return Err(DiscoveryError::config(format!(
                    "region {} listed more than once",
                    region.region_code
                )));
            }
        }

        if self.account_concurrency == 0 || self.region_concurrency == 0 {
            return Err(DiscoveryError::config("concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(DiscoveryError::config("retry.max_attempts must be at least 1"));
        }
        if self.timeouts.call_secs == 0 {
            return Err(DiscoveryError::config("timeouts.call_secs must be at least 1"));
        }
        if self.dispatch_margin_secs >= self.run_budget_secs {
            return Err(DiscoveryError::config(format!(
                "dispatch_margin_secs ({}) must be below run_budget_secs ({})",
                self.dispatch_margin_secs, self.run_budget_secs
            )));
        }

        Ok(())
    }

    /// The home account, if one is configured
    pub fn home_account(&self) -> Option<&AccountTarget> {
        self.accounts.iter().find(|a| a.is_home)
    }

    /// Accounts that will be attempted
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountTarget> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    /// Region codes to scan for one account
    ///
    /// An account override selects codes explicitly; codes disabled in the
    /// global region list are dropped either way.
    pub fn regions_for(&self, account: &AccountTarget) -> Vec<String> {
        let disabled: HashSet<&str> = self
            .regions
            .iter()
            .filter(|r| !r.enabled)
            .map(|r| r.region_code.as_str())
            .collect();

        let mut out: Vec<String> = match &account.regions {
            Some(codes) => codes
                .iter()
                .filter(|c| !disabled.contains(c.as_str()))
                .cloned()
                .collect(),
            None => self
                .regions
                .iter()
                .filter(|r| r.enabled)
                .map(|r| r.region_code.clone())
                .collect(),
        };
        let mut seen = HashSet::new();
        out.retain(|c| seen.insert(c.clone()));
        out
    }

    /// Run budget as a Duration
    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }

    /// Dispatch margin as a Duration
    pub fn dispatch_margin(&self) -> Duration {
        Duration::from_secs(self.dispatch_margin_secs)
    }

    /// Shared retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }
}
