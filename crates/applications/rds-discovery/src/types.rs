//! Core inventory types
//!
//! The canonical [`InstanceRecord`] is the only shape that reaches the
//! reconciler and the store. Everything provider-shaped stays in
//! [`crate::provider`] and is converted at the normalizer boundary.

use crate::error::{DiscoveryError, Result};
use crate::metrics::RunCounts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One (account, region) pair: the unit of scanning, reconciliation and staleness
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    /// Account identifier
    pub account_id: String,
    /// Region code
    pub region: String,
}

impl ScopeKey {
    /// Create a scope key
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account_id, self.region)
    }
}

/// Composite key of an inventory record, globally unique
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Account identifier
    pub account_id: String,
    /// Region code
    pub region: String,
    /// Database instance identifier
    pub instance_id: String,
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.region, self.instance_id)
    }
}

/// Environment classification derived from instance tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Production workload
    Production,
    /// Development, test or staging workload
    Development,
    /// Proof of concept or sandbox
    Poc,
    /// No recognized environment tag. Consumers treat this permissively.
    Unknown,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Development => write!(f, "development"),
            Environment::Poc => write!(f, "poc"),
            Environment::Unknown => write!(f, "unknown"),
        }
    }
}

/// Canonical inventory record for one database instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Owning account
    pub account_id: String,

    /// Owning region
    pub region: String,

    /// Database instance identifier
    pub instance_id: String,

    /// Engine name (e.g., "postgres", "aurora-mysql")
    pub engine: String,

    /// Engine version
    pub engine_version: String,

    /// Instance class (e.g., "db.r6g.large")
    pub instance_class: String,

    /// Provider-reported status (e.g., "available")
    pub status: String,

    /// Multi-AZ deployment
    pub multi_az: bool,

    /// Storage encryption at rest
    pub storage_encrypted: bool,

    /// Deletion protection enabled
    pub deletion_protection: bool,

    /// Automated backup retention in days
    pub backup_retention_days: i32,

    /// Resource tags
    pub tags: BTreeMap<String, String>,

    /// Environment derived from tags
    pub environment: Environment,

    /// Last successful scan of the owning scope that observed this instance
    pub last_seen: DateTime<Utc>,

    /// Owning scope was scanned successfully and no longer reports this instance
    #[serde(default)]
    pub removed: bool,
}

impl InstanceRecord {
    /// Composite key
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            account_id: self.account_id.clone(),
            region: self.region.clone(),
            instance_id: self.instance_id.clone(),
        }
    }

    /// Owning scope
    pub fn scope(&self) -> ScopeKey {
        ScopeKey::new(&self.account_id, &self.region)
    }

    /// Compare everything except `last_seen` and `removed`
    pub fn same_attributes(&self, other: &InstanceRecord) -> bool {
        self.account_id == other.account_id
            && self.region == other.region
            && self.instance_id == other.instance_id
            && self.engine == other.engine
            && self.engine_version == other.engine_version
            && self.instance_class == other.instance_class
            && self.status == other.status
            && self.multi_az == other.multi_az
            && self.storage_encrypted == other.storage_encrypted
            && self.deletion_protection == other.deletion_protection
            && self.backup_retention_days == other.backup_retention_days
            && self.tags == other.tags
            && self.environment == other.environment
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    /// Periodic scheduler
    #[default]
    Scheduled,
    /// Operator request
    Manual,
}

/// Invocation input from the scheduler or CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    /// What started the run
    pub trigger_source: TriggerSource,
    /// When the run was requested
    pub requested_at: DateTime<Utc>,
}

impl Invocation {
    /// Manual invocation requested now
    pub fn manual() -> Self {
        Self {
            trigger_source: TriggerSource::Manual,
            requested_at: Utc::now(),
        }
    }
}

impl Default for Invocation {
    /// A missing invocation means a full scheduled run
    fn default() -> Self {
        Self {
            trigger_source: TriggerSource::Scheduled,
            requested_at: Utc::now(),
        }
    }
}

/// Discovery run lifecycle: `Pending -> Running -> terminal`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not started
    Pending,
    /// Scanning
    Running,
    /// Finished with no errors recorded
    #[serde(rename = "completed")]
    CompletedSuccess,
    /// Finished, at least one non-fatal error recorded
    CompletedWithErrors,
    /// No account could be scanned
    Failed,
}

impl RunStatus {
    /// Terminal states are set exactly once
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompletedSuccess | Self::CompletedWithErrors | Self::Failed
        )
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::CompletedSuccess => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end execution of the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRun {
    /// Run identifier
    pub run_id: String,

    /// Invocation that started the run
    pub invocation: Invocation,

    /// Start time (set on `start`)
    pub started_at: Option<DateTime<Utc>>,

    /// End time (set on `finalize`)
    pub ended_at: Option<DateTime<Utc>>,

    /// Lifecycle state
    pub status: RunStatus,

    /// Counters captured at finalization
    pub counts: RunCounts,
}

impl DiscoveryRun {
    /// Create a pending run
    pub fn new(invocation: Invocation) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            invocation,
            started_at: None,
            ended_at: None,
            status: RunStatus::Pending,
            counts: RunCounts::default(),
        }
    }

    /// Move `Pending -> Running`
    pub fn start(&mut self) -> Result<()> {
        if self.status != RunStatus::Pending {
            return Err(DiscoveryError::config(format!(
                "run {} cannot start from state {}",
                self.run_id, self.status
            )));
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Set the terminal state. Fails if a terminal state was already set.
    pub fn finalize(&mut self, status: RunStatus, counts: RunCounts) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DiscoveryError::AlreadyFinalized {
                run_id: self.run_id.clone(),
                status: self.status.to_string(),
            });
        }
        if !status.is_terminal() {
            return Err(DiscoveryError::config(format!(
                "{} is not a terminal run status",
                status
            )));
        }
        self.status = status;
        self.counts = counts;
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}
