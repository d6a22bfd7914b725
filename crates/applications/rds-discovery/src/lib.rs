//! # RDS Discovery
//!
//! Multi-account, multi-region RDS inventory discovery.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator
//! ├── per account (N workers)
//! │   └── CredentialBroker ── ambient (home) | sts:AssumeRole + ExternalId (remote)
//! │       └── per region (M workers)
//! │           └── RegionScanner ── rds:DescribeDBInstances pages
//! │               └── normalize ── InstanceRecord
//! │                   └── reconcile ── InventoryStore (memory | file | s3)
//! ├── ErrorClassifier ── six-type taxonomy with remediation
//! └── MetricsAggregator ── counters, errors, warnings
//! ```
//!
//! Failures are caught at the smallest enclosing scope (instance, region,
//! account) and recorded as classified entries. A run only ends `failed`
//! when no account at all could be scanned.
//!
//! ## Staleness
//!
//! A record's `last_seen` advances only when its own (account, region)
//! scope is scanned successfully, and `removed` is only set by such a
//! scan. A failed scope leaves its stored records exactly as they were.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aws;
pub mod classify;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fixtures;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod provider;
pub mod reconcile;
pub mod retry;
pub mod scanner;
pub mod store;
pub mod types;

// ============================================================================
// Public exports
// ============================================================================

// Entry point
pub use orchestrator::{DiscoveryResult, Orchestrator, RunBudget};

// Configuration
pub use config::{
    AccountTarget, DiscoveryConfig, RegionDiscovery, RegionTarget, RetrySettings, StoreConfig,
    TimeoutConfig,
};

// Components
pub use classify::{ErrorClassifier, ErrorEntry, ErrorType, Scope, Severity, Warning};
pub use credentials::CredentialBroker;
pub use metrics::{MetricsAggregator, RunCounts};
pub use normalize::normalize;
pub use reconcile::{ReconcileStats, reconcile};
pub use retry::RetryPolicy;
pub use scanner::{RegionScanner, ScanOutput};

// Provider seams and implementations
pub use aws::{RdsInstanceLister, StsRoleExchange, load_sdk_config};
pub use fixtures::FixtureProvider;
pub use provider::{AccessContext, InstanceLister, ProviderFault, RoleExchange};

// Store
pub use store::{
    FileInventoryStore, InventoryFilter, InventoryStore, MemoryInventoryStore, S3InventoryStore,
};

// Data model
pub use types::{
    DiscoveryRun, Environment, InstanceKey, InstanceRecord, Invocation, RunStatus, ScopeKey,
    TriggerSource,
};

// Error handling
pub use error::{DiscoveryError, Result};
