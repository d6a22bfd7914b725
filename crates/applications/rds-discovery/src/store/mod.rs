//! Durable inventory store
//!
//! The inventory is partitioned by [`ScopeKey`]: each (account, region)
//! scope is loaded and saved as a unit. One worker owns one scope at a
//! time, so writers never contend across scopes and same-scope writes
//! cannot race.
//!
//! Implementations:
//! - [`MemoryInventoryStore`]: process memory, used by tests and fixture runs
//! - [`FileInventoryStore`]: one JSON document per scope under a directory
//! - [`S3InventoryStore`]: one S3 object per scope

mod file;
mod s3;

pub use file::FileInventoryStore;
pub use s3::S3InventoryStore;

use crate::config::StoreConfig;
use crate::error::{DiscoveryError, Result};
use crate::types::{DiscoveryRun, InstanceRecord, ScopeKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persisted form of one scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDocument {
    /// Account identifier
    pub account_id: String,
    /// Region code
    pub region: String,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Every record ever observed in the scope, removed ones included
    pub records: Vec<InstanceRecord>,
}

impl ScopeDocument {
    /// Document stamped now
    pub fn new(scope: &ScopeKey, records: Vec<InstanceRecord>) -> Self {
        Self {
            account_id: scope.account_id.clone(),
            region: scope.region.clone(),
            updated_at: Utc::now(),
            records,
        }
    }
}

/// Read-side filter for inventory queries
#[derive(Debug, Clone, Default)]
pub struct InventoryFilter {
    /// Only this account
    pub account_id: Option<String>,
    /// Only this region
    pub region: Option<String>,
    /// Include soft-deleted records
    pub include_removed: bool,
}

impl InventoryFilter {
    /// Scope-level match
    pub fn matches_scope(&self, scope: &ScopeKey) -> bool {
        self.account_id
            .as_deref()
            .is_none_or(|a| a == scope.account_id)
            && self.region.as_deref().is_none_or(|r| r == scope.region)
    }

    /// Record-level match
    pub fn matches(&self, record: &InstanceRecord) -> bool {
        self.matches_scope(&record.scope()) && (self.include_removed || !record.removed)
    }
}

/// Scope-partitioned inventory persistence
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// All records stored for a scope (empty if never written)
    async fn load_scope(&self, scope: &ScopeKey) -> Result<Vec<InstanceRecord>>;

    /// Replace the stored records of a scope
    async fn save_scope(&self, scope: &ScopeKey, records: Vec<InstanceRecord>) -> Result<()>;

    /// Records across scopes, filtered and sorted by key
    async fn list(&self, filter: &InventoryFilter) -> Result<Vec<InstanceRecord>>;

    /// Persist a finalized run
    async fn record_run(&self, run: &DiscoveryRun) -> Result<()>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Open the store named in the configuration
///
/// The S3 store needs an SDK configuration carrying ambient credentials.
pub fn open(
    config: &StoreConfig,
    sdk_config: Option<&aws_config::SdkConfig>,
) -> Result<Arc<dyn InventoryStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemoryInventoryStore::new())),
        StoreConfig::File { path } => Ok(Arc::new(FileInventoryStore::new(path))),
        StoreConfig::S3 {
            bucket,
            prefix,
            region,
        } => {
            let sdk_config = sdk_config.ok_or_else(|| {
                DiscoveryError::config("the s3 store needs AWS configuration (not available with --fixtures)")
            })?;
            let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);
            if let Some(region) = region {
                builder = builder.region(aws_types::region::Region::new(region.clone()));
            }
            let client = aws_sdk_s3::Client::from_conf(builder.build());
            Ok(Arc::new(
                S3InventoryStore::new(client, bucket.clone()).with_prefix(prefix.clone()),
            ))
        }
    }
}

/// Sort records by composite key
pub(crate) fn sort_records(records: &mut [InstanceRecord]) {
    records.sort_by(|a, b| {
        (&a.account_id, &a.region, &a.instance_id).cmp(&(&b.account_id, &b.region, &b.instance_id))
    });
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryInventoryStore {
    scopes: RwLock<HashMap<ScopeKey, Vec<InstanceRecord>>>,
    runs: RwLock<Vec<DiscoveryRun>>,
}

impl MemoryInventoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs recorded so far
    pub async fn runs(&self) -> Vec<DiscoveryRun> {
        self.runs.read().await.clone()
    }
}

#[async_trait]
impl InventoryStore for MemoryInventoryStore {
    async fn load_scope(&self, scope: &ScopeKey) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .scopes
            .read()
            .await
            .get(scope)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_scope(&self, scope: &ScopeKey, mut records: Vec<InstanceRecord>) -> Result<()> {
        sort_records(&mut records);
        self.scopes.write().await.insert(scope.clone(), records);
        Ok(())
    }

    async fn list(&self, filter: &InventoryFilter) -> Result<Vec<InstanceRecord>> {
        let scopes = self.scopes.read().await;
        let mut out: Vec<InstanceRecord> = scopes
            .iter()
            .filter(|(scope, _)| filter.matches_scope(scope))
            .flat_map(|(_, records)| records.iter())
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_records(&mut out);
        Ok(out)
    }

    async fn record_run(&self, run: &DiscoveryRun) -> Result<()> {
        self.runs.write().await.push(run.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::{Environment, InstanceRecord};
    use chrono::Utc;
    use std::collections::BTreeMap;

    pub fn record(account: &str, region: &str, id: &str) -> InstanceRecord {
        InstanceRecord {
            account_id: account.to_string(),
            region: region.to_string(),
            instance_id: id.to_string(),
            engine: "postgres".to_string(),
            engine_version: "15.4".to_string(),
            instance_class: "db.t3.micro".to_string(),
            status: "available".to_string(),
            multi_az: false,
            storage_encrypted: true,
            deletion_protection: false,
            backup_retention_days: 7,
            tags: BTreeMap::new(),
            environment: Environment::Unknown,
            last_seen: Utc::now(),
            removed: false,
        }
    }
}
