//! Offline provider
//!
//! [`FixtureProvider`] implements both provider seams from a JSON document
//! (or from builder calls in tests), so the whole engine can run without
//! AWS credentials. Region pages use the `DescribeDBInstances` field
//! names, so `aws rds describe-db-instances` output can be pasted in.
//!
//! ```json
//! {
//!   "accounts": {
//!     "111111111111": {
//!       "regions": {
//!         "us-east-1": { "pages": [ { "DBInstances": [ { "DBInstanceIdentifier": "orders", "Engine": "postgres" } ] } ] },
//!         "eu-west-1": { "fault": { "kind": "service", "code": "OptInRequired", "message": "region disabled" } }
//!       }
//!     },
//!     "222222222222": {
//!       "assume_fault": { "kind": "service", "code": "AccessDenied", "message": "not authorized" }
//!     }
//!   }
//! }
//! ```
//!
//! Unknown accounts assume successfully and own no instances; unknown
//! regions list empty.

use crate::config::AccountTarget;
use crate::error::{DiscoveryError, Result};
use crate::provider::{AccessContext, InstanceLister, ProviderFault, RawInstance, RawPage, RawTag, RoleExchange};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Fixture behavior for one region of one account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionFixture {
    /// Pages returned in order; markers are generated
    #[serde(default)]
    pub pages: Vec<RawPage>,

    /// Every listing call fails with this fault
    #[serde(default)]
    pub fault: Option<ProviderFault>,

    /// Fault returned when this page index is requested (mid-pagination failure)
    #[serde(default)]
    pub fault_on_page: Option<usize>,

    /// The first N listing calls are throttled
    #[serde(default)]
    pub throttle_first: u32,

    /// Artificial latency per call
    #[serde(default)]
    pub delay_ms: u64,
}

/// Fixture behavior for one account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountFixture {
    /// Role exchange fails with this fault
    #[serde(default)]
    pub assume_fault: Option<ProviderFault>,

    /// The first N role exchanges are throttled
    #[serde(default)]
    pub assume_throttle_first: u32,

    /// Every listing call in every region fails with this fault
    #[serde(default)]
    pub listing_fault: Option<ProviderFault>,

    /// Regions the account has enabled
    #[serde(default)]
    pub enabled_regions: Option<Vec<String>>,

    /// Per-region behavior
    #[serde(default)]
    pub regions: BTreeMap<String, RegionFixture>,
}

/// Top-level fixture document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDocument {
    /// Per-account behavior keyed by account id
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountFixture>,
}

/// Build a raw record with the required fields and an optional environment tag
pub fn raw_instance(identifier: &str, engine: &str, environment: Option<&str>) -> RawInstance {
    RawInstance {
        identifier: Some(identifier.to_string()),
        engine: Some(engine.to_string()),
        engine_version: Some("15.4".to_string()),
        instance_class: Some("db.t3.medium".to_string()),
        status: Some("available".to_string()),
        multi_az: Some(false),
        storage_encrypted: Some(true),
        deletion_protection: Some(false),
        backup_retention_period: Some(7),
        tags: environment
            .map(|env| {
                vec![RawTag {
                    key: Some("Environment".to_string()),
                    value: Some(env.to_string()),
                }]
            })
            .unwrap_or_default(),
    }
}

/// Document-driven implementation of both provider seams
#[derive(Debug, Default)]
pub struct FixtureProvider {
    doc: FixtureDocument,
    attempts: Mutex<HashMap<String, u32>>,
    list_calls: AtomicU64,
    assume_calls: AtomicU64,
    lists_in_flight: AtomicUsize,
    max_lists_in_flight: AtomicUsize,
}

impl FixtureProvider {
    /// Empty provider: every account assumes and lists nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider over a parsed document
    pub fn from_document(doc: FixtureDocument) -> Self {
        Self {
            doc,
            ..Default::default()
        }
    }

    /// Load a JSON fixture file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryError::fixture(format!("cannot read {}: {}", path.display(), e))
        })?;
        let doc: FixtureDocument = serde_json::from_str(&raw).map_err(|e| {
            DiscoveryError::fixture(format!("invalid fixture {}: {}", path.display(), e))
        })?;
        Ok(Self::from_document(doc))
    }

    fn account_mut(&mut self, account_id: &str) -> &mut AccountFixture {
        self.doc.accounts.entry(account_id.to_string()).or_default()
    }

    fn region_mut(&mut self, account_id: &str, region: &str) -> &mut RegionFixture {
        self.account_mut(account_id)
            .regions
            .entry(region.to_string())
            .or_default()
    }

    /// One page of instances in a region
    pub fn with_instances(mut self, account_id: &str, region: &str, instances: Vec<RawInstance>) -> Self {
        self.region_mut(account_id, region).pages = vec![RawPage {
            instances,
            next_marker: None,
        }];
        self
    }

    /// Several pages of instances in a region
    pub fn with_pages(mut self, account_id: &str, region: &str, pages: Vec<Vec<RawInstance>>) -> Self {
        self.region_mut(account_id, region).pages = pages
            .into_iter()
            .map(|instances| RawPage {
                instances,
                next_marker: None,
            })
            .collect();
        self
    }

    /// Region listing always fails
    pub fn with_region_fault(mut self, account_id: &str, region: &str, fault: ProviderFault) -> Self {
        self.region_mut(account_id, region).fault = Some(fault);
        self
    }

    /// Region listing fails when page `index` is requested
    pub fn with_fault_on_page(mut self, account_id: &str, region: &str, index: usize, fault: ProviderFault) -> Self {
        let region = self.region_mut(account_id, region);
        region.fault_on_page = Some(index);
        region.fault = Some(fault);
        self
    }

    /// First `n` listing calls in a region are throttled
    pub fn with_region_throttle(mut self, account_id: &str, region: &str, n: u32) -> Self {
        self.region_mut(account_id, region).throttle_first = n;
        self
    }

    /// Listing calls in a region take `delay`
    pub fn with_region_delay(mut self, account_id: &str, region: &str, delay: Duration) -> Self {
        self.region_mut(account_id, region).delay_ms = delay.as_millis() as u64;
        self
    }

    /// Role exchange fails
    pub fn with_assume_fault(mut self, account_id: &str, fault: ProviderFault) -> Self {
        self.account_mut(account_id).assume_fault = Some(fault);
        self
    }

    /// First `n` role exchanges are throttled
    pub fn with_assume_throttle(mut self, account_id: &str, n: u32) -> Self {
        self.account_mut(account_id).assume_throttle_first = n;
        self
    }

    /// Every listing call in the account fails
    pub fn with_listing_fault(mut self, account_id: &str, fault: ProviderFault) -> Self {
        self.account_mut(account_id).listing_fault = Some(fault);
        self
    }

    /// Regions enabled in the account
    pub fn with_enabled_regions<I, S>(mut self, account_id: &str, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.account_mut(account_id).enabled_regions = Some(regions.into_iter().map(Into::into).collect());
        self
    }

    /// Listing calls made so far
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Role exchanges made so far
    pub fn assume_calls(&self) -> u64 {
        self.assume_calls.load(Ordering::SeqCst)
    }

    /// Most listing calls that were running at the same time
    pub fn max_in_flight_lists(&self) -> usize {
        self.max_lists_in_flight.load(Ordering::SeqCst)
    }

    /// Bump and return the attempt counter for `key` (1-based)
    async fn attempt(&self, key: String) -> u32 {
        let mut attempts = self.attempts.lock().await;
        let n = attempts.entry(key).or_insert(0);
        *n += 1;
        *n
    }

    fn throttled(what: &str) -> ProviderFault {
        ProviderFault::service("Throttling", format!("Rate exceeded ({})", what))
    }

    async fn page(
        &self,
        ctx: &AccessContext,
        region: &str,
        marker: Option<String>,
    ) -> std::result::Result<RawPage, ProviderFault> {
        let Some(account) = self.doc.accounts.get(&ctx.account_id) else {
            return Ok(RawPage::default());
        };
        if let Some(fault) = &account.listing_fault {
            return Err(fault.clone());
        }
        let Some(fixture) = account.regions.get(region) else {
            return Ok(RawPage::default());
        };

        if fixture.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(fixture.delay_ms)).await;
        }
        if fixture.throttle_first > 0 {
            let n = self.attempt(format!("list:{}:{}", ctx.account_id, region)).await;
            if n <= fixture.throttle_first {
                return Err(Self::throttled("rds:DescribeDBInstances"));
            }
        }

        let index = page_index(marker.as_deref())?;
        if let Some(fault) = &fixture.fault
            && fixture.fault_on_page.is_none_or(|at| at == index)
        {
            return Err(fault.clone());
        }

        let Some(page) = fixture.pages.get(index) else {
            return Ok(RawPage::default());
        };
        let next_marker = (index + 1 < fixture.pages.len()).then(|| format!("page-{}", index + 1));
        Ok(RawPage {
            instances: page.instances.clone(),
            next_marker,
        })
    }
}

fn page_index(marker: Option<&str>) -> std::result::Result<usize, ProviderFault> {
    match marker {
        None => Ok(0),
        Some(m) => m
            .strip_prefix("page-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ProviderFault::service("InvalidParameterValue", format!("unknown marker {}", m))),
    }
}

#[async_trait]
impl RoleExchange for FixtureProvider {
    fn ambient(&self, account: &AccountTarget) -> AccessContext {
        AccessContext::ambient(&account.account_id)
    }

    async fn assume(
        &self,
        account: &AccountTarget,
        role_arn: &str,
        _session_name: &str,
    ) -> std::result::Result<AccessContext, ProviderFault> {
        self.assume_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fixture) = self.doc.accounts.get(&account.account_id) {
            if fixture.assume_throttle_first > 0 {
                let n = self.attempt(format!("assume:{}", account.account_id)).await;
                if n <= fixture.assume_throttle_first {
                    return Err(Self::throttled("sts:AssumeRole"));
                }
            }
            if let Some(fault) = &fixture.assume_fault {
                return Err(fault.clone());
            }
        }
        Ok(AccessContext::assumed(
            &account.account_id,
            role_arn,
            Some(Utc::now() + ChronoDuration::minutes(15)),
        ))
    }
}

#[async_trait]
impl InstanceLister for FixtureProvider {
    async fn list_page(
        &self,
        ctx: &AccessContext,
        region: &str,
        marker: Option<String>,
    ) -> std::result::Result<RawPage, ProviderFault> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let running = self.lists_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_lists_in_flight.fetch_max(running, Ordering::SeqCst);

        let page = self.page(ctx, region, marker).await;
        self.lists_in_flight.fetch_sub(1, Ordering::SeqCst);
        page
    }

    async fn enabled_regions(&self, ctx: &AccessContext) -> std::result::Result<Vec<String>, ProviderFault> {
        self.doc
            .accounts
            .get(&ctx.account_id)
            .and_then(|a| a.enabled_regions.clone())
            .ok_or_else(|| {
                ProviderFault::service(
                    "UnauthorizedOperation",
                    format!("fixture defines no enabled regions for {}", ctx.account_id),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> AccountTarget {
        AccountTarget::remote("222222222222", "remote", "Reader", "tok")
    }

    #[tokio::test]
    async fn test_pages_and_markers() {
        let provider = FixtureProvider::new().with_pages(
            "222222222222",
            "us-east-1",
            vec![
                vec![raw_instance("a", "postgres", None)],
                vec![raw_instance("b", "mysql", None)],
            ],
        );
        let ctx = provider.assume(&remote(), "arn", "s").await.unwrap();

        let first = provider.list_page(&ctx, "us-east-1", None).await.unwrap();
        assert_eq!(first.instances.len(), 1);
        assert_eq!(first.next_marker.as_deref(), Some("page-1"));

        let second = provider
            .list_page(&ctx, "us-east-1", first.next_marker)
            .await
            .unwrap();
        assert_eq!(second.instances[0].identifier.as_deref(), Some("b"));
        assert!(second.next_marker.is_none());
        assert_eq!(provider.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_tracks_concurrent_listings() {
        let provider = FixtureProvider::new()
            .with_region_delay("222222222222", "us-east-1", Duration::from_millis(30))
            .with_region_delay("222222222222", "eu-west-1", Duration::from_millis(30));
        let ctx = provider.assume(&remote(), "arn", "s").await.unwrap();

        provider.list_page(&ctx, "us-east-1", None).await.unwrap();
        assert_eq!(provider.max_in_flight_lists(), 1);

        let (a, b) = tokio::join!(
            provider.list_page(&ctx, "us-east-1", None),
            provider.list_page(&ctx, "eu-west-1", None)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(provider.max_in_flight_lists(), 2);
    }

    #[tokio::test]
    async fn test_throttle_then_succeed() {
        let provider = FixtureProvider::new().with_assume_throttle("222222222222", 2);
        assert!(provider.assume(&remote(), "arn", "s").await.is_err());
        assert!(provider.assume(&remote(), "arn", "s").await.is_err());
        assert!(provider.assume(&remote(), "arn", "s").await.is_ok());
        assert_eq!(provider.assume_calls(), 3);
    }

    #[tokio::test]
    async fn test_fault_on_later_page_only() {
        let provider = FixtureProvider::new()
            .with_pages(
                "222222222222",
                "us-east-1",
                vec![vec![raw_instance("a", "postgres", None)], vec![]],
            )
            .with_fault_on_page("222222222222", "us-east-1", 1, ProviderFault::timeout("slow"));
        let ctx = AccessContext::assumed("222222222222", "arn", None);

        let first = provider.list_page(&ctx, "us-east-1", None).await.unwrap();
        assert!(provider
            .list_page(&ctx, "us-east-1", first.next_marker)
            .await
            .is_err());
    }

    #[test]
    fn test_document_parses_api_shaped_pages() {
        let doc: FixtureDocument = serde_json::from_str(
            r#"{
                "accounts": {
                    "111111111111": {
                        "regions": {
                            "us-east-1": { "pages": [ { "DBInstances": [ { "DBInstanceIdentifier": "orders", "Engine": "postgres" } ] } ] },
                            "eu-west-1": { "fault": { "kind": "service", "code": "OptInRequired", "message": "disabled" } }
                        }
                    },
                    "222222222222": { "assume_fault": { "kind": "service", "code": "AccessDenied", "message": "no" } }
                }
            }"#,
        )
        .unwrap();

        let east = &doc.accounts["111111111111"].regions["us-east-1"];
        assert_eq!(east.pages[0].instances.len(), 1);
        assert!(doc.accounts["222222222222"].assume_fault.is_some());
    }

    #[test]
    fn test_from_file_reports_fixture_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[").unwrap();
        let err = FixtureProvider::from_file(&path).unwrap_err();
        assert!(matches!(err, DiscoveryError::Fixture(_)));
    }
}
