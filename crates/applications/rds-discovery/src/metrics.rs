//! Run metrics
//!
//! One [`MetricsAggregator`] per run, shared by every worker. Counters are
//! atomics; error entries and warnings are appended under a mutex. The
//! final [`RunCounts`] snapshot is embedded in the run result and the run
//! history record.

use crate::classify::{ErrorEntry, Severity, Warning};
use crate::reconcile::ReconcileStats;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Counter snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Accounts a worker was started for
    pub accounts_attempted: u64,
    /// Accounts whose credentials were accepted by the provider
    pub accounts_scanned: u64,
    /// Accounts never started because the budget ran out
    pub accounts_skipped: u64,

    /// Region scans started
    pub regions_attempted: u64,
    /// Region scans that completed and reconciled
    pub regions_scanned: u64,
    /// Region scans that failed
    pub regions_failed: u64,
    /// Region scans never started (budget or credential short-circuit)
    pub regions_skipped: u64,

    /// Live instances observed this run
    pub instances_total: u64,
    /// Instances seen for the first time
    pub instances_new: u64,
    /// Instances whose attributes changed
    pub instances_updated: u64,
    /// Instances only refreshed
    pub instances_unchanged: u64,
    /// Instances newly marked removed
    pub instances_removed: u64,

    /// Low severity errors
    pub errors_low: u64,
    /// Medium severity errors
    pub errors_medium: u64,
    /// High severity errors
    pub errors_high: u64,
    /// Critical severity errors
    pub errors_critical: u64,

    /// Warnings
    pub warnings: u64,
}

impl RunCounts {
    /// Errors of every severity
    pub fn total_errors(&self) -> u64 {
        self.errors_low + self.errors_medium + self.errors_high + self.errors_critical
    }
}

/// Thread-safe accumulator for one run
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    accounts_attempted: AtomicU64,
    accounts_scanned: AtomicU64,
    accounts_skipped: AtomicU64,
    regions_attempted: AtomicU64,
    regions_scanned: AtomicU64,
    regions_failed: AtomicU64,
    regions_skipped: AtomicU64,
    instances_total: AtomicU64,
    instances_new: AtomicU64,
    instances_updated: AtomicU64,
    instances_unchanged: AtomicU64,
    instances_removed: AtomicU64,
    errors_low: AtomicU64,
    errors_medium: AtomicU64,
    errors_high: AtomicU64,
    errors_critical: AtomicU64,
    warning_count: AtomicU64,
    budget_exhausted: AtomicBool,

    errors: Mutex<Vec<ErrorEntry>>,
    warnings: Mutex<Vec<Warning>>,
}

impl MetricsAggregator {
    /// Empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// An account worker started
    pub fn account_attempted(&self) {
        self.accounts_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// An account's credentials were accepted
    pub fn account_scanned(&self) {
        self.accounts_scanned.fetch_add(1, Ordering::Relaxed);
    }

    /// An account was left undispatched
    pub fn account_skipped(&self) {
        self.accounts_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A region scan started
    pub fn region_attempted(&self) {
        self.regions_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// A region scan failed
    pub fn region_failed(&self) {
        self.regions_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Regions left undispatched
    pub fn regions_skipped(&self, n: u64) {
        self.regions_skipped.fetch_add(n, Ordering::Relaxed);
    }

    /// A region completed and its reconciliation stats
    pub fn region_scanned(&self, stats: &ReconcileStats) {
        self.regions_scanned.fetch_add(1, Ordering::Relaxed);
        self.instances_total
            .fetch_add(stats.observed() as u64, Ordering::Relaxed);
        self.instances_new.fetch_add(stats.new as u64, Ordering::Relaxed);
        self.instances_updated
            .fetch_add(stats.updated as u64, Ordering::Relaxed);
        self.instances_unchanged
            .fetch_add(stats.unchanged as u64, Ordering::Relaxed);
        self.instances_removed
            .fetch_add(stats.removed as u64, Ordering::Relaxed);
    }

    /// New work was refused because the run budget ran out
    pub fn mark_budget_exhausted(&self) {
        self.budget_exhausted.store(true, Ordering::Relaxed);
    }

    /// Whether the budget cut off any work
    pub fn budget_exhausted(&self) -> bool {
        self.budget_exhausted.load(Ordering::Relaxed)
    }

    /// Append a classified error
    pub async fn record_error(&self, entry: ErrorEntry) {
        let counter = match entry.severity {
            Severity::Low => &self.errors_low,
            Severity::Medium => &self.errors_medium,
            Severity::High => &self.errors_high,
            Severity::Critical => &self.errors_critical,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.errors.lock().await.push(entry);
    }

    /// Append warnings
    pub async fn record_warnings(&self, warnings: Vec<Warning>) {
        if warnings.is_empty() {
            return;
        }
        self.warning_count
            .fetch_add(warnings.len() as u64, Ordering::Relaxed);
        self.warnings.lock().await.extend(warnings);
    }

    /// Current counter values
    pub fn snapshot(&self) -> RunCounts {
        RunCounts {
            accounts_attempted: self.accounts_attempted.load(Ordering::Relaxed),
            accounts_scanned: self.accounts_scanned.load(Ordering::Relaxed),
            accounts_skipped: self.accounts_skipped.load(Ordering::Relaxed),
            regions_attempted: self.regions_attempted.load(Ordering::Relaxed),
            regions_scanned: self.regions_scanned.load(Ordering::Relaxed),
            regions_failed: self.regions_failed.load(Ordering::Relaxed),
            regions_skipped: self.regions_skipped.load(Ordering::Relaxed),
            instances_total: self.instances_total.load(Ordering::Relaxed),
            instances_new: self.instances_new.load(Ordering::Relaxed),
            instances_updated: self.instances_updated.load(Ordering::Relaxed),
            instances_unchanged: self.instances_unchanged.load(Ordering::Relaxed),
            instances_removed: self.instances_removed.load(Ordering::Relaxed),
            errors_low: self.errors_low.load(Ordering::Relaxed),
            errors_medium: self.errors_medium.load(Ordering::Relaxed),
            errors_high: self.errors_high.load(Ordering::Relaxed),
            errors_critical: self.errors_critical.load(Ordering::Relaxed),
            warnings: self.warning_count.load(Ordering::Relaxed),
        }
    }

    /// Collected errors and warnings, sorted for deterministic output
    pub async fn drain_findings(&self) -> (Vec<ErrorEntry>, Vec<Warning>) {
        let mut errors = std::mem::take(&mut *self.errors.lock().await);
        let mut warnings = std::mem::take(&mut *self.warnings.lock().await);
        errors.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        warnings.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        (errors, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ErrorType, Scope};
    use std::sync::Arc;

    fn entry(account: &str, severity: Severity) -> ErrorEntry {
        ErrorEntry {
            scope: Scope::Account,
            account_id: account.to_string(),
            region: None,
            instance_id: None,
            error_type: ErrorType::CrossAccountAccess,
            severity,
            message: "m".to_string(),
            remediation: "r".to_string(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends() {
        let metrics = Arc::new(MetricsAggregator::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                metrics.account_attempted();
                let severity = if i % 2 == 0 { Severity::High } else { Severity::Low };
                metrics.record_error(entry(&format!("{:012}", i), severity)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let counts = metrics.snapshot();
        assert_eq!(counts.accounts_attempted, 20);
        assert_eq!(counts.errors_high, 10);
        assert_eq!(counts.errors_low, 10);
        assert_eq!(counts.total_errors(), 20);

        let (errors, _) = metrics.drain_findings().await;
        assert_eq!(errors.len(), 20);
        assert_eq!(errors[0].account_id, "000000000000");
        assert_eq!(errors[19].account_id, "000000000019");
    }

    #[test]
    fn test_region_scanned_rolls_up_stats() {
        let metrics = MetricsAggregator::new();
        metrics.region_scanned(&ReconcileStats {
            new: 2,
            updated: 1,
            unchanged: 3,
            removed: 1,
        });
        let counts = metrics.snapshot();
        assert_eq!(counts.regions_scanned, 1);
        assert_eq!(counts.instances_total, 6);
        assert_eq!(counts.instances_new, 2);
        assert_eq!(counts.instances_removed, 1);
    }

    #[test]
    fn test_budget_flag() {
        let metrics = MetricsAggregator::new();
        assert!(!metrics.budget_exhausted());
        metrics.mark_budget_exhausted();
        assert!(metrics.budget_exhausted());
    }
}
