//! Discovery orchestrator
//!
//! Entry point for one run. Resolves the account x region matrix, drives
//! the broker, scanner and reconciler with two bounded worker pools, and
//! always returns a single [`DiscoveryResult`].
//!
//! ## Failure isolation
//!
//! - A role exchange failure stops only that account.
//! - A region failure stops only that region. Its stored records are left
//!   untouched (no removal marking without a successful scan).
//! - A malformed record skips only that record.
//! - A rejected execution identity (`invalid_credentials`) stops further
//!   regions of the same account and is recorded once at account scope.
//!
//! ## Run budget
//!
//! New account and region work is dispatched only while
//! `now + dispatch_margin < deadline`. Work already in flight finishes or
//! times out on its own. Skipped work is counted, not reported as an error.

use crate::classify::{ErrorClassifier, ErrorEntry, ErrorType, Scope, Warning};
use crate::config::{AccountTarget, DiscoveryConfig, RegionDiscovery};
use crate::credentials::CredentialBroker;
use crate::metrics::{MetricsAggregator, RunCounts};
use crate::provider::{AccessContext, InstanceLister, ProviderFault, RoleExchange};
use crate::reconcile::reconcile;
use crate::retry::RetryPolicy;
use crate::scanner::RegionScanner;
use crate::store::InventoryStore;
use crate::types::{DiscoveryRun, Invocation, RunStatus, ScopeKey, TriggerSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Output contract of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Live instances observed across every scanned scope
    pub total_instances: u64,

    /// Accounts a worker was started for
    pub accounts_attempted: u64,

    /// Accounts whose credentials were accepted
    pub accounts_scanned: u64,

    /// Regions scanned and reconciled
    pub regions_scanned: u64,

    /// Terminal run status
    pub execution_status: RunStatus,

    /// Classified errors, sorted by account, region, instance and type
    pub errors: Vec<ErrorEntry>,

    /// Data-quality warnings
    pub warnings: Vec<Warning>,

    /// Run identifier
    pub run_id: String,

    /// What started the run
    pub trigger_source: TriggerSource,

    /// Run start
    pub started_at: Option<DateTime<Utc>>,

    /// Run end
    pub ended_at: Option<DateTime<Utc>>,

    /// Work was left undispatched because the run budget ran out
    pub budget_exhausted: bool,

    /// Every aggregator counter
    pub metrics: RunCounts,
}

/// Wall-clock budget for dispatching new work
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    deadline: Instant,
    margin: Duration,
}

impl RunBudget {
    /// Budget starting now
    pub fn start(budget: Duration, margin: Duration) -> Self {
        Self {
            deadline: Instant::now() + budget,
            margin,
        }
    }

    /// New work may still be launched
    pub fn allows_dispatch(&self) -> bool {
        Instant::now() + self.margin < self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// How one region scan ended
#[derive(Debug)]
enum RegionOutcome {
    Scanned,
    Failed,
    CredentialsRejected(ProviderFault),
}

/// Shared state of one run, handed to every worker
struct RunContext {
    config: Arc<DiscoveryConfig>,
    broker: CredentialBroker,
    scanner: RegionScanner,
    lister: Arc<dyn InstanceLister>,
    classifier: Arc<ErrorClassifier>,
    store: Arc<dyn InventoryStore>,
    metrics: MetricsAggregator,
    budget: RunBudget,
    retry: RetryPolicy,
}

/// Runs discovery over the configured account x region matrix
pub struct Orchestrator {
    config: Arc<DiscoveryConfig>,
    exchange: Arc<dyn RoleExchange>,
    lister: Arc<dyn InstanceLister>,
    store: Arc<dyn InventoryStore>,
}

impl Orchestrator {
    /// Create an orchestrator from separate seams
    pub fn new(
        config: Arc<DiscoveryConfig>,
        exchange: Arc<dyn RoleExchange>,
        lister: Arc<dyn InstanceLister>,
        store: Arc<dyn InventoryStore>,
    ) -> Self {
        Self {
            config,
            exchange,
            lister,
            store,
        }
    }

    /// Create an orchestrator over a provider implementing both seams
    pub fn with_provider<P>(
        config: Arc<DiscoveryConfig>,
        provider: Arc<P>,
        store: Arc<dyn InventoryStore>,
    ) -> Self
    where
        P: RoleExchange + InstanceLister + 'static,
    {
        Self::new(config, provider.clone(), provider, store)
    }

    /// Execute one run. Partial failures are recorded, never raised.
    pub async fn run(&self, invocation: Invocation) -> DiscoveryResult {
        let mut run = DiscoveryRun::new(invocation);
        if let Err(e) = run.start() {
            error!(run_id = %run.run_id, error = %e, "Run did not start cleanly");
        }

        let classifier = Arc::new(ErrorClassifier::from_config(&self.config));
        let retry = self.config.retry_policy();
        let ctx = Arc::new(RunContext {
            config: self.config.clone(),
            broker: CredentialBroker::new(
                self.exchange.clone(),
                classifier.clone(),
                &self.config,
                &run.run_id,
            ),
            scanner: RegionScanner::new(self.lister.clone(), retry.clone()),
            lister: self.lister.clone(),
            classifier,
            store: self.store.clone(),
            metrics: MetricsAggregator::new(),
            budget: RunBudget::start(self.config.run_budget(), self.config.dispatch_margin()),
            retry,
        });

        let accounts: Vec<AccountTarget> = self.config.enabled_accounts().cloned().collect();
        info!(
            run_id = %run.run_id,
            trigger = ?run.invocation.trigger_source,
            accounts = accounts.len(),
            account_concurrency = self.config.account_concurrency,
            region_concurrency = self.config.region_concurrency,
            store = %self.store.describe(),
            "🚀 Discovery run starting"
        );

        dispatch_accounts(&ctx, accounts).await;

        let counts = ctx.metrics.snapshot();
        if counts.accounts_attempted == 0 && counts.accounts_skipped > 0 {
            warn!(
                run_id = %run.run_id,
                skipped = counts.accounts_skipped,
                "⏱️  Run budget left no time to dispatch any account"
            );
        }
        let status = run_status(&counts);

        if let Err(e) = run.finalize(status, counts.clone()) {
            error!(run_id = %run.run_id, error = %e, "Run finalization rejected");
        }
        if let Err(e) = self.store.record_run(&run).await {
            warn!(run_id = %run.run_id, error = %e, "Failed to record run history");
        }

        let (errors, warnings) = ctx.metrics.drain_findings().await;
        let result = DiscoveryResult {
            total_instances: counts.instances_total,
            accounts_attempted: counts.accounts_attempted,
            accounts_scanned: counts.accounts_scanned,
            regions_scanned: counts.regions_scanned,
            execution_status: run.status,
            errors,
            warnings,
            run_id: run.run_id.clone(),
            trigger_source: run.invocation.trigger_source,
            started_at: run.started_at,
            ended_at: run.ended_at,
            budget_exhausted: ctx.metrics.budget_exhausted(),
            metrics: counts,
        };

        let finished = match result.execution_status {
            RunStatus::Failed => "❌ Discovery run failed",
            RunStatus::CompletedWithErrors => "⚠️  Discovery run completed with errors",
            _ => "✅ Discovery run completed",
        };
        info!(
            run_id = %result.run_id,
            status = %result.execution_status,
            instances = result.total_instances,
            accounts_scanned = result.accounts_scanned,
            accounts_attempted = result.accounts_attempted,
            regions_scanned = result.regions_scanned,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            budget_exhausted = result.budget_exhausted,
            "{}",
            finished
        );

        result
    }
}

/// Terminal status from the final counters
///
/// `Failed` only when accounts were attempted and none of them got past
/// account-scope failures (role exchange or rejected credentials). Work the
/// budget never dispatched is not a failure.
fn run_status(counts: &RunCounts) -> RunStatus {
    if counts.accounts_attempted > 0 && counts.accounts_scanned == 0 {
        RunStatus::Failed
    } else if counts.total_errors() > 0 {
        RunStatus::CompletedWithErrors
    } else {
        RunStatus::CompletedSuccess
    }
}

/// Account worker pool (N concurrent accounts)
async fn dispatch_accounts(ctx: &Arc<RunContext>, accounts: Vec<AccountTarget>) {
    let semaphore = Arc::new(Semaphore::new(ctx.config.account_concurrency));
    let mut workers = JoinSet::new();

    for account in accounts {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if !ctx.budget.allows_dispatch() {
            warn!(
                account_id = %account.account_id,
                "⏱️  Run budget reached, account not dispatched"
            );
            ctx.metrics.account_skipped();
            ctx.metrics.mark_budget_exhausted();
            continue;
        }

        let ctx = ctx.clone();
        let span = info_span!("account", account_id = %account.account_id);
        workers.spawn(
            async move {
                let _permit = permit;
                scan_account(ctx, account).await;
            }
            .instrument(span),
        );
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Account worker aborted");
        }
    }
}

/// Regions to scan for one account
async fn resolve_regions(ctx: &RunContext, account: &AccountTarget, access: &AccessContext) -> Vec<String> {
    let configured = ctx.config.regions_for(account);
    if ctx.config.region_discovery != RegionDiscovery::EnabledInAccount {
        return configured;
    }

    let enabled = ctx
        .retry
        .run(
            "ec2:DescribeRegions",
            |fault: &ProviderFault| fault.is_transient(),
            || ctx.lister.enabled_regions(access),
        )
        .await;

    match enabled {
        Ok(enabled) => {
            let (keep, dropped): (Vec<String>, Vec<String>) =
                configured.into_iter().partition(|r| enabled.contains(r));
            if !dropped.is_empty() {
                debug!(
                    account_id = %account.account_id,
                    regions = ?dropped,
                    "Regions not enabled in account, skipping"
                );
            }
            keep
        }
        Err(fault) => {
            warn!(
                account_id = %account.account_id,
                error = %fault,
                "Could not resolve enabled regions, using configured list"
            );
            configured
        }
    }
}

/// One account: credentials, then the region worker pool (M concurrent regions)
async fn scan_account(ctx: Arc<RunContext>, account: AccountTarget) {
    ctx.metrics.account_attempted();

    let access = match ctx.broker.acquire(&account).await {
        Ok(access) => Arc::new(access),
        Err(entry) => {
            ctx.metrics.record_error(entry).await;
            return;
        }
    };

    let regions = resolve_regions(&ctx, &account, &access).await;
    if regions.is_empty() {
        info!(account_id = %account.account_id, "No regions to scan");
        ctx.metrics.account_scanned();
        return;
    }

    let rejected = Arc::new(AtomicBool::new(false));
    let semaphore = Arc::new(Semaphore::new(ctx.config.region_concurrency));
    let mut workers = JoinSet::new();
    let mut skipped = 0u64;

    for region in regions {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if rejected.load(Ordering::SeqCst) {
            skipped += 1;
            continue;
        }
        if !ctx.budget.allows_dispatch() {
            warn!(
                account_id = %account.account_id,
                region = %region,
                "⏱️  Run budget reached, region not dispatched"
            );
            ctx.metrics.mark_budget_exhausted();
            skipped += 1;
            continue;
        }

        let ctx = ctx.clone();
        let account = account.clone();
        let access = access.clone();
        let rejected = rejected.clone();
        let span = info_span!("region", region = %region);
        workers.spawn(
            async move {
                let _permit = permit;
                scan_region(&ctx, &account, &access, &region, &rejected).await
            }
            .instrument(span),
        );
    }

    let mut scanned = 0u64;
    let mut failed = 0u64;
    let mut rejection: Option<ProviderFault> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(RegionOutcome::Scanned) => scanned += 1,
            Ok(RegionOutcome::Failed) => failed += 1,
            Ok(RegionOutcome::CredentialsRejected(fault)) => {
                failed += 1;
                rejection.get_or_insert(fault);
            }
            Err(e) => {
                error!(account_id = %account.account_id, error = %e, "Region worker aborted");
                ctx.metrics.region_failed();
                failed += 1;
            }
        }
    }
    ctx.metrics.regions_skipped(skipped);

    if let Some(fault) = rejection {
        warn!(
            account_id = %account.account_id,
            error = %fault,
            skipped_regions = skipped,
            "🔒 Credentials rejected, account abandoned"
        );
        let entry = ctx.classifier.classify(&fault, Scope::Account, &account, None);
        ctx.metrics.record_error(entry).await;
    }

    if scanned > 0 || rejection.is_none() {
        ctx.metrics.account_scanned();
    }

    info!(
        account_id = %account.account_id,
        account = %account.label(),
        regions_scanned = scanned,
        regions_failed = failed,
        regions_skipped = skipped,
        "Account finished"
    );
}

/// One (account, region) scope: scan, then reconcile
async fn scan_region(
    ctx: &RunContext,
    account: &AccountTarget,
    access: &AccessContext,
    region: &str,
    rejected: &AtomicBool,
) -> RegionOutcome {
    ctx.metrics.region_attempted();

    let output = match ctx.scanner.scan(access, region).await {
        Ok(output) => output,
        Err(fault) => {
            ctx.metrics.region_failed();
            if ErrorType::from_fault(&fault) == ErrorType::InvalidCredentials {
                rejected.store(true, Ordering::SeqCst);
                return RegionOutcome::CredentialsRejected(fault);
            }
            warn!(
                account_id = %account.account_id,
                region = %region,
                error = %fault,
                "Region scan failed"
            );
            let entry = ctx
                .classifier
                .classify(&fault, Scope::Region, account, Some(region));
            ctx.metrics.record_error(entry).await;
            return RegionOutcome::Failed;
        }
    };

    ctx.metrics.record_warnings(output.warnings).await;

    let scope = ScopeKey::new(&account.account_id, region);
    match reconcile(&scope, output.records, ctx.store.as_ref()).await {
        Ok(stats) => {
            ctx.metrics.region_scanned(&stats);
            debug!(
                scope = %scope,
                instances = stats.observed(),
                removed = stats.removed,
                "Region scanned"
            );
            RegionOutcome::Scanned
        }
        Err(e) => {
            ctx.metrics.region_failed();
            warn!(scope = %scope, error = %e, "Inventory write failed");
            let fault = ProviderFault::service("InventoryStoreError", e.to_string());
            let mut entry = ctx
                .classifier
                .classify(&fault, Scope::Region, account, Some(region));
            entry.message = format!("writing inventory for {} failed: {}", scope, e);
            ctx.metrics.record_error(entry).await;
            RegionOutcome::Failed
        }
    }
}
