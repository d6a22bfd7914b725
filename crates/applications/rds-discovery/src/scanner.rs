//! Region scanner
//!
//! Walks every page of the listing call for one (account, region) scope.
//! Each page request is retried on transient faults with the shared
//! policy; a fault that survives the retries fails the whole scope, even
//! mid-pagination, because a partial listing must never drive removal.
//!
//! Inside a page, a record missing a required field is skipped with an
//! instance-scoped warning. The rest of the page is kept.

use crate::classify::Warning;
use crate::normalize::normalize;
use crate::provider::{AccessContext, InstanceLister, ProviderFault, RawPage};
use crate::retry::RetryPolicy;
use crate::types::InstanceRecord;
use async_stream::try_stream;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one successful region scan
#[derive(Debug, Default)]
pub struct ScanOutput {
    /// Canonical records, one per valid raw record
    pub records: Vec<InstanceRecord>,
    /// Skipped malformed records
    pub warnings: Vec<Warning>,
    /// Pages fetched
    pub pages: usize,
}

/// Lists and normalizes the instances of one scope
pub struct RegionScanner {
    lister: Arc<dyn InstanceLister>,
    retry: RetryPolicy,
}

impl RegionScanner {
    /// Create a scanner
    pub fn new(lister: Arc<dyn InstanceLister>, retry: RetryPolicy) -> Self {
        Self { lister, retry }
    }

    /// Pages of the listing call, each retried independently
    pub fn pages<'a>(
        &'a self,
        ctx: &'a AccessContext,
        region: &'a str,
    ) -> impl Stream<Item = Result<RawPage, ProviderFault>> + 'a {
        try_stream! {
            let mut marker: Option<String> = None;
            loop {
                let page = self
                    .retry
                    .run(
                        "rds:DescribeDBInstances",
                        |fault: &ProviderFault| fault.is_transient(),
                        || self.lister.list_page(ctx, region, marker.clone()),
                    )
                    .await?;

                let next = page.next_marker.clone();
                yield page;

                match next {
                    Some(next) if Some(&next) != marker.as_ref() => marker = Some(next),
                    Some(repeated) => {
                        warn!(region = %region, marker = %repeated, "Listing returned the same marker twice");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    /// Scan one region of one account
    pub async fn scan(
        &self,
        ctx: &AccessContext,
        region: &str,
    ) -> Result<ScanOutput, ProviderFault> {
        let observed_at = Utc::now();
        let mut output = ScanOutput::default();

        let pages = self.pages(ctx, region);
        pin_mut!(pages);

        while let Some(page) = pages.next().await {
            let page = page?;
            output.pages += 1;

            for raw in page.instances {
                match raw.validate() {
                    Ok(listed) => output
                        .records
                        .push(normalize(listed, &ctx.account_id, region, observed_at)),
                    Err(missing) => {
                        warn!(
                            account_id = %ctx.account_id,
                            region = %region,
                            instance_id = ?missing.identifier,
                            field = missing.field,
                            "Skipping malformed record"
                        );
                        output
                            .warnings
                            .push(Warning::malformed_record(&ctx.account_id, region, &missing));
                    }
                }
            }
        }

        debug!(
            account_id = %ctx.account_id,
            region = %region,
            pages = output.pages,
            instances = output.records.len(),
            skipped = output.warnings.len(),
            "Region listed"
        );
        Ok(output)
    }
}
