//! S3 inventory store
//!
//! One object per scope at `<prefix>/scopes/<account_id>/<region>.json`
//! and one per finalized run at `<prefix>/runs/<run_id>.json`. A single
//! PUT replaces a scope, so a scope is never partially written.

use super::{InventoryFilter, InventoryStore, ScopeDocument, sort_records};
use crate::error::{DiscoveryError, Result};
use crate::types::{DiscoveryRun, InstanceRecord, ScopeKey};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

/// S3-backed inventory store
pub struct S3InventoryStore {
    /// S3 client
    client: Client,

    /// Bucket name
    bucket: String,

    /// Key prefix
    prefix: String,
}

impl S3InventoryStore {
    /// Create a store writing under the default prefix
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: crate::config::DEFAULT_S3_PREFIX.to_string(),
        }
    }

    /// Set key prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    fn scopes_prefix(&self) -> String {
        format!("{}/scopes/", self.prefix)
    }

    fn scope_key(&self, scope: &ScopeKey) -> String {
        format!("{}{}/{}.json", self.scopes_prefix(), scope.account_id, scope.region)
    }

    fn run_key(&self, run_id: &str) -> String {
        format!("{}/runs/{}.json", self.prefix, run_id)
    }

    async fn put_json(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| DiscoveryError::from_aws(DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn get_document(&self, key: &str) -> Result<Option<ScopeDocument>> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Ok(None);
                }
                return Err(DiscoveryError::from_aws(DisplayErrorContext(&service)));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| DiscoveryError::store(format!("reading s3://{}/{}: {}", self.bucket, key, e)))?
            .into_bytes();
        let doc = serde_json::from_slice(&bytes).map_err(|e| {
            DiscoveryError::store(format!("corrupt scope object s3://{}/{}: {}", self.bucket, key, e))
        })?;
        Ok(Some(doc))
    }

    async fn list_scope_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| DiscoveryError::from_aws(DisplayErrorContext(&e)))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key())
                    .filter(|k| k.ends_with(".json"))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl InventoryStore for S3InventoryStore {
    async fn load_scope(&self, scope: &ScopeKey) -> Result<Vec<InstanceRecord>> {
        Ok(self
            .get_document(&self.scope_key(scope))
            .await?
            .map(|doc| doc.records)
            .unwrap_or_default())
    }

    async fn save_scope(&self, scope: &ScopeKey, mut records: Vec<InstanceRecord>) -> Result<()> {
        sort_records(&mut records);
        let key = self.scope_key(scope);
        let doc = ScopeDocument::new(scope, records);
        self.put_json(&key, serde_json::to_vec(&doc)?).await?;
        debug!(
            scope = %scope,
            bucket = %self.bucket,
            key = %key,
            records = doc.records.len(),
            "Scope written"
        );
        Ok(())
    }

    async fn list(&self, filter: &InventoryFilter) -> Result<Vec<InstanceRecord>> {
        let prefix = match &filter.account_id {
            Some(account) => format!("{}{}/", self.scopes_prefix(), account),
            None => self.scopes_prefix(),
        };

        let mut out = Vec::new();
        for key in self.list_scope_keys(&prefix).await? {
            if let Some(doc) = self.get_document(&key).await? {
                let scope = ScopeKey::new(doc.account_id, doc.region);
                if filter.matches_scope(&scope) {
                    out.extend(doc.records.into_iter().filter(|r| filter.matches(r)));
                }
            }
        }
        sort_records(&mut out);
        Ok(out)
    }

    async fn record_run(&self, run: &DiscoveryRun) -> Result<()> {
        self.put_json(&self.run_key(&run.run_id), serde_json::to_vec(run)?)
            .await
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> S3InventoryStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        S3InventoryStore::new(Client::from_conf(config), "inventory-bucket").with_prefix("rds/")
    }

    #[test]
    fn test_object_keys() {
        let store = store();
        assert_eq!(
            store.scope_key(&ScopeKey::new("111111111111", "eu-west-1")),
            "rds/scopes/111111111111/eu-west-1.json"
        );
        assert_eq!(store.run_key("abc"), "rds/runs/abc.json");
        assert_eq!(store.describe(), "s3://inventory-bucket/rds");
    }
}
