//! Local JSON directory store
//!
//! Layout under the root directory:
//!
//! ```text
//! scopes/<account_id>/<region>.json   one ScopeDocument per scope
//! runs/<run_id>.json                  finalized discovery runs
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so readers never observe a half-written scope.

use super::{InventoryFilter, InventoryStore, ScopeDocument, sort_records};
use crate::error::{DiscoveryError, Result};
use crate::types::{DiscoveryRun, InstanceRecord, ScopeKey};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Directory-backed inventory store
#[derive(Debug, Clone)]
pub struct FileInventoryStore {
    root: PathBuf,
}

impl FileInventoryStore {
    /// Store rooted at `root` (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn scopes_dir(&self) -> PathBuf {
        self.root.join("scopes")
    }

    fn scope_path(&self, scope: &ScopeKey) -> PathBuf {
        self.scopes_dir()
            .join(&scope.account_id)
            .join(format!("{}.json", scope.region))
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", run_id))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| DiscoveryError::store(format!("{} has no parent", path.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_document(path: &Path) -> Result<Option<ScopeDocument>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes).map_err(|e| {
                    DiscoveryError::store(format!("corrupt scope file {}: {}", path.display(), e))
                })?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Subdirectory names, or nothing if `dir` does not exist
    async fn entries(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            out.push(entry.path());
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl InventoryStore for FileInventoryStore {
    async fn load_scope(&self, scope: &ScopeKey) -> Result<Vec<InstanceRecord>> {
        Ok(Self::read_document(&self.scope_path(scope))
            .await?
            .map(|doc| doc.records)
            .unwrap_or_default())
    }

    async fn save_scope(&self, scope: &ScopeKey, mut records: Vec<InstanceRecord>) -> Result<()> {
        sort_records(&mut records);
        let path = self.scope_path(scope);
        let doc = ScopeDocument::new(scope, records);
        let bytes = serde_json::to_vec_pretty(&doc)?;
        Self::write_atomic(&path, &bytes).await?;
        debug!(scope = %scope, path = %path.display(), records = doc.records.len(), "Scope written");
        Ok(())
    }

    async fn list(&self, filter: &InventoryFilter) -> Result<Vec<InstanceRecord>> {
        let mut out = Vec::new();
        for account_dir in Self::entries(&self.scopes_dir()).await? {
            if !account_dir.is_dir() {
                continue;
            }
            for path in Self::entries(&account_dir).await? {
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(doc) = Self::read_document(&path).await? {
                    let scope = ScopeKey::new(doc.account_id, doc.region);
                    if filter.matches_scope(&scope) {
                        out.extend(doc.records.into_iter().filter(|r| filter.matches(r)));
                    }
                }
            }
        }
        sort_records(&mut out);
        Ok(out)
    }

    async fn record_run(&self, run: &DiscoveryRun) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(run)?;
        Self::write_atomic(&self.run_path(&run.run_id), &bytes).await
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::record;
    use crate::types::Invocation;

    #[tokio::test]
    async fn test_file_scope_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileInventoryStore::new(dir.path());
        let scope = ScopeKey::new("111111111111", "us-east-1");

        assert!(store.load_scope(&scope).await.unwrap().is_empty());

        store
            .save_scope(&scope, vec![record("111111111111", "us-east-1", "orders-db")])
            .await
            .unwrap();

        let loaded = store.load_scope(&scope).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].instance_id, "orders-db");
        assert!(dir.path().join("scopes/111111111111/us-east-1.json").exists());
    }

    #[tokio::test]
    async fn test_file_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileInventoryStore::new(dir.path());
        let scope = ScopeKey::new("111111111111", "eu-west-1");

        for id in ["a", "b", "c"] {
            store
                .save_scope(&scope, vec![record("111111111111", "eu-west-1", id)])
                .await
                .unwrap();
        }

        let files: Vec<_> = std::fs::read_dir(dir.path().join("scopes/111111111111"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["eu-west-1.json".to_string()]);
        assert_eq!(store.load_scope(&scope).await.unwrap()[0].instance_id, "c");
    }

    #[tokio::test]
    async fn test_file_list_across_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileInventoryStore::new(dir.path());

        store
            .save_scope(
                &ScopeKey::new("222222222222", "us-west-2"),
                vec![record("222222222222", "us-west-2", "z")],
            )
            .await
            .unwrap();
        let mut gone = record("111111111111", "us-east-1", "gone");
        gone.removed = true;
        store
            .save_scope(
                &ScopeKey::new("111111111111", "us-east-1"),
                vec![record("111111111111", "us-east-1", "a"), gone],
            )
            .await
            .unwrap();

        let live = store.list(&InventoryFilter::default()).await.unwrap();
        let ids: Vec<_> = live.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "z"]);

        let everything = store
            .list(&InventoryFilter {
                include_removed: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn test_file_corrupt_scope_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileInventoryStore::new(dir.path());
        let scope = ScopeKey::new("111111111111", "us-east-1");
        let path = dir.path().join("scopes/111111111111");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("us-east-1.json"), "{oops").unwrap();

        let err = store.load_scope(&scope).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Store(_)));
    }

    #[tokio::test]
    async fn test_file_records_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileInventoryStore::new(dir.path());
        let run = DiscoveryRun::new(Invocation::default());
        store.record_run(&run).await.unwrap();
        assert!(dir
            .path()
            .join("runs")
            .join(format!("{}.json", run.run_id))
            .exists());
    }
}
