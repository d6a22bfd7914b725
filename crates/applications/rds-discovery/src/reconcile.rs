//! Inventory reconciliation
//!
//! Applies the observed set of one successfully scanned scope to the
//! store:
//!
//! 1. Each observed record is upserted by composite key. A record that was
//!    previously marked removed is revived.
//! 2. Every stored record of the same scope that was not observed, and is
//!    not already removed, is marked `removed = true`. Its `last_seen` is
//!    left alone.
//!
//! Only call this for a scope whose scan succeeded. A failed scan has no
//! observed set, which is different from an empty one.

use crate::error::Result;
use crate::store::InventoryStore;
use crate::types::{InstanceRecord, ScopeKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Per-scope reconciliation outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    /// Keys not stored before
    pub new: usize,
    /// Attributes changed, or revived from removed
    pub updated: usize,
    /// Only `last_seen` advanced
    pub unchanged: usize,
    /// Newly marked removed
    pub removed: usize,
}

impl ReconcileStats {
    /// Live instances observed in the scope
    pub fn observed(&self) -> usize {
        self.new + self.updated + self.unchanged
    }
}

/// Merge an observed set into the stored records of its scope
///
/// Pure: returns the new stored set and the stats without touching I/O.
pub fn merge(
    scope: &ScopeKey,
    existing: Vec<InstanceRecord>,
    observed: Vec<InstanceRecord>,
) -> (Vec<InstanceRecord>, ReconcileStats) {
    let mut stats = ReconcileStats::default();
    let mut by_id: BTreeMap<String, InstanceRecord> = existing
        .into_iter()
        .filter(|r| r.account_id == scope.account_id && r.region == scope.region)
        .map(|r| (r.instance_id.clone(), r))
        .collect();

    let mut seen: HashSet<String> = HashSet::with_capacity(observed.len());
    for record in observed {
        if !seen.insert(record.instance_id.clone()) {
            // Duplicate id within one listing: first one wins
            continue;
        }
        match by_id.get(&record.instance_id) {
            None => stats.new += 1,
            Some(prev) if prev.removed || !prev.same_attributes(&record) => stats.updated += 1,
            Some(_) => stats.unchanged += 1,
        }
        by_id.insert(record.instance_id.clone(), InstanceRecord { removed: false, ..record });
    }

    for (id, record) in by_id.iter_mut() {
        if !seen.contains(id) && !record.removed {
            record.removed = true;
            stats.removed += 1;
        }
    }

    (by_id.into_values().collect(), stats)
}

/// Reconcile one scope against the store
pub async fn reconcile(
    scope: &ScopeKey,
    observed: Vec<InstanceRecord>,
    store: &dyn InventoryStore,
) -> Result<ReconcileStats> {
    let existing = store.load_scope(scope).await?;
    let (merged, stats) = merge(scope, existing, observed);
    store.save_scope(scope, merged).await?;

    debug!(
        scope = %scope,
        new = stats.new,
        updated = stats.updated,
        unchanged = stats.unchanged,
        removed = stats.removed,
        "Scope reconciled"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::record;
    use crate::store::{InventoryFilter, MemoryInventoryStore};
    use chrono::{Duration, Utc};

    const ACCOUNT: &str = "111111111111";
    const REGION: &str = "us-east-1";

    fn scope() -> ScopeKey {
        ScopeKey::new(ACCOUNT, REGION)
    }

    fn observed(ids: &[&str]) -> Vec<InstanceRecord> {
        ids.iter().map(|id| record(ACCOUNT, REGION, id)).collect()
    }

    #[tokio::test]
    async fn test_first_scan_inserts() {
        let store = MemoryInventoryStore::new();
        let stats = reconcile(&scope(), observed(&["a", "b"]), &store)
            .await
            .unwrap();
        assert_eq!(stats.new, 2);
        assert_eq!(stats.observed(), 2);
        assert_eq!(store.load_scope(&scope()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent_except_last_seen() {
        let store = MemoryInventoryStore::new();
        let first_seen = Utc::now() - Duration::hours(1);
        let mut first = observed(&["a", "b"]);
        for r in &mut first {
            r.last_seen = first_seen;
        }
        reconcile(&scope(), first, &store).await.unwrap();

        let stats = reconcile(&scope(), observed(&["a", "b"]), &store)
            .await
            .unwrap();
        assert_eq!(
            stats,
            ReconcileStats {
                new: 0,
                updated: 0,
                unchanged: 2,
                removed: 0
            }
        );

        let stored = store.load_scope(&scope()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.last_seen > first_seen));
    }

    #[tokio::test]
    async fn test_absent_record_is_marked_removed_not_deleted() {
        let store = MemoryInventoryStore::new();
        reconcile(&scope(), observed(&["a", "b"]), &store)
            .await
            .unwrap();
        let before = store.load_scope(&scope()).await.unwrap();
        let b_seen = before.iter().find(|r| r.instance_id == "b").unwrap().last_seen;

        let stats = reconcile(&scope(), observed(&["a"]), &store).await.unwrap();
        assert_eq!(stats.removed, 1);

        let stored = store.load_scope(&scope()).await.unwrap();
        let b = stored.iter().find(|r| r.instance_id == "b").unwrap();
        assert!(b.removed);
        assert_eq!(b.last_seen, b_seen);

        // Still removed on the next scan, counted once
        let stats = reconcile(&scope(), observed(&["a"]), &store).await.unwrap();
        assert_eq!(stats.removed, 0);
        let live = store.list(&InventoryFilter::default()).await.unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn test_reobserved_record_is_revived() {
        let store = MemoryInventoryStore::new();
        reconcile(&scope(), observed(&["a"]), &store).await.unwrap();
        reconcile(&scope(), observed(&[]), &store).await.unwrap();
        let stats = reconcile(&scope(), observed(&["a"]), &store).await.unwrap();

        assert_eq!(stats.updated, 1);
        assert!(!store.load_scope(&scope()).await.unwrap()[0].removed);
    }

    #[tokio::test]
    async fn test_changed_attributes_count_as_updated() {
        let store = MemoryInventoryStore::new();
        reconcile(&scope(), observed(&["a"]), &store).await.unwrap();

        let mut changed = observed(&["a"]);
        changed[0].status = "modifying".to_string();
        let stats = reconcile(&scope(), changed, &store).await.unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(store.load_scope(&scope()).await.unwrap()[0].status, "modifying");
    }

    #[tokio::test]
    async fn test_other_scopes_untouched() {
        let store = MemoryInventoryStore::new();
        let other = ScopeKey::new(ACCOUNT, "eu-west-1");
        reconcile(&other, vec![record(ACCOUNT, "eu-west-1", "x")], &store)
            .await
            .unwrap();

        reconcile(&scope(), observed(&[]), &store).await.unwrap();
        let x = store.load_scope(&other).await.unwrap();
        assert!(!x[0].removed);
    }

    #[test]
    fn test_duplicate_ids_in_one_listing() {
        let (merged, stats) = merge(&scope(), Vec::new(), observed(&["a", "a"]));
        assert_eq!(merged.len(), 1);
        assert_eq!(stats.new, 1);
    }
}
