use std::sync::Arc;

use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::logic::TreeStorage;
use crate::model::{Id, ObjectType, Snapshot, TreeKind};
use crate::store::{ObjectRowStore, SnapshotStore};

/// Snapshots referencing the five entity trees.
///
/// A snapshot row holds one reference on each of its trees for as long as
/// it exists.
pub struct SnapshotManager<S> {
    rows: Arc<S>,
    trees: Arc<TreeStorage<S>>,
}

impl<S: ObjectRowStore + SnapshotStore> SnapshotManager<S> {
    pub fn new(rows: Arc<S>, trees: Arc<TreeStorage<S>>) -> Self {
        Self { rows, trees }
    }

    /// Validate and persist a snapshot, returning its hash.
    ///
    /// Re-creating an existing snapshot is a no-op.
    pub async fn create(&self, ctx: &OpContext, mut snapshot: Snapshot) -> Result<String> {
        let hash = snapshot.compute_hash();
        if !snapshot.hash.is_empty() && snapshot.hash != hash {
            return Err(VcsError::InvalidInput(format!(
                "snapshot hash {} does not match its contents ({})",
                snapshot.hash, hash
            )));
        }
        snapshot.hash = hash.clone();

        for kind in TreeKind::ALL {
            let tree_hash = snapshot.tree(kind);
            let owner = format!("snapshot {} ({} tree)", hash, kind);
            match self.trees.objects().info(ctx, tree_hash).await? {
                None => return Err(VcsError::dangling(owner, "tree", tree_hash)),
                Some(info) if info.object_type != ObjectType::Tree => {
                    return Err(VcsError::TypeMismatch {
                        hash: tree_hash.to_string(),
                        expected: ObjectType::Tree,
                        found: info.object_type,
                    })
                }
                Some(_) => {}
            }
        }

        let mut taken = Vec::with_capacity(TreeKind::ALL.len());
        for kind in TreeKind::ALL {
            match self.trees.objects().increment_ref(ctx, snapshot.tree(kind)).await {
                Ok(_) => taken.push(kind),
                Err(e) => {
                    self.release_trees(&snapshot, &taken).await;
                    return Err(e);
                }
            }
        }

        match ctx.run(self.rows.insert_snapshot(&snapshot)).await {
            Ok(true) => {
                log::info!("Created snapshot {} for repository {}", hash, snapshot.repository_id);
                Ok(hash)
            }
            Ok(false) => {
                log::debug!("Snapshot {} already exists", hash);
                self.release_trees(&snapshot, &taken).await;
                Ok(hash)
            }
            Err(e) => {
                self.release_trees(&snapshot, &taken).await;
                Err(e)
            }
        }
    }

    /// Give back tree references taken by a `create` that wrote no row.
    async fn release_trees(&self, snapshot: &Snapshot, kinds: &[TreeKind]) {
        let ctx = OpContext::background();
        for kind in kinds {
            if let Err(e) = self.trees.release(&ctx, snapshot.tree(*kind)).await {
                log::warn!("Failed to release {} tree of snapshot {}: {}", kind, snapshot.hash, e);
            }
        }
    }

    pub async fn get_by_hash(&self, ctx: &OpContext, hash: &str) -> Result<Snapshot> {
        ctx.run(self.rows.get_snapshot(hash))
            .await?
            .ok_or_else(|| VcsError::not_found("snapshot", hash))
    }

    pub async fn get_latest(&self, ctx: &OpContext, repository_id: &Id) -> Result<Option<Snapshot>> {
        ctx.run(self.rows.get_latest_snapshot(repository_id)).await
    }

    /// Newest first
    pub async fn list_by_repository(&self, ctx: &OpContext, repository_id: &Id) -> Result<Vec<Snapshot>> {
        ctx.run(self.rows.list_snapshots(repository_id)).await
    }

    /// Remove a snapshot and release its tree references.
    pub async fn delete(&self, ctx: &OpContext, hash: &str) -> Result<()> {
        let snapshot = self.get_by_hash(ctx, hash).await?;
        if !ctx.run(self.rows.delete_snapshot(hash)).await? {
            return Err(VcsError::not_found("snapshot", hash));
        }
        for kind in TreeKind::ALL {
            match self.trees.release(ctx, snapshot.tree(kind)).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    log::warn!("Snapshot {} referenced missing {} tree", hash, kind)
                }
                Err(e) => return Err(e),
            }
        }
        log::info!("Deleted snapshot {}", hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::logic::ObjectStorage;
    use crate::model::{Object, ObjectInfo, ObjectRow, ObjectStats, SnapshotTrees, Tree};
    use crate::store::InMemoryStore;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rows that start failing ref increments after a fixed number of calls.
    struct FailingIncrements {
        inner: InMemoryStore,
        remaining: AtomicUsize,
    }

    impl FailingIncrements {
        fn new(allowed: usize) -> Self {
            Self {
                inner: InMemoryStore::new(),
                remaining: AtomicUsize::new(allowed),
            }
        }
    }

    #[async_trait::async_trait]
    impl ObjectRowStore for FailingIncrements {
        async fn get_object_row(&self, hash: &str) -> Result<Option<ObjectRow>> {
            self.inner.get_object_row(hash).await
        }
        async fn get_object_info(&self, hash: &str) -> Result<Option<ObjectInfo>> {
            self.inner.get_object_info(hash).await
        }
        async fn object_exists(&self, hash: &str) -> Result<bool> {
            self.inner.object_exists(hash).await
        }
        async fn upsert_object_row(&self, row: ObjectRow) -> Result<i32> {
            self.inner.upsert_object_row(row).await
        }
        async fn increment_object_ref(&self, hash: &str) -> Result<i32> {
            let left = self.remaining.load(Ordering::SeqCst);
            if left == 0 {
                return Err(VcsError::StorageIo("connection reset".into()));
            }
            self.remaining.store(left - 1, Ordering::SeqCst);
            self.inner.increment_object_ref(hash).await
        }
        async fn decrement_object_ref(&self, hash: &str) -> Result<i32> {
            self.inner.decrement_object_ref(hash).await
        }
        async fn list_objects_by_type(
            &self,
            object_type: ObjectType,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<ObjectInfo>> {
            self.inner.list_objects_by_type(object_type, limit, offset).await
        }
        async fn delete_unreferenced_objects(&self, older_than: DateTime<Utc>) -> Result<Vec<ObjectInfo>> {
            self.inner.delete_unreferenced_objects(older_than).await
        }
        async fn object_stats(&self) -> Result<Vec<ObjectStats>> {
            self.inner.object_stats().await
        }
    }

    #[async_trait::async_trait]
    impl SnapshotStore for FailingIncrements {
        async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<bool> {
            self.inner.insert_snapshot(snapshot).await
        }
        async fn get_snapshot(&self, hash: &str) -> Result<Option<Snapshot>> {
            self.inner.get_snapshot(hash).await
        }
        async fn get_latest_snapshot(&self, repository_id: &Id) -> Result<Option<Snapshot>> {
            self.inner.get_latest_snapshot(repository_id).await
        }
        async fn list_snapshots(&self, repository_id: &Id) -> Result<Vec<Snapshot>> {
            self.inner.list_snapshots(repository_id).await
        }
        async fn delete_snapshot(&self, hash: &str) -> Result<bool> {
            self.inner.delete_snapshot(hash).await
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        trees: Arc<TreeStorage<InMemoryStore>>,
        snapshots: SnapshotManager<InMemoryStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            object_root: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let store = Arc::new(InMemoryStore::new());
        let objects = Arc::new(ObjectStorage::new(store.clone(), &config));
        let trees = Arc::new(TreeStorage::new(objects));
        let snapshots = SnapshotManager::new(store, trees.clone());
        Fixture { _dir: dir, trees, snapshots }
    }

    async fn empty_trees<S: ObjectRowStore>(trees: &TreeStorage<S>) -> SnapshotTrees {
        let ctx = OpContext::background();
        let empty = trees.store(&ctx, &Tree::new()).await.unwrap();
        let mut slots = SnapshotTrees::default();
        for kind in TreeKind::ALL {
            slots.set(kind, empty.clone());
        }
        slots
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let f = fixture();
        let ctx = OpContext::background();
        let slots = empty_trees(&f.trees).await;

        let snapshot = Snapshot::new("repo".into(), slots, json!({"floors": 0}));
        let hash = f.snapshots.create(&ctx, snapshot.clone()).await.unwrap();
        assert_eq!(hash, snapshot.hash);

        // idempotent
        assert_eq!(f.snapshots.create(&ctx, snapshot).await.unwrap(), hash);

        let loaded = f.snapshots.get_by_hash(&ctx, &hash).await.unwrap();
        assert_eq!(loaded.metadata, json!({"floors": 0}));
        let latest = f.snapshots.get_latest(&ctx, &"repo".to_string()).await.unwrap();
        assert_eq!(latest.unwrap().hash, hash);
        assert!(f.snapshots.get_latest(&ctx, &"other".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dangling_tree_is_rejected() {
        let f = fixture();
        let ctx = OpContext::background();
        let mut slots = empty_trees(&f.trees).await;
        slots.set(TreeKind::Spatial, "a".repeat(64));

        let err = f
            .snapshots
            .create(&ctx, Snapshot::new("repo".into(), slots, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::DanglingReference { kind: "tree", .. }));
        assert!(f.snapshots.list_by_repository(&ctx, &"repo".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blob_in_tree_slot_is_rejected() {
        let f = fixture();
        let ctx = OpContext::background();
        let blob = f.trees.objects().store(&ctx, Object::blob("x")).await.unwrap();
        let mut slots = empty_trees(&f.trees).await;
        slots.set(TreeKind::Files, blob);

        let err = f
            .snapshots
            .create(&ctx, Snapshot::new("repo".into(), slots, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_delete_releases_trees() {
        let f = fixture();
        let ctx = OpContext::background();
        let slots = empty_trees(&f.trees).await;
        let tree_hash = slots.building.clone();

        let hash = f
            .snapshots
            .create(&ctx, Snapshot::new("repo".into(), slots, json!({})))
            .await
            .unwrap();
        // one reference from the store call, five from the snapshot slots
        assert_eq!(f.trees.objects().load(&ctx, &tree_hash).await.unwrap().ref_count, 6);

        f.snapshots.delete(&ctx, &hash).await.unwrap();
        assert_eq!(f.trees.objects().load(&ctx, &tree_hash).await.unwrap().ref_count, 1);
        assert!(f.snapshots.get_by_hash(&ctx, &hash).await.unwrap_err().is_not_found());
        assert!(f.snapshots.delete(&ctx, &hash).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_increment_leaves_no_snapshot_or_refs() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            object_root: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let store = Arc::new(FailingIncrements::new(2));
        let objects = Arc::new(ObjectStorage::new(store.clone(), &config));
        let trees = Arc::new(TreeStorage::new(objects));
        let snapshots = SnapshotManager::new(store, trees.clone());
        let ctx = OpContext::background();

        let slots = empty_trees(&trees).await;
        let tree_hash = slots.building.clone();
        let err = snapshots
            .create(&ctx, Snapshot::new("repo".into(), slots, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::StorageIo(_)));

        assert!(snapshots.list_by_repository(&ctx, &"repo".to_string()).await.unwrap().is_empty());
        assert_eq!(trees.objects().info(&ctx, &tree_hash).await.unwrap().unwrap().ref_count, 1);
    }

    #[tokio::test]
    async fn test_recreate_does_not_add_tree_refs() {
        let f = fixture();
        let ctx = OpContext::background();
        let slots = empty_trees(&f.trees).await;
        let tree_hash = slots.building.clone();
        let snapshot = Snapshot::new("repo".into(), slots, json!({}));

        f.snapshots.create(&ctx, snapshot.clone()).await.unwrap();
        f.snapshots.create(&ctx, snapshot).await.unwrap();
        assert_eq!(f.trees.objects().info(&ctx, &tree_hash).await.unwrap().unwrap().ref_count, 6);
    }
}
