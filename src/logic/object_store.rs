use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::StorageConfig;
use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::model::{Object, ObjectInfo, ObjectRow, ObjectStats, ObjectType, StorageTier};
use crate::store::{BlobFs, ObjectRowStore};

/// Content-addressed, ref-counted object storage.
///
/// Rows live in `S`; bytes live inline in the row or under the filesystem
/// tier depending on size.
///
/// Placing a file and landing its row, and checking a row and unlinking its
/// file, run under the same per-hash lock so GC never removes a file that a
/// concurrent store is about to reference.
pub struct ObjectStorage<S> {
    rows: Arc<S>,
    blobs: BlobFs,
    inline_threshold: i64,
    compress_threshold: i64,
    file_locks: Vec<Mutex<()>>,
}

const FILE_LOCK_STRIPES: usize = 64;

impl<S: ObjectRowStore> ObjectStorage<S> {
    pub fn new(rows: Arc<S>, config: &StorageConfig) -> Self {
        Self {
            rows,
            blobs: BlobFs::new(config.object_root.clone()),
            inline_threshold: config.inline_threshold,
            compress_threshold: config.compress_threshold,
            file_locks: (0..FILE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn file_lock(&self, hash: &str) -> &Mutex<()> {
        let stripe = hash
            .get(..2)
            .and_then(|prefix| usize::from_str_radix(prefix, 16).ok())
            .unwrap_or(0);
        &self.file_locks[stripe % self.file_locks.len()]
    }

    pub fn tier_for(&self, size: i64) -> StorageTier {
        StorageTier::for_size(size, self.inline_threshold, self.compress_threshold)
    }

    /// Store an object and return its hash.
    ///
    /// Storing bytes that already exist adds a reference instead of writing
    /// them again. An empty `hash` is computed; a non-empty one must match.
    pub async fn store(&self, ctx: &OpContext, mut object: Object) -> Result<String> {
        ctx.check()?;

        let hash = object.content_hash();
        if !object.hash.is_empty() && object.hash != hash {
            return Err(VcsError::InvalidInput(format!(
                "object hash {} does not match its contents ({})",
                object.hash, hash
            )));
        }
        object.hash = hash.clone();
        object.size = object.contents.len() as i64;

        if ctx.run(self.rows.object_exists(&hash)).await? {
            match ctx.run(self.rows.increment_object_ref(&hash)).await {
                Ok(ref_count) => {
                    log::debug!("Object {} already stored, ref_count={}", hash, ref_count);
                    return Ok(hash);
                }
                // collected between the two calls; write it again
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let tier = self.tier_for(object.size);
        let _placing = if tier.is_file() {
            let guard = self.file_lock(&hash).lock().await;
            ctx.run(self.blobs.write(&hash, &object.contents, tier.is_compressed()))
                .await?;
            Some(guard)
        } else {
            None
        };

        let row = ObjectRow {
            info: ObjectInfo {
                hash: hash.clone(),
                object_type: object.object_type,
                size: object.size,
                ref_count: 1,
                tier,
                created_at: Utc::now(),
            },
            inline_contents: (!tier.is_file()).then(|| object.contents),
        };

        match ctx.run(self.rows.upsert_object_row(row)).await {
            Ok(ref_count) => {
                log::debug!(
                    "Stored {} {} ({} bytes, {}), ref_count={}",
                    object.object_type,
                    hash,
                    object.size,
                    tier.as_str(),
                    ref_count
                );
                Ok(hash)
            }
            Err(e) => {
                if tier.is_file() {
                    self.discard_orphan_file(&hash).await;
                }
                Err(e)
            }
        }
    }

    /// Remove a placed file whose row never landed.
    async fn discard_orphan_file(&self, hash: &str) {
        match self.rows.object_exists(hash).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = self.blobs.remove(hash).await {
                    log::warn!("Failed to remove orphaned object file {}: {}", hash, e);
                }
            }
            Err(e) => log::warn!("Keeping object file {}; row lookup failed: {}", hash, e),
        }
    }

    pub async fn load(&self, ctx: &OpContext, hash: &str) -> Result<Object> {
        let row = ctx
            .run(self.rows.get_object_row(hash))
            .await?
            .ok_or_else(|| VcsError::not_found("object", hash))?;

        let contents = match row.inline_contents {
            Some(contents) => contents,
            None => ctx.run(self.blobs.read(hash, row.info.compressed())).await?,
        };
        if contents.len() as i64 != row.info.size {
            return Err(VcsError::StorageIo(format!(
                "object {} is {} bytes, expected {}",
                hash,
                contents.len(),
                row.info.size
            )));
        }

        Ok(Object {
            hash: row.info.hash,
            object_type: row.info.object_type,
            size: row.info.size,
            contents,
            ref_count: row.info.ref_count,
            compressed: row.info.tier.is_compressed(),
            created_at: row.info.created_at,
        })
    }

    /// Row metadata without touching the filesystem tier
    pub async fn info(&self, ctx: &OpContext, hash: &str) -> Result<Option<ObjectInfo>> {
        ctx.run(self.rows.get_object_info(hash)).await
    }

    pub async fn exists(&self, ctx: &OpContext, hash: &str) -> Result<bool> {
        ctx.run(self.rows.object_exists(hash)).await
    }

    pub async fn increment_ref(&self, ctx: &OpContext, hash: &str) -> Result<i32> {
        ctx.run(self.rows.increment_object_ref(hash)).await
    }

    /// Drop one reference; the count never goes below zero.
    pub async fn decrement_ref(&self, ctx: &OpContext, hash: &str) -> Result<i32> {
        ctx.run(self.rows.decrement_object_ref(hash)).await
    }

    pub async fn list_by_type(
        &self,
        ctx: &OpContext,
        object_type: ObjectType,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ObjectInfo>> {
        ctx.run(self.rows.list_objects_by_type(object_type, limit, offset))
            .await
    }

    /// Garbage-collect zero-ref objects created before `older_than`.
    ///
    /// Rows go first; a file whose removal fails is logged and left behind
    /// as an orphan rather than failing the sweep.
    pub async fn delete_unreferenced(&self, ctx: &OpContext, older_than: DateTime<Utc>) -> Result<u64> {
        let deleted = ctx
            .run(self.rows.delete_unreferenced_objects(older_than))
            .await?;

        for info in deleted.iter().filter(|info| info.tier.is_file()) {
            let _removing = self.file_lock(&info.hash).lock().await;
            // a concurrent store may have re-created the object
            if matches!(self.rows.object_exists(&info.hash).await, Ok(true)) {
                continue;
            }
            if let Err(e) = self.blobs.remove(&info.hash).await {
                log::warn!("Failed to remove object file {}: {}", info.hash, e);
            }
        }

        if !deleted.is_empty() {
            log::info!("Garbage collected {} unreferenced objects", deleted.len());
        }
        Ok(deleted.len() as u64)
    }

    pub async fn stats(&self, ctx: &OpContext) -> Result<Vec<ObjectStats>> {
        ctx.run(self.rows.object_stats()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn storage(root: &std::path::Path, inline: i64, compress: i64) -> ObjectStorage<InMemoryStore> {
        let config = StorageConfig {
            object_root: root.to_path_buf(),
            inline_threshold: inline,
            compress_threshold: compress,
        };
        ObjectStorage::new(Arc::new(InMemoryStore::new()), &config)
    }

    #[tokio::test]
    async fn test_store_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 1024, 1 << 20);
        let ctx = OpContext::background();

        let first = objects.store(&ctx, Object::blob("hello")).await.unwrap();
        let second = objects.store(&ctx, Object::blob("hello")).await.unwrap();
        assert_eq!(first, second);

        let loaded = objects.load(&ctx, &first).await.unwrap();
        assert_eq!(loaded.contents, b"hello");
        assert_eq!(loaded.ref_count, 2);
        assert!(!loaded.compressed);
    }

    #[tokio::test]
    async fn test_tiers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 16, 256);
        let ctx = OpContext::background();

        let inline = objects.store(&ctx, Object::blob(vec![1u8; 8])).await.unwrap();
        let file = objects.store(&ctx, Object::blob(vec![2u8; 64])).await.unwrap();
        let compressed = objects.store(&ctx, Object::blob(vec![3u8; 4096])).await.unwrap();

        let blobs = BlobFs::new(dir.path());
        assert!(!blobs.exists(&inline).await.unwrap());
        assert!(blobs.exists(&file).await.unwrap());
        assert!(blobs.exists(&compressed).await.unwrap());

        assert_eq!(objects.load(&ctx, &file).await.unwrap().contents, vec![2u8; 64]);
        let big = objects.load(&ctx, &compressed).await.unwrap();
        assert!(big.compressed);
        assert_eq!(big.contents, vec![3u8; 4096]);
    }

    #[tokio::test]
    async fn test_mismatched_hash_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 1024, 1 << 20);
        let mut object = Object::blob("hello");
        object.hash = "0".repeat(64);
        let err = objects
            .store(&OpContext::background(), object)
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_gc_removes_rows_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 16, 1 << 20);
        let ctx = OpContext::background();

        let keep = objects.store(&ctx, Object::blob(vec![7u8; 32])).await.unwrap();
        let doomed = objects.store(&ctx, Object::blob(vec![9u8; 32])).await.unwrap();
        assert_eq!(objects.decrement_ref(&ctx, &doomed).await.unwrap(), 0);
        assert_eq!(objects.decrement_ref(&ctx, &doomed).await.unwrap(), 0);

        // young objects survive
        let removed = objects
            .delete_unreferenced(&ctx, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let removed = objects
            .delete_unreferenced(&ctx, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(objects.load(&ctx, &doomed).await.unwrap_err().is_not_found());
        assert!(!BlobFs::new(dir.path()).exists(&doomed).await.unwrap());

        // aged but still referenced
        let kept = objects.load(&ctx, &keep).await.unwrap();
        assert_eq!(kept.ref_count, 1);
        assert_eq!(kept.contents, vec![7u8; 32]);
        assert!(BlobFs::new(dir.path()).exists(&keep).await.unwrap());
    }

    #[tokio::test]
    async fn test_gc_waits_for_file_store_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            object_root: dir.path().to_path_buf(),
            inline_threshold: 16,
            ..StorageConfig::default()
        };
        let rows = Arc::new(InMemoryStore::new());
        let objects = Arc::new(ObjectStorage::new(rows.clone(), &config));
        let ctx = OpContext::background();

        let hash = objects.store(&ctx, Object::blob(vec![3u8; 64])).await.unwrap();
        let row = rows.get_object_row(&hash).await.unwrap().unwrap();
        assert_eq!(objects.decrement_ref(&ctx, &hash).await.unwrap(), 0);

        // a store of the same bytes has placed the file and not yet landed its row
        let placing = objects.file_lock(&hash).lock().await;
        let gc = {
            let objects = objects.clone();
            tokio::spawn(async move {
                objects
                    .delete_unreferenced(&OpContext::background(), Utc::now() + chrono::Duration::hours(1))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!objects.exists(&ctx, &hash).await.unwrap());
        rows.upsert_object_row(row).await.unwrap();
        drop(placing);

        assert_eq!(gc.await.unwrap().unwrap(), 1);
        let object = objects.load(&ctx, &hash).await.unwrap();
        assert_eq!(object.contents, vec![3u8; 64]);
    }

    #[tokio::test]
    async fn test_failed_file_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 16, 1 << 20);
        let ctx = OpContext::background();

        let object = Object::blob(vec![4u8; 64]);
        let hash = object.hash.clone();
        // a regular file where the shard directory should go
        std::fs::write(dir.path().join(&hash[..2]), b"in the way").unwrap();

        let err = objects.store(&ctx, object).await.unwrap_err();
        assert!(matches!(err, VcsError::StorageIo(_)));
        assert!(!objects.exists(&ctx, &hash).await.unwrap());
        let staged = std::fs::read_dir(dir.path().join("tmp")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_missing_object() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 1024, 1 << 20);
        let ctx = OpContext::background();
        assert!(objects.load(&ctx, "abc123").await.unwrap_err().is_not_found());
        assert!(objects.increment_ref(&ctx, "abc123").await.unwrap_err().is_not_found());
        assert!(!objects.exists(&ctx, "abc123").await.unwrap());
    }

    #[tokio::test]
    async fn test_canceled_store_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 16, 1 << 20);
        let (ctx, handle) = OpContext::cancelable();
        handle.cancel();

        let object = Object::blob(vec![5u8; 64]);
        let hash = object.hash.clone();
        assert!(matches!(objects.store(&ctx, object).await, Err(VcsError::Canceled)));

        let ctx = OpContext::background();
        assert!(!objects.exists(&ctx, &hash).await.unwrap());
        assert!(!BlobFs::new(dir.path()).exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let objects = storage(dir.path(), 1024, 1 << 20);
        let ctx = OpContext::background();
        objects.store(&ctx, Object::blob("a")).await.unwrap();
        objects.store(&ctx, Object::blob("bc")).await.unwrap();
        objects
            .store(&ctx, Object::new(ObjectType::Tree, b"[]".to_vec()))
            .await
            .unwrap();

        let stats = objects.stats(&ctx).await.unwrap();
        let blobs = stats
            .iter()
            .find(|s| s.object_type == Some(ObjectType::Blob))
            .unwrap();
        assert_eq!(blobs.count, 2);
        assert_eq!(blobs.total_size, 3);
        assert_eq!(blobs.unreferenced, 0);
    }
}
