use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Branch, Change, Commit, Conflict, ConflictResolution, ConflictStatus, EntityKind, FieldMap,
    Id, ObjectInfo, ObjectRow, ObjectStats, ObjectType, Snapshot,
};

/// Bookkeeping rows for content-addressed objects.
///
/// Implementations only manage rows; file placement is handled by
/// `ObjectStorage`. Ref-count changes must be atomic per hash.
#[async_trait::async_trait]
pub trait ObjectRowStore: Send + Sync {
    async fn get_object_row(&self, hash: &str) -> Result<Option<ObjectRow>>;
    async fn get_object_info(&self, hash: &str) -> Result<Option<ObjectInfo>>;
    async fn object_exists(&self, hash: &str) -> Result<bool>;
    /// Insert the row, or add one reference if it already exists. Returns the new ref count.
    async fn upsert_object_row(&self, row: ObjectRow) -> Result<i32>;
    /// Fails with `NotFound` if the row is absent.
    async fn increment_object_ref(&self, hash: &str) -> Result<i32>;
    /// Floors at zero. Fails with `NotFound` if the row is absent.
    async fn decrement_object_ref(&self, hash: &str) -> Result<i32>;
    async fn list_objects_by_type(
        &self,
        object_type: ObjectType,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ObjectInfo>>;
    /// Delete zero-ref rows created before `older_than`, returning what was removed.
    async fn delete_unreferenced_objects(&self, older_than: DateTime<Utc>) -> Result<Vec<ObjectInfo>>;
    async fn object_stats(&self) -> Result<Vec<ObjectStats>>;
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert unless a snapshot with the same hash exists. Returns whether a row was written.
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<bool>;
    async fn get_snapshot(&self, hash: &str) -> Result<Option<Snapshot>>;
    async fn get_latest_snapshot(&self, repository_id: &Id) -> Result<Option<Snapshot>>;
    async fn list_snapshots(&self, repository_id: &Id) -> Result<Vec<Snapshot>>;
    async fn delete_snapshot(&self, hash: &str) -> Result<bool>;
}

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    /// Insert a branch. A default branch clears the flag on the repository's other branches.
    /// Fails with `AlreadyExists` if a live branch has the same name.
    async fn insert_branch(&self, branch: &Branch) -> Result<()>;
    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>>;
    /// Looks up live (not deleted) branches only
    async fn get_branch_by_name(&self, repository_id: &Id, name: &str) -> Result<Option<Branch>>;
    async fn list_branches(&self, repository_id: &Id) -> Result<Vec<Branch>>;
    async fn get_default_branch(&self, repository_id: &Id) -> Result<Option<Branch>>;
    async fn set_default_branch(&self, repository_id: &Id, branch_id: &Id) -> Result<bool>;
    /// Move the head of an active branch. Returns false if no active branch matched.
    async fn set_branch_head(&self, branch_id: &Id, head: &Id) -> Result<bool>;
    /// Move the head only if it currently equals `expected`.
    async fn compare_and_set_branch_head(
        &self,
        branch_id: &Id,
        expected: Option<&Id>,
        head: &Id,
    ) -> Result<bool>;
    /// Persist status, default flag and merge fields.
    async fn update_branch_state(&self, branch: &Branch) -> Result<()>;
}

#[async_trait::async_trait]
pub trait CommitStore: Send + Sync {
    async fn insert_commit(&self, commit: &Commit) -> Result<()>;
    async fn get_commit(&self, id: &Id) -> Result<Option<Commit>>;
    /// Batch lookup; missing ids are skipped.
    async fn get_commits(&self, ids: &[Id]) -> Result<Vec<Commit>>;
    async fn find_commits_by_hash_prefix(&self, repository_id: &Id, prefix: &str) -> Result<Vec<Commit>>;
    /// Commits listing `id` among their parents
    async fn get_child_commits(&self, id: &Id) -> Result<Vec<Commit>>;
    /// Newest first
    async fn list_commits(&self, repository_id: &Id, limit: i64, offset: i64) -> Result<Vec<Commit>>;
    async fn list_branch_commits(&self, branch_id: &Id, limit: i64) -> Result<Vec<Commit>>;
    async fn count_commits(&self, repository_id: &Id) -> Result<i64>;
}

#[async_trait::async_trait]
pub trait ChangeStore: Send + Sync {
    /// Append a change. Fails with `StaleVersion` unless its version is greater
    /// than every logged version of the same entity.
    async fn append_change(&self, change: &Change) -> Result<()>;
    /// Changes with `timestamp > since`, in insertion order
    async fn changes_since(&self, since: DateTime<Utc>, entity: Option<EntityKind>) -> Result<Vec<Change>>;
    async fn entity_changes(&self, entity_id: &Id) -> Result<Vec<Change>>;
    async fn latest_version(&self, entity: Option<EntityKind>, entity_id: &Id) -> Result<Option<i64>>;
    async fn prune_changes(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait::async_trait]
pub trait ConflictStore: Send + Sync {
    async fn insert_conflict(&self, conflict: &Conflict) -> Result<()>;
    async fn get_conflict(&self, id: &Id) -> Result<Option<Conflict>>;
    async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<Conflict>>;
    /// Store the audit record and move the conflict to `status` together.
    async fn record_resolution(&self, resolution: &ConflictResolution, status: ConflictStatus) -> Result<()>;
    async fn list_resolutions(&self, conflict_id: &Id) -> Result<Vec<ConflictResolution>>;
}

/// Writes a change to the entity CRUD layer
#[async_trait::async_trait]
pub trait EntityApplier: Send + Sync {
    async fn apply_change(&self, change: &Change) -> Result<()>;
}

/// Enumerates current entity state for checkpointing
#[async_trait::async_trait]
pub trait EntityStateSource: Send + Sync {
    async fn entity_state(&self, entity: EntityKind) -> Result<Vec<(Id, FieldMap)>>;
}

pub trait Store:
    ObjectRowStore + SnapshotStore + BranchStore + CommitStore + ChangeStore + ConflictStore + Send + Sync
{
}
