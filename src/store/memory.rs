use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, VcsError};
use crate::model::{
    Branch, BranchStatus, Change, ChangeType, Commit, Conflict, ConflictResolution,
    ConflictStatus, EntityKind, FieldMap, Id, ObjectInfo, ObjectRow, ObjectStats, ObjectType,
    Snapshot,
};
use crate::store::traits::{
    BranchStore, ChangeStore, CommitStore, ConflictStore, EntityApplier, EntityStateSource,
    ObjectRowStore, SnapshotStore, Store,
};

#[derive(Debug, Default)]
struct Tables {
    objects: HashMap<String, ObjectRow>,
    snapshots: Vec<Snapshot>,
    branches: Vec<Branch>,
    commits: Vec<Commit>,
    changes: Vec<Change>,
    conflicts: Vec<Conflict>,
    resolutions: Vec<ConflictResolution>,
}

/// Process-local store for tests and embedded use.
///
/// Every table sits behind one lock so multi-row updates (default branch
/// switch, resolution + status) stay atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all rows.
    pub fn clear(&self) {
        *self.tables.write() = Tables::default();
    }
}

#[async_trait::async_trait]
impl ObjectRowStore for InMemoryStore {
    async fn get_object_row(&self, hash: &str) -> Result<Option<ObjectRow>> {
        Ok(self.tables.read().objects.get(hash).cloned())
    }

    async fn get_object_info(&self, hash: &str) -> Result<Option<ObjectInfo>> {
        Ok(self.tables.read().objects.get(hash).map(|row| row.info.clone()))
    }

    async fn object_exists(&self, hash: &str) -> Result<bool> {
        Ok(self.tables.read().objects.contains_key(hash))
    }

    async fn upsert_object_row(&self, row: ObjectRow) -> Result<i32> {
        let mut tables = self.tables.write();
        let entry = tables
            .objects
            .entry(row.info.hash.clone())
            .and_modify(|existing| existing.info.ref_count += 1)
            .or_insert(row);
        Ok(entry.info.ref_count)
    }

    async fn increment_object_ref(&self, hash: &str) -> Result<i32> {
        let mut tables = self.tables.write();
        let row = tables
            .objects
            .get_mut(hash)
            .ok_or_else(|| VcsError::not_found("object", hash))?;
        row.info.ref_count += 1;
        Ok(row.info.ref_count)
    }

    async fn decrement_object_ref(&self, hash: &str) -> Result<i32> {
        let mut tables = self.tables.write();
        let row = tables
            .objects
            .get_mut(hash)
            .ok_or_else(|| VcsError::not_found("object", hash))?;
        row.info.ref_count = (row.info.ref_count - 1).max(0);
        Ok(row.info.ref_count)
    }

    async fn list_objects_by_type(
        &self,
        object_type: ObjectType,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ObjectInfo>> {
        let tables = self.tables.read();
        let mut infos: Vec<ObjectInfo> = tables
            .objects
            .values()
            .filter(|row| row.info.object_type == object_type)
            .map(|row| row.info.clone())
            .collect();
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.hash.cmp(&b.hash)));
        Ok(infos
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete_unreferenced_objects(&self, older_than: DateTime<Utc>) -> Result<Vec<ObjectInfo>> {
        let mut tables = self.tables.write();
        let doomed: Vec<String> = tables
            .objects
            .values()
            .filter(|row| row.info.ref_count == 0 && row.info.created_at < older_than)
            .map(|row| row.info.hash.clone())
            .collect();
        Ok(doomed
            .iter()
            .filter_map(|hash| tables.objects.remove(hash))
            .map(|row| row.info)
            .collect())
    }

    async fn object_stats(&self) -> Result<Vec<ObjectStats>> {
        let tables = self.tables.read();
        let mut by_type: BTreeMap<&'static str, ObjectStats> = BTreeMap::new();
        for row in tables.objects.values() {
            let stats = by_type.entry(row.info.object_type.as_str()).or_insert(ObjectStats {
                object_type: Some(row.info.object_type),
                ..Default::default()
            });
            stats.count += 1;
            stats.total_size += row.info.size;
            if row.info.ref_count == 0 {
                stats.unreferenced += 1;
            }
        }
        Ok(by_type.into_values().collect())
    }
}

#[async_trait::async_trait]
impl SnapshotStore for InMemoryStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<bool> {
        let mut tables = self.tables.write();
        if tables.snapshots.iter().any(|s| s.hash == snapshot.hash) {
            return Ok(false);
        }
        tables.snapshots.push(snapshot.clone());
        Ok(true)
    }

    async fn get_snapshot(&self, hash: &str) -> Result<Option<Snapshot>> {
        Ok(self.tables.read().snapshots.iter().find(|s| s.hash == hash).cloned())
    }

    async fn get_latest_snapshot(&self, repository_id: &Id) -> Result<Option<Snapshot>> {
        let tables = self.tables.read();
        // later inserts win ties on created_at
        Ok(tables
            .snapshots
            .iter()
            .filter(|s| &s.repository_id == repository_id)
            .fold(None, |latest: Option<&Snapshot>, s| match latest {
                Some(l) if l.created_at > s.created_at => Some(l),
                _ => Some(s),
            })
            .cloned())
    }

    async fn list_snapshots(&self, repository_id: &Id) -> Result<Vec<Snapshot>> {
        let tables = self.tables.read();
        let mut snapshots: Vec<Snapshot> = tables
            .snapshots
            .iter()
            .filter(|s| &s.repository_id == repository_id)
            .cloned()
            .collect();
        snapshots.reverse();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    async fn delete_snapshot(&self, hash: &str) -> Result<bool> {
        let mut tables = self.tables.write();
        let before = tables.snapshots.len();
        tables.snapshots.retain(|s| s.hash != hash);
        Ok(tables.snapshots.len() != before)
    }
}

#[async_trait::async_trait]
impl BranchStore for InMemoryStore {
    async fn insert_branch(&self, branch: &Branch) -> Result<()> {
        let mut tables = self.tables.write();
        let taken = tables.branches.iter().any(|b| {
            b.repository_id == branch.repository_id
                && b.name == branch.name
                && b.status != BranchStatus::Deleted
        });
        if taken {
            return Err(VcsError::AlreadyExists {
                kind: "branch",
                key: branch.name.clone(),
            });
        }
        if branch.is_default {
            for other in tables
                .branches
                .iter_mut()
                .filter(|b| b.repository_id == branch.repository_id)
            {
                other.is_default = false;
            }
        }
        tables.branches.push(branch.clone());
        Ok(())
    }

    async fn get_branch(&self, id: &Id) -> Result<Option<Branch>> {
        Ok(self.tables.read().branches.iter().find(|b| &b.id == id).cloned())
    }

    async fn get_branch_by_name(&self, repository_id: &Id, name: &str) -> Result<Option<Branch>> {
        Ok(self
            .tables
            .read()
            .branches
            .iter()
            .find(|b| {
                &b.repository_id == repository_id && b.name == name && b.status != BranchStatus::Deleted
            })
            .cloned())
    }

    async fn list_branches(&self, repository_id: &Id) -> Result<Vec<Branch>> {
        let mut branches: Vec<Branch> = self
            .tables
            .read()
            .branches
            .iter()
            .filter(|b| &b.repository_id == repository_id)
            .cloned()
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    async fn get_default_branch(&self, repository_id: &Id) -> Result<Option<Branch>> {
        Ok(self
            .tables
            .read()
            .branches
            .iter()
            .find(|b| &b.repository_id == repository_id && b.is_default)
            .cloned())
    }

    async fn set_default_branch(&self, repository_id: &Id, branch_id: &Id) -> Result<bool> {
        let mut tables = self.tables.write();
        let eligible = tables.branches.iter().any(|b| {
            &b.id == branch_id && &b.repository_id == repository_id && b.is_active()
        });
        if !eligible {
            return Ok(false);
        }
        let now = Utc::now();
        for branch in tables
            .branches
            .iter_mut()
            .filter(|b| &b.repository_id == repository_id)
        {
            let is_default = &branch.id == branch_id;
            if branch.is_default != is_default {
                branch.is_default = is_default;
                branch.updated_at = now;
            }
        }
        Ok(true)
    }

    async fn set_branch_head(&self, branch_id: &Id, head: &Id) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.branches.iter_mut().find(|b| &b.id == branch_id && b.is_active()) {
            Some(branch) => {
                branch.head_commit = Some(head.clone());
                branch.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn compare_and_set_branch_head(
        &self,
        branch_id: &Id,
        expected: Option<&Id>,
        head: &Id,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.branches.iter_mut().find(|b| &b.id == branch_id && b.is_active()) {
            Some(branch) if branch.head_commit.as_ref() == expected => {
                branch.head_commit = Some(head.clone());
                branch.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_branch_state(&self, branch: &Branch) -> Result<()> {
        let mut tables = self.tables.write();
        let stored = tables
            .branches
            .iter_mut()
            .find(|b| b.id == branch.id)
            .ok_or_else(|| VcsError::not_found("branch", branch.id.clone()))?;
        stored.status = branch.status;
        stored.is_default = branch.is_default;
        stored.merged_at = branch.merged_at;
        stored.merged_by = branch.merged_by.clone();
        stored.updated_at = branch.updated_at;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CommitStore for InMemoryStore {
    async fn insert_commit(&self, commit: &Commit) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.commits.iter().any(|c| c.id == commit.id) {
            return Err(VcsError::AlreadyExists {
                kind: "commit",
                key: commit.id.clone(),
            });
        }
        tables.commits.push(commit.clone());
        Ok(())
    }

    async fn get_commit(&self, id: &Id) -> Result<Option<Commit>> {
        Ok(self.tables.read().commits.iter().find(|c| &c.id == id).cloned())
    }

    async fn get_commits(&self, ids: &[Id]) -> Result<Vec<Commit>> {
        let tables = self.tables.read();
        Ok(tables
            .commits
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn find_commits_by_hash_prefix(&self, repository_id: &Id, prefix: &str) -> Result<Vec<Commit>> {
        Ok(self
            .tables
            .read()
            .commits
            .iter()
            .filter(|c| &c.repository_id == repository_id && c.commit_hash.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_child_commits(&self, id: &Id) -> Result<Vec<Commit>> {
        Ok(self
            .tables
            .read()
            .commits
            .iter()
            .filter(|c| c.parent_commits.contains(id))
            .cloned()
            .collect())
    }

    async fn list_commits(&self, repository_id: &Id, limit: i64, offset: i64) -> Result<Vec<Commit>> {
        let tables = self.tables.read();
        Ok(tables
            .commits
            .iter()
            .rev()
            .filter(|c| &c.repository_id == repository_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_branch_commits(&self, branch_id: &Id, limit: i64) -> Result<Vec<Commit>> {
        let tables = self.tables.read();
        Ok(tables
            .commits
            .iter()
            .rev()
            .filter(|c| &c.branch_id == branch_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_commits(&self, repository_id: &Id) -> Result<i64> {
        Ok(self
            .tables
            .read()
            .commits
            .iter()
            .filter(|c| &c.repository_id == repository_id)
            .count() as i64)
    }
}

#[async_trait::async_trait]
impl ChangeStore for InMemoryStore {
    async fn append_change(&self, change: &Change) -> Result<()> {
        let mut tables = self.tables.write();
        let latest = tables
            .changes
            .iter()
            .filter(|c| c.key() == change.key())
            .map(|c| c.version)
            .max();
        if let Some(latest) = latest {
            if change.version <= latest {
                return Err(VcsError::StaleVersion {
                    entity_id: change.entity_id.clone(),
                    latest,
                    attempted: change.version,
                });
            }
        }
        tables.changes.push(change.clone());
        Ok(())
    }

    async fn changes_since(&self, since: DateTime<Utc>, entity: Option<EntityKind>) -> Result<Vec<Change>> {
        Ok(self
            .tables
            .read()
            .changes
            .iter()
            .filter(|c| c.timestamp > since && entity.map_or(true, |kind| c.entity == kind))
            .cloned()
            .collect())
    }

    async fn entity_changes(&self, entity_id: &Id) -> Result<Vec<Change>> {
        Ok(self
            .tables
            .read()
            .changes
            .iter()
            .filter(|c| &c.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn latest_version(&self, entity: Option<EntityKind>, entity_id: &Id) -> Result<Option<i64>> {
        Ok(self
            .tables
            .read()
            .changes
            .iter()
            .filter(|c| &c.entity_id == entity_id && entity.map_or(true, |kind| c.entity == kind))
            .map(|c| c.version)
            .max())
    }

    async fn prune_changes(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write();
        let count = tables.changes.len();
        tables.changes.retain(|c| c.timestamp >= before);
        Ok((count - tables.changes.len()) as u64)
    }
}

#[async_trait::async_trait]
impl ConflictStore for InMemoryStore {
    async fn insert_conflict(&self, conflict: &Conflict) -> Result<()> {
        self.tables.write().conflicts.push(conflict.clone());
        Ok(())
    }

    async fn get_conflict(&self, id: &Id) -> Result<Option<Conflict>> {
        Ok(self.tables.read().conflicts.iter().find(|c| &c.id == id).cloned())
    }

    async fn list_conflicts(&self, status: Option<ConflictStatus>) -> Result<Vec<Conflict>> {
        Ok(self
            .tables
            .read()
            .conflicts
            .iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn record_resolution(&self, resolution: &ConflictResolution, status: ConflictStatus) -> Result<()> {
        let mut tables = self.tables.write();
        let conflict = tables
            .conflicts
            .iter_mut()
            .find(|c| c.id == resolution.conflict_id)
            .ok_or_else(|| VcsError::not_found("conflict", resolution.conflict_id.clone()))?;
        conflict.status = status;
        tables.resolutions.push(resolution.clone());
        Ok(())
    }

    async fn list_resolutions(&self, conflict_id: &Id) -> Result<Vec<ConflictResolution>> {
        Ok(self
            .tables
            .read()
            .resolutions
            .iter()
            .filter(|r| &r.conflict_id == conflict_id)
            .cloned()
            .collect())
    }
}

impl Store for InMemoryStore {}

/// Entity storage kept in memory, keyed by kind and id.
///
/// Updates overlay their fields onto the stored record.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    entities: RwLock<BTreeMap<(EntityKind, Id), FieldMap>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity: EntityKind, entity_id: &str) -> Option<FieldMap> {
        self.entities
            .read()
            .get(&(entity, entity_id.to_string()))
            .cloned()
    }

    pub fn insert(&self, entity: EntityKind, entity_id: impl Into<Id>, fields: FieldMap) {
        self.entities.write().insert((entity, entity_id.into()), fields);
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

#[async_trait::async_trait]
impl EntityApplier for InMemoryEntityStore {
    async fn apply_change(&self, change: &Change) -> Result<()> {
        let mut entities = self.entities.write();
        let key = (change.entity, change.entity_id.clone());
        match change.change_type {
            ChangeType::Create => {
                entities.insert(key, change.data.clone());
            }
            ChangeType::Update => {
                let record = entities.entry(key).or_default();
                for (field, value) in &change.data {
                    record.insert(field.clone(), value.clone());
                }
            }
            ChangeType::Delete => {
                entities.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EntityStateSource for InMemoryEntityStore {
    async fn entity_state(&self, entity: EntityKind) -> Result<Vec<(Id, FieldMap)>> {
        Ok(self
            .entities
            .read()
            .iter()
            .filter(|((kind, _), _)| *kind == entity)
            .map(|((_, id), fields)| (id.clone(), fields.clone()))
            .collect())
    }
}
