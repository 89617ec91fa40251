use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::logic::conflict_resolver::index_latest;
use crate::logic::{
    BranchManager, ChangeTracker, CommitGraph, ConflictResolver, ObjectStorage, SnapshotManager,
    TreeBuilder, TreeStorage,
};
use crate::model::{
    Change, ChangesSummary, Commit, Conflict, EntityKind, Id, NewCommit, Snapshot, SnapshotTrees,
    TreeKind,
};
use crate::store::{EntityApplier, EntityStateSource, Store};

/// Outcome of reconciling a local and a remote change set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Remote changes written to entity storage, in the order applied
    pub applied: Vec<Change>,
    /// Remote changes not newer than the local side
    pub skipped: usize,
    /// Conflicts detected and left pending
    pub conflicts: Vec<Conflict>,
}

/// Who is checkpointing and why
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub message: String,
    pub author_name: String,
    pub author_email: Option<String>,
    pub author_id: Option<Id>,
}

impl CheckpointRequest {
    pub fn new(author_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            author_name: author_name.into(),
            author_email: None,
            author_id: None,
        }
    }
}

/// Wires the version-control components over one store.
pub struct SyncEngine<S, A> {
    objects: Arc<ObjectStorage<S>>,
    trees: Arc<TreeStorage<S>>,
    snapshots: Arc<SnapshotManager<S>>,
    graph: Arc<CommitGraph<S>>,
    branches: Arc<BranchManager<S>>,
    tracker: Arc<ChangeTracker<S>>,
    resolver: Arc<ConflictResolver<S, A>>,
    entities: Arc<A>,
}

impl<S, A> SyncEngine<S, A>
where
    S: Store + 'static,
    A: EntityApplier + EntityStateSource + 'static,
{
    pub fn new(store: Arc<S>, entities: Arc<A>, config: &AppConfig) -> Self {
        let objects = Arc::new(ObjectStorage::new(store.clone(), &config.storage));
        let trees = Arc::new(TreeStorage::new(objects.clone()));
        let snapshots = Arc::new(SnapshotManager::new(store.clone(), trees.clone()));
        let graph = Arc::new(CommitGraph::new(store.clone(), &config.graph));
        let branches = Arc::new(BranchManager::new(store.clone(), graph.clone()));
        let tracker = Arc::new(ChangeTracker::new(store.clone(), &config.tracker));
        let resolver = Arc::new(ConflictResolver::new(store, entities.clone()));

        Self {
            objects,
            trees,
            snapshots,
            graph,
            branches,
            tracker,
            resolver,
            entities,
        }
    }

    pub fn objects(&self) -> &Arc<ObjectStorage<S>> {
        &self.objects
    }

    pub fn trees(&self) -> &Arc<TreeStorage<S>> {
        &self.trees
    }

    pub fn snapshots(&self) -> &Arc<SnapshotManager<S>> {
        &self.snapshots
    }

    pub fn graph(&self) -> &Arc<CommitGraph<S>> {
        &self.graph
    }

    pub fn branches(&self) -> &Arc<BranchManager<S>> {
        &self.branches
    }

    pub fn tracker(&self) -> &Arc<ChangeTracker<S>> {
        &self.tracker
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver<S, A>> {
        &self.resolver
    }

    /// Detect conflicts, then apply every non-conflicting remote change that
    /// is newer than what the local side has for the same entity.
    pub async fn reconcile(&self, ctx: &OpContext, local: &[Change], remote: &[Change]) -> Result<SyncReport> {
        let conflicts = self.resolver.detect_conflicts(ctx, local, remote).await?;
        let conflicted: HashSet<(EntityKind, &str)> = conflicts
            .iter()
            .map(|c| (c.entity, c.entity_id.as_str()))
            .collect();
        let local_latest = index_latest(local);

        let mut by_key: BTreeMap<(EntityKind, &str), Vec<&Change>> = BTreeMap::new();
        for change in remote {
            by_key.entry(change.key()).or_default().push(change);
        }

        let mut report = SyncReport::default();
        for (key, mut changes) in by_key {
            if conflicted.contains(&key) {
                continue;
            }
            changes.sort_by(|a, b| (a.timestamp, a.version).cmp(&(b.timestamp, b.version)));
            let watermark = local_latest
                .get(&(key.0, key.1.to_string()))
                .map(|c| (c.timestamp, c.version));

            for change in changes {
                let newer = watermark.map_or(true, |mark| (change.timestamp, change.version) > mark);
                if !newer {
                    report.skipped += 1;
                    continue;
                }
                ctx.run(self.entities.apply_change(change)).await?;
                report.applied.push(change.clone());
            }
        }

        log::info!(
            "Reconciled {} local / {} remote changes: {} applied, {} skipped, {} conflicts",
            local.len(),
            remote.len(),
            report.applied.len(),
            report.skipped,
            conflicts.len()
        );
        report.conflicts = conflicts;
        Ok(report)
    }

    /// Snapshot current entity state and commit it on top of the branch head.
    pub async fn checkpoint(&self, ctx: &OpContext, branch_id: &Id, request: CheckpointRequest) -> Result<Commit> {
        let branch = self.branches.get(ctx, branch_id).await?;
        if !branch.is_active() {
            return Err(VcsError::InvalidState(format!(
                "branch '{}' is {}",
                branch.name,
                branch.status.as_str()
            )));
        }

        let mut slots = SnapshotTrees::default();
        let mut counts = serde_json::Map::new();
        for tree_kind in TreeKind::ALL {
            let mut builder = TreeBuilder::new();
            for entity in EntityKind::ALL.into_iter().filter(|e| e.tree_kind() == tree_kind) {
                let state = ctx.run(self.entities.entity_state(entity)).await?;
                counts.insert(entity.as_str().to_string(), state.len().into());
                for (id, fields) in state {
                    let name = if builder.tree().get(&id).is_some() {
                        format!("{}/{}", entity, id)
                    } else {
                        id
                    };
                    builder.add_json(name, &fields)?;
                }
            }
            let hash = self.trees.store_built(ctx, builder).await?;
            slots.set(tree_kind, hash);
        }

        let snapshot = Snapshot::new(
            branch.repository_id.clone(),
            slots.clone(),
            serde_json::json!({
                "entities": counts,
                "repository_id": branch.repository_id,
                "parent": branch.head_commit,
            }),
        );
        let created = self.snapshots.create(ctx, snapshot).await;
        // the snapshot now owns the tree references taken while building
        let cleanup = OpContext::background();
        for kind in TreeKind::ALL {
            if let Err(e) = self.trees.release(&cleanup, slots.get(kind)).await {
                log::warn!("Failed to release {} tree {}: {}", kind, slots.get(kind), e);
            }
        }
        let snapshot_hash = created?;

        let mut summary = ChangesSummary::default();
        let mut files_changed = 0;
        match &branch.head_commit {
            Some(head) => {
                let parent = self.graph.get_commit(ctx, head).await?;
                let previous = self.snapshots.get_by_hash(ctx, &parent.version_id).await?;
                for kind in TreeKind::ALL {
                    let diff = self.trees.diff(ctx, previous.tree(kind), slots.get(kind)).await?;
                    summary.created += diff.added.len() as i64;
                    summary.updated += diff.modified.len() as i64;
                    summary.deleted += diff.removed.len() as i64;
                    if kind == TreeKind::Files {
                        files_changed = diff.total() as i32;
                    }
                }
            }
            None => {
                for kind in TreeKind::ALL {
                    let tree = self.trees.load(ctx, slots.get(kind)).await?;
                    summary.created += tree.len() as i64;
                    if kind == TreeKind::Files {
                        files_changed = tree.len() as i32;
                    }
                }
            }
        }

        let mut new_commit = NewCommit::new(
            branch.repository_id.clone(),
            branch.id.clone(),
            snapshot_hash,
            request.message,
            request.author_name,
        )
        .with_parents(branch.head_commit.clone());
        new_commit.author_email = request.author_email;
        new_commit.author_id = request.author_id;
        new_commit.lines_added = (summary.created + summary.updated) as i32;
        new_commit.lines_deleted = summary.deleted as i32;
        new_commit.files_changed = files_changed;
        new_commit.changes_summary = summary;

        let commit = self.graph.create_commit(ctx, new_commit).await?;
        self.branches
            .compare_and_set_head(ctx, branch_id, branch.head_commit.as_ref(), &commit.id)
            .await?;

        log::info!(
            "Checkpoint {} on '{}': +{} ~{} -{}",
            commit.short_hash,
            branch.name,
            commit.changes_summary.created,
            commit.changes_summary.updated,
            commit.changes_summary.deleted
        );
        Ok(commit)
    }
}
