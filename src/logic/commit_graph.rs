use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::GraphConfig;
use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::model::{is_hash_prefix, Commit, Id, NewCommit, SHORT_HASH_LEN};
use crate::store::{CommitStore, SnapshotStore};

/// How an ancestry walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    /// The visitor asked to stop
    Stopped,
    /// Every reachable ancestor was visited
    Exhausted,
    /// The traversal cap was hit first
    Capped,
}

/// Append-only DAG of commits.
pub struct CommitGraph<S> {
    rows: Arc<S>,
    max_traversal: usize,
}

impl<S: CommitStore + SnapshotStore> CommitGraph<S> {
    pub fn new(rows: Arc<S>, config: &GraphConfig) -> Self {
        Self {
            rows,
            max_traversal: config.max_traversal.max(1),
        }
    }

    /// Record a commit.
    ///
    /// Only the first commit of a repository may be parentless. Every
    /// parent must already exist in the same repository, and the snapshot
    /// it points at must exist.
    pub async fn create_commit(&self, ctx: &OpContext, new_commit: NewCommit) -> Result<Commit> {
        let unique: HashSet<&Id> = new_commit.parent_commits.iter().collect();
        if unique.len() != new_commit.parent_commits.len() {
            return Err(VcsError::InvalidInput("duplicate parent commit".to_string()));
        }

        if ctx.run(self.rows.get_snapshot(&new_commit.version_id)).await?.is_none() {
            return Err(VcsError::dangling(
                format!("commit on branch {}", new_commit.branch_id),
                "snapshot",
                new_commit.version_id.clone(),
            ));
        }

        if new_commit.parent_commits.is_empty() {
            let existing = ctx.run(self.rows.count_commits(&new_commit.repository_id)).await?;
            if existing > 0 {
                return Err(VcsError::InvalidState(format!(
                    "repository {} already has a root commit",
                    new_commit.repository_id
                )));
            }
        } else {
            let parents = ctx.run(self.rows.get_commits(&new_commit.parent_commits)).await?;
            for parent_id in &new_commit.parent_commits {
                let Some(parent) = parents.iter().find(|p| &p.id == parent_id) else {
                    return Err(VcsError::dangling(
                        format!("commit on branch {}", new_commit.branch_id),
                        "commit",
                        parent_id.clone(),
                    ));
                };
                if parent.repository_id != new_commit.repository_id {
                    return Err(VcsError::InvalidInput(format!(
                        "parent {} belongs to repository {}",
                        parent_id, parent.repository_id
                    )));
                }
            }
        }

        let commit = Commit::new(new_commit);
        ctx.run(self.rows.insert_commit(&commit)).await?;
        log::info!(
            "Created commit {} on branch {} ({} parents)",
            commit.short_hash,
            commit.branch_id,
            commit.parent_commits.len()
        );
        Ok(commit)
    }

    pub async fn get_commit(&self, ctx: &OpContext, id: &Id) -> Result<Commit> {
        ctx.run(self.rows.get_commit(id))
            .await?
            .ok_or_else(|| VcsError::not_found("commit", id.clone()))
    }

    /// Look up a commit by full hash or an unambiguous prefix of at least
    /// `SHORT_HASH_LEN` characters.
    pub async fn get_by_hash(&self, ctx: &OpContext, repository_id: &Id, hash: &str) -> Result<Commit> {
        let hash = hash.trim().to_lowercase();
        if !is_hash_prefix(&hash) || hash.len() < SHORT_HASH_LEN {
            return Err(VcsError::InvalidInput(format!("'{}' is not a commit hash", hash)));
        }
        let mut matches = ctx
            .run(self.rows.find_commits_by_hash_prefix(repository_id, &hash))
            .await?;
        match matches.len() {
            0 => Err(VcsError::not_found("commit", hash)),
            1 => Ok(matches.remove(0)),
            _ => Err(VcsError::InvalidInput(format!("commit hash '{}' is ambiguous", hash))),
        }
    }

    /// Parents in recorded order
    pub async fn get_parents(&self, ctx: &OpContext, id: &Id) -> Result<Vec<Commit>> {
        let commit = self.get_commit(ctx, id).await?;
        let mut parents = ctx.run(self.rows.get_commits(&commit.parent_commits)).await?;
        parents.sort_by_key(|p| commit.parent_commits.iter().position(|id| id == &p.id));
        Ok(parents)
    }

    pub async fn get_children(&self, ctx: &OpContext, id: &Id) -> Result<Vec<Commit>> {
        self.get_commit(ctx, id).await?;
        ctx.run(self.rows.get_child_commits(id)).await
    }

    /// Whether `ancestor` is reachable from `descendant` through parent links.
    ///
    /// A commit counts as its own ancestor. If the walk exceeds the
    /// traversal cap the answer is `false`.
    pub async fn is_ancestor(&self, ctx: &OpContext, ancestor: &Id, descendant: &Id) -> Result<bool> {
        let target = self.get_commit(ctx, ancestor).await?;
        let start = self.get_commit(ctx, descendant).await?;
        if target.repository_id != start.repository_id {
            return Ok(false);
        }

        let walk = self
            .walk_ancestors(ctx, &start.id, |commit, _| commit.id == target.id)
            .await?;
        if walk == Walk::Capped {
            log::warn!(
                "Ancestry check {} -> {} stopped after {} commits",
                target.short_hash,
                start.short_hash,
                self.max_traversal
            );
        }
        Ok(walk == Walk::Stopped)
    }

    /// Nearest common ancestor of two commits, if any.
    pub async fn merge_base(&self, ctx: &OpContext, left: &Id, right: &Id) -> Result<Option<Id>> {
        self.get_commit(ctx, right).await?;

        let mut left_ancestors = HashSet::new();
        let left_walk = self
            .walk_ancestors(ctx, left, |commit, _| {
                left_ancestors.insert(commit.id.clone());
                false
            })
            .await?;

        let mut base = None;
        let right_walk = self
            .walk_ancestors(ctx, right, |commit, _| {
                if left_ancestors.contains(&commit.id) {
                    base = Some(commit.id.clone());
                    true
                } else {
                    false
                }
            })
            .await?;

        if base.is_none() && (left_walk == Walk::Capped || right_walk == Walk::Capped) {
            log::warn!("Merge base search for {} and {} hit the traversal cap", left, right);
        }
        Ok(base)
    }

    /// Ancestors of `id` (inclusive), breadth-first, newest first.
    pub async fn history(&self, ctx: &OpContext, id: &Id, limit: usize) -> Result<Vec<Commit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut commits = Vec::new();
        self.walk_ancestors(ctx, id, |commit, _| {
            commits.push(commit.clone());
            commits.len() >= limit
        })
        .await?;
        commits.sort_by(|a, b| b.committed_at.cmp(&a.committed_at));
        Ok(commits)
    }

    /// Newest first
    pub async fn list_by_repository(
        &self,
        ctx: &OpContext,
        repository_id: &Id,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Commit>> {
        ctx.run(self.rows.list_commits(repository_id, limit, offset)).await
    }

    pub async fn list_by_branch(&self, ctx: &OpContext, branch_id: &Id, limit: i64) -> Result<Vec<Commit>> {
        ctx.run(self.rows.list_branch_commits(branch_id, limit)).await
    }

    /// Breadth-first walk over `start` and its ancestors, one store round
    /// trip per generation. `visit` returns true to stop.
    async fn walk_ancestors<F>(&self, ctx: &OpContext, start: &Id, mut visit: F) -> Result<Walk>
    where
        F: FnMut(&Commit, usize) -> bool + Send,
    {
        let mut visited: HashSet<Id> = HashSet::from([start.clone()]);
        let mut frontier = vec![start.clone()];
        let mut depth = 0;

        while !frontier.is_empty() {
            let commits = ctx.run(self.rows.get_commits(&frontier)).await?;
            let by_id: HashMap<&str, &Commit> = commits.iter().map(|c| (c.id.as_str(), c)).collect();

            let mut next = Vec::new();
            for id in &frontier {
                let Some(commit) = by_id.get(id.as_str()) else {
                    if depth == 0 {
                        return Err(VcsError::not_found("commit", id.clone()));
                    }
                    log::warn!("Commit graph references missing commit {}", id);
                    continue;
                };
                if visit(commit, depth) {
                    return Ok(Walk::Stopped);
                }
                for parent in &commit.parent_commits {
                    if visited.contains(parent) {
                        continue;
                    }
                    if visited.len() >= self.max_traversal {
                        return Ok(Walk::Capped);
                    }
                    visited.insert(parent.clone());
                    next.push(parent.clone());
                }
            }

            frontier = next;
            depth += 1;
        }

        Ok(Walk::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Snapshot, SnapshotTrees};
    use crate::store::InMemoryStore;
    use serde_json::json;

    const REPO: &str = "repo-1";

    async fn graph_with_cap(max_traversal: usize) -> (CommitGraph<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::new());
        let snapshot = Snapshot::new(REPO.into(), SnapshotTrees::default(), json!({}));
        store.insert_snapshot(&snapshot).await.unwrap();
        (CommitGraph::new(store, &GraphConfig { max_traversal }), snapshot.hash)
    }

    async fn commit(
        graph: &CommitGraph<InMemoryStore>,
        snapshot: &str,
        message: &str,
        parents: &[&Commit],
    ) -> Commit {
        let new_commit = NewCommit::new(REPO, "branch-1", snapshot, message, "alice")
            .with_parents(parents.iter().map(|p| p.id.clone()));
        graph.create_commit(&OpContext::background(), new_commit).await.unwrap()
    }

    #[tokio::test]
    async fn test_root_then_linear_history() {
        let (graph, snap) = graph_with_cap(100).await;
        let ctx = OpContext::background();

        let c1 = commit(&graph, &snap, "survey", &[]).await;
        let c2 = commit(&graph, &snap, "add floors", &[&c1]).await;
        let c3 = commit(&graph, &snap, "add rooms", &[&c2]).await;

        assert!(c1.is_root());
        assert!(graph.is_ancestor(&ctx, &c1.id, &c3.id).await.unwrap());
        assert!(graph.is_ancestor(&ctx, &c3.id, &c3.id).await.unwrap());
        assert!(!graph.is_ancestor(&ctx, &c3.id, &c1.id).await.unwrap());

        let history = graph.history(&ctx, &c3.id, 10).await.unwrap();
        let ids: Vec<_> = history.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec![c3.id.clone(), c2.id.clone(), c1.id.clone()]);

        let children = graph.get_children(&ctx, &c1.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, c2.id);
    }

    #[tokio::test]
    async fn test_second_root_is_rejected() {
        let (graph, snap) = graph_with_cap(100).await;
        commit(&graph, &snap, "root", &[]).await;
        let err = graph
            .create_commit(
                &OpContext::background(),
                NewCommit::new(REPO, "branch-1", snap.clone(), "another root", "bob"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_missing_parent_and_snapshot() {
        let (graph, snap) = graph_with_cap(100).await;
        let ctx = OpContext::background();
        commit(&graph, &snap, "root", &[]).await;

        let orphan = NewCommit::new(REPO, "branch-1", snap.clone(), "orphan", "bob").with_parents(["nope"]);
        assert!(matches!(
            graph.create_commit(&ctx, orphan).await,
            Err(VcsError::DanglingReference { kind: "commit", .. })
        ));

        let no_snapshot = NewCommit::new(REPO, "branch-1", "f".repeat(64), "x", "bob");
        assert!(matches!(
            graph.create_commit(&ctx, no_snapshot).await,
            Err(VcsError::DanglingReference { kind: "snapshot", .. })
        ));
    }

    #[tokio::test]
    async fn test_merge_commit_and_merge_base() {
        let (graph, snap) = graph_with_cap(100).await;
        let ctx = OpContext::background();

        let root = commit(&graph, &snap, "root", &[]).await;
        let base = commit(&graph, &snap, "base", &[&root]).await;
        let left = commit(&graph, &snap, "hvac", &[&base]).await;
        let right = commit(&graph, &snap, "electrical", &[&base]).await;
        let merge = commit(&graph, &snap, "merge", &[&left, &right]).await;

        assert!(merge.merge_commit);
        assert_eq!(graph.merge_base(&ctx, &left.id, &right.id).await.unwrap(), Some(base.id.clone()));
        assert_eq!(graph.merge_base(&ctx, &merge.id, &left.id).await.unwrap(), Some(left.id.clone()));
        assert!(graph.is_ancestor(&ctx, &right.id, &merge.id).await.unwrap());
        assert!(!graph.is_ancestor(&ctx, &left.id, &right.id).await.unwrap());

        let parents = graph.get_parents(&ctx, &merge.id).await.unwrap();
        assert_eq!(parents[0].id, left.id);
        assert_eq!(parents[1].id, right.id);
    }

    #[tokio::test]
    async fn test_traversal_cap_answers_false() {
        let (graph, snap) = graph_with_cap(3).await;
        let ctx = OpContext::background();

        let mut chain = vec![commit(&graph, &snap, "c0", &[]).await];
        for i in 1..10 {
            let next = commit(&graph, &snap, &format!("c{}", i), &[chain.last().unwrap()]).await;
            chain.push(next);
        }
        assert!(graph.is_ancestor(&ctx, &chain[8].id, &chain[9].id).await.unwrap());
        assert!(!graph.is_ancestor(&ctx, &chain[0].id, &chain[9].id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lookup_by_short_hash() {
        let (graph, snap) = graph_with_cap(100).await;
        let ctx = OpContext::background();
        let root = commit(&graph, &snap, "root", &[]).await;

        let found = graph.get_by_hash(&ctx, &REPO.to_string(), &root.short_hash).await.unwrap();
        assert_eq!(found.id, root.id);
        assert!(graph.get_by_hash(&ctx, &REPO.to_string(), "xyz").await.is_err());
        assert!(graph
            .get_by_hash(&ctx, &"other".to_string(), &root.commit_hash)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
