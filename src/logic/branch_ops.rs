use std::sync::Arc;

use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::logic::CommitGraph;
use crate::model::{Branch, Commit, Id, NewBranch};
use crate::store::{BranchStore, CommitStore, SnapshotStore};

/// Branch lifecycle and head movement.
pub struct BranchManager<S> {
    rows: Arc<S>,
    graph: Arc<CommitGraph<S>>,
}

impl<S: BranchStore + CommitStore + SnapshotStore> BranchManager<S> {
    pub fn new(rows: Arc<S>, graph: Arc<CommitGraph<S>>) -> Self {
        Self { rows, graph }
    }

    /// Create a branch. The first branch of a repository becomes its default.
    pub async fn create(&self, ctx: &OpContext, mut new_branch: NewBranch) -> Result<Branch> {
        new_branch.name = new_branch.name.trim().to_string();
        if new_branch.name.is_empty() {
            return Err(VcsError::InvalidInput("branch name must not be empty".to_string()));
        }

        if let Some(base) = &new_branch.base_commit {
            let commit = self.require_commit(ctx, &new_branch.name, base).await?;
            if commit.repository_id != new_branch.repository_id {
                return Err(VcsError::InvalidInput(format!(
                    "base commit {} belongs to repository {}",
                    base, commit.repository_id
                )));
            }
        }

        if ctx
            .run(self.rows.get_branch_by_name(&new_branch.repository_id, &new_branch.name))
            .await?
            .is_some()
        {
            return Err(VcsError::AlreadyExists {
                kind: "branch",
                key: new_branch.name,
            });
        }

        if !new_branch.is_default
            && ctx
                .run(self.rows.get_default_branch(&new_branch.repository_id))
                .await?
                .is_none()
        {
            new_branch.is_default = true;
        }

        let branch = new_branch.into_branch();
        ctx.run(self.rows.insert_branch(&branch)).await?;
        log::info!(
            "Created {} branch '{}' in repository {}",
            branch.branch_type,
            branch.name,
            branch.repository_id
        );
        Ok(branch)
    }

    pub async fn get(&self, ctx: &OpContext, id: &Id) -> Result<Branch> {
        ctx.run(self.rows.get_branch(id))
            .await?
            .ok_or_else(|| VcsError::not_found("branch", id.clone()))
    }

    pub async fn get_by_name(&self, ctx: &OpContext, repository_id: &Id, name: &str) -> Result<Branch> {
        ctx.run(self.rows.get_branch_by_name(repository_id, name))
            .await?
            .ok_or_else(|| VcsError::not_found("branch", name))
    }

    pub async fn list(&self, ctx: &OpContext, repository_id: &Id) -> Result<Vec<Branch>> {
        ctx.run(self.rows.list_branches(repository_id)).await
    }

    pub async fn get_default(&self, ctx: &OpContext, repository_id: &Id) -> Result<Branch> {
        ctx.run(self.rows.get_default_branch(repository_id))
            .await?
            .ok_or_else(|| VcsError::not_found("default branch", repository_id.clone()))
    }

    pub async fn set_default(&self, ctx: &OpContext, repository_id: &Id, branch_id: &Id) -> Result<Branch> {
        let branch = self.get(ctx, branch_id).await?;
        if &branch.repository_id != repository_id {
            return Err(VcsError::not_found("branch", branch_id.clone()));
        }
        if !branch.is_active() {
            return Err(VcsError::InvalidState(format!(
                "branch '{}' is {} and cannot become the default",
                branch.name,
                branch.status.as_str()
            )));
        }
        if !ctx.run(self.rows.set_default_branch(repository_id, branch_id)).await? {
            return Err(VcsError::not_found("branch", branch_id.clone()));
        }
        self.get(ctx, branch_id).await
    }

    /// Point the branch at `commit_id` unconditionally.
    pub async fn set_head(&self, ctx: &OpContext, branch_id: &Id, commit_id: &Id) -> Result<Branch> {
        let branch = self.active_branch(ctx, branch_id).await?;
        self.require_same_repository(ctx, &branch, commit_id).await?;

        if !ctx.run(self.rows.set_branch_head(branch_id, commit_id)).await? {
            return Err(VcsError::InvalidState(format!(
                "branch '{}' is no longer active",
                branch.name
            )));
        }
        log::debug!("Branch '{}' head -> {}", branch.name, commit_id);
        self.get(ctx, branch_id).await
    }

    /// Point the branch at `commit_id` only if its head is still `expected`.
    pub async fn compare_and_set_head(
        &self,
        ctx: &OpContext,
        branch_id: &Id,
        expected: Option<&Id>,
        commit_id: &Id,
    ) -> Result<Branch> {
        let branch = self.active_branch(ctx, branch_id).await?;
        self.require_same_repository(ctx, &branch, commit_id).await?;

        if !ctx
            .run(self.rows.compare_and_set_branch_head(branch_id, expected, commit_id))
            .await?
        {
            let current = self.get(ctx, branch_id).await?;
            if !current.is_active() {
                return Err(VcsError::InvalidState(format!(
                    "branch '{}' is no longer active",
                    current.name
                )));
            }
            return Err(VcsError::StaleHead {
                branch_id: branch_id.clone(),
                expected: expected.cloned(),
                found: current.head_commit,
            });
        }
        self.get(ctx, branch_id).await
    }

    /// Advance the head to a descendant of the current head.
    pub async fn fast_forward(&self, ctx: &OpContext, branch_id: &Id, commit_id: &Id) -> Result<Branch> {
        let branch = self.active_branch(ctx, branch_id).await?;
        if let Some(head) = &branch.head_commit {
            if head == commit_id {
                return Ok(branch);
            }
            if !self.graph.is_ancestor(ctx, head, commit_id).await? {
                return Err(VcsError::InvalidState(format!(
                    "cannot fast-forward '{}': {} does not descend from its head",
                    branch.name, commit_id
                )));
            }
        }
        self.compare_and_set_head(ctx, branch_id, branch.head_commit.as_ref(), commit_id)
            .await
    }

    /// Fast-forward `target` to the head of `source` and mark `source` merged.
    pub async fn merge_into(
        &self,
        ctx: &OpContext,
        source_id: &Id,
        target_id: &Id,
        merged_by: &str,
    ) -> Result<Branch> {
        let mut source = self.active_branch(ctx, source_id).await?;
        let target = self.active_branch(ctx, target_id).await?;
        if source.repository_id != target.repository_id {
            return Err(VcsError::InvalidInput(
                "branches belong to different repositories".to_string(),
            ));
        }

        if let Some(head) = &source.head_commit {
            self.fast_forward(ctx, target_id, head).await?;
        }

        source.mark_as_merged(merged_by)?;
        ctx.run(self.rows.update_branch_state(&source)).await?;
        log::info!("Merged branch '{}' into '{}'", source.name, target.name);
        Ok(source)
    }

    pub async fn delete(&self, ctx: &OpContext, branch_id: &Id) -> Result<Branch> {
        let mut branch = self.get(ctx, branch_id).await?;
        if branch.is_default {
            return Err(VcsError::InvalidState(format!(
                "branch '{}' is the default branch; choose another default first",
                branch.name
            )));
        }
        branch.mark_as_deleted()?;
        ctx.run(self.rows.update_branch_state(&branch)).await?;
        log::info!("Deleted branch '{}'", branch.name);
        Ok(branch)
    }

    /// Commits recorded on a branch, newest first
    pub async fn commits(&self, ctx: &OpContext, branch_id: &Id, limit: i64) -> Result<Vec<Commit>> {
        self.get(ctx, branch_id).await?;
        self.graph.list_by_branch(ctx, branch_id, limit).await
    }

    async fn active_branch(&self, ctx: &OpContext, branch_id: &Id) -> Result<Branch> {
        let branch = self.get(ctx, branch_id).await?;
        if !branch.is_active() {
            return Err(VcsError::InvalidState(format!(
                "branch '{}' is {}",
                branch.name,
                branch.status.as_str()
            )));
        }
        Ok(branch)
    }

    async fn require_commit(&self, ctx: &OpContext, owner: &str, commit_id: &Id) -> Result<Commit> {
        match self.graph.get_commit(ctx, commit_id).await {
            Ok(commit) => Ok(commit),
            Err(e) if e.is_not_found() => Err(VcsError::dangling(
                format!("branch '{}'", owner),
                "commit",
                commit_id.clone(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn require_same_repository(&self, ctx: &OpContext, branch: &Branch, commit_id: &Id) -> Result<()> {
        let commit = self.require_commit(ctx, &branch.name, commit_id).await?;
        if commit.repository_id != branch.repository_id {
            return Err(VcsError::InvalidInput(format!(
                "commit {} belongs to repository {}",
                commit_id, commit.repository_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::model::{BranchStatus, NewCommit, Snapshot, SnapshotTrees};
    use crate::store::InMemoryStore;
    use serde_json::json;

    const REPO: &str = "repo-1";

    struct Fixture {
        branches: BranchManager<InMemoryStore>,
        graph: Arc<CommitGraph<InMemoryStore>>,
        snapshot: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let snapshot = Snapshot::new(REPO.into(), SnapshotTrees::default(), json!({}));
        store.insert_snapshot(&snapshot).await.unwrap();
        let graph = Arc::new(CommitGraph::new(store.clone(), &GraphConfig::default()));
        Fixture {
            branches: BranchManager::new(store, graph.clone()),
            graph,
            snapshot: snapshot.hash,
        }
    }

    impl Fixture {
        async fn commit(&self, branch: &Branch, parents: &[&Id]) -> Commit {
            let new_commit = NewCommit::new(REPO, branch.id.clone(), self.snapshot.clone(), "edit", "alice")
                .with_parents(parents.iter().map(|p| (*p).clone()));
            self.graph
                .create_commit(&OpContext::background(), new_commit)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_branch_becomes_default() {
        let f = fixture().await;
        let ctx = OpContext::background();

        let main = f.branches.create(&ctx, NewBranch::new(REPO, "main", "alice")).await.unwrap();
        assert!(main.is_default);
        let feature = f
            .branches
            .create(&ctx, NewBranch::new(REPO, "feature/hvac", "alice"))
            .await
            .unwrap();
        assert!(!feature.is_default);

        let switched = f.branches.set_default(&ctx, &REPO.to_string(), &feature.id).await.unwrap();
        assert!(switched.is_default);
        let main = f.branches.get(&ctx, &main.id).await.unwrap();
        assert!(!main.is_default);

        let err = f
            .branches
            .create(&ctx, NewBranch::new(REPO, "main", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_compare_and_set_detects_stale_head() {
        let f = fixture().await;
        let ctx = OpContext::background();
        let main = f.branches.create(&ctx, NewBranch::main(REPO, "alice")).await.unwrap();

        let c1 = f.commit(&main, &[]).await;
        let main = f.branches.compare_and_set_head(&ctx, &main.id, None, &c1.id).await.unwrap();
        assert_eq!(main.head_commit.as_ref(), Some(&c1.id));

        let c2 = f.commit(&main, &[&c1.id]).await;
        let err = f
            .branches
            .compare_and_set_head(&ctx, &main.id, None, &c2.id)
            .await
            .unwrap_err();
        match err {
            VcsError::StaleHead { found, .. } => assert_eq!(found, Some(c1.id.clone())),
            other => panic!("expected StaleHead, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fast_forward_requires_descendant() {
        let f = fixture().await;
        let ctx = OpContext::background();
        let main = f.branches.create(&ctx, NewBranch::main(REPO, "alice")).await.unwrap();

        let c1 = f.commit(&main, &[]).await;
        let c2 = f.commit(&main, &[&c1.id]).await;
        let side = f.commit(&main, &[&c1.id]).await;

        f.branches.set_head(&ctx, &main.id, &c2.id).await.unwrap();
        let err = f.branches.fast_forward(&ctx, &main.id, &side.id).await.unwrap_err();
        assert!(matches!(err, VcsError::InvalidState(_)));

        let c3 = f.commit(&main, &[&c2.id]).await;
        let main = f.branches.fast_forward(&ctx, &main.id, &c3.id).await.unwrap();
        assert_eq!(main.head_commit, Some(c3.id));
    }

    #[tokio::test]
    async fn test_set_head_rejects_unknown_commit() {
        let f = fixture().await;
        let ctx = OpContext::background();
        let main = f.branches.create(&ctx, NewBranch::main(REPO, "alice")).await.unwrap();
        let err = f
            .branches
            .set_head(&ctx, &main.id, &"missing".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::DanglingReference { .. }));
    }

    #[tokio::test]
    async fn test_merge_into_marks_source_merged() {
        let f = fixture().await;
        let ctx = OpContext::background();
        let main = f.branches.create(&ctx, NewBranch::main(REPO, "alice")).await.unwrap();
        let c1 = f.commit(&main, &[]).await;
        let main = f.branches.set_head(&ctx, &main.id, &c1.id).await.unwrap();

        let feature = f
            .branches
            .create(&ctx, NewBranch::new(REPO, "feature/lighting", "bob").from_commit(c1.id.clone()))
            .await
            .unwrap();
        let c2 = f.commit(&feature, &[&c1.id]).await;
        f.branches.set_head(&ctx, &feature.id, &c2.id).await.unwrap();

        let merged = f.branches.merge_into(&ctx, &feature.id, &main.id, "carol").await.unwrap();
        assert_eq!(merged.status, BranchStatus::Merged);
        let main = f.branches.get(&ctx, &main.id).await.unwrap();
        assert_eq!(main.head_commit, Some(c2.id));

        // merged is terminal
        assert!(f.branches.set_head(&ctx, &feature.id, &c1.id).await.is_err());
        assert!(f.branches.delete(&ctx, &feature.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let f = fixture().await;
        let ctx = OpContext::background();
        let main = f.branches.create(&ctx, NewBranch::main(REPO, "alice")).await.unwrap();
        let scratch = f
            .branches
            .create(&ctx, NewBranch::new(REPO, "scratch", "alice"))
            .await
            .unwrap();

        assert!(matches!(
            f.branches.delete(&ctx, &main.id).await,
            Err(VcsError::InvalidState(_))
        ));
        let deleted = f.branches.delete(&ctx, &scratch.id).await.unwrap();
        assert_eq!(deleted.status, BranchStatus::Deleted);

        // the name is free again
        f.branches
            .create(&ctx, NewBranch::new(REPO, "scratch", "bob"))
            .await
            .unwrap();
    }
}
