use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::model::{generate_id, sha256_hex, short_hash, Id};

/// Counts of entity-level changes carried by a commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesSummary {
    pub created: i64,
    pub updated: i64,
    pub deleted: i64,
}

impl ChangesSummary {
    pub fn total(&self) -> i64 {
        self.created + self.updated + self.deleted
    }
}

/// An immutable node in a repository's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: Id,
    pub repository_id: Id,
    pub branch_id: Id,
    /// Hash of the snapshot this commit records
    pub version_id: String,
    /// SHA-256 of the commit content
    pub commit_hash: String,
    pub short_hash: String,
    pub message: String,
    pub author_name: String,
    pub author_email: Option<String>,
    pub author_id: Option<Id>,
    /// Parent commit ids (empty for the initial commit)
    pub parent_commits: Vec<Id>,
    pub merge_commit: bool,
    pub changes_summary: ChangesSummary,
    pub files_changed: i32,
    pub lines_added: i32,
    pub lines_deleted: i32,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub committed_at: DateTime<Utc>,
}

/// Commit creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommit {
    pub repository_id: Id,
    pub branch_id: Id,
    pub version_id: String,
    pub message: String,
    pub author_name: String,
    pub author_email: Option<String>,
    pub author_id: Option<Id>,
    pub parent_commits: Vec<Id>,
    pub changes_summary: ChangesSummary,
    pub files_changed: i32,
    pub lines_added: i32,
    pub lines_deleted: i32,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
}

impl NewCommit {
    pub fn new(
        repository_id: impl Into<Id>,
        branch_id: impl Into<Id>,
        version_id: impl Into<String>,
        message: impl Into<String>,
        author_name: impl Into<String>,
    ) -> Self {
        Self {
            repository_id: repository_id.into(),
            branch_id: branch_id.into(),
            version_id: version_id.into(),
            message: message.into(),
            author_name: author_name.into(),
            author_email: None,
            author_id: None,
            parent_commits: Vec::new(),
            changes_summary: ChangesSummary::default(),
            files_changed: 0,
            lines_added: 0,
            lines_deleted: 0,
            tags: Vec::new(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Id>,
    {
        self.parent_commits = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_merge(&self) -> bool {
        self.parent_commits.len() >= 2
    }
}

impl Commit {
    /// Materialize a commit from a request, stamping id, time and hashes.
    pub fn new(new_commit: NewCommit) -> Self {
        let committed_at = Utc::now();
        let commit_hash = Self::calculate_hash(&new_commit, &committed_at);

        Self {
            id: generate_id(),
            merge_commit: new_commit.is_merge(),
            short_hash: short_hash(&commit_hash),
            commit_hash,
            repository_id: new_commit.repository_id,
            branch_id: new_commit.branch_id,
            version_id: new_commit.version_id,
            message: new_commit.message,
            author_name: new_commit.author_name,
            author_email: new_commit.author_email,
            author_id: new_commit.author_id,
            parent_commits: new_commit.parent_commits,
            changes_summary: new_commit.changes_summary,
            files_changed: new_commit.files_changed,
            lines_added: new_commit.lines_added,
            lines_deleted: new_commit.lines_deleted,
            tags: new_commit.tags,
            metadata: new_commit.metadata,
            committed_at,
        }
    }

    /// Calculate SHA-256 hash for the commit
    fn calculate_hash(commit: &NewCommit, committed_at: &DateTime<Utc>) -> String {
        let mut parts = vec![format!("repository:{}\n", commit.repository_id)];
        if !commit.parent_commits.is_empty() {
            parts.push(format!("parents:{}\n", commit.parent_commits.iter().join(",")));
        }
        parts.push(format!("version:{}\n", commit.version_id));
        parts.push(format!("author:{}\n", commit.author_name));
        if let Some(email) = &commit.author_email {
            parts.push(format!("email:{}\n", email));
        }
        parts.push(format!("message:{}\n", commit.message));
        parts.push(format!("committed_at:{}\n", committed_at.to_rfc3339()));
        sha256_hex(parts)
    }

    pub fn is_root(&self) -> bool {
        self.parent_commits.is_empty()
    }

    /// The first-parent link used when walking linear history
    pub fn first_parent(&self) -> Option<&Id> {
        self.parent_commits.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_stamps_hashes() {
        let commit = Commit::new(NewCommit::new("repo", "branch", "snap", "Initial", "alice"));
        assert_eq!(commit.commit_hash.len(), 64);
        assert_eq!(commit.short_hash, &commit.commit_hash[..7]);
        assert!(commit.is_root());
        assert!(!commit.merge_commit);
    }

    #[test]
    fn test_merge_flag_follows_parent_count() {
        let single = Commit::new(
            NewCommit::new("repo", "branch", "snap", "Edit", "alice").with_parents(["c1"]),
        );
        assert!(!single.merge_commit);
        assert_eq!(single.first_parent().map(String::as_str), Some("c1"));

        let merge = Commit::new(
            NewCommit::new("repo", "branch", "snap", "Merge", "alice").with_parents(["c1", "c2"]),
        );
        assert!(merge.merge_commit);
    }
}
