use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VcsError};
use crate::model::{generate_id, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,  // Branch is accepting commits
    Merged,  // Branch has been merged; terminal
    Deleted, // Branch was deleted; terminal
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Active => "active",
            BranchStatus::Merged => "merged",
            BranchStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for BranchStatus {
    type Err = VcsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(BranchStatus::Active),
            "merged" => Ok(BranchStatus::Merged),
            "deleted" => Ok(BranchStatus::Deleted),
            _ => Err(VcsError::Serialization(format!("Unknown branch status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchType {
    Main,
    Feature,
    Release,
    Hotfix,
    /// Branch holding a replica's reconciled changes
    Sync,
}

impl BranchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchType::Main => "main",
            BranchType::Feature => "feature",
            BranchType::Release => "release",
            BranchType::Hotfix => "hotfix",
            BranchType::Sync => "sync",
        }
    }
}

impl std::fmt::Display for BranchType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BranchType {
    type Err = VcsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "main" => Ok(BranchType::Main),
            "feature" => Ok(BranchType::Feature),
            "release" => Ok(BranchType::Release),
            "hotfix" => Ok(BranchType::Hotfix),
            "sync" => Ok(BranchType::Sync),
            _ => Err(VcsError::Serialization(format!("Unknown branch type: {}", s))),
        }
    }
}

/// A named, mutable pointer to a head commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    pub repository_id: Id,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Commit the branch was cut from
    pub base_commit: Option<Id>,
    /// Latest commit on the branch (None until the first commit)
    pub head_commit: Option<Id>,
    pub branch_type: BranchType,
    pub protected: bool,
    pub requires_review: bool,
    pub auto_delete_on_merge: bool,
    pub status: BranchStatus,
    pub is_default: bool,
    pub created_by: String,
    pub owned_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_by: Option<String>,
}

/// Branch creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBranch {
    pub repository_id: Id,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub base_commit: Option<Id>,
    pub branch_type: BranchType,
    pub protected: bool,
    pub requires_review: bool,
    pub auto_delete_on_merge: bool,
    pub is_default: bool,
    pub created_by: String,
    pub owned_by: Option<String>,
}

impl NewBranch {
    pub fn new(repository_id: impl Into<Id>, name: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            name: name.into(),
            display_name: None,
            description: None,
            base_commit: None,
            branch_type: BranchType::Feature,
            protected: false,
            requires_review: false,
            auto_delete_on_merge: false,
            is_default: false,
            created_by: created_by.into(),
            owned_by: None,
        }
    }

    /// The protected default `main` branch of a repository.
    pub fn main(repository_id: impl Into<Id>, created_by: impl Into<String>) -> Self {
        Self {
            branch_type: BranchType::Main,
            protected: true,
            is_default: true,
            description: Some("Default main branch".to_string()),
            ..Self::new(repository_id, "main", created_by)
        }
    }

    pub fn from_commit(mut self, commit_id: impl Into<Id>) -> Self {
        self.base_commit = Some(commit_id.into());
        self
    }

    pub fn into_branch(self) -> Branch {
        let now = Utc::now();
        Branch {
            id: generate_id(),
            repository_id: self.repository_id,
            name: self.name,
            display_name: self.display_name,
            description: self.description,
            head_commit: self.base_commit.clone(),
            base_commit: self.base_commit,
            branch_type: self.branch_type,
            protected: self.protected,
            requires_review: self.requires_review,
            auto_delete_on_merge: self.auto_delete_on_merge,
            status: BranchStatus::Active,
            is_default: self.is_default,
            created_by: self.created_by,
            owned_by: self.owned_by,
            created_at: now,
            updated_at: now,
            merged_at: None,
            merged_by: None,
        }
    }
}

impl Branch {
    pub fn is_active(&self) -> bool {
        self.status == BranchStatus::Active
    }

    pub fn can_be_merged(&self) -> bool {
        self.status == BranchStatus::Active
    }

    pub fn can_be_deleted(&self) -> bool {
        self.status == BranchStatus::Active && !self.protected
    }

    /// `active -> merged`; irreversible.
    pub fn mark_as_merged(&mut self, merged_by: impl Into<String>) -> Result<()> {
        if !self.can_be_merged() {
            return Err(VcsError::InvalidState(format!(
                "branch '{}' cannot be merged (status: {})",
                self.name,
                self.status.as_str()
            )));
        }
        let now = Utc::now();
        self.status = BranchStatus::Merged;
        self.merged_at = Some(now);
        self.merged_by = Some(merged_by.into());
        self.updated_at = now;
        Ok(())
    }

    /// `active -> deleted`; rejected for protected branches.
    pub fn mark_as_deleted(&mut self) -> Result<()> {
        if !self.can_be_deleted() {
            let reason = if self.protected {
                "protected".to_string()
            } else {
                format!("status: {}", self.status.as_str())
            };
            return Err(VcsError::InvalidState(format!(
                "branch '{}' cannot be deleted ({})",
                self.name, reason
            )));
        }
        self.status = BranchStatus::Deleted;
        self.is_default = false;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_branch_starts_at_base_commit() {
        let branch = NewBranch::new("repo-1", "feature/hvac", "alice")
            .from_commit("c1")
            .into_branch();
        assert_eq!(branch.head_commit.as_deref(), Some("c1"));
        assert_eq!(branch.base_commit.as_deref(), Some("c1"));
        assert_eq!(branch.status, BranchStatus::Active);
        assert!(!branch.is_default);
    }

    #[test]
    fn test_merged_is_terminal() {
        let mut branch = NewBranch::new("repo-1", "feature/hvac", "alice").into_branch();
        branch.mark_as_merged("bob").unwrap();
        assert_eq!(branch.status, BranchStatus::Merged);
        assert_eq!(branch.merged_by.as_deref(), Some("bob"));
        assert!(branch.merged_at.is_some());

        assert!(branch.mark_as_merged("bob").is_err());
        assert!(branch.mark_as_deleted().is_err());
    }

    #[test]
    fn test_protected_branch_rejects_deletion() {
        let mut main = NewBranch::main("repo-1", "alice").into_branch();
        assert!(main.protected);
        assert!(!main.can_be_deleted());
        assert!(matches!(main.mark_as_deleted(), Err(VcsError::InvalidState(_))));
        assert_eq!(main.status, BranchStatus::Active);

        let mut feature = NewBranch::new("repo-1", "scratch", "alice").into_branch();
        assert!(feature.can_be_deleted());
        feature.mark_as_deleted().unwrap();
        assert_eq!(feature.status, BranchStatus::Deleted);
        assert!(!feature.can_be_deleted());
        assert!(feature.mark_as_deleted().is_err());
    }
}
