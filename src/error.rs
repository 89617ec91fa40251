use thiserror::Error;

use crate::model::ObjectType;

/// Errors surfaced by the version-control core.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("object {hash} is a {found}, expected {expected}")]
    TypeMismatch {
        hash: String,
        expected: ObjectType,
        found: ObjectType,
    },

    #[error("{owner} references missing {kind} {key}")]
    DanglingReference {
        owner: String,
        kind: &'static str,
        key: String,
    },

    #[error("invalid resolution strategy '{0}'")]
    InvalidResolution(String),

    #[error("operation canceled")]
    Canceled,

    #[error("storage error: {0}")]
    StorageIo(String),

    #[error("{kind} already exists: {key}")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("branch {branch_id} head moved: expected {expected:?}, found {found:?}")]
    StaleHead {
        branch_id: String,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("version {attempted} for {entity_id} does not follow latest version {latest}")]
    StaleVersion {
        entity_id: String,
        latest: i64,
        attempted: i64,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl VcsError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        VcsError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn dangling(owner: impl Into<String>, kind: &'static str, key: impl Into<String>) -> Self {
        VcsError::DanglingReference {
            owner: owner.into(),
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VcsError::NotFound { .. })
    }
}

impl From<sqlx::Error> for VcsError {
    fn from(err: sqlx::Error) -> Self {
        VcsError::StorageIo(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for VcsError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        VcsError::StorageIo(err.to_string())
    }
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        VcsError::StorageIo(err.to_string())
    }
}

impl From<serde_json::Error> for VcsError {
    fn from(err: serde_json::Error) -> Self {
        VcsError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VcsError>;
