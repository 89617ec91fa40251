use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VcsError;
use crate::model::{generate_id, Change, EntityKind, FieldMap, Id};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides updated the entity to different data
    Update,
    /// One side deleted, the other updated
    DeleteUpdate,
    /// Entity shape disagrees between replicas
    Schema,
    /// Both sides produced different versions of the entity
    Version,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::Update => "update",
            ConflictType::DeleteUpdate => "delete_update",
            ConflictType::Schema => "schema",
            ConflictType::Version => "version",
        }
    }
}

impl std::str::FromStr for ConflictType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update" => Ok(ConflictType::Update),
            "delete_update" => Ok(ConflictType::DeleteUpdate),
            "schema" => Ok(ConflictType::Schema),
            "version" => Ok(ConflictType::Version),
            _ => Err(VcsError::Serialization(format!("Unknown conflict type: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    /// Parked for an out-of-band human decision
    Deferred,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Deferred => "deferred",
        }
    }
}

impl std::str::FromStr for ConflictStatus {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConflictStatus::Pending),
            "resolved" => Ok(ConflictStatus::Resolved),
            "deferred" => Ok(ConflictStatus::Deferred),
            _ => Err(VcsError::Serialization(format!("Unknown conflict status: {}", s))),
        }
    }
}

/// Divergence between a local and a remote change to the same entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Id,
    pub entity: EntityKind,
    pub entity_id: Id,
    pub conflict_type: ConflictType,
    pub local_data: FieldMap,
    pub remote_data: FieldMap,
    pub local_change: Change,
    pub remote_change: Change,
    pub status: ConflictStatus,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(conflict_type: ConflictType, local: Change, remote: Change) -> Self {
        Self {
            id: generate_id(),
            entity: local.entity,
            entity_id: local.entity_id.clone(),
            conflict_type,
            local_data: local.data.clone(),
            remote_data: remote.data.clone(),
            local_change: local,
            remote_change: remote,
            status: ConflictStatus::Pending,
            detected_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != ConflictStatus::Resolved
    }
}

/// How a conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    Local,
    Remote,
    Merge,
    Defer,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Local => "local",
            ResolutionStrategy::Remote => "remote",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Defer => "defer",
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(ResolutionStrategy::Local),
            "remote" => Ok(ResolutionStrategy::Remote),
            "merge" => Ok(ResolutionStrategy::Merge),
            "defer" => Ok(ResolutionStrategy::Defer),
            _ => Err(VcsError::InvalidResolution(s.to_string())),
        }
    }
}

/// Audit record of one resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub id: Id,
    pub conflict_id: Id,
    pub resolution: ResolutionStrategy,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl ConflictResolution {
    pub fn new(
        conflict_id: impl Into<Id>,
        resolution: ResolutionStrategy,
        resolved_by: impl Into<String>,
        notes: Option<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            conflict_id: conflict_id.into(),
            resolution,
            resolved_by: resolved_by.into(),
            resolved_at: Utc::now(),
            notes,
        }
    }
}
