use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::logic::merge_fn_for;
use crate::model::{
    generate_id, Change, ChangeType, Conflict, ConflictResolution, ConflictStatus, ConflictType,
    EntityKind, Id, ResolutionStrategy,
};
use crate::store::{ConflictStore, EntityApplier};

/// Latest change per `(entity, entity_id)`
pub(crate) fn index_latest(changes: &[Change]) -> BTreeMap<(EntityKind, Id), &Change> {
    let mut index: BTreeMap<(EntityKind, Id), &Change> = BTreeMap::new();
    for change in changes {
        let key = (change.entity, change.entity_id.clone());
        match index.get(&key) {
            Some(current) if (current.timestamp, current.version) > (change.timestamp, change.version) => {}
            _ => {
                index.insert(key, change);
            }
        }
    }
    index
}

/// Classify how two changes to the same entity diverge, if they do.
pub fn check_for_conflict(local: &Change, remote: &Change) -> Option<ConflictType> {
    let delete_vs_update = matches!(
        (local.change_type, remote.change_type),
        (ChangeType::Delete, ChangeType::Update) | (ChangeType::Update, ChangeType::Delete)
    );
    if delete_vs_update {
        return Some(ConflictType::DeleteUpdate);
    }
    if local.timestamp == remote.timestamp {
        return None;
    }
    if local.version > 0 && remote.version > 0 && local.version != remote.version {
        return Some(ConflictType::Version);
    }
    if local.change_type == ChangeType::Update
        && remote.change_type == ChangeType::Update
        && local.data != remote.data
    {
        return Some(ConflictType::Update);
    }
    None
}

/// Pure detection over two change sets, in key order.
pub fn find_conflicts(local: &[Change], remote: &[Change]) -> Vec<Conflict> {
    let local = index_latest(local);
    let remote = index_latest(remote);

    local
        .iter()
        .filter_map(|(key, local_change)| {
            let remote_change = remote.get(key)?;
            check_for_conflict(local_change, remote_change).map(|conflict_type| {
                Conflict::new(conflict_type, (*local_change).clone(), (*remote_change).clone())
            })
        })
        .collect()
}

/// Detects divergent edits and applies the chosen resolution.
pub struct ConflictResolver<S, A> {
    rows: Arc<S>,
    applier: Arc<A>,
}

impl<S: ConflictStore, A: EntityApplier> ConflictResolver<S, A> {
    pub fn new(rows: Arc<S>, applier: Arc<A>) -> Self {
        Self { rows, applier }
    }

    /// Detect and persist conflicts between a local and a remote change set.
    pub async fn detect_conflicts(
        &self,
        ctx: &OpContext,
        local: &[Change],
        remote: &[Change],
    ) -> Result<Vec<Conflict>> {
        let conflicts = find_conflicts(local, remote);
        for conflict in &conflicts {
            ctx.run(self.rows.insert_conflict(conflict)).await?;
            log::info!(
                "Detected {} conflict {} on {} {}",
                conflict.conflict_type.as_str(),
                conflict.id,
                conflict.entity,
                conflict.entity_id
            );
        }
        Ok(conflicts)
    }

    /// Resolve a conflict with a strategy given by name.
    pub async fn resolve_conflict(
        &self,
        ctx: &OpContext,
        conflict_id: &Id,
        strategy: &str,
        resolved_by: &str,
    ) -> Result<ConflictResolution> {
        let strategy: ResolutionStrategy = strategy.parse()?;
        self.resolve_with(ctx, conflict_id, strategy, resolved_by, None).await
    }

    pub async fn resolve_with(
        &self,
        ctx: &OpContext,
        conflict_id: &Id,
        strategy: ResolutionStrategy,
        resolved_by: &str,
        notes: Option<String>,
    ) -> Result<ConflictResolution> {
        let conflict = self.get_conflict(ctx, conflict_id).await?;
        if conflict.status == ConflictStatus::Resolved {
            return Err(VcsError::InvalidState(format!(
                "conflict {} is already resolved",
                conflict_id
            )));
        }

        let status = match strategy {
            ResolutionStrategy::Local => {
                ctx.run(self.applier.apply_change(&conflict.local_change)).await?;
                ConflictStatus::Resolved
            }
            ResolutionStrategy::Remote => {
                ctx.run(self.applier.apply_change(&conflict.remote_change)).await?;
                ConflictStatus::Resolved
            }
            ResolutionStrategy::Merge => {
                let change = self.merged_change(&conflict)?;
                ctx.run(self.applier.apply_change(&change)).await?;
                ConflictStatus::Resolved
            }
            ResolutionStrategy::Defer => ConflictStatus::Deferred,
        };

        let resolution = ConflictResolution::new(conflict_id.clone(), strategy, resolved_by, notes);
        ctx.run(self.rows.record_resolution(&resolution, status)).await?;
        log::info!(
            "Conflict {} on {} {} resolved with '{}' by {}",
            conflict_id,
            conflict.entity,
            conflict.entity_id,
            strategy,
            resolved_by
        );
        Ok(resolution)
    }

    /// The change a `merge` resolution applies. Falls back to the local
    /// change where no field merge applies.
    fn merged_change(&self, conflict: &Conflict) -> Result<Change> {
        let merge = match merge_fn_for(conflict.entity) {
            Some(merge) if !conflict.local_change.is_delete() && !conflict.remote_change.is_delete() => merge,
            Some(_) => {
                log::warn!(
                    "Conflict {} has a delete side; merge falls back to local",
                    conflict.id
                );
                return Ok(conflict.local_change.clone());
            }
            None => {
                log::warn!(
                    "No field merge for {}; conflict {} falls back to local",
                    conflict.entity,
                    conflict.id
                );
                return Ok(conflict.local_change.clone());
            }
        };

        let data = merge(&conflict.local_data, &conflict.remote_data)?;
        Ok(Change {
            id: generate_id(),
            change_type: ChangeType::Update,
            entity: conflict.entity,
            entity_id: conflict.entity_id.clone(),
            timestamp: Utc::now(),
            data,
            version: conflict.local_change.version.max(conflict.remote_change.version) + 1,
        })
    }

    pub async fn get_conflict(&self, ctx: &OpContext, conflict_id: &Id) -> Result<Conflict> {
        ctx.run(self.rows.get_conflict(conflict_id))
            .await?
            .ok_or_else(|| VcsError::not_found("conflict", conflict_id.clone()))
    }

    /// Conflicts still waiting for a first decision
    pub async fn list_pending(&self, ctx: &OpContext) -> Result<Vec<Conflict>> {
        ctx.run(self.rows.list_conflicts(Some(ConflictStatus::Pending)))
            .await
    }

    pub async fn list_deferred(&self, ctx: &OpContext) -> Result<Vec<Conflict>> {
        ctx.run(self.rows.list_conflicts(Some(ConflictStatus::Deferred)))
            .await
    }

    pub async fn get_resolutions(&self, ctx: &OpContext, conflict_id: &Id) -> Result<Vec<ConflictResolution>> {
        ctx.run(self.rows.list_resolutions(conflict_id)).await
    }
}
