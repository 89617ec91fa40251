use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::TrackerConfig;
use crate::context::OpContext;
use crate::error::{Result, VcsError};
use crate::logic::{ChangeListener, ListenerHub, SubscriptionId};
use crate::model::{generate_id, Change, ChangeType, EntityKind, FieldMap, Id};
use crate::store::ChangeStore;

/// Append-only log of entity edits with listener fan-out.
pub struct ChangeTracker<S> {
    rows: Arc<S>,
    listeners: ListenerHub,
}

impl<S: ChangeStore> ChangeTracker<S> {
    pub fn new(rows: Arc<S>, config: &TrackerConfig) -> Self {
        Self {
            rows,
            listeners: ListenerHub::new(config.listener_capacity, config.overflow_policy),
        }
    }

    pub async fn track_create(
        &self,
        ctx: &OpContext,
        entity: EntityKind,
        entity_id: &str,
        data: FieldMap,
    ) -> Result<Change> {
        self.record(ctx, Change::new(ChangeType::Create, entity, entity_id, data, 1))
            .await
    }

    /// `previous_version` is the version the caller last saw; when omitted
    /// the latest logged version is used.
    pub async fn track_update(
        &self,
        ctx: &OpContext,
        entity: EntityKind,
        entity_id: &str,
        data: FieldMap,
        previous_version: Option<i64>,
    ) -> Result<Change> {
        let version = self.next_version(ctx, entity, entity_id, previous_version).await?;
        self.record(ctx, Change::new(ChangeType::Update, entity, entity_id, data, version))
            .await
    }

    pub async fn track_delete(
        &self,
        ctx: &OpContext,
        entity: EntityKind,
        entity_id: &str,
        data: FieldMap,
        previous_version: Option<i64>,
    ) -> Result<Change> {
        let version = self.next_version(ctx, entity, entity_id, previous_version).await?;
        self.record(ctx, Change::new(ChangeType::Delete, entity, entity_id, data, version))
            .await
    }

    async fn next_version(
        &self,
        ctx: &OpContext,
        entity: EntityKind,
        entity_id: &str,
        previous_version: Option<i64>,
    ) -> Result<i64> {
        match previous_version {
            Some(previous) => Ok(previous + 1),
            None => {
                let latest = ctx
                    .run(self.rows.latest_version(Some(entity), &entity_id.to_string()))
                    .await?;
                Ok(latest.unwrap_or(0) + 1)
            }
        }
    }

    /// Persist, then notify listeners.
    async fn record(&self, ctx: &OpContext, change: Change) -> Result<Change> {
        ctx.run(self.rows.append_change(&change)).await?;
        log::debug!(
            "Tracked {} of {} {} v{}",
            change.change_type.as_str(),
            change.entity,
            change.entity_id,
            change.version
        );
        self.listeners.publish(&change).await;
        Ok(change)
    }

    /// Changes after `since`, optionally for one entity kind, in recording order.
    pub async fn get_changes(
        &self,
        ctx: &OpContext,
        since: DateTime<Utc>,
        entity: Option<EntityKind>,
    ) -> Result<Vec<Change>> {
        ctx.run(self.rows.changes_since(since, entity)).await
    }

    pub async fn get_entity_changes(&self, ctx: &OpContext, entity_id: &Id) -> Result<Vec<Change>> {
        ctx.run(self.rows.entity_changes(entity_id)).await
    }

    /// 0 when nothing has been logged for the entity
    pub async fn get_latest_version(&self, ctx: &OpContext, entity_id: &Id) -> Result<i64> {
        Ok(ctx
            .run(self.rows.latest_version(None, entity_id))
            .await?
            .unwrap_or(0))
    }

    /// Register a listener for every change recorded from now on.
    ///
    /// Must be called from within a Tokio runtime; fails with `InvalidState` otherwise.
    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> Result<SubscriptionId> {
        self.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Drop changes older than `older_than`, returning how many went.
    pub async fn prune_old_changes(&self, ctx: &OpContext, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let pruned = ctx.run(self.rows.prune_changes(cutoff)).await?;
        if pruned > 0 {
            log::info!("Pruned {} changes older than {}", pruned, cutoff);
        }
        Ok(pruned)
    }
}

/// Collapse several changes to one entity into a single change.
///
/// Fields are unioned in timestamp order so later writes win. Any delete
/// makes the result a delete; otherwise any create makes it a create.
pub fn merge_changes(changes: &[Change]) -> Result<Change> {
    let first = changes
        .first()
        .ok_or_else(|| VcsError::InvalidInput("no changes to merge".to_string()))?;
    if let Some(other) = changes.iter().find(|c| c.key() != first.key()) {
        return Err(VcsError::InvalidInput(format!(
            "cannot merge changes for {} {} and {} {}",
            first.entity, first.entity_id, other.entity, other.entity_id
        )));
    }

    let mut ordered: Vec<&Change> = changes.iter().collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.version.cmp(&b.version)));

    let mut data = FieldMap::new();
    for change in &ordered {
        for (field, value) in &change.data {
            data.insert(field.clone(), value.clone());
        }
    }

    let change_type = if changes.iter().any(|c| c.change_type == ChangeType::Delete) {
        ChangeType::Delete
    } else if changes.iter().any(|c| c.change_type == ChangeType::Create) {
        ChangeType::Create
    } else {
        ChangeType::Update
    };

    Ok(Change {
        id: generate_id(),
        change_type,
        entity: first.entity,
        entity_id: first.entity_id.clone(),
        timestamp: changes.iter().map(|c| c.timestamp).max().unwrap_or(first.timestamp),
        data,
        version: changes.iter().map(|c| c.version).max().unwrap_or(first.version),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::logic::FnListener;
    use crate::store::InMemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    fn tracker() -> ChangeTracker<InMemoryStore> {
        let config = TrackerConfig {
            listener_capacity: 8,
            overflow_policy: OverflowPolicy::Block,
            retention_days: 30,
        };
        ChangeTracker::new(Arc::new(InMemoryStore::new()), &config)
    }

    #[tokio::test]
    async fn test_versions_increase() {
        let tracker = tracker();
        let ctx = OpContext::background();

        let created = tracker
            .track_create(&ctx, EntityKind::Room, "r1", fields(json!({"name": "Lobby"})))
            .await
            .unwrap();
        assert_eq!(created.version, 1);

        let updated = tracker
            .track_update(&ctx, EntityKind::Room, "r1", fields(json!({"area": 40})), None)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let updated = tracker
            .track_update(&ctx, EntityKind::Room, "r1", fields(json!({"area": 42})), Some(2))
            .await
            .unwrap();
        assert_eq!(updated.version, 3);
        assert_eq!(tracker.get_latest_version(&ctx, &"r1".to_string()).await.unwrap(), 3);
        assert_eq!(tracker.get_latest_version(&ctx, &"r2".to_string()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let tracker = tracker();
        let ctx = OpContext::background();
        tracker
            .track_create(&ctx, EntityKind::Equipment, "e1", FieldMap::new())
            .await
            .unwrap();
        tracker
            .track_update(&ctx, EntityKind::Equipment, "e1", FieldMap::new(), None)
            .await
            .unwrap();

        // editor still holding version 1
        let err = tracker
            .track_update(&ctx, EntityKind::Equipment, "e1", FieldMap::new(), Some(1))
            .await
            .unwrap_err();
        match err {
            VcsError::StaleVersion { latest, attempted, .. } => {
                assert_eq!(latest, 2);
                assert_eq!(attempted, 2);
            }
            other => panic!("expected StaleVersion, got {:?}", other),
        }
        assert_eq!(
            tracker.get_entity_changes(&ctx, &"e1".to_string()).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_get_changes_filters_and_orders() {
        let tracker = tracker();
        let ctx = OpContext::background();
        let since = Utc::now() - chrono::Duration::seconds(1);

        tracker.track_create(&ctx, EntityKind::Room, "r1", FieldMap::new()).await.unwrap();
        tracker.track_create(&ctx, EntityKind::Floor, "f1", FieldMap::new()).await.unwrap();
        tracker.track_create(&ctx, EntityKind::Room, "r2", FieldMap::new()).await.unwrap();

        let all = tracker.get_changes(&ctx, since, None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|c| c.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "f1", "r2"]);

        let rooms = tracker.get_changes(&ctx, since, Some(EntityKind::Room)).await.unwrap();
        assert_eq!(rooms.len(), 2);
    }

    #[tokio::test]
    async fn test_listeners_see_each_change_once() {
        let tracker = tracker();
        let ctx = OpContext::background();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tracker
            .subscribe(Arc::new(FnListener(move |c: &Change| {
                sink.lock().push(c.entity_id.clone())
            })))
            .unwrap();

        tracker.track_create(&ctx, EntityKind::Room, "r1", FieldMap::new()).await.unwrap();
        tracker
            .track_delete(&ctx, EntityKind::Room, "r1", FieldMap::new(), None)
            .await
            .unwrap();

        for _ in 0..200 {
            if seen.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock(), vec!["r1".to_string(), "r1".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_old_changes() {
        let store = Arc::new(InMemoryStore::new());
        let tracker = ChangeTracker::new(store.clone(), &TrackerConfig::default());
        let ctx = OpContext::background();

        let mut old = Change::new(ChangeType::Create, EntityKind::File, "doc", FieldMap::new(), 1);
        old.timestamp = Utc::now() - chrono::Duration::days(40);
        store.append_change(&old).await.unwrap();
        tracker.track_create(&ctx, EntityKind::File, "plan", FieldMap::new()).await.unwrap();

        let pruned = tracker
            .prune_old_changes(&ctx, chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        let left = tracker
            .get_changes(&ctx, Utc::now() - chrono::Duration::days(365), None)
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].entity_id, "plan");
    }

    #[test]
    fn test_merge_changes_escalates() {
        let mut create = Change::new(
            ChangeType::Create,
            EntityKind::Equipment,
            "e1",
            fields(json!({"name": "Pump", "status": "new"})),
            1,
        );
        let mut update = Change::new(
            ChangeType::Update,
            EntityKind::Equipment,
            "e1",
            fields(json!({"status": "installed"})),
            2,
        );
        create.timestamp = Utc::now() - chrono::Duration::seconds(10);
        update.timestamp = Utc::now();

        let merged = merge_changes(&[update.clone(), create.clone()]).unwrap();
        assert_eq!(merged.change_type, ChangeType::Create);
        assert_eq!(merged.version, 2);
        assert_eq!(merged.timestamp, update.timestamp);
        assert_eq!(merged.data, fields(json!({"name": "Pump", "status": "installed"})));

        let delete = Change::new(ChangeType::Delete, EntityKind::Equipment, "e1", FieldMap::new(), 3);
        let merged = merge_changes(&[create, update, delete]).unwrap();
        assert_eq!(merged.change_type, ChangeType::Delete);
        assert_eq!(merged.version, 3);
    }

    #[test]
    fn test_merge_changes_rejects_bad_input() {
        assert!(matches!(
            merge_changes(&[]),
            Err(VcsError::InvalidInput(_))
        ));
        let a = Change::new(ChangeType::Update, EntityKind::Room, "r1", FieldMap::new(), 1);
        let b = Change::new(ChangeType::Update, EntityKind::Room, "r2", FieldMap::new(), 1);
        assert!(matches!(
            merge_changes(&[a, b]),
            Err(VcsError::InvalidInput(_))
        ));
    }
}
