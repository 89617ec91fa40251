use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VcsError};
use crate::model::{generate_id, Id, TreeKind};

/// Field values carried by a change, keyed by field name
pub type FieldMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ChangeType {
    type Err = VcsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeType::Create),
            "update" => Ok(ChangeType::Update),
            "delete" => Ok(ChangeType::Delete),
            _ => Err(VcsError::Serialization(format!("Unknown change type: {}", s))),
        }
    }
}

/// Kinds of building entities whose edits are tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Building,
    Floor,
    Room,
    Equipment,
    User,
    Organization,
    File,
    Operation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Building,
        EntityKind::Floor,
        EntityKind::Room,
        EntityKind::Equipment,
        EntityKind::User,
        EntityKind::Organization,
        EntityKind::File,
        EntityKind::Operation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Building => "building",
            EntityKind::Floor => "floor",
            EntityKind::Room => "room",
            EntityKind::Equipment => "equipment",
            EntityKind::User => "user",
            EntityKind::Organization => "organization",
            EntityKind::File => "file",
            EntityKind::Operation => "operation",
        }
    }

    /// Snapshot tree this kind of entity is recorded under
    pub fn tree_kind(&self) -> TreeKind {
        match self {
            EntityKind::Building | EntityKind::Floor => TreeKind::Building,
            EntityKind::Equipment => TreeKind::Equipment,
            EntityKind::Room => TreeKind::Spatial,
            EntityKind::File => TreeKind::Files,
            EntityKind::User | EntityKind::Organization | EntityKind::Operation => {
                TreeKind::Operations
            }
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = VcsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| VcsError::Serialization(format!("Unknown entity kind: {}", s)))
    }
}

/// One create/update/delete event for an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: Id,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub entity: EntityKind,
    pub entity_id: Id,
    pub timestamp: DateTime<Utc>,
    pub data: FieldMap,
    /// Per-entity counter, strictly increasing
    pub version: i64,
}

impl Change {
    pub fn new(
        change_type: ChangeType,
        entity: EntityKind,
        entity_id: impl Into<Id>,
        data: FieldMap,
        version: i64,
    ) -> Self {
        Self {
            id: generate_id(),
            change_type,
            entity,
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
            data,
            version,
        }
    }

    pub fn key(&self) -> (EntityKind, &str) {
        (self.entity, self.entity_id.as_str())
    }

    pub fn is_delete(&self) -> bool {
        self.change_type == ChangeType::Delete
    }
}

/// Typed view of equipment fields used by field-level merging.
///
/// An owned field is `None` only when absent; an explicit `null` is kept as
/// `Some(Value::Null)` so a deliberate clear survives a merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentRecord {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub name: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub model: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub serial: Option<serde_json::Value>,
    /// Everything else (location, room_id, manufacturer, ...)
    #[serde(flatten)]
    pub other: FieldMap,
}

fn present<'de, D>(deserializer: D) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

impl EquipmentRecord {
    pub fn from_fields(fields: &FieldMap) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(fields.clone()))?)
    }

    pub fn into_fields(self) -> Result<FieldMap> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(VcsError::Serialization(format!(
                "equipment record serialized to {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_every_kind_maps_to_a_tree() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
            let _ = kind.tree_kind();
        }
        assert_eq!(EntityKind::Room.tree_kind(), TreeKind::Spatial);
        assert!("elevator".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_equipment_record_keeps_unknown_fields() {
        let data = fields(json!({
            "name": "AHU-1",
            "model": "X200",
            "room_id": "r-12",
            "capacity_kw": 40
        }));
        let record = EquipmentRecord::from_fields(&data).unwrap();
        assert_eq!(record.name, Some(json!("AHU-1")));
        assert_eq!(record.serial, None);
        assert_eq!(record.other.get("room_id"), Some(&json!("r-12")));

        let back = record.into_fields().unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_equipment_record_keeps_explicit_null() {
        let data = fields(json!({"name": null, "model": "X200"}));
        let record = EquipmentRecord::from_fields(&data).unwrap();
        assert_eq!(record.name, Some(serde_json::Value::Null));
        assert_eq!(record.status, None);
        assert_eq!(record.into_fields().unwrap(), data);
    }

    #[test]
    fn test_change_serializes_type_tag() {
        let change = Change::new(
            ChangeType::Update,
            EntityKind::Equipment,
            "eq-1",
            fields(json!({"status": "offline"})),
            2,
        );
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], json!("update"));
        assert_eq!(value["entity"], json!("equipment"));
    }
}
