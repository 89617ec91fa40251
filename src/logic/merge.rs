use crate::error::Result;
use crate::model::{EntityKind, EquipmentRecord, FieldMap};

/// Field-level merge of a local and a remote record
pub type MergeFn = fn(&FieldMap, &FieldMap) -> Result<FieldMap>;

/// Merge function for an entity kind, if that kind supports field merging.
pub fn merge_fn_for(entity: EntityKind) -> Option<MergeFn> {
    match entity {
        EntityKind::Equipment => Some(merge_equipment),
        _ => None,
    }
}

/// Local keeps `name` and `status`, remote supplies `model` and `serial`;
/// remaining fields are unioned with local values taking precedence.
pub fn merge_equipment(local: &FieldMap, remote: &FieldMap) -> Result<FieldMap> {
    let local = EquipmentRecord::from_fields(local)?;
    let remote = EquipmentRecord::from_fields(remote)?;

    let mut other = remote.other;
    other.extend(local.other);

    let merged = EquipmentRecord {
        name: local.name.or(remote.name),
        status: local.status.or(remote.status),
        model: remote.model.or(local.model),
        serial: remote.serial.or(local.serial),
        other,
    };
    merged.into_fields()
}
