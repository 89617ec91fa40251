use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{sha256_hex, Id};

/// The five trees that make up a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeKind {
    Building,
    Equipment,
    Spatial,
    Files,
    Operations,
}

impl TreeKind {
    pub const ALL: [TreeKind; 5] = [
        TreeKind::Building,
        TreeKind::Equipment,
        TreeKind::Spatial,
        TreeKind::Files,
        TreeKind::Operations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TreeKind::Building => "building",
            TreeKind::Equipment => "equipment",
            TreeKind::Spatial => "spatial",
            TreeKind::Files => "files",
            TreeKind::Operations => "operations",
        }
    }
}

impl std::fmt::Display for TreeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tree hashes for each snapshot slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTrees {
    pub building: String,
    pub equipment: String,
    pub spatial: String,
    pub files: String,
    pub operations: String,
}

impl SnapshotTrees {
    pub fn get(&self, kind: TreeKind) -> &str {
        match kind {
            TreeKind::Building => &self.building,
            TreeKind::Equipment => &self.equipment,
            TreeKind::Spatial => &self.spatial,
            TreeKind::Files => &self.files,
            TreeKind::Operations => &self.operations,
        }
    }

    pub fn set(&mut self, kind: TreeKind, hash: String) {
        match kind {
            TreeKind::Building => self.building = hash,
            TreeKind::Equipment => self.equipment = hash,
            TreeKind::Spatial => self.spatial = hash,
            TreeKind::Files => self.files = hash,
            TreeKind::Operations => self.operations = hash,
        }
    }
}

/// Complete state of a repository's structured data at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Content hash; left empty to have the store compute it
    pub hash: String,
    pub repository_id: Id,
    pub building_tree: String,
    pub equipment_tree: String,
    pub spatial_tree: String,
    pub files_tree: String,
    pub operations_tree: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(repository_id: Id, trees: SnapshotTrees, metadata: serde_json::Value) -> Self {
        let mut snapshot = Self {
            hash: String::new(),
            repository_id,
            building_tree: trees.building,
            equipment_tree: trees.equipment,
            spatial_tree: trees.spatial,
            files_tree: trees.files,
            operations_tree: trees.operations,
            metadata,
            created_at: Utc::now(),
        };
        snapshot.hash = snapshot.compute_hash();
        snapshot
    }

    pub fn tree(&self, kind: TreeKind) -> &str {
        match kind {
            TreeKind::Building => &self.building_tree,
            TreeKind::Equipment => &self.equipment_tree,
            TreeKind::Spatial => &self.spatial_tree,
            TreeKind::Files => &self.files_tree,
            TreeKind::Operations => &self.operations_tree,
        }
    }

    pub fn trees(&self) -> SnapshotTrees {
        SnapshotTrees {
            building: self.building_tree.clone(),
            equipment: self.equipment_tree.clone(),
            spatial: self.spatial_tree.clone(),
            files: self.files_tree.clone(),
            operations: self.operations_tree.clone(),
        }
    }

    /// SHA-256 over the five tree references and the canonical metadata JSON.
    pub fn compute_hash(&self) -> String {
        // serde_json keeps object keys sorted, so this rendering is canonical
        let metadata = self.metadata.to_string();
        let mut parts: Vec<String> = TreeKind::ALL
            .iter()
            .map(|kind| format!("{}:{}\n", kind, self.tree(*kind)))
            .collect();
        parts.push(format!("metadata:{}\n", metadata));
        sha256_hex(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trees() -> SnapshotTrees {
        SnapshotTrees {
            building: "b".into(),
            equipment: "e".into(),
            spatial: "s".into(),
            files: "f".into(),
            operations: "o".into(),
        }
    }

    #[test]
    fn test_hash_covers_trees_and_metadata() {
        let a = Snapshot::new("repo".into(), trees(), json!({"floor": 3}));
        let b = Snapshot::new("repo".into(), trees(), json!({"floor": 3}));
        assert_eq!(a.hash, b.hash);

        let c = Snapshot::new("repo".into(), trees(), json!({"floor": 4}));
        assert_ne!(a.hash, c.hash);

        let mut swapped = trees();
        swapped.set(TreeKind::Files, "o".into());
        swapped.set(TreeKind::Operations, "f".into());
        let d = Snapshot::new("repo".into(), swapped, json!({"floor": 3}));
        assert_ne!(a.hash, d.hash);
    }

    #[test]
    fn test_metadata_key_order_does_not_matter() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let left = Snapshot::new("repo".into(), trees(), a);
        let right = Snapshot::new("repo".into(), trees(), b);
        assert_eq!(left.hash, right.hash);
    }
}
