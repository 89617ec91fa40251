use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, VcsError};
use crate::model::{Object, ObjectType};

/// One named reference inside a tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub hash: String,
    #[serde(rename = "type")]
    pub entry_type: ObjectType,
}

/// A named, ordered set of hash references.
///
/// Entries are kept sorted by name so that two trees with the same entries
/// always serialize to the same bytes and therefore the same hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

/// Names that differ between two trees
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, returning the previous one.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        hash: impl Into<String>,
        entry_type: ObjectType,
    ) -> Option<TreeEntry> {
        let name = name.into();
        let entry = TreeEntry {
            name: name.clone(),
            hash: hash.into(),
            entry_type,
        };
        self.entries.insert(name, entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical serialized form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let entries: Vec<&TreeEntry> = self.entries.values().collect();
        Ok(serde_json::to_vec(&entries)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<TreeEntry> = serde_json::from_slice(bytes)?;
        let mut tree = Tree::new();
        for entry in entries {
            if tree.entries.contains_key(&entry.name) {
                return Err(VcsError::Serialization(format!(
                    "duplicate tree entry '{}'",
                    entry.name
                )));
            }
            tree.entries.insert(entry.name.clone(), entry);
        }
        Ok(tree)
    }

    pub fn to_object(&self) -> Result<Object> {
        Ok(Object::new(ObjectType::Tree, self.to_bytes()?))
    }

    pub fn hash(&self) -> Result<String> {
        Ok(Object::compute_hash(ObjectType::Tree, &self.to_bytes()?))
    }

    /// Entry names added, modified or removed going from `self` to `other`.
    pub fn diff(&self, other: &Tree) -> TreeDiff {
        let mut diff = TreeDiff::default();

        for (name, entry) in &other.entries {
            match self.entries.get(name) {
                None => diff.added.push(name.clone()),
                Some(previous) if previous != entry => diff.modified.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in self.entries.keys() {
            if !other.entries.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }

        diff
    }
}

impl FromIterator<TreeEntry> for Tree {
    fn from_iter<I: IntoIterator<Item = TreeEntry>>(iter: I) -> Self {
        let mut tree = Tree::new();
        for entry in iter {
            tree.entries.insert(entry.name.clone(), entry);
        }
        tree
    }
}
