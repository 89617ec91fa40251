use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VcsError;
use crate::model::sha256_hex;

/// Kind of content held by an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Blob,
    Tree,
    Snapshot,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectType {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "snapshot" => Ok(ObjectType::Snapshot),
            _ => Err(VcsError::Serialization(format!("Unknown object type: {}", s))),
        }
    }
}

/// Where an object's bytes physically live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Small objects kept in the database row
    Inline,
    /// Mid-size objects written raw to the filesystem
    File,
    /// Large objects written gzip-compressed to the filesystem
    CompressedFile,
}

impl StorageTier {
    /// Pick the tier for an object of `size` bytes.
    pub fn for_size(size: i64, inline_threshold: i64, compress_threshold: i64) -> Self {
        if size < inline_threshold {
            StorageTier::Inline
        } else if size < compress_threshold {
            StorageTier::File
        } else {
            StorageTier::CompressedFile
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, StorageTier::CompressedFile)
    }

    pub fn is_file(&self) -> bool {
        !matches!(self, StorageTier::Inline)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Inline => "inline",
            StorageTier::File => "file",
            StorageTier::CompressedFile => "compressed_file",
        }
    }
}

impl std::str::FromStr for StorageTier {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(StorageTier::Inline),
            "file" => Ok(StorageTier::File),
            "compressed_file" => Ok(StorageTier::CompressedFile),
            _ => Err(VcsError::Serialization(format!("Unknown storage tier: {}", s))),
        }
    }
}

/// An immutable, content-addressed blob of bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    /// Content hash; left empty to have the store compute it
    pub hash: String,
    pub object_type: ObjectType,
    /// Uncompressed length of `contents`
    pub size: i64,
    pub contents: Vec<u8>,
    pub ref_count: i32,
    /// Whether the stored copy is compressed (contents are always returned raw)
    pub compressed: bool,
    pub created_at: DateTime<Utc>,
}

impl Object {
    pub fn new(object_type: ObjectType, contents: Vec<u8>) -> Self {
        let hash = Self::compute_hash(object_type, &contents);
        Self {
            hash,
            object_type,
            size: contents.len() as i64,
            contents,
            ref_count: 0,
            compressed: false,
            created_at: Utc::now(),
        }
    }

    pub fn blob(contents: impl Into<Vec<u8>>) -> Self {
        Self::new(ObjectType::Blob, contents.into())
    }

    /// Digest over `(type, size, contents)`.
    pub fn compute_hash(object_type: ObjectType, contents: &[u8]) -> String {
        let header = format!("{} {}\0", object_type, contents.len());
        sha256_hex([header.as_bytes(), contents])
    }

    pub fn content_hash(&self) -> String {
        Self::compute_hash(self.object_type, &self.contents)
    }
}

/// Object metadata without contents, as listed for audit and inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub hash: String,
    pub object_type: ObjectType,
    pub size: i64,
    pub ref_count: i32,
    pub tier: StorageTier,
    pub created_at: DateTime<Utc>,
}

impl ObjectInfo {
    pub fn compressed(&self) -> bool {
        self.tier.is_compressed()
    }
}

/// Persisted bookkeeping row for an object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRow {
    pub info: ObjectInfo,
    /// Present only for the inline tier
    pub inline_contents: Option<Vec<u8>>,
}

/// Per-type storage statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStats {
    pub object_type: Option<ObjectType>,
    pub count: i64,
    pub total_size: i64,
    pub unreferenced: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_depends_on_type_and_contents() {
        let blob = Object::blob("hello");
        let same = Object::blob("hello");
        let tree = Object::new(ObjectType::Tree, b"hello".to_vec());

        assert_eq!(blob.hash, same.hash);
        assert_ne!(blob.hash, tree.hash);
        assert_eq!(blob.size, 5);
        assert_eq!(blob.hash.len(), 64);
    }

    #[test]
    fn test_tier_selection() {
        let inline = 1024;
        let compress = 10 * 1024 * 1024;
        assert_eq!(StorageTier::for_size(5, inline, compress), StorageTier::Inline);
        assert_eq!(StorageTier::for_size(1023, inline, compress), StorageTier::Inline);
        assert_eq!(StorageTier::for_size(1024, inline, compress), StorageTier::File);
        assert_eq!(
            StorageTier::for_size(compress, inline, compress),
            StorageTier::CompressedFile
        );
    }

    #[test]
    fn test_object_type_round_trips_through_str() {
        for ty in [ObjectType::Blob, ObjectType::Tree, ObjectType::Snapshot] {
            assert_eq!(ty.as_str().parse::<ObjectType>().unwrap(), ty);
        }
        assert!("commit".parse::<ObjectType>().is_err());
    }
}
