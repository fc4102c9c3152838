//! Object staging
//!
//! Durable, write-once storage for bronze (raw) and silver (validated)
//! snapshots. Each `(dataset_id, stage)` pair has a single mutable cell, the
//! latest pointer, which is only ever advanced under the pair's named lock.
//!
//! Key layout:
//!
//! ```text
//! {dataset_id}/{stage}/{partition_key}/{content_hash}
//! {dataset_id}/{stage}/{partition_key}/{content_hash}.meta.json
//! {dataset_id}/{stage}/LATEST.json
//! ```

mod lock;
mod local;
#[cfg(feature = "s3")]
mod s3;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

pub use lock::{LockTable, LockTableGuard};
pub use local::LocalObjectStage;
#[cfg(feature = "s3")]
pub use s3::{S3ObjectStage, S3StageConfig};

/// Name of the pointer record inside `{dataset_id}/{stage}/`
pub const LATEST_FILE: &str = "LATEST.json";

/// Suffix of the metadata sidecar written next to each payload
pub const META_SUFFIX: &str = ".meta.json";

/// Free-form metadata attributes attached to a staged object
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Storage stage of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Raw payload exactly as fetched
    Bronze,
    /// Parsed, validated and type-coerced rows
    Silver,
}

impl Stage {
    /// Get the stage name used in object keys
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Bronze => "bronze",
            Stage::Silver => "silver",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bronze" => Ok(Stage::Bronze),
            "silver" => Ok(Stage::Silver),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Compute the SHA-256 hex digest used as content hash
pub fn content_hash(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Address of a committed or pending object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub dataset_id: String,
    pub stage: Stage,
    pub partition_key: String,
    pub content_hash: String,
}

impl ObjectRef {
    /// Storage key of the payload
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            stage_prefix(&self.dataset_id, self.stage),
            self.partition_key,
            self.content_hash
        )
    }

    /// Storage key of the metadata sidecar
    pub fn meta_key(&self) -> String {
        format!("{}{}", self.key(), META_SUFFIX)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// `{dataset_id}/{stage}`
pub fn stage_prefix(dataset_id: &str, stage: Stage) -> String {
    format!("{}/{}", dataset_id, stage.name())
}

/// Storage key of the latest pointer for a dataset and stage
pub fn latest_key(dataset_id: &str, stage: Stage) -> String {
    format!("{}/{}", stage_prefix(dataset_id, stage), LATEST_FILE)
}

/// Metadata sidecar stored next to each payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub dataset_id: String,
    pub stage: Stage,
    pub partition_key: String,
    pub content_hash: String,
    /// Payload size in bytes
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
    /// Stage-specific attributes (source, fetched_at, validation_report, ...)
    #[serde(default)]
    pub attributes: Attributes,
}

impl ObjectMetadata {
    /// Reference to the object this metadata describes
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            dataset_id: self.dataset_id.clone(),
            stage: self.stage,
            partition_key: self.partition_key.clone(),
            content_hash: self.content_hash.clone(),
        }
    }

    /// Look up a string attribute
    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(|v| v.as_str())
    }
}

/// An immutable snapshot read back from the stage
#[derive(Debug, Clone)]
pub struct StagedObject {
    pub reference: ObjectRef,
    pub metadata: ObjectMetadata,
    pub payload: Vec<u8>,
}

/// Pointer record naming the most recent committed object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    /// Object key the pointer resolves to
    pub key: String,
    pub dataset_id: String,
    pub stage: Stage,
    pub partition_key: String,
    pub content_hash: String,
    /// Creation time of the referenced object
    pub created_at: DateTime<Utc>,
    /// When the pointer was advanced
    pub advanced_at: DateTime<Utc>,
}

impl LatestPointer {
    pub fn new(metadata: &ObjectMetadata) -> Self {
        Self {
            key: metadata.object_ref().key(),
            dataset_id: metadata.dataset_id.clone(),
            stage: metadata.stage,
            partition_key: metadata.partition_key.clone(),
            content_hash: metadata.content_hash.clone(),
            created_at: metadata.created_at,
            advanced_at: Utc::now(),
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            dataset_id: self.dataset_id.clone(),
            stage: self.stage,
            partition_key: self.partition_key.clone(),
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Exclusive hold on a `(dataset_id, stage)` pair
///
/// Released when dropped. Holders run the whole write-then-advance sequence
/// while the guard is alive.
pub struct StageLock {
    name: String,
    _guards: Vec<Box<dyn Send>>,
}

impl StageLock {
    pub(crate) fn new(name: String, guards: Vec<Box<dyn Send>>) -> Self {
        Self {
            name,
            _guards: guards,
        }
    }

    /// Lock name, `{dataset_id}/{stage}`
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for StageLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageLock").field("name", &self.name).finish()
    }
}

/// Durable object storage keyed by dataset, stage and partition
pub trait ObjectStage: Send + Sync {
    /// Human-readable backend description for logs
    fn describe(&self) -> String;

    /// Write a payload and its metadata sidecar. Writing an object that
    /// already exists under the same hash returns the existing reference.
    fn put(
        &self,
        dataset_id: &str,
        stage: Stage,
        partition_key: &str,
        payload: &[u8],
        attributes: Attributes,
    ) -> Result<ObjectRef, StorageError>;

    /// Read an object back, verifying its content hash
    fn get(&self, reference: &ObjectRef) -> Result<StagedObject, StorageError>;

    /// Read the current latest pointer, if the stage has ever been advanced
    fn latest_pointer(
        &self,
        dataset_id: &str,
        stage: Stage,
    ) -> Result<Option<LatestPointer>, StorageError>;

    /// Atomically repoint `{dataset_id}/{stage}/LATEST.json` at `reference`
    fn advance_latest(&self, reference: &ObjectRef) -> Result<LatestPointer, StorageError>;

    /// Acquire the named lock for `(dataset_id, stage)`
    fn lock(&self, dataset_id: &str, stage: Stage) -> Result<StageLock, StorageError>;

    /// Metadata of every object written for `(dataset_id, stage)`, oldest first
    fn list(&self, dataset_id: &str, stage: Stage) -> Result<Vec<ObjectMetadata>, StorageError>;

    /// Resolve the latest pointer and read the object it names
    fn get_latest(
        &self,
        dataset_id: &str,
        stage: Stage,
    ) -> Result<Option<StagedObject>, StorageError> {
        match self.latest_pointer(dataset_id, stage)? {
            Some(pointer) => self.get(&pointer.object_ref()).map(Some),
            None => Ok(None),
        }
    }
}

/// Check a payload against the hash it was stored under
pub(crate) fn verify_payload(reference: &ObjectRef, payload: &[u8]) -> Result<(), StorageError> {
    let actual = content_hash(payload);
    if actual != reference.content_hash {
        return Err(StorageError::Corrupt {
            key: reference.key(),
            reason: format!(
                "content hash mismatch: expected {}, found {}",
                reference.content_hash, actual
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip_names() {
        assert_eq!(Stage::from_str("bronze").unwrap(), Stage::Bronze);
        assert_eq!(Stage::from_str("SILVER").unwrap(), Stage::Silver);
        assert!(Stage::from_str("gold").is_err());
        assert_eq!(Stage::Silver.to_string(), "silver");
    }

    #[test]
    fn test_object_keys() {
        let reference = ObjectRef {
            dataset_id: "guides".to_string(),
            stage: Stage::Bronze,
            partition_key: "2024-05".to_string(),
            content_hash: "abc".to_string(),
        };
        assert_eq!(reference.key(), "guides/bronze/2024-05/abc");
        assert_eq!(reference.meta_key(), "guides/bronze/2024-05/abc.meta.json");
        assert_eq!(latest_key("guides", Stage::Silver), "guides/silver/LATEST.json");
    }

    #[test]
    fn test_content_hash_is_sha256() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_verify_payload_detects_mismatch() {
        let reference = ObjectRef {
            dataset_id: "d".to_string(),
            stage: Stage::Bronze,
            partition_key: "all".to_string(),
            content_hash: content_hash(b"one"),
        };
        assert!(verify_payload(&reference, b"one").is_ok());
        assert!(matches!(
            verify_payload(&reference, b"two"),
            Err(StorageError::Corrupt { .. })
        ));
    }
}
