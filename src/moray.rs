//! Storage client capability interface and wire types.
//!
//! The initializer depends on the moray client only through the
//! [`MorayClient`] trait: the six operations it actually consumes. Hosts
//! hand in their production client; tests hand in a scripted fake. The
//! client is shared across migration workers and must be safe for
//! concurrent use.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{BucketOptions, BucketSchema, IndexDefinition, DATA_VERSION_FIELD};

/// A bucket as reported by the remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBucket {
    pub name: String,

    #[serde(default)]
    pub index: BTreeMap<String, IndexDefinition>,

    #[serde(default)]
    pub options: BucketOptions,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<Value>,

    /// Non-empty while the remote is still reindexing rows in the
    /// background after a schema update.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reindex_active: BTreeMap<String, Value>,

    /// Remote-side modification time. Never interpreted by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<String>,
}

impl RemoteBucket {
    /// The remote schema with remote-only fields (`name`, `mtime`,
    /// `reindex_active`) dropped, in the same normal form as a desired
    /// [`BucketSchema`]. Suitable for structural comparison.
    pub fn schema(&self) -> BucketSchema {
        BucketSchema {
            index: self.index.clone(),
            options: self.options.clone(),
            pre: self.pre.clone(),
            post: self.post.clone(),
        }
    }

    pub fn reindex_in_progress(&self) -> bool {
        !self.reindex_active.is_empty()
    }
}

/// One stored record: opaque key, JSON payload, and the etag the remote
/// handed out with it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: String,
    pub value: Value,
    pub etag: String,
}

impl StoredRecord {
    pub fn new(key: impl Into<String>, value: Value, etag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value,
            etag: etag.into(),
        }
    }

    /// The record's migration gate, if the payload carries one. Absent
    /// means the record predates versioning.
    pub fn data_version(&self) -> Option<u64> {
        self.value.get(DATA_VERSION_FIELD).and_then(Value::as_u64)
    }

    /// Stamp the payload with a new data version.
    pub fn set_data_version(&mut self, version: u64) {
        if let Value::Object(map) = &mut self.value {
            map.insert(DATA_VERSION_FIELD.to_string(), Value::from(version));
        }
    }
}

/// A single etag-guarded put within a batch write.
#[derive(Debug, Clone)]
pub struct BatchPut {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    /// Etag observed at read time; the remote rejects the put if the
    /// record has changed since. `None` writes unconditionally.
    pub etag: Option<String>,
}

/// Result of one bounded reindex request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReindexOutcome {
    /// Rows brought up to the current schema by this request. Zero means
    /// the bucket is fully reindexed.
    pub processed: u64,
}

/// The narrow slice of the moray client the initializer consumes.
#[async_trait]
pub trait MorayClient: Send + Sync {
    /// Fetch a bucket's current remote state. Fails with a
    /// `BucketNotFoundError` cause when the bucket does not exist.
    async fn get_bucket(&self, name: &str) -> Result<RemoteBucket>;

    async fn create_bucket(&self, name: &str, schema: &BucketSchema) -> Result<()>;

    async fn update_bucket(&self, name: &str, schema: &BucketSchema) -> Result<()>;

    /// Ask the remote to reindex up to `count` rows.
    async fn reindex_objects(&self, name: &str, count: u32) -> Result<ReindexOutcome>;

    /// Fetch one page of records matching an LDAP-style filter. The page
    /// size is the remote's default; the initializer never overrides it.
    async fn find_objects(&self, name: &str, filter: &str) -> Result<Vec<StoredRecord>>;

    /// Apply a batch of puts atomically.
    async fn batch(&self, ops: Vec<BatchPut>) -> Result<()>;
}

/// Selection filter for records still behind `target_version`.
///
/// Version 1 selects records with no `data_version` at all. Later
/// versions select `data_version = target - 1`, keeping the missing-field
/// branch in the disjunction so records that slipped behind without a
/// version tag are still picked up.
pub fn migration_filter(target_version: u64) -> String {
    if target_version <= 1 {
        format!("(!({DATA_VERSION_FIELD}=*))")
    } else {
        format!(
            "(|(!({DATA_VERSION_FIELD}=*))({DATA_VERSION_FIELD}={}))",
            target_version - 1
        )
    }
}
