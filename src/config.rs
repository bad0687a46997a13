//! Desired bucket configuration.
//!
//! A [`BucketsConfig`] maps each *model name* (the logical identifier the
//! host service uses) to a [`BucketSpec`] describing the remote bucket
//! that backs it: its name and the schema the bucket should converge to.
//!
//! Index field types are carried as wire strings (`"string"`, `"number"`,
//! `"boolean"`, …). The core compares them structurally but never
//! interprets them; the remote validates types and rejects bad ones with
//! `InvalidBucketConfigError`.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::migrations::MigrationPlan;

/// The per-record field that gates data migrations. Every bucket with a
/// migration plan must index it as a `number`.
pub const DATA_VERSION_FIELD: &str = "data_version";

/// Wire string for numeric indexes.
pub const INDEX_TYPE_NUMBER: &str = "number";

/// Definition of a single indexed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index type as understood by the remote: `string`, `number`,
    /// `boolean`, …
    #[serde(rename = "type")]
    pub index_type: String,

    /// Whether the remote enforces uniqueness over this field.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(index_type: impl Into<String>) -> Self {
        Self {
            index_type: index_type.into(),
            unique: false,
        }
    }
}

/// Auxiliary schema options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketOptions {
    /// Schema version. Absent on the wire means 0. Versions must grow
    /// monotonically over the lifetime of a bucket.
    #[serde(default)]
    pub version: u64,
}

/// The declared shape of a bucket: indexed fields, options and the
/// opaque pre/post hooks passed through to the remote.
///
/// The struct is its own normal form: optional wire fields deserialize
/// into defaults (`options.version` 0, empty `pre`/`post`), and maps are
/// ordered, so two schemas are equivalent exactly when they compare
/// equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketSchema {
    #[serde(default)]
    pub index: BTreeMap<String, IndexDefinition>,

    #[serde(default)]
    pub options: BucketOptions,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<serde_json::Value>,
}

impl BucketSchema {
    pub fn version(&self) -> u64 {
        self.options.version
    }
}

/// Desired state for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Remote bucket name, unique within a configuration.
    pub name: String,
    pub schema: BucketSchema,
}

/// The full desired bucket configuration, keyed by model name.
///
/// Iteration is in model-name order, which fixes the order buckets are
/// reconciled and reindexed in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketsConfig {
    buckets: BTreeMap<String, BucketSpec>,
}

impl BucketsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model and its bucket spec, replacing any previous entry.
    pub fn insert(&mut self, model: impl Into<String>, spec: BucketSpec) {
        self.buckets.insert(model.into(), spec);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_bucket(mut self, model: impl Into<String>, spec: BucketSpec) -> Self {
        self.insert(model, spec);
        self
    }

    pub fn get(&self, model: &str) -> Option<&BucketSpec> {
        self.buckets.get(model)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BucketSpec)> {
        self.buckets.iter().map(|(model, spec)| (model.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Validate the configuration, together with the migration plan that
    /// will run against it.
    ///
    /// Checks that bucket names are unique across models, that every
    /// migrated model is configured, and that its bucket indexes
    /// [`DATA_VERSION_FIELD`] as a `number` (the migration selection
    /// filter queries that field, so it must be indexed before any
    /// migration runs).
    pub fn validate(&self, plan: Option<&MigrationPlan>) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (model, spec) in self.iter() {
            if !seen.insert(spec.name.as_str()) {
                bail!(
                    "bucket name \"{}\" is used by more than one model (model \"{model}\")",
                    spec.name
                );
            }
        }

        let Some(plan) = plan else {
            return Ok(());
        };

        for model in plan.model_names() {
            let Some(spec) = self.get(model) else {
                bail!("data migrations declared for unconfigured model \"{model}\"");
            };
            let Some(def) = spec.schema.index.get(DATA_VERSION_FIELD) else {
                bail!(
                    "bucket \"{}\" of model \"{model}\" has data migrations but no \
                     indexed \"{DATA_VERSION_FIELD}\" field",
                    spec.name
                );
            };
            if def.index_type != INDEX_TYPE_NUMBER {
                bail!(
                    "bucket \"{}\" of model \"{model}\" must index \"{DATA_VERSION_FIELD}\" \
                     as \"{INDEX_TYPE_NUMBER}\", found \"{}\"",
                    spec.name,
                    def.index_type
                );
            }
        }
        Ok(())
    }
}
