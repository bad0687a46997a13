//! Shared fixtures for integration tests.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Value};

use moray_buckets::{
    BucketOptions, BucketSchema, BucketSpec, BucketsConfig, IndexDefinition, MigrationModule,
    MigrationPlan,
};

/// Build a schema from `(field, type)` pairs.
pub fn schema(fields: &[(&str, &str)], version: u64) -> BucketSchema {
    let index: BTreeMap<String, IndexDefinition> = fields
        .iter()
        .map(|(field, ty)| (field.to_string(), IndexDefinition::new(*ty)))
        .collect();
    BucketSchema {
        index,
        options: BucketOptions { version },
        pre: vec![],
        post: vec![],
    }
}

/// Single-model configuration: `test_model` backed by bucket `b1`.
pub fn single_model_config(fields: &[(&str, &str)], version: u64) -> BucketsConfig {
    BucketsConfig::new().with_bucket(
        "test_model",
        BucketSpec {
            name: "b1".to_string(),
            schema: schema(fields, version),
        },
    )
}

/// Configuration for a model carrying data migrations: indexes `foo` and
/// the numeric `data_version` gate.
pub fn migrated_model_config() -> BucketsConfig {
    single_model_config(&[("foo", "string"), ("data_version", "number")], 1)
}

/// `count` records shaped `{"foo": "foo"}` with no data version.
pub fn unversioned_records(count: usize) -> Vec<(String, Value)> {
    (0..count)
        .map(|i| (format!("key-{i:05}"), json!({"foo": "foo"})))
        .collect()
}

/// Version-1 migration: copy `foo` into `bar` and stamp the version.
pub fn copy_foo_to_bar_migration() -> MigrationModule {
    MigrationModule::new(1, |mut record, _ctx| {
        let foo = record.value.get("foo").cloned().unwrap_or(Value::Null);
        if let Value::Object(map) = &mut record.value {
            map.insert("bar".to_string(), foo);
        }
        record.set_data_version(1);
        Ok(Some(record))
    })
}

/// Plan with the single `test_model` version-1 migration above.
pub fn single_migration_plan() -> MigrationPlan {
    MigrationPlan::new().with_model("test_model", vec![copy_foo_to_bar_migration()])
}

/// Stale-cache tunables small enough for tests.
pub fn fast_migrate_options() -> moray_buckets::MigrateOptions {
    moray_buckets::MigrateOptions {
        stale_cache_delay: Duration::from_millis(5),
        stale_cache_budget: Duration::from_millis(500),
    }
}

/// Poll `predicate` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    predicate()
}
