//! Scripted in-memory moray fake.
//!
//! Models the slice of remote behavior the initializer depends on:
//! bucket schemas with versions, per-row schema-version tags, background
//! reindexing, filtered page-bounded queries, and etag-guarded batch
//! writes. Failures are injected per method and cleared to simulate a
//! remote that recovers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use moray_buckets::{
    BatchPut, BucketSchema, MorayClient, MorayError, MorayErrorName, RemoteBucket, ReindexOutcome,
    StoredRecord,
};

/// Remote default page size for `find_objects`.
pub const PAGE_LIMIT: usize = 1000;

/// Index types the fake remote accepts; anything else is rejected the
/// way moray rejects a misspelled type.
const VALID_INDEX_TYPES: &[&str] = &["string", "number", "boolean"];

/// A failure to inject into one client method.
#[derive(Clone)]
pub enum Fault {
    /// A nameless error, classified transient everywhere.
    Generic(String),
    /// A named remote error.
    Moray(MorayError),
}

impl Fault {
    fn to_error(&self) -> anyhow::Error {
        match self {
            Self::Generic(message) => anyhow!("{message}"),
            Self::Moray(err) => err.clone().into(),
        }
    }
}

/// A fault plus how many calls it should affect (`None` = until cleared).
#[derive(Clone)]
struct InjectedFault {
    fault: Fault,
    remaining: Option<usize>,
}

#[derive(Default)]
struct Faults {
    get_bucket: Option<InjectedFault>,
    create_bucket: Option<InjectedFault>,
    update_bucket: Option<InjectedFault>,
    reindex_objects: Option<InjectedFault>,
    find_objects: Option<InjectedFault>,
    batch: Option<InjectedFault>,
}

#[derive(Clone)]
struct MockRecord {
    value: Value,
    etag: String,
    /// Schema version the row was last written or reindexed under.
    rver: u64,
}

struct MockBucket {
    bucket: RemoteBucket,
    records: BTreeMap<String, MockRecord>,
}

#[derive(Default)]
struct Store {
    buckets: BTreeMap<String, MockBucket>,
}

/// Call counters, for asserting what the initializer did (and did not)
/// issue.
#[derive(Default)]
pub struct CallCounts {
    pub get_bucket: AtomicUsize,
    pub create_bucket: AtomicUsize,
    pub update_bucket: AtomicUsize,
    pub reindex_objects: AtomicUsize,
    pub find_objects: AtomicUsize,
    pub batch: AtomicUsize,
}

pub struct ScriptedMoray {
    store: Mutex<Store>,
    faults: Mutex<Faults>,
    etag_counter: AtomicU64,
    /// Artificial latency per call, to spread call timing in
    /// interleaving tests.
    latency: Mutex<Duration>,
    pub calls: CallCounts,
}

impl ScriptedMoray {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(Store::default()),
            faults: Mutex::new(Faults::default()),
            etag_counter: AtomicU64::new(0),
            latency: Mutex::new(Duration::ZERO),
            calls: CallCounts::default(),
        })
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    fn next_etag(&self) -> String {
        format!("etag-{}", self.etag_counter.fetch_add(1, Ordering::SeqCst))
    }

    // === Seeding ===

    /// Create a bucket directly in the fake store, bypassing validation.
    pub fn seed_bucket(&self, name: &str, schema: BucketSchema) {
        let mut store = self.store.lock();
        store.buckets.insert(
            name.to_string(),
            MockBucket {
                bucket: RemoteBucket {
                    name: name.to_string(),
                    index: schema.index,
                    options: schema.options,
                    pre: schema.pre,
                    post: schema.post,
                    reindex_active: BTreeMap::new(),
                    mtime: Some("2026-01-12T08:00:00.000Z".to_string()),
                },
                records: BTreeMap::new(),
            },
        );
    }

    /// Insert records into a seeded bucket at the bucket's current
    /// schema version.
    pub fn seed_records(&self, bucket: &str, records: impl IntoIterator<Item = (String, Value)>) {
        let mut store = self.store.lock();
        let entry = store
            .buckets
            .get_mut(bucket)
            .expect("seed_records requires a seeded bucket");
        let rver = entry.bucket.options.version;
        for (key, value) in records {
            let etag = self.next_etag();
            entry.records.insert(key, MockRecord { value, etag, rver });
        }
    }

    // === Inspection ===

    pub fn bucket(&self, name: &str) -> Option<RemoteBucket> {
        self.store
            .lock()
            .buckets
            .get(name)
            .map(|b| b.bucket.clone())
    }

    /// Every record in a bucket: `(key, value, rver)`.
    pub fn records(&self, bucket: &str) -> Vec<(String, Value, u64)> {
        self.store
            .lock()
            .buckets
            .get(bucket)
            .map(|b| {
                b.records
                    .iter()
                    .map(|(k, r)| (k.clone(), r.value.clone(), r.rver))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of all bucket schemas, for store-equality assertions.
    pub fn schema_snapshot(&self) -> BTreeMap<String, Value> {
        self.store
            .lock()
            .buckets
            .iter()
            .map(|(name, b)| {
                (
                    name.clone(),
                    serde_json::to_value(b.bucket.schema()).unwrap(),
                )
            })
            .collect()
    }

    // === Fault injection ===

    pub fn fail_get_bucket(&self, message: &str) {
        self.faults.lock().get_bucket = Some(InjectedFault {
            fault: Fault::Generic(message.to_string()),
            remaining: None,
        });
    }

    pub fn fail_batch(&self, message: &str) {
        self.faults.lock().batch = Some(InjectedFault {
            fault: Fault::Generic(message.to_string()),
            remaining: None,
        });
    }

    pub fn fail_batch_with(&self, err: MorayError) {
        self.faults.lock().batch = Some(InjectedFault {
            fault: Fault::Moray(err),
            remaining: None,
        });
    }

    /// Fail the next `times` selection queries, then recover.
    pub fn fail_find_objects_times(&self, err: MorayError, times: usize) {
        self.faults.lock().find_objects = Some(InjectedFault {
            fault: Fault::Moray(err),
            remaining: Some(times),
        });
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    async fn enter(&self, slot: fn(&mut Faults) -> &mut Option<InjectedFault>) -> Result<()> {
        let latency = *self.latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        let mut faults = self.faults.lock();
        let injected = slot(&mut faults);
        let Some(fault) = injected.as_mut() else {
            return Ok(());
        };
        let err = fault.fault.to_error();
        let exhausted = match &mut fault.remaining {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            *injected = None;
        }
        Err(err)
    }

    fn validate_index_types(schema: &BucketSchema) -> Result<()> {
        for (field, def) in &schema.index {
            if !VALID_INDEX_TYPES.contains(&def.index_type.as_str()) {
                return Err(MorayError::new(
                    MorayErrorName::InvalidBucketConfig,
                    format!(
                        "index \"{field}\" has invalid type \"{}\"",
                        def.index_type
                    ),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Parse the two selection filter shapes the controller emits and match
/// one record value against them.
fn filter_matches(filter: &str, value: &Value) -> Result<bool> {
    if filter == "(!(data_version=*))" {
        return Ok(value.get("data_version").is_none());
    }
    if let Some(rest) = filter.strip_prefix("(|(!(data_version=*))(data_version=") {
        if let Some(digits) = rest.strip_suffix("))") {
            let wanted: u64 = digits.parse()?;
            return Ok(match value.get("data_version") {
                None => true,
                Some(dv) => dv.as_u64() == Some(wanted),
            });
        }
    }
    bail!("unsupported filter in test client: {filter}");
}

#[async_trait]
impl MorayClient for ScriptedMoray {
    async fn get_bucket(&self, name: &str) -> Result<RemoteBucket> {
        self.calls.get_bucket.fetch_add(1, Ordering::SeqCst);
        self.enter(|f| &mut f.get_bucket).await?;
        self.store
            .lock()
            .buckets
            .get(name)
            .map(|b| b.bucket.clone())
            .ok_or_else(|| MorayError::bucket_not_found(name).into())
    }

    async fn create_bucket(&self, name: &str, schema: &BucketSchema) -> Result<()> {
        self.calls.create_bucket.fetch_add(1, Ordering::SeqCst);
        self.enter(|f| &mut f.create_bucket).await?;
        Self::validate_index_types(schema)?;
        let mut store = self.store.lock();
        if store.buckets.contains_key(name) {
            bail!("bucket \"{name}\" already exists");
        }
        store.buckets.insert(
            name.to_string(),
            MockBucket {
                bucket: RemoteBucket {
                    name: name.to_string(),
                    index: schema.index.clone(),
                    options: schema.options.clone(),
                    pre: schema.pre.clone(),
                    post: schema.post.clone(),
                    reindex_active: BTreeMap::new(),
                    mtime: Some("2026-01-12T08:00:00.000Z".to_string()),
                },
                records: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn update_bucket(&self, name: &str, schema: &BucketSchema) -> Result<()> {
        self.calls.update_bucket.fetch_add(1, Ordering::SeqCst);
        self.enter(|f| &mut f.update_bucket).await?;
        Self::validate_index_types(schema)?;
        let mut store = self.store.lock();
        let entry = store
            .buckets
            .get_mut(name)
            .ok_or_else(|| anyhow::Error::from(MorayError::bucket_not_found(name)))?;

        let added: Vec<String> = schema
            .index
            .keys()
            .filter(|field| !entry.bucket.index.contains_key(*field))
            .cloned()
            .collect();
        entry.bucket.index = schema.index.clone();
        entry.bucket.options = schema.options.clone();
        entry.bucket.pre = schema.pre.clone();
        entry.bucket.post = schema.post.clone();
        if !added.is_empty() && !entry.records.is_empty() {
            // Rows written under older schema versions need reindexing.
            entry.bucket.reindex_active.insert(
                schema.options.version.to_string(),
                serde_json::to_value(added).unwrap(),
            );
        }
        Ok(())
    }

    async fn reindex_objects(&self, name: &str, count: u32) -> Result<ReindexOutcome> {
        self.calls.reindex_objects.fetch_add(1, Ordering::SeqCst);
        self.enter(|f| &mut f.reindex_objects).await?;
        let mut store = self.store.lock();
        let entry = store
            .buckets
            .get_mut(name)
            .ok_or_else(|| anyhow::Error::from(MorayError::bucket_not_found(name)))?;
        let version = entry.bucket.options.version;
        let mut processed = 0u64;
        for record in entry.records.values_mut() {
            if processed >= u64::from(count) {
                break;
            }
            if record.rver < version {
                record.rver = version;
                processed += 1;
            }
        }
        if processed == 0 {
            entry.bucket.reindex_active.clear();
        }
        Ok(ReindexOutcome { processed })
    }

    async fn find_objects(&self, name: &str, filter: &str) -> Result<Vec<StoredRecord>> {
        self.calls.find_objects.fetch_add(1, Ordering::SeqCst);
        self.enter(|f| &mut f.find_objects).await?;
        let store = self.store.lock();
        let entry = store
            .buckets
            .get(name)
            .ok_or_else(|| anyhow::Error::from(MorayError::bucket_not_found(name)))?;
        let mut page = Vec::new();
        for (key, record) in &entry.records {
            if filter_matches(filter, &record.value)? {
                page.push(StoredRecord::new(
                    key.clone(),
                    record.value.clone(),
                    record.etag.clone(),
                ));
                if page.len() >= PAGE_LIMIT {
                    break;
                }
            }
        }
        Ok(page)
    }

    async fn batch(&self, ops: Vec<BatchPut>) -> Result<()> {
        self.calls.batch.fetch_add(1, Ordering::SeqCst);
        self.enter(|f| &mut f.batch).await?;
        let mut store = self.store.lock();
        for op in &ops {
            let entry = store
                .buckets
                .get_mut(&op.bucket)
                .ok_or_else(|| anyhow::Error::from(MorayError::bucket_not_found(&op.bucket)))?;
            if let (Some(expected), Some(existing)) = (&op.etag, entry.records.get(&op.key)) {
                if *expected != existing.etag {
                    bail!(
                        "etag mismatch on \"{}\": expected {expected}, found {}",
                        op.key,
                        existing.etag
                    );
                }
            }
            let rver = entry.bucket.options.version;
            let etag = self.next_etag();
            entry.records.insert(
                op.key.clone(),
                MockRecord {
                    value: op.value.clone(),
                    etag,
                    rver,
                },
            );
        }
        Ok(())
    }
}
