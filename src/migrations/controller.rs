//! Migration controller: execute a plan against the store.
//!
//! One worker per model runs in parallel; within a worker, migrations run
//! sequentially in version order. Each migration streams records in
//! remote-bounded chunks: query the selection filter, transform, batch
//! the rewrites back with their read-time etags, yield, repeat until the
//! filter comes back empty.
//!
//! Restart safety comes from the filter being version-based rather than
//! cursor-based: a phase restart after a transient failure simply
//! re-selects whatever is still behind, and records that were already
//! written no longer match.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BucketsConfig;
use crate::errors::{error_name_in_chain, InitError, MorayErrorName, Phase};
use crate::migrations::{MigrationContext, MigrationModule, MigrationPlan};
use crate::moray::{migration_filter, BatchPut, MorayClient};
use crate::status::StatusHandle;

/// Time source for the stale-cache retry budget. Faked in tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Tunables for the migration phase.
#[derive(Debug, Clone, Copy)]
pub struct MigrateOptions {
    /// Delay between selection retries while the remote's schema cache
    /// is stale.
    pub stale_cache_delay: Duration,
    /// Total wall-clock budget for those retries before the error is
    /// allowed to escalate.
    pub stale_cache_budget: Duration,
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            stale_cache_delay: Duration::from_secs(10),
            stale_cache_budget: Duration::from_secs(6 * 60),
        }
    }
}

/// Wall-clock budget for retrying the selection query while the remote's
/// per-instance schema cache catches up with a schema bump.
struct StaleCacheBudget<'a> {
    clock: &'a dyn Clock,
    cancel: &'a CancellationToken,
    deadline: Instant,
    delay: Duration,
}

impl<'a> StaleCacheBudget<'a> {
    fn new(clock: &'a dyn Clock, cancel: &'a CancellationToken, opts: MigrateOptions) -> Self {
        Self {
            clock,
            cancel,
            deadline: clock.now() + opts.stale_cache_budget,
            delay: opts.stale_cache_delay,
        }
    }

    /// Sleep before the next selection retry. `Ok(true)` means retry,
    /// `Ok(false)` means the budget is spent. The sleep is raced against
    /// the cancellation token so a fired signal does not wait out the
    /// remaining budget.
    async fn backoff(&self) -> Result<bool> {
        if self.clock.now() >= self.deadline {
            return Ok(false);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(InitError::Cancelled {
                phase: Phase::DataMigration,
            }
            .into()),
            _ = self.clock.sleep(self.delay) => Ok(true),
        }
    }
}

/// Run every model's migrations to completion, in parallel across models.
///
/// All workers run to completion even when a sibling fails; each failure
/// is recorded under its model in the status, and the first failure in
/// model-name order becomes the phase result.
pub async fn run_data_migrations(
    client: Arc<dyn MorayClient>,
    config: &BucketsConfig,
    plan: &MigrationPlan,
    status: &StatusHandle,
    cancel: &CancellationToken,
    clock: Arc<dyn Clock>,
    opts: MigrateOptions,
) -> Result<()> {
    let mut join_set: JoinSet<(String, Result<()>)> = JoinSet::new();
    let mut worker_models: HashMap<tokio::task::Id, String> = HashMap::new();

    for (model, modules) in plan.models() {
        let bucket = config
            .get(model)
            .map(|spec| spec.name.clone())
            .ok_or_else(|| anyhow!("no bucket configured for model \"{model}\""))?;
        let client = Arc::clone(&client);
        let status = status.clone();
        let cancel = cancel.clone();
        let clock = Arc::clone(&clock);
        let model = model.to_string();
        let task_model = model.clone();
        let modules = modules.to_vec();

        let handle = join_set.spawn(async move {
            let result = migrate_model(
                client.as_ref(),
                &bucket,
                &model,
                &modules,
                &status,
                &cancel,
                clock.as_ref(),
                opts,
            )
            .await;
            (model, result)
        });
        worker_models.insert(handle.id(), task_model);
    }

    let mut first_failure: Option<(String, anyhow::Error)> = None;
    while let Some(joined) = join_set.join_next_with_id().await {
        // A panicked worker counts as that model's failure; bailing out
        // here would drop the set and abort every in-flight sibling.
        let (model, result) = match joined {
            Ok((_task_id, (model, result))) => (model, result),
            Err(join_err) => {
                let model = worker_models
                    .remove(&join_err.id())
                    .unwrap_or_else(|| "<unknown model>".to_string());
                (
                    model,
                    Err(anyhow!("data migration worker panicked: {join_err}")),
                )
            }
        };
        match result {
            Ok(()) => {
                status.update(|s| {
                    s.data_migrations.latest_errors.remove(&model);
                });
            }
            Err(err) => {
                warn!(model = %model, error = %format!("{err:#}"), "data migration worker failed");
                status.update(|s| {
                    s.data_migrations
                        .latest_errors
                        .insert(model.clone(), format!("{err:#}"));
                });
                let replace = first_failure
                    .as_ref()
                    .is_none_or(|(failed, _)| model < *failed);
                if replace {
                    first_failure = Some((model, err));
                }
            }
        }
    }

    match first_failure {
        Some((model, err)) => {
            Err(err.context(format!("data migrations failed for model \"{model}\"")))
        }
        None => Ok(()),
    }
}

/// Run one model's migrations sequentially in version order.
#[allow(clippy::too_many_arguments)]
async fn migrate_model(
    client: &dyn MorayClient,
    bucket: &str,
    model: &str,
    modules: &[MigrationModule],
    status: &StatusHandle,
    cancel: &CancellationToken,
    clock: &dyn Clock,
    opts: MigrateOptions,
) -> Result<()> {
    for module in modules {
        migrate_model_to_version(client, bucket, model, module, cancel, clock, opts)
            .await
            .with_context(|| {
                format!("migrate model \"{model}\" to data version {}", module.version)
            })?;
        status.update(|s| {
            s.data_migrations
                .completed
                .insert(model.to_string(), module.version);
        });
        info!(model, bucket, version = module.version, "data migration complete");
    }
    Ok(())
}

/// Chunk loop for a single migration step.
async fn migrate_model_to_version(
    client: &dyn MorayClient,
    bucket: &str,
    model: &str,
    module: &MigrationModule,
    cancel: &CancellationToken,
    clock: &dyn Clock,
    opts: MigrateOptions,
) -> Result<()> {
    let filter = migration_filter(module.version);
    let ctx = MigrationContext {
        model: model.to_string(),
        version: module.version,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(InitError::Cancelled {
                phase: Phase::DataMigration,
            }
            .into());
        }

        let page = find_migratable(client, bucket, &filter, cancel, clock, opts).await?;
        if page.is_empty() {
            return Ok(());
        }
        debug!(
            model,
            version = module.version,
            records = page.len(),
            "transforming a chunk of records"
        );

        let mut ops = Vec::with_capacity(page.len());
        for record in page {
            let key = record.key.clone();
            let etag = record.etag.clone();
            let migrated = module
                .apply(record, &ctx)
                .with_context(|| format!("transform record \"{key}\" of model \"{model}\""))?;
            match migrated {
                Some(record) => ops.push(BatchPut {
                    bucket: bucket.to_string(),
                    key,
                    value: record.value,
                    etag: Some(etag),
                }),
                None => {
                    debug!(model, key = %key, version = module.version, "record already migrated");
                }
            }
        }

        if !ops.is_empty() {
            client
                .batch(ops)
                .await
                .with_context(|| format!("write migrated records of model \"{model}\""))?;
        }

        // Let sibling model workers interleave between chunks.
        tokio::task::yield_now().await;
    }
}

/// Selection query with the stale schema-cache envelope.
///
/// After a schema bump the remote may briefly answer `InvalidQueryError`
/// because its per-instance schema cache has not refreshed, even though
/// `data_version` is guaranteed indexed. That one condition is retried
/// here on a fixed delay within a wall-clock budget; it must not reach
/// the phase-level backoff, whose classifier would rightly call
/// `InvalidQueryError` terminal.
async fn find_migratable(
    client: &dyn MorayClient,
    bucket: &str,
    filter: &str,
    cancel: &CancellationToken,
    clock: &dyn Clock,
    opts: MigrateOptions,
) -> Result<Vec<crate::moray::StoredRecord>> {
    let budget = StaleCacheBudget::new(clock, cancel, opts);
    loop {
        match client.find_objects(bucket, filter).await {
            Ok(page) => return Ok(page),
            Err(err) if error_name_in_chain(&err, &[MorayErrorName::InvalidQuery]) => {
                warn!(
                    bucket,
                    filter,
                    error = %format!("{err:#}"),
                    "selection rejected; assuming stale schema cache and retrying"
                );
                if !budget.backoff().await? {
                    return Err(err.context(format!(
                        "selection on bucket \"{bucket}\" still rejected after stale schema-cache budget"
                    )));
                }
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("find migratable records in bucket \"{bucket}\""))
            }
        }
    }
}
