//! The initializer: sequence schema setup, reindexing and data
//! migrations against a bucket set.
//!
//! A [`BucketsInitializer`] is single-shot: construct it with the desired
//! configuration (and optionally a migration plan), call
//! [`start`](BucketsInitializer::start) once, and observe progress
//! through [`status`](BucketsInitializer::status) snapshots or the
//! broadcast [`InitEvent`] milestones. Each phase runs inside the backoff
//! engine with that phase's error classifier, so transient remote
//! failures never surface to the host; the first terminal failure ends
//! the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::{run_with_backoff, BackoffPolicy};
use crate::config::BucketsConfig;
use crate::errors::{is_transient, InitError, Phase};
use crate::migrations::controller::{run_data_migrations, Clock, MigrateOptions, SystemClock};
use crate::migrations::MigrationPlan;
use crate::moray::MorayClient;
use crate::reindex::reindex_buckets;
use crate::schema::setup_buckets;
use crate::status::{PhaseState, Status, StatusHandle};

/// Milestones broadcast while an initialization run progresses. Each is
/// emitted at most once; nothing follows `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitEvent {
    BucketsSetupDone,
    BucketsReindexDone,
    DataMigrationsDone,
    Done,
    Error(String),
}

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Coordinates the three-phase pipeline for one bucket set.
pub struct BucketsInitializer {
    client: Arc<dyn MorayClient>,
    config: BucketsConfig,
    plan: Option<MigrationPlan>,
    status: StatusHandle,
    started: AtomicBool,
    events: broadcast::Sender<InitEvent>,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
    setup_policy: BackoffPolicy,
    reindex_policy: BackoffPolicy,
    migrations_policy: BackoffPolicy,
    migrate_opts: MigrateOptions,
}

impl std::fmt::Debug for BucketsInitializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketsInitializer")
            .field("config", &self.config)
            .field("plan", &self.plan)
            .field("started", &self.started)
            .field("setup_policy", &self.setup_policy)
            .field("reindex_policy", &self.reindex_policy)
            .field("migrations_policy", &self.migrations_policy)
            .field("migrate_opts", &self.migrate_opts)
            .finish()
    }
}

impl BucketsInitializer {
    /// Build an initializer, validating the configuration and plan
    /// together. Validation failures are returned here so a
    /// misconfigured host never reaches [`start`](Self::start).
    pub fn new(
        config: BucketsConfig,
        client: Arc<dyn MorayClient>,
        plan: Option<MigrationPlan>,
    ) -> Result<Self> {
        if let Some(plan) = &plan {
            plan.validate()?;
        }
        config.validate(plan.as_ref())?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            client,
            config,
            plan,
            status: StatusHandle::new(),
            started: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
            clock: Arc::new(SystemClock),
            setup_policy: BackoffPolicy::default(),
            reindex_policy: BackoffPolicy::default(),
            migrations_policy: BackoffPolicy::default(),
            migrate_opts: MigrateOptions::default(),
        })
    }

    /// Cap the attempts of the schema-setup phase.
    pub fn with_max_buckets_setup_attempts(mut self, max_attempts: u32) -> Self {
        self.setup_policy = self.setup_policy.with_max_attempts(max_attempts);
        self
    }

    /// Cap the attempts of the reindex phase.
    pub fn with_max_buckets_reindex_attempts(mut self, max_attempts: u32) -> Self {
        self.reindex_policy = self.reindex_policy.with_max_attempts(max_attempts);
        self
    }

    /// Cap the attempts of the data-migration phase.
    pub fn with_max_data_migrations_attempts(mut self, max_attempts: u32) -> Self {
        self.migrations_policy = self.migrations_policy.with_max_attempts(max_attempts);
        self
    }

    /// Use a caller-owned cancellation token instead of the internal one.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the stale-cache retry tunables of the migration phase.
    pub fn with_migrate_options(mut self, opts: MigrateOptions) -> Self {
        self.migrate_opts = opts;
        self
    }

    /// Substitute the time source used by the migration controller.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deep-copy snapshot of the current status.
    pub fn status(&self) -> Status {
        self.status.snapshot()
    }

    /// Subscribe to milestone events. Subscribers that join after an
    /// event was emitted do not see it.
    pub fn subscribe(&self) -> broadcast::Receiver<InitEvent> {
        self.events.subscribe()
    }

    /// Request cancellation; in-flight phases finish with a terminal
    /// cancellation error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Run the pipeline to completion.
    ///
    /// Returns when the store is fully prepared or the first terminal
    /// error is hit; the same outcome is mirrored on the event channel
    /// as `Done` or `Error`. A second call fails with
    /// [`InitError::AlreadyStarted`].
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(InitError::AlreadyStarted.into());
        }

        match self.run_pipeline().await {
            Ok(()) => {
                info!("bucket initialization complete");
                self.emit(InitEvent::Done);
                Ok(())
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "bucket initialization failed");
                self.emit(InitEvent::Error(format!("{err:#}")));
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self) -> Result<()> {
        self.run_setup().await?;
        self.run_reindex().await?;
        if let Some(plan) = &self.plan {
            self.run_migrations(plan).await?;
        }
        Ok(())
    }

    async fn run_setup(&self) -> Result<()> {
        let phase = Phase::Setup;
        self.status
            .update(|s| s.buckets_setup.state = PhaseState::Started);

        let result = run_with_backoff(
            phase,
            self.setup_policy,
            &self.cancel,
            |err| is_transient(phase, err),
            |err| {
                self.status
                    .update(|s| s.buckets_setup.latest_error = Some(format!("{err:#}")));
            },
            || setup_buckets(self.client.as_ref(), &self.config, &self.cancel),
        )
        .await;

        match result {
            Ok(()) => {
                self.status.update(|s| {
                    s.buckets_setup.state = PhaseState::Done;
                    s.buckets_setup.latest_error = None;
                });
                self.emit(InitEvent::BucketsSetupDone);
                Ok(())
            }
            Err(err) => {
                self.status.update(|s| {
                    s.buckets_setup.state = PhaseState::Error;
                    s.buckets_setup.latest_error = Some(format!("{err:#}"));
                });
                Err(err)
            }
        }
    }

    async fn run_reindex(&self) -> Result<()> {
        let phase = Phase::Reindex;
        self.status
            .update(|s| s.buckets_reindex.state = PhaseState::Started);

        let result = run_with_backoff(
            phase,
            self.reindex_policy,
            &self.cancel,
            |err| is_transient(phase, err),
            |err| {
                self.status
                    .update(|s| s.buckets_reindex.latest_error = Some(format!("{err:#}")));
            },
            || reindex_buckets(self.client.as_ref(), &self.config, &self.cancel),
        )
        .await;

        match result {
            Ok(()) => {
                self.status.update(|s| {
                    s.buckets_reindex.state = PhaseState::Done;
                    s.buckets_reindex.latest_error = None;
                });
                self.emit(InitEvent::BucketsReindexDone);
                Ok(())
            }
            Err(err) => {
                self.status.update(|s| {
                    s.buckets_reindex.state = PhaseState::Error;
                    s.buckets_reindex.latest_error = Some(format!("{err:#}"));
                });
                Err(err)
            }
        }
    }

    async fn run_migrations(&self, plan: &MigrationPlan) -> Result<()> {
        let phase = Phase::DataMigration;
        self.status
            .update(|s| s.data_migrations.state = PhaseState::Started);

        let result = run_with_backoff(
            phase,
            self.migrations_policy,
            &self.cancel,
            |err| is_transient(phase, err),
            // Worker failures are already recorded per model by the
            // controller before the phase result reaches the backoff
            // loop.
            |_err| {},
            || {
                run_data_migrations(
                    Arc::clone(&self.client),
                    &self.config,
                    plan,
                    &self.status,
                    &self.cancel,
                    Arc::clone(&self.clock),
                    self.migrate_opts,
                )
            },
        )
        .await;

        match result {
            Ok(()) => {
                self.status.update(|s| {
                    s.data_migrations.state = PhaseState::Done;
                    s.data_migrations.latest_errors.clear();
                });
                self.emit(InitEvent::DataMigrationsDone);
                Ok(())
            }
            Err(err) => {
                self.status
                    .update(|s| s.data_migrations.state = PhaseState::Error);
                Err(err)
            }
        }
    }

    fn emit(&self, event: InitEvent) {
        // Nobody listening is fine; events are advisory.
        let _ = self.events.send(event);
    }
}
