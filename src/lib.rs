//! Bucket initialization for moray-backed services.
//!
//! Services that keep their state in a set of indexed moray buckets need
//! those buckets converged to a known schema, reindexed, and their
//! records rewritten to the current data version before any service code
//! runs. This crate coordinates that:
//!
//! - **Schema setup**: create or update each bucket to its desired
//!   schema, enforcing backward compatibility (indexes are never
//!   removed, schema changes require a version bump, downgrades are
//!   no-ops).
//! - **Reindex**: drive the remote's background reindexing to completion
//!   in bounded pages.
//! - **Data migrations**: per model, rewrite records to successive data
//!   versions in parallel workers, streaming bounded chunks with
//!   etag-guarded batch writes.
//!
//! Each phase runs inside a retry engine that classifies failures as
//! transient (retried with exponential backoff) or terminal (the run
//! fails). The whole pipeline is idempotent: a crashed or restarted run
//! converges on the same store state because selection is version-based.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use moray_buckets::{BucketsConfig, BucketsInitializer, MigrationPlan};
//!
//! let initializer = BucketsInitializer::new(config, client, Some(plan))?;
//! let mut events = initializer.subscribe();
//! initializer.start().await?;
//! assert_eq!(initializer.status().data_migrations.completed["accounts"], 2);
//! ```

pub mod backoff;
pub mod config;
pub mod errors;
pub mod init;
pub mod migrations;
pub mod moray;
pub mod reindex;
pub mod schema;
pub mod status;

pub use backoff::BackoffPolicy;
pub use config::{
    BucketOptions, BucketSchema, BucketSpec, BucketsConfig, IndexDefinition, DATA_VERSION_FIELD,
};
pub use errors::{InitError, MorayError, MorayErrorName, Phase};
pub use init::{BucketsInitializer, InitEvent};
pub use migrations::controller::{Clock, MigrateOptions, SystemClock};
pub use migrations::loader::{load_migration_plan, MigrationResolver};
pub use migrations::{MigrationContext, MigrationModule, MigrationPlan};
pub use moray::{
    migration_filter, BatchPut, MorayClient, RemoteBucket, ReindexOutcome, StoredRecord,
};
pub use status::{MigrationsStatus, PhaseState, PhaseStatus, Status, StatusHandle};
