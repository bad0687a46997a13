//! Reindex driver: bring every row in line with the latest declared
//! indexes.
//!
//! After a schema update the remote reindexes rows lazily; this driver
//! pushes that work to completion by requesting bounded reindex pages
//! until the remote reports nothing left. Record contents are never
//! inspected, and every failure here is retryable.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::BucketsConfig;
use crate::errors::{InitError, Phase};
use crate::moray::MorayClient;

/// Rows requested per reindex call.
pub const REINDEX_PAGE_SIZE: u32 = 100;

/// Drive reindexing of every configured bucket to completion.
///
/// A large bucket takes many page requests, so cancellation is checked
/// before every page rather than only at the phase boundary.
pub async fn reindex_buckets(
    client: &dyn MorayClient,
    config: &BucketsConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    for (model, spec) in config.iter() {
        let mut total: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(InitError::Cancelled {
                    phase: Phase::Reindex,
                }
                .into());
            }
            let outcome = client
                .reindex_objects(&spec.name, REINDEX_PAGE_SIZE)
                .await
                .with_context(|| format!("reindex bucket \"{}\"", spec.name))?;
            if outcome.processed == 0 {
                break;
            }
            total += outcome.processed;
            debug!(
                model,
                bucket = %spec.name,
                processed = outcome.processed,
                total,
                "reindexed a page of rows"
            );
        }
        debug!(model, bucket = %spec.name, total, "bucket fully reindexed");
    }
    Ok(())
}
