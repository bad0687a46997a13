//! Schema reconciliation: converge each remote bucket to its desired
//! schema.
//!
//! Buckets are reconciled sequentially in model-name order; the first
//! terminal error aborts the pass. A pass is idempotent: re-running it
//! against an already-converged store issues no writes.
//!
//! Version decisions, per bucket:
//! - absent remotely: create;
//! - equal versions: schemas must compare equal after normalization,
//!   otherwise the change needed a version bump and the pass fails;
//! - desired version ahead: indexes may only be added, never removed,
//!   then update;
//! - desired version behind: leave the bucket alone. This is a code
//!   rollback, and the remote already holds the superset schema.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{BucketSpec, BucketsConfig};
use crate::errors::{error_name_in_chain, InitError, MorayErrorName, Phase};
use crate::moray::{MorayClient, RemoteBucket};

/// What a reconciliation pass decided to do with one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaAction {
    Create,
    Update,
    Noop,
}

/// Pure decision core: compare remote state against the desired spec.
fn decide(current: Option<&RemoteBucket>, spec: &BucketSpec) -> Result<SchemaAction> {
    let Some(current) = current else {
        return Ok(SchemaAction::Create);
    };

    let old_version = current.options.version;
    let new_version = spec.schema.version();

    if new_version == old_version {
        if current.schema() == spec.schema {
            return Ok(SchemaAction::Noop);
        }
        return Err(InitError::SchemaChangesSameVersion {
            bucket: spec.name.clone(),
            version: new_version,
            old: serde_json::to_value(current.schema())?,
            new: serde_json::to_value(&spec.schema)?,
        }
        .into());
    }

    if new_version > old_version {
        let removed: Vec<String> = current
            .index
            .keys()
            .filter(|field| !spec.schema.index.contains_key(*field))
            .cloned()
            .collect();
        if !removed.is_empty() {
            return Err(InitError::InvalidIndexesRemoval {
                bucket: spec.name.clone(),
                removed,
            }
            .into());
        }
        return Ok(SchemaAction::Update);
    }

    // new_version < old_version: rollback tolerance.
    Ok(SchemaAction::Noop)
}

/// Reconcile every configured bucket, in model-name order. Cancellation
/// is checked between buckets so a fired signal does not wait out the
/// rest of the pass.
pub async fn setup_buckets(
    client: &dyn MorayClient,
    config: &BucketsConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    for (model, spec) in config.iter() {
        if cancel.is_cancelled() {
            return Err(InitError::Cancelled {
                phase: Phase::Setup,
            }
            .into());
        }
        reconcile_bucket(client, model, spec).await?;
    }
    Ok(())
}

async fn reconcile_bucket(client: &dyn MorayClient, model: &str, spec: &BucketSpec) -> Result<()> {
    let current = match client.get_bucket(&spec.name).await {
        Ok(bucket) => Some(bucket),
        Err(err) if error_name_in_chain(&err, &[MorayErrorName::BucketNotFound]) => None,
        Err(err) => {
            return Err(err).with_context(|| format!("load bucket \"{}\"", spec.name));
        }
    };

    match decide(current.as_ref(), spec)? {
        SchemaAction::Create => {
            info!(
                model,
                bucket = %spec.name,
                version = spec.schema.version(),
                "bucket absent; creating"
            );
            client
                .create_bucket(&spec.name, &spec.schema)
                .await
                .with_context(|| format!("create bucket \"{}\"", spec.name))
        }
        SchemaAction::Update => {
            let old_version = current.as_ref().map_or(0, |b| b.options.version);
            info!(
                model,
                bucket = %spec.name,
                old_version,
                new_version = spec.schema.version(),
                "updating bucket schema"
            );
            client
                .update_bucket(&spec.name, &spec.schema)
                .await
                .with_context(|| format!("update bucket \"{}\"", spec.name))
        }
        SchemaAction::Noop => {
            debug!(model, bucket = %spec.name, "bucket schema already converged");
            Ok(())
        }
    }
}
