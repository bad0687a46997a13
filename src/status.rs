//! Observable status of an initialization run.
//!
//! Each phase publishes into a shared [`StatusHandle`]; observers read
//! value snapshots via [`StatusHandle::snapshot`], so no lock is ever
//! exposed and a snapshot never changes under the reader. Transient retry
//! errors surface in `latest_error` / `latest_errors` while retries are in
//! flight and are cleared once an attempt succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Lifecycle of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseState {
    #[default]
    NotStarted,
    Started,
    Done,
    Error,
}

/// Status of the setup and reindex phases.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseStatus {
    pub state: PhaseState,

    /// Most recent error, formatted with its full cause chain. Present
    /// while retrying and after terminal failure; absent after success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_error: Option<String>,
}

/// Status of the data-migration phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationsStatus {
    pub state: PhaseState,

    /// Most recent error per model, keyed by model name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub latest_errors: BTreeMap<String, String>,

    /// Highest migration version each model has completed.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub completed: BTreeMap<String, u64>,
}

/// Full status snapshot across the three phases.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub buckets_setup: PhaseStatus,
    pub buckets_reindex: PhaseStatus,
    pub data_migrations: MigrationsStatus,
}

/// Shared, internally synchronized status cell.
#[derive(Clone, Default)]
pub struct StatusHandle {
    inner: Arc<Mutex<Status>>,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy of the current status.
    pub fn snapshot(&self) -> Status {
        self.inner.lock().clone()
    }

    /// Mutate the status under the lock. Crate-internal: observers only
    /// ever see snapshots.
    pub(crate) fn update<F: FnOnce(&mut Status)>(&self, f: F) {
        f(&mut self.inner.lock());
    }
}
