//! Data migrations: versioned record rewrites per model.
//!
//! A [`MigrationModule`] rewrites one record to one data version; a
//! [`MigrationPlan`] holds each model's modules in version order. Plans
//! are either assembled in code or discovered from a migrations
//! directory by the [`loader`]. The [`controller`] executes a plan
//! against the store.

pub mod controller;
pub mod loader;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::errors::InitError;
use crate::moray::StoredRecord;

/// Context handed to every migration function.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    /// Model whose records are being migrated.
    pub model: String,
    /// Data version this migration produces.
    pub version: u64,
}

/// Signature of a migration function.
///
/// Takes ownership of the record and returns the rewritten record, or
/// `None` to skip a record that is already in the target shape. Skipped
/// records are not written back.
pub type MigrateFn =
    Arc<dyn Fn(StoredRecord, &MigrationContext) -> Result<Option<StoredRecord>> + Send + Sync>;

/// One migration step: rewrite records to data version `version`.
#[derive(Clone)]
pub struct MigrationModule {
    pub version: u64,
    migrate: MigrateFn,
}

impl MigrationModule {
    pub fn new<F>(version: u64, migrate: F) -> Self
    where
        F: Fn(StoredRecord, &MigrationContext) -> Result<Option<StoredRecord>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            version,
            migrate: Arc::new(migrate),
        }
    }

    /// Apply this migration to one record.
    pub fn apply(
        &self,
        record: StoredRecord,
        ctx: &MigrationContext,
    ) -> Result<Option<StoredRecord>> {
        (self.migrate)(record, ctx)
    }
}

impl fmt::Debug for MigrationModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationModule")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Ordered migrations per model.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    models: BTreeMap<String, Vec<MigrationModule>>,
}

impl MigrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model's migrations, replacing any previous entry.
    pub fn insert_model(&mut self, model: impl Into<String>, modules: Vec<MigrationModule>) {
        self.models.insert(model.into(), modules);
    }

    /// Builder-style [`insert_model`](Self::insert_model).
    pub fn with_model(mut self, model: impl Into<String>, modules: Vec<MigrationModule>) -> Self {
        self.insert_model(model, modules);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn models(&self) -> impl Iterator<Item = (&str, &[MigrationModule])> {
        self.models
            .iter()
            .map(|(model, modules)| (model.as_str(), modules.as_slice()))
    }

    /// Highest version a model migrates to, if it has any migrations.
    pub fn target_version(&self, model: &str) -> Option<u64> {
        self.models
            .get(model)
            .and_then(|modules| modules.last())
            .map(|module| module.version)
    }

    /// Check that every model's versions run exactly 1, 2, … k.
    pub fn validate(&self) -> Result<()> {
        for (model, modules) in self.models() {
            for (position, module) in modules.iter().enumerate() {
                let expected = position as u64 + 1;
                if module.version != expected {
                    return Err(InitError::NonSequentialMigrationVersion {
                        model: model.to_string(),
                        expected,
                        found: module.version,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}
