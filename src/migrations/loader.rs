//! Discover a migration plan from an on-disk layout.
//!
//! Layout: `root/<model>/NNN-<slug>.<ext>`, one file per migration, where
//! `NNN` is a zero-padded positive decimal that fixes the ordering. The
//! loader owns filename validation and ordering; turning a discovered
//! file into executable code is delegated to the host through
//! [`MigrationResolver`], since migration bodies are compiled into the
//! host rather than loaded at runtime.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::errors::InitError;
use crate::migrations::{MigrationModule, MigrationPlan};

/// Maps a discovered migration file to its compiled-in module.
///
/// Implementations typically match on the model name and the filename's
/// sequence number. The resolved module's `version` is asserted against
/// the file ordering by the loader, so a mismatched registration fails
/// loudly instead of running out of order.
pub trait MigrationResolver {
    fn resolve(&self, model: &str, file: &Path) -> Result<MigrationModule>;
}

impl<F> MigrationResolver for F
where
    F: Fn(&str, &Path) -> Result<MigrationModule>,
{
    fn resolve(&self, model: &str, file: &Path) -> Result<MigrationModule> {
        self(model, file)
    }
}

/// Parse `NNN-<slug>.<ext>` and return the sequence number.
///
/// `NNN` must be a positive decimal (leading zeros allowed) followed by a
/// `-` and a non-empty remainder.
fn parse_sequence(file_name: &str) -> Option<u64> {
    let (digits, rest) = file_name.split_once('-')?;
    if digits.is_empty() || rest.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match digits.parse::<u64>() {
        Ok(seq) if seq >= 1 => Some(seq),
        _ => None,
    }
}

/// Scan `root` and build a validated [`MigrationPlan`].
///
/// Fails with [`InitError::InvalidDataMigrationFileNames`] if any file in
/// any model directory does not match the naming pattern, and with
/// [`InitError::NonSequentialMigrationVersion`] if the resolved module
/// versions do not run 1, 2, … k.
pub fn load_migration_plan(
    root: &Path,
    resolver: &dyn MigrationResolver,
) -> Result<MigrationPlan> {
    let mut plan = MigrationPlan::new();
    let mut invalid_names: Vec<String> = Vec::new();

    let entries =
        fs::read_dir(root).with_context(|| format!("read migrations dir {}", root.display()))?;
    let mut model_dirs: Vec<(String, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read migrations dir {}", root.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            debug!(path = %path.display(), "ignoring non-directory in migrations root");
            continue;
        }
        let model = entry.file_name().to_string_lossy().into_owned();
        model_dirs.push((model, path));
    }
    model_dirs.sort();

    for (model, dir) in model_dirs {
        let mut files: Vec<(u64, PathBuf)> = Vec::new();
        for entry in
            fs::read_dir(&dir).with_context(|| format!("read model dir {}", dir.display()))?
        {
            let entry = entry.with_context(|| format!("read model dir {}", dir.display()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            match parse_sequence(&file_name) {
                Some(seq) => files.push((seq, entry.path())),
                None => invalid_names.push(format!("{model}/{file_name}")),
            }
        }
        if !invalid_names.is_empty() {
            continue;
        }
        files.sort();

        let mut modules = Vec::with_capacity(files.len());
        for (position, (seq, file)) in files.iter().enumerate() {
            let module = resolver
                .resolve(&model, file)
                .with_context(|| format!("resolve migration {}", file.display()))?;
            let expected = position as u64 + 1;
            if module.version != expected {
                return Err(InitError::NonSequentialMigrationVersion {
                    model,
                    expected,
                    found: module.version,
                }
                .into());
            }
            debug!(
                model = %model,
                sequence = seq,
                version = module.version,
                file = %file.display(),
                "loaded migration module"
            );
            modules.push(module);
        }
        plan.insert_model(model, modules);
    }

    if !invalid_names.is_empty() {
        invalid_names.sort();
        return Err(InitError::InvalidDataMigrationFileNames(invalid_names).into());
    }

    Ok(plan)
}
