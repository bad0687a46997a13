//! Error taxonomy and transient/terminal classification.
//!
//! Failures come from two places: the remote moray service, which reports
//! named errors on the wire ([`MorayError`]), and the initializer itself
//! ([`InitError`]). The backoff engine decides whether to retry an attempt
//! by asking [`is_transient`], which inspects every cause in an
//! [`anyhow::Error`] chain for a kind that is terminal in the current
//! phase. Anything it does not recognize is treated as transient.

use std::fmt;

use thiserror::Error;

/// Named error kinds reported by the moray service.
///
/// `Display` renders the name exactly as it appears on the wire, so error
/// chains formatted with `{:#}` remain greppable against moray logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MorayErrorName {
    BucketNotFound,
    InvalidBucketConfig,
    InvalidBucketName,
    InvalidIndexDefinition,
    NotFunction,
    BucketVersion,
    InvalidIndexType,
    InvalidQuery,
    NotIndexed,
    UniqueAttribute,
}

impl MorayErrorName {
    /// The wire-protocol name for this error kind.
    pub fn as_wire_name(&self) -> &'static str {
        match self {
            Self::BucketNotFound => "BucketNotFoundError",
            Self::InvalidBucketConfig => "InvalidBucketConfigError",
            Self::InvalidBucketName => "InvalidBucketNameError",
            Self::InvalidIndexDefinition => "InvalidIndexDefinitionError",
            Self::NotFunction => "NotFunctionError",
            Self::BucketVersion => "BucketVersionError",
            Self::InvalidIndexType => "InvalidIndexTypeError",
            Self::InvalidQuery => "InvalidQueryError",
            Self::NotIndexed => "NotIndexedError",
            Self::UniqueAttribute => "UniqueAttributeError",
        }
    }
}

impl fmt::Display for MorayErrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_name())
    }
}

/// An error reported by the moray service.
///
/// Client implementations (and test fakes) construct these from wire
/// responses; the rest of the crate only ever inspects `name` through
/// [`error_name_in_chain`] and [`is_transient`].
#[derive(Error, Debug, Clone)]
#[error("{name}: {message}")]
pub struct MorayError {
    pub name: MorayErrorName,
    pub message: String,
}

impl MorayError {
    pub fn new(name: MorayErrorName, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }

    pub fn bucket_not_found(bucket: &str) -> Self {
        Self::new(
            MorayErrorName::BucketNotFound,
            format!("bucket \"{bucket}\" does not exist"),
        )
    }
}

/// Errors raised by the initializer itself rather than the remote.
///
/// Every variant is terminal in every phase.
#[derive(Error, Debug)]
pub enum InitError {
    /// The desired schema drops indexes the remote bucket already has.
    /// Removal is banned: a rollback to code that still queries the
    /// dropped field would turn those queries unindexed.
    #[error("removing indexes from bucket \"{bucket}\" is not allowed: {}", .removed.join(", "))]
    InvalidIndexesRemoval {
        bucket: String,
        removed: Vec<String>,
    },

    /// The desired schema differs from the remote one without a version
    /// bump.
    #[error("schema of bucket \"{bucket}\" changed but version {version} was not bumped")]
    SchemaChangesSameVersion {
        bucket: String,
        version: u64,
        old: serde_json::Value,
        new: serde_json::Value,
    },

    /// Files in a migrations directory that do not match `NNN-<slug>.<ext>`.
    #[error("invalid data migration file names: {}", .0.join(", "))]
    InvalidDataMigrationFileNames(Vec<String>),

    /// Migration versions for a model must run 1, 2, … k with no gaps.
    #[error(
        "migration versions for model \"{model}\" must be sequential: expected {expected}, found {found}"
    )]
    NonSequentialMigrationVersion {
        model: String,
        expected: u64,
        found: u64,
    },

    /// `start()` was called a second time on the same initializer.
    #[error("buckets initialization has already been started")]
    AlreadyStarted,

    /// The caller's cancellation signal fired.
    #[error("{phase} cancelled")]
    Cancelled { phase: Phase },

    /// The backoff engine gave up after the configured attempt cap.
    #[error("maximum number of attempts reached for {phase}")]
    MaxAttemptsReached { phase: Phase },
}

/// The three pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Reindex,
    DataMigration,
}

impl Phase {
    /// Remote error kinds that abort this phase instead of being retried.
    ///
    /// Reindexing is inherently retryable, so nothing is terminal there.
    /// `InvalidQuery` is terminal for data migrations only once the
    /// stale-cache envelope in the migration controller has given up on
    /// it; the classifier never sees the recoverable case.
    fn terminal_names(&self) -> &'static [MorayErrorName] {
        match self {
            Self::Setup => &[
                MorayErrorName::InvalidBucketConfig,
                MorayErrorName::InvalidBucketName,
                MorayErrorName::InvalidIndexDefinition,
                MorayErrorName::NotFunction,
                MorayErrorName::BucketVersion,
            ],
            Self::Reindex => &[],
            Self::DataMigration => &[
                MorayErrorName::BucketNotFound,
                MorayErrorName::InvalidIndexType,
                MorayErrorName::InvalidQuery,
                MorayErrorName::NotIndexed,
                MorayErrorName::UniqueAttribute,
            ],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Setup => "buckets setup",
            Self::Reindex => "buckets reindex",
            Self::DataMigration => "data migrations",
        })
    }
}

/// Whether any cause in `err`'s chain is a [`MorayError`] bearing one of
/// `names`.
pub fn error_name_in_chain(err: &anyhow::Error, names: &[MorayErrorName]) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<MorayError>()
            .is_some_and(|moray| names.contains(&moray.name))
    })
}

/// Classify `err` for `phase`: `true` means the attempt may be retried.
///
/// Terminal means: a remote error kind in the phase's terminal set, or any
/// [`InitError`], appears anywhere in the cause chain. Everything else is
/// transient, which keeps the classifier total over arbitrary errors.
pub fn is_transient(phase: Phase, err: &anyhow::Error) -> bool {
    let terminal = phase.terminal_names();
    for cause in err.chain() {
        if let Some(moray) = cause.downcast_ref::<MorayError>() {
            if terminal.contains(&moray.name) {
                return false;
            }
        }
        if cause.downcast_ref::<InitError>().is_some() {
            return false;
        }
    }
    true
}
