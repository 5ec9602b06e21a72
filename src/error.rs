// error.rs

use std::error::Error;
use std::path::PathBuf;

use bed_reader::BedErrorPlus;

use crate::store::Axis;

/// Thread-safe standard dynamic error.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors raised by the filter store, the apply engine and the dispatcher.
///
/// Errors from user callbacks are not represented here: `apply` returns them to the caller
/// unchanged, and `run_parallel` wraps them in [`EngineError::WorkerFailure`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown {axis} identifier '{id}'")]
    UnknownIdentifier { axis: Axis, id: String },

    #[error("invalid length of the {axis} selection: expected {expected}, found {found}")]
    LengthMismatch {
        axis: Axis,
        expected: usize,
        found: usize,
    },

    #[error("{axis} index {index} out of range (bound {bound})")]
    IndexOutOfRange {
        axis: Axis,
        index: usize,
        bound: usize,
    },

    #[error("no filter can be popped: the filter stack is empty")]
    EmptyStack,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("worker {worker} failed: {source}")]
    WorkerFailure {
        worker: usize,
        #[source]
        source: ThreadSafeStdError,
    },

    #[error(
        "'{0}' is not a standard variable name, and the standard format:\n    \
         sample.id, variant.id, position, chromosome, allele, genotype\n    \
         $dosage, $num_allele, $chrom_pos"
    )]
    UnknownVariable(String),

    #[error("outputs cannot be concatenated: {0}")]
    NotConcatenable(String),

    #[error("'{}' is already open; reopen it with duplicates allowed", .0.display())]
    FileAlreadyOpen(PathBuf),

    #[error("storage error: {0}")]
    Storage(ThreadSafeStdError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to create worker pool: {0}")]
    ThreadPool(String),
}

impl EngineError {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        EngineError::Storage(message.into().into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration(message.into())
    }
}

impl From<Box<BedErrorPlus>> for EngineError {
    fn from(e: Box<BedErrorPlus>) -> Self {
        EngineError::Storage(format!("bed_reader error: {}", e).into())
    }
}
