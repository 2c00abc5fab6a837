//! Error kinds for the unit store.

use thiserror::Error;

/// Errors surfaced by [`crate::UnitStore`].
///
/// Per-task failures (executor flags, parse errors, exit codes) are not
/// represented here — they are absorbed into `update_units` batches and
/// reported via `ReleaseSummary` at the `lobster` crate level. Only things
/// that threaten durable state are modeled as `StoreError`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error during {op}: {source}")]
    Sqlite {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store busy after {attempts} attempts during {op}")]
    RetryExhausted { op: &'static str, attempts: u32 },

    #[error("workflow {label:?} is already registered with a different topology")]
    TopologyMismatch { label: String },

    #[error("workflow {label:?} is not registered")]
    UnknownWorkflow { label: String },

    #[error("registering dependency {child:?} -> {parent:?} would create a cycle")]
    CyclicDependency { child: String, parent: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn from_sqlite(op: &'static str, source: rusqlite::Error) -> Self {
        StoreError::Sqlite { op, source }
    }
}
