use camino::Utf8PathBuf;
use thiserror::Error;

use crate::stale::Reason;

/// Errors produced while evaluating or running a single task.
///
/// None of these are retried by the engine; retry policy, if any, belongs
/// to the caller that schedules tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The fingerprint engine cannot introspect the logic unit.
    #[error("cannot retrieve source for '{identity}'")]
    SourceUnavailable { identity: String },

    /// A declared input is absent; the run was refused before it started.
    #[error("missing prerequisite: {path}")]
    PrerequisiteMissing { path: Utf8PathBuf },

    /// The task body returned without producing a declared output.
    #[error("declared output not created: {path}")]
    OutputNotProduced { path: Utf8PathBuf },

    /// The task is still stale right after a successful run. This is a bug
    /// in the engine or in the task's own declarations (e.g. an output
    /// written to a path that was never declared), never a user error.
    #[error("task still stale after run: {reasons:?}")]
    InvariantViolation { reasons: Reason },

    /// No input or output path was declared under this key.
    #[error("no path declared under key '{key}'")]
    UnknownKey { key: String },

    /// A task must declare at least one output.
    #[error("a task must declare at least one output")]
    NoOutputs,

    /// An output path must name a file; the temp-then-rename commit has
    /// nowhere to put a sibling temp file otherwise.
    #[error("output path has no file name: {path}")]
    OutputNotAFile { path: Utf8PathBuf },

    /// The task graph contains a cycle.
    #[error("cycle detected in the task graph")]
    Cycle,

    /// The task body itself failed. The original cause is carried
    /// unchanged so callers can inspect it.
    #[error("task body failed:\n{0}")]
    Logic(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the on-disk metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("couldn't access the metadata store.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("couldn't decode a metadata record.\n{0}")]
    Record(#[from] serde_json::Error),
}
