//! Decides whether a task is up to date.
//!
//! The verdict is a set of reasons rather than a single boolean so
//! callers and tests can assert *why* a task is stale, not just that
//! it is.

use bitflags::bitflags;

use crate::fingerprint::Fingerprint;
use crate::meta::TaskMetadata;
use crate::task::Task;

bitflags! {
    /// The reasons a task must re-run. Empty means up to date.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Reason: u8 {
        const CODE_CHANGED    = 1 << 0;
        const INPUTS_CHANGED  = 1 << 1;
        const INPUTS_MISSING  = 1 << 2;
        const OUTPUTS_CHANGED = 1 << 3;
        const OUTPUTS_MISSING = 1 << 4;
        const FORCED          = 1 << 5;
    }
}

impl Reason {
    pub fn is_up_to_date(self) -> bool {
        self.is_empty()
    }
}

/// Compares the task's current fingerprint and on-disk state against the
/// metadata recorded at the end of the last successful run.
///
/// With no recorded metadata the task has never run: that is reported as
/// `CODE_CHANGED` (there is nothing to compare against) plus whatever is
/// structurally detectable about missing paths.
pub(crate) fn evaluate(
    task: &Task,
    fingerprint: &Fingerprint,
    metadata: Option<&TaskMetadata>,
) -> std::io::Result<Reason> {
    if task.force() {
        return Ok(Reason::FORCED);
    }

    let Some(metadata) = metadata else {
        let mut reasons = Reason::CODE_CHANGED;
        for path in task.inputs().values() {
            if !path.exists() {
                reasons |= Reason::INPUTS_MISSING;
            }
        }
        for path in task.outputs().values() {
            if !path.exists() {
                reasons |= Reason::OUTPUTS_MISSING;
            }
        }
        return Ok(reasons);
    };

    let mut reasons = Reason::empty();

    if *fingerprint != metadata.fingerprint {
        reasons |= Reason::CODE_CHANGED;
    }

    for path in task.inputs().values() {
        if !path.exists() {
            reasons |= Reason::INPUTS_MISSING;
            continue;
        }
        if !task.check_path_metadata() {
            continue;
        }
        match metadata.paths.get(path) {
            Some(record) if record.matches(path, task.rerun_on_mtime())? => {}
            _ => reasons |= Reason::INPUTS_CHANGED,
        }
    }

    for path in task.outputs().values() {
        if !path.exists() {
            reasons |= Reason::OUTPUTS_MISSING;
            continue;
        }
        match metadata.paths.get(path) {
            Some(record) if record.matches(path, task.rerun_on_mtime())? => {}
            _ => reasons |= Reason::OUTPUTS_CHANGED,
        }
    }

    Ok(reasons)
}
