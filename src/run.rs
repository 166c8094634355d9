//! Orchestrates one task run: pre-flight check, temp-output execution,
//! post-run verification, atomic commit, metadata update and failure
//! containment.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::TaskError;
use crate::fingerprint::{self, FingerprintEngine};
use crate::log::RunLog;
use crate::meta::{MetadataStore, PathRecord, TaskMetadata};
use crate::stale::{self, Reason};
use crate::task::{Status, Task};

/// Derives the sibling hidden name a task writes to before the atomic
/// rename. Same directory, therefore same filesystem.
pub(crate) fn tmp_atomic_path(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or_default();
    path.with_file_name(format!(".tatara.tmp.{name}"))
}

/// What a task body sees while it runs: the declared input paths, and
/// in place of every declared output, the temporary path it must write
/// to. The final output paths are never exposed to running logic.
pub struct RunContext<'a> {
    inputs: &'a BTreeMap<Arc<str>, Utf8PathBuf>,
    outputs: BTreeMap<Arc<str>, Utf8PathBuf>,
    log: &'a RunLog,
}

impl RunContext<'_> {
    /// The absolute path declared under an input key.
    pub fn input(&self, key: &str) -> Result<&Utf8Path, TaskError> {
        self.inputs
            .get(key)
            .map(Utf8PathBuf::as_path)
            .ok_or_else(|| TaskError::UnknownKey { key: key.into() })
    }

    /// The temporary path to write the output declared under a key.
    pub fn output(&self, key: &str) -> Result<&Utf8Path, TaskError> {
        self.outputs
            .get(key)
            .map(Utf8PathBuf::as_path)
            .ok_or_else(|| TaskError::UnknownKey { key: key.into() })
    }

    /// Appends a line to this run's execution log.
    pub fn log(&self, line: impl AsRef<str>) {
        self.log.write(line);
    }
}

/// Evaluates staleness and executes tasks against a metadata store.
///
/// The runner is sequential and synchronous: a task body runs to
/// completion (or fails) before any commit step begins. Running many
/// tasks concurrently is the caller's responsibility.
pub struct Runner {
    store: MetadataStore,
    engine: FingerprintEngine,
}

impl Runner {
    pub fn new(store: MetadataStore) -> Self {
        Self {
            store,
            engine: FingerprintEngine::new(),
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn engine(&self) -> &FingerprintEngine {
        &self.engine
    }

    /// Why the task must re-run, or the empty set when it is up to date.
    ///
    /// A forced task is reported stale without introspecting its logic
    /// or touching the store, so forcing works even for logic with no
    /// inspectable source.
    pub fn evaluate(&self, task: &Task) -> Result<Reason, TaskError> {
        if task.force() {
            return Ok(Reason::FORCED);
        }

        let fingerprint = self.engine.fingerprint(task.logic(), task.depends_on())?;
        let metadata = self.store.load(&task.identity_key())?;

        Ok(stale::evaluate(task, &fingerprint, metadata.as_ref())?)
    }

    /// A line diff between the source recorded on the last successful
    /// run and the current source, for display when a task is stale due
    /// to a code change. `None` when no record exists or nothing changed.
    pub fn diff(&self, task: &Task) -> Result<Option<String>, TaskError> {
        let current = self.engine.source_text(task.logic())?;
        let metadata = self.store.load(&task.identity_key())?;

        Ok(fingerprint::diff(
            metadata.as_ref().map(|m| m.source.as_str()),
            &current,
        ))
    }

    /// Executes one task with atomic visibility of its outputs.
    ///
    /// Refuses to start while a declared input is missing, without
    /// touching the task's status. Any failure after the run has started
    /// transitions the task to `Error`, is written to the run log, and
    /// is returned unchanged. Temporary files of a failed run are left
    /// in place for postmortem inspection; they are never committed.
    pub fn run(&self, task: &mut Task) -> Result<(), TaskError> {
        if let Some(path) = task.missing_input() {
            return Err(TaskError::PrerequisiteMissing {
                path: path.to_owned(),
            });
        }

        let key = task.identity_key();
        let _lock = self.store.lock(&key)?;

        let log_path = self.store.log_path(&key);
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir)?;
        }

        task.set_status(Status::Running);
        self.store.append_status(&key, Status::Running)?;

        let log = RunLog::attach(&log_path)?;

        match self.run_inner(task, &log) {
            Ok(()) => {
                task.set_status(Status::Complete);
                self.store.append_status(&key, Status::Complete)?;
                log.write(format!("completed: {task}"));
                Ok(())
            }
            Err(err) => {
                task.set_status(Status::Error);
                log.write(format!("failed: {task}: {err}"));
                if let Err(err) = self.store.append_status(&key, Status::Error) {
                    tracing::warn!("couldn't journal the error status: {err}");
                }
                Err(err)
            }
        }
    }

    fn run_inner(&self, task: &Task, log: &RunLog) -> Result<(), TaskError> {
        for path in task.outputs().values() {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
        }

        let tmp_outputs: BTreeMap<Arc<str>, Utf8PathBuf> = task
            .outputs()
            .iter()
            .map(|(key, path)| (Arc::clone(key), tmp_atomic_path(path)))
            .collect();

        let ctx = RunContext {
            inputs: task.inputs(),
            outputs: tmp_outputs.clone(),
            log,
        };

        log.write(format!("running: {task}"));
        let started = Instant::now();
        task.logic().execute(&ctx).map_err(TaskError::Logic)?;
        tracing::debug!("{task} completed in {:.2?}", started.elapsed());

        // All declared outputs must exist in their temp locations before
        // any of them is committed.
        for (key, tmp_path) in &tmp_outputs {
            if !tmp_path.exists() {
                return Err(TaskError::OutputNotProduced {
                    path: task.outputs()[key].clone(),
                });
            }
        }

        for (key, tmp_path) in &tmp_outputs {
            fs::rename(tmp_path, &task.outputs()[key])?;
        }

        let metadata = self.capture_metadata(task)?;
        let key = task.identity_key();
        self.store.store(&key, &metadata)?;

        // The freshly written metadata must evaluate as up to date; a
        // leftover reason is a bug in the engine or in the task's own
        // declarations, not a user error.
        let mut reasons = stale::evaluate(task, &metadata.fingerprint, Some(&metadata))?;
        reasons.remove(Reason::FORCED);
        if !reasons.is_empty() {
            return Err(TaskError::InvariantViolation { reasons });
        }

        Ok(())
    }

    fn capture_metadata(&self, task: &Task) -> Result<TaskMetadata, TaskError> {
        let fingerprint = self.engine.fingerprint(task.logic(), task.depends_on())?;
        let source = self.engine.source_text(task.logic())?.to_string();

        let mut paths = BTreeMap::new();
        for path in task.inputs().values().chain(task.outputs().values()) {
            paths.insert(path.clone(), PathRecord::capture(path)?);
        }

        Ok(TaskMetadata {
            fingerprint,
            source,
            paths,
        })
    }
}
