//! The task model: declared inputs and outputs, policy flags, status
//! lifecycle and the derived identity key.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::hash::Hash32;
use crate::logic::Logic;

/// Lifecycle of a single task within one engine invocation.
///
/// Created `NotRun`; the execution controller sets `Running` at start,
/// `Complete` on successful atomic commit, and `Error` on any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NotRun,
    Running,
    Complete,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::NotRun => "NOT_RUN",
            Status::Running => "RUNNING",
            Status::Complete => "COMPLETE",
            Status::Error => "ERROR",
        })
    }
}

/// The stable key under which a task's metadata persists across process
/// runs: a digest of the logic identity plus the canonicalized input and
/// output path sets. Identical key means same task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(Hash32);

impl From<Hash32> for IdentityKey {
    fn from(hash: Hash32) -> Self {
        IdentityKey(hash)
    }
}

impl IdentityKey {
    pub fn to_hex(self) -> String {
        self.0.to_hex()
    }

    /// The first ten hex characters, used in logs and display.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(10);
        hex
    }
}

impl std::fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdentityKey({})", self.short())
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.short())
    }
}

/// One unit of work: executable logic plus declared inputs and outputs.
///
/// Keys of the input/output maps are stable identifiers used nowhere
/// else; paths are absolutized at construction so the identity key does
/// not depend on the working directory at evaluation time.
pub struct Task {
    logic: Arc<dyn Logic>,
    depends_on: Vec<Arc<dyn Logic>>,
    inputs: BTreeMap<Arc<str>, Utf8PathBuf>,
    outputs: BTreeMap<Arc<str>, Utf8PathBuf>,
    force: bool,
    check_path_metadata: bool,
    rerun_on_mtime: bool,
    status: Status,
    identity: OnceLock<IdentityKey>,
}

impl Task {
    pub fn builder(logic: impl Logic + 'static) -> TaskBuilder {
        TaskBuilder {
            logic: Arc::new(logic),
            depends_on: Vec::new(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            force: false,
            check_path_metadata: true,
            rerun_on_mtime: true,
        }
    }

    pub fn logic(&self) -> &dyn Logic {
        self.logic.as_ref()
    }

    pub fn depends_on(&self) -> &[Arc<dyn Logic>] {
        &self.depends_on
    }

    pub fn inputs(&self) -> &BTreeMap<Arc<str>, Utf8PathBuf> {
        &self.inputs
    }

    pub fn outputs(&self) -> &BTreeMap<Arc<str>, Utf8PathBuf> {
        &self.outputs
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn check_path_metadata(&self) -> bool {
        self.check_path_metadata
    }

    pub fn rerun_on_mtime(&self) -> bool {
        self.rerun_on_mtime
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Whether every declared input currently exists. A task with a
    /// missing input cannot even start.
    pub fn can_run(&self) -> bool {
        self.inputs.values().all(|path| path.exists())
    }

    /// The first declared input that does not currently exist.
    pub(crate) fn missing_input(&self) -> Option<&Utf8Path> {
        self.inputs
            .values()
            .find(|path| !path.exists())
            .map(Utf8PathBuf::as_path)
    }

    /// The task's primary key, computed once and cached.
    pub fn identity_key(&self) -> IdentityKey {
        *self.identity.get_or_init(|| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(self.logic.identity().as_bytes());
            for path in self.inputs.values() {
                hasher.update(path.as_str().as_bytes());
            }
            for path in self.outputs.values() {
                hasher.update(path.as_str().as_bytes());
            }
            IdentityKey(hasher.finalize().into())
        })
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.identity_key().short(), self.logic.identity())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("logic", &self.logic.identity())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("status", &self.status)
            .finish()
    }
}

/// Builds a [`Task`]; declaring at least one output is required.
pub struct TaskBuilder {
    logic: Arc<dyn Logic>,
    depends_on: Vec<Arc<dyn Logic>>,
    inputs: BTreeMap<Arc<str>, Utf8PathBuf>,
    outputs: BTreeMap<Arc<str>, Utf8PathBuf>,
    force: bool,
    check_path_metadata: bool,
    rerun_on_mtime: bool,
}

impl TaskBuilder {
    pub fn input(mut self, key: impl Into<Arc<str>>, path: impl AsRef<Utf8Path>) -> Self {
        self.inputs.insert(key.into(), path.as_ref().to_owned());
        self
    }

    pub fn output(mut self, key: impl Into<Arc<str>>, path: impl AsRef<Utf8Path>) -> Self {
        self.outputs.insert(key.into(), path.as_ref().to_owned());
        self
    }

    /// Declares a logic-level dependency: a unit whose source change
    /// should invalidate this task even though it is not an input.
    pub fn depends_on(mut self, logic: impl Logic + 'static) -> Self {
        self.depends_on.push(Arc::new(logic));
        self
    }

    /// Always report the task as stale regardless of fingerprints.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// When false, input content drift is ignored; only existence and
    /// structure matter. Missing inputs still count.
    pub fn check_path_metadata(mut self, check: bool) -> Self {
        self.check_path_metadata = check;
        self
    }

    /// When true, a changed size or mtime alone marks a path as changed;
    /// when false, the content hash decides.
    pub fn rerun_on_mtime(mut self, rerun: bool) -> Self {
        self.rerun_on_mtime = rerun;
        self
    }

    pub fn build(self) -> Result<Task, TaskError> {
        if self.outputs.is_empty() {
            return Err(TaskError::NoOutputs);
        }

        let mut inputs = BTreeMap::new();
        for (key, path) in self.inputs {
            inputs.insert(key, absolutize(&path)?);
        }
        let mut outputs = BTreeMap::new();
        for (key, path) in self.outputs {
            let path = absolutize(&path)?;
            if path.file_name().is_none() {
                return Err(TaskError::OutputNotAFile { path });
            }
            outputs.insert(key, path);
        }

        Ok(Task {
            logic: self.logic,
            depends_on: self.depends_on,
            inputs,
            outputs,
            force: self.force,
            check_path_metadata: self.check_path_metadata,
            rerun_on_mtime: self.rerun_on_mtime,
            status: Status::NotRun,
            identity: OnceLock::new(),
        })
    }
}

/// Anchors a path at the current directory and normalizes it lexically.
pub(crate) fn absolutize(path: &Utf8Path) -> Result<Utf8PathBuf, std::io::Error> {
    if path.is_absolute() {
        return Ok(normalize_path(path));
    }

    let cwd = Utf8PathBuf::from_path_buf(std::env::current_dir()?)
        .map_err(|path| std::io::Error::other(format!("non-UTF-8 working directory: {path:?}")))?;

    Ok(normalize_path(&cwd.join(path)))
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// This may cause incorrect or surprising behavior at times. This should be
/// used carefully. Unfortunately, [`std::fs::canonicalize`] can be hard to use
/// correctly, since it can often fail, or on Windows returns annoying device
/// paths.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::FnLogic;

    fn noop(name: &str) -> FnLogic {
        FnLogic::new(name, "fn noop() {}", |_ctx| Ok(()))
    }

    #[test]
    fn test_builder_requires_outputs() {
        let result = Task::builder(noop("a")).input("in", "/tmp/in.txt").build();
        assert!(matches!(result, Err(TaskError::NoOutputs)));
    }

    #[test]
    fn test_builder_rejects_output_without_file_name() {
        let result = Task::builder(noop("a")).output("out", "/").build();
        assert!(matches!(result, Err(TaskError::OutputNotAFile { .. })));

        // Normalization strips the trailing component before the check.
        let result = Task::builder(noop("a")).output("out", "/data/..").build();
        assert!(matches!(result, Err(TaskError::OutputNotAFile { .. })));
    }

    #[test]
    fn test_identity_is_stable_across_instances() {
        let a = Task::builder(noop("job"))
            .input("in", "/data/in.txt")
            .output("out", "/data/out.txt")
            .build()
            .unwrap();
        let b = Task::builder(noop("job"))
            .input("in", "/data/in.txt")
            .output("out", "/data/out.txt")
            .build()
            .unwrap();

        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_identity_depends_on_paths() {
        let a = Task::builder(noop("job"))
            .output("out", "/data/out.txt")
            .build()
            .unwrap();
        let b = Task::builder(noop("job"))
            .output("out", "/data/other.txt")
            .build()
            .unwrap();

        assert_ne!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_identity_normalizes_paths() {
        let a = Task::builder(noop("job"))
            .output("out", "/data/./sub/../out.txt")
            .build()
            .unwrap();
        let b = Task::builder(noop("job"))
            .output("out", "/data/out.txt")
            .build()
            .unwrap();

        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn test_display_uses_short_key() {
        let task = Task::builder(noop("job"))
            .output("out", "/data/out.txt")
            .build()
            .unwrap();

        let display = task.to_string();
        assert_eq!(display, format!("{} job", task.identity_key().short()));
        assert_eq!(task.identity_key().short().len(), 10);
    }

    #[test]
    fn test_can_run_checks_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let input = root.join("in.txt");

        let task = Task::builder(noop("job"))
            .input("in", &input)
            .output("out", root.join("out.txt"))
            .build()
            .unwrap();

        assert!(!task.can_run());
        assert_eq!(task.missing_input(), Some(input.as_path()));

        std::fs::write(&input, "data").unwrap();
        assert!(task.can_run());
        assert_eq!(task.missing_input(), None);
    }
}
