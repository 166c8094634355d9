//! Out-of-band change detection for files no task produces.
//!
//! A rescan task wraps exactly one file path and has no outputs. Its
//! whole purpose is to catch drift caused *outside* the engine's own
//! commit path, so completion is re-derived fresh on every call instead
//! of being cached.

use std::sync::OnceLock;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::TaskError;
use crate::meta::{MetadataStore, PathRecord};
use crate::task::{self, IdentityKey, Status};

/// The outcome of a rescan, reported distinctly so callers can warn on
/// drift of a path the engine expects to be immutable rather than
/// silently accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    /// No record existed yet; the path was observed for the first time.
    FirstObservation,
    /// The content changed since the last observation.
    Drifted,
    /// The content matches the last observation.
    Unchanged,
}

/// A degenerate task watching one shared input file.
pub struct RescanTask {
    path: Utf8PathBuf,
    identity: OnceLock<IdentityKey>,
}

impl RescanTask {
    pub fn new(path: impl AsRef<Utf8Path>) -> std::io::Result<Self> {
        Ok(Self {
            path: task::absolutize(path.as_ref())?,
            identity: OnceLock::new(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Keyed by the watched path alone; there is no logic to hash.
    pub fn identity_key(&self) -> IdentityKey {
        *self.identity.get_or_init(|| {
            let hash: crate::hash::Hash32 = blake3::Hasher::new()
                .update(self.path.as_str().as_bytes())
                .finalize()
                .into();
            IdentityKey::from(hash)
        })
    }

    pub fn can_run(&self) -> bool {
        self.path.exists()
    }

    /// Whether the file is unchanged since its last observation.
    ///
    /// Always re-derived from the filesystem; a missing record or an
    /// unreadable file both count as "not complete".
    pub fn complete(&self, store: &MetadataStore) -> Result<bool, TaskError> {
        match store.load_path_record(&self.identity_key())? {
            Some(record) => Ok(record.matches(&self.path, false).unwrap_or(false)),
            None => Ok(false),
        }
    }

    /// Recomputes the digest, persists the new record and reports how
    /// the path moved since the last observation.
    pub fn run(&self, store: &MetadataStore) -> Result<Drift, TaskError> {
        if !self.can_run() {
            return Err(TaskError::PrerequisiteMissing {
                path: self.path.clone(),
            });
        }

        let key = self.identity_key();
        let _lock = store.lock(&key)?;
        store.append_status(&key, Status::Running)?;

        let previous = store.load_path_record(&key)?;
        let current = PathRecord::capture(&self.path)?;

        let drift = match previous {
            None => Drift::FirstObservation,
            Some(previous) if previous.hash != current.hash => {
                tracing::warn!("content of {} changed out of band", self.path);
                Drift::Drifted
            }
            Some(_) => Drift::Unchanged,
        };

        store.store_path_record(&key, &current)?;
        store.append_status(&key, Status::Complete)?;

        Ok(drift)
    }
}

impl std::fmt::Display for RescanTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} rescan({})", self.identity_key().short(), self.path)
    }
}
