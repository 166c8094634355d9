//! Persistence of what a previous run observed.
//!
//! Records live under a root directory in a two-level layout sharded by
//! the identity key: `tasks/<k[..2]>/<k[2..]>/` holds `task.json` (the
//! metadata record), `task.status` (an append-only journal of status
//! transitions), `task.log` (the last run's execution log) and
//! `task.lock` (the advisory run lock). Rescan records live under
//! `paths/` in the same layout.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::hash::Hash32;
use crate::task::{IdentityKey, Status};

/// The digest and stat signature of a single file path, captured at the
/// end of the last successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRecord {
    pub hash: Hash32,
    pub size: u64,
    pub mtime: i64,
}

impl PathRecord {
    /// Captures the current digest and stat signature of a file.
    pub fn capture(path: &Utf8Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            hash: Hash32::hash_file(path)?,
            size: meta.len(),
            mtime: mtime_nanos(&meta),
        })
    }

    /// Whether the file at `path` still matches this record.
    ///
    /// An unchanged size and mtime pair is accepted without re-hashing.
    /// When the stat differs, `rerun_on_mtime` reports the change
    /// immediately; otherwise the content hash decides.
    pub fn matches(&self, path: &Utf8Path, rerun_on_mtime: bool) -> std::io::Result<bool> {
        let meta = fs::metadata(path)?;

        if meta.len() == self.size && mtime_nanos(&meta) == self.mtime {
            return Ok(true);
        }
        if rerun_on_mtime {
            return Ok(false);
        }

        Ok(Hash32::hash_file(path)? == self.hash)
    }
}

fn mtime_nanos(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Everything recorded about a task at the end of its last successful
/// run. Rewritten in full after every success, never partially updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub fingerprint: Fingerprint,
    /// The stripped source text, retained so a code-change diff can be
    /// rendered on the next invocation.
    pub source: String,
    /// Per-path records for every declared input and output.
    pub paths: BTreeMap<Utf8PathBuf, PathRecord>,
}

/// The on-disk store of [`TaskMetadata`] and rescan [`PathRecord`]s.
///
/// Loads take a shared advisory lock on the record file and stores an
/// exclusive one; records are written to a temp file, fsync'd, and
/// renamed into place so a crash never leaves a partial record.
pub struct MetadataStore {
    root: Utf8PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn task_dir(&self, key: &IdentityKey) -> Utf8PathBuf {
        let hex = key.to_hex();
        self.root.join("tasks").join(&hex[..2]).join(&hex[2..])
    }

    fn path_dir(&self, key: &IdentityKey) -> Utf8PathBuf {
        let hex = key.to_hex();
        self.root.join("paths").join(&hex[..2]).join(&hex[2..])
    }

    /// The location of a task's execution log, derived from its key.
    pub fn log_path(&self, key: &IdentityKey) -> Utf8PathBuf {
        self.task_dir(key).join("task.log")
    }

    /// Loads the metadata recorded for a task, or `None` before its
    /// first successful run.
    pub fn load(&self, key: &IdentityKey) -> Result<Option<TaskMetadata>, StoreError> {
        read_record(&self.task_dir(key).join("task.json"))
    }

    /// Atomically rewrites the metadata record for a task.
    pub fn store(&self, key: &IdentityKey, metadata: &TaskMetadata) -> Result<(), StoreError> {
        write_record(&self.task_dir(key), "task.json", metadata)
    }

    /// Loads the record of a rescanned path, or `None` before its first
    /// observation.
    pub fn load_path_record(&self, key: &IdentityKey) -> Result<Option<PathRecord>, StoreError> {
        read_record(&self.path_dir(key).join("path.json"))
    }

    /// Atomically rewrites the record of a rescanned path.
    pub fn store_path_record(
        &self,
        key: &IdentityKey,
        record: &PathRecord,
    ) -> Result<(), StoreError> {
        write_record(&self.path_dir(key), "path.json", record)
    }

    /// Appends a timestamped status transition to the task's journal.
    pub fn append_status(&self, key: &IdentityKey, status: Status) -> Result<(), StoreError> {
        let dir = self.task_dir(key);
        fs::create_dir_all(&dir)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("task.status"))?;
        writeln!(file, "{};{}", Utc::now().to_rfc3339(), status)?;

        Ok(())
    }

    /// The raw status journal of a task.
    pub fn read_status(&self, key: &IdentityKey) -> Result<String, StoreError> {
        Ok(fs::read_to_string(self.task_dir(key).join("task.status"))?)
    }

    /// The last run's execution log.
    pub fn read_log(&self, key: &IdentityKey) -> Result<String, StoreError> {
        Ok(fs::read_to_string(self.log_path(key))?)
    }

    /// Takes the exclusive advisory lock for a task identity, blocking
    /// until any concurrent holder releases it. Held for the duration of
    /// a run so two processes never execute the same task at once.
    pub fn lock(&self, key: &IdentityKey) -> Result<StoreLock, StoreError> {
        let dir = self.task_dir(key);
        fs::create_dir_all(&dir)?;

        let file = File::create(dir.join("task.lock"))?;
        file.lock_exclusive()?;

        Ok(StoreLock { file })
    }
}

/// Exclusive advisory lock on a task identity; released on drop.
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_record<T>(path: &Utf8Path) -> Result<Option<T>, StoreError>
where
    T: serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)?;
    file.lock_shared()?;
    let record = serde_json::from_reader(BufReader::new(&file));
    FileExt::unlock(&file)?;

    Ok(Some(record?))
}

fn write_record<T>(dir: &Utf8Path, name: &str, record: &T) -> Result<(), StoreError>
where
    T: Serialize,
{
    fs::create_dir_all(dir)?;

    let tmp_path = dir.join(format!(".{name}.tmp"));
    let file = File::create(&tmp_path)?;
    file.lock_exclusive()?;

    let mut writer = BufWriter::new(&file);
    let result = serde_json::to_writer_pretty(&mut writer, record);
    writer.write_all(b"\n")?;
    writer.flush()?;
    drop(writer);

    file.sync_all()?;
    FileExt::unlock(&file)?;
    result?;

    fs::rename(tmp_path, dir.join(name))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rewrites the file after a short pause so the mtime moves.
    fn touch_later(path: &Utf8Path, content: &str) {
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(path, content).unwrap();
    }

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, MetadataStore::new(root.join("meta")))
    }

    fn key(seed: &str) -> IdentityKey {
        IdentityKey::from(Hash32::hash(seed))
    }

    fn sample_metadata() -> TaskMetadata {
        TaskMetadata {
            fingerprint: Fingerprint {
                source: Hash32::hash(b"source"),
                compiled: Hash32::hash(b"compiled"),
                depends_on: Hash32::hash(b""),
            },
            source: "fn f() {}\n".into(),
            paths: BTreeMap::new(),
        }
    }

    #[test]
    fn test_load_absent_is_none() {
        let (_dir, store) = store();
        assert!(store.load(&key("a")).unwrap().is_none());
    }

    #[test]
    fn test_round_trip() {
        let (_dir, store) = store();
        let key = key("a");
        let metadata = sample_metadata();

        store.store(&key, &metadata).unwrap();
        assert_eq!(store.load(&key).unwrap().unwrap(), metadata);
    }

    #[test]
    fn test_rewrite_replaces_whole_record() {
        let (_dir, store) = store();
        let key = key("a");

        let mut metadata = sample_metadata();
        store.store(&key, &metadata).unwrap();

        metadata.source = "fn g() {}\n".into();
        store.store(&key, &metadata).unwrap();

        assert_eq!(store.load(&key).unwrap().unwrap().source, "fn g() {}\n");
    }

    #[test]
    fn test_status_journal_is_ordered() {
        let (_dir, store) = store();
        let key = key("a");

        store.append_status(&key, Status::Running).unwrap();
        store.append_status(&key, Status::Complete).unwrap();

        let journal = store.read_status(&key).unwrap();
        let lines: Vec<_> = journal.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(";RUNNING"));
        assert!(lines[1].ends_with(";COMPLETE"));
    }

    #[test]
    fn test_path_record_fast_path_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap().join("file.txt");
        std::fs::write(&path, "one").unwrap();

        let record = PathRecord::capture(&path).unwrap();
        assert!(record.matches(&path, true).unwrap());
        assert!(record.matches(&path, false).unwrap());

        touch_later(&path, "two");
        assert!(!record.matches(&path, true).unwrap());
        assert!(!record.matches(&path, false).unwrap());

        // Same content rewritten: stat drifts, content does not.
        touch_later(&path, "one");
        assert!(!record.matches(&path, true).unwrap());
        assert!(record.matches(&path, false).unwrap());
    }

    #[test]
    fn test_lock_guard_releases() {
        let (_dir, store) = store();
        let key = key("a");

        let guard = store.lock(&key).unwrap();
        drop(guard);
        let _second = store.lock(&key).unwrap();
    }
}
