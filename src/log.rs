//! The scoped per-run execution log.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

use camino::Utf8Path;
use chrono::Utc;

/// A scoped handle on a task's execution log.
///
/// Attached by the execution controller for the duration of one run and
/// detached (flushed and closed) on drop, on every exit path. Task
/// bodies write through it via the run context.
pub struct RunLog {
    writer: Mutex<BufWriter<std::fs::File>>,
}

impl RunLog {
    pub fn attach(path: &Utf8Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Appends a timestamped line. Log failures are reported through
    /// `tracing` instead of aborting the run they describe.
    pub fn write(&self, line: impl AsRef<str>) {
        let mut writer = self.writer.lock().unwrap();
        if let Err(err) = writeln!(writer, "{} {}", Utc::now().to_rfc3339(), line.as_ref()) {
            tracing::warn!("couldn't write to the run log: {err}");
        }
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    #[test]
    fn test_lines_are_appended_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap().join("task.log");

        {
            let log = RunLog::attach(&path).unwrap();
            log.write("first");
            log.write("second");
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" first"));
        assert!(lines[1].ends_with(" second"));
    }
}
