//! File journals of retraining attempts
//!
//! Two views of the same records, both under the state directory:
//! - `retraining.log`: append-only, one human-readable line per attempt
//! - `retraining_log.json`: JSON array holding only the newest `limit` records
//!
//! The CLI and the daemon may append to the same directory, so the JSON
//! read-modify-write runs under an advisory `flock` on `retraining_log.json.lock`.

use crate::error::Result;
use crate::types::RetrainingRecord;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const TEXT_LOG_NAME: &str = "retraining.log";
pub const JSON_LOG_NAME: &str = "retraining_log.json";
const LOCK_NAME: &str = "retraining_log.json.lock";

/// Writer for the text and JSON retraining journals
#[derive(Debug, Clone)]
pub struct RetrainingJournal {
    text_path: PathBuf,
    json_path: PathBuf,
    lock_path: PathBuf,
    limit: usize,
}

impl RetrainingJournal {
    /// Journal files inside `dir`.
    pub fn new(dir: &Path, limit: usize) -> Self {
        Self {
            text_path: dir.join(TEXT_LOG_NAME),
            json_path: dir.join(JSON_LOG_NAME),
            lock_path: dir.join(LOCK_NAME),
            limit: limit.max(1),
        }
    }

    pub fn text_path(&self) -> &Path {
        &self.text_path
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    /// Append one record to both journals.
    pub fn append(&self, record: &RetrainingRecord) -> Result<()> {
        if let Some(parent) = self.text_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.append_text(record)?;
        self.append_json(record)
    }

    fn append_text(&self, record: &RetrainingRecord) -> Result<()> {
        let models = record
            .models_trained
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut line = format!(
            "[{}] run={} trigger={} status=\"{}\" duration_ms={} models=[{}]",
            record.started_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"),
            record.run_id,
            record.trigger,
            record.status,
            record.duration_ms,
            models,
        );
        if let Some(message) = &record.message {
            line.push_str(&format!(" message=\"{}\"", message.replace('"', "'")));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.text_path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn append_json(&self, record: &RetrainingRecord) -> Result<()> {
        let _lock = JournalLock::acquire(&self.lock_path)?;

        let mut records = self.read_json();
        records.push(record.clone());
        let excess = records.len().saturating_sub(self.limit);
        records.drain(..excess);

        // Write to a sibling file first so readers never see a torn array
        let tmp = self.json_path.with_extension(format!(
            "json.{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&records)?)?;
        if let Err(e) = std::fs::rename(&tmp, &self.json_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Records currently in the JSON journal, oldest first.
    ///
    /// A missing or unreadable file reads as empty.
    pub fn read_json(&self) -> Vec<RetrainingRecord> {
        let Ok(content) = std::fs::read(&self.json_path) else {
            return Vec::new();
        };
        match serde_json::from_slice(&content) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    path = %self.json_path.display(),
                    error = %e,
                    "Unreadable retraining journal; starting a new one"
                );
                Vec::new()
            }
        }
    }
}

/// Exclusive advisory lock, released on drop
struct JournalLock {
    file: File,
}

impl JournalLock {
    /// Block until the lock at `path` is ours.
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        loop {
            match lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        let _ = unlock(&self.file);
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_EX: i32 = 2;
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_UN: i32 = 8;
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
unsafe extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

// Single writer per state directory off Unix
#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}
