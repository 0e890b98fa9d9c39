//! Durable record of mailbox messages that have already been acted upon.
//!
//! # Design
//!
//! The [`UidStore`] trait abstracts exactly-once tracking of roster emails.
//! The primary implementation, [`FileUidStore`], keeps an append-only log with
//! one UID per line and fsyncs every append before returning, so a UID that
//! was reported as recorded survives a crash.
//!
//! On open the log is replayed to rebuild the in-memory set. A UID found in
//! the log is processed forever: no later run picks the same message again,
//! even when the provisioning that followed it failed.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;

/// Errors from UID store operations.
#[derive(Debug, thiserror::Error)]
pub enum UidStoreError {
    /// The UID cannot be stored as a single log line.
    #[error("invalid message uid {uid:?}: {reason}")]
    InvalidUid {
        /// The rejected UID.
        uid: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// I/O error while opening, replaying or appending to the log.
    #[error("uid log write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The in-memory set was poisoned by a panicking writer.
    #[error("uid store lock poisoned")]
    LockPoisoned,
}

/// Set of processed mailbox message UIDs.
///
/// `record` must return `Ok(())` only after the UID has been durably
/// persisted; `contains` must reflect every earlier `record`, including
/// those made by previous processes sharing the same storage.
pub trait UidStore {
    /// Returns `true` if `uid` was previously recorded.
    fn contains(&self, uid: &str) -> bool;

    /// Durably appends `uid`.
    fn record(&self, uid: &str) -> Result<(), UidStoreError>;
}

fn check_uid(uid: &str) -> Result<(), UidStoreError> {
    if uid.is_empty() {
        return Err(UidStoreError::InvalidUid {
            uid: uid.to_string(),
            reason: "empty",
        });
    }
    if uid.chars().any(char::is_whitespace) {
        return Err(UidStoreError::InvalidUid {
            uid: uid.to_string(),
            reason: "contains whitespace",
        });
    }
    Ok(())
}

// =============================================================================
// FileUidStore
// =============================================================================

/// Append-only file-backed UID store.
///
/// An exclusive file lock is held for the lifetime of this struct, so two
/// concurrent runs cannot interleave writes to the same log. If the lock
/// cannot be acquired, `open` fails with [`UidStoreError::Io`].
pub struct FileUidStore {
    path: PathBuf,
    processed: Mutex<HashSet<String>>,
    /// Append handle; also carries the exclusive lock.
    file: Mutex<File>,
    /// Set when the last line on disk lacks its newline (torn write).
    needs_newline: Mutex<bool>,
}

impl std::fmt::Debug for FileUidStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUidStore")
            .field("path", &self.path)
            .field("processed_count", &self.len())
            .finish_non_exhaustive()
    }
}

impl FileUidStore {
    /// Open or create the UID log at `path`, replaying existing entries.
    ///
    /// A missing log is an empty store, never an error.
    ///
    /// # Errors
    ///
    /// Returns [`UidStoreError::Io`] if the log cannot be created, locked or
    /// read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, UidStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .truncate(false)
            .append(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("uid log is locked by another process ({}): {e}", path.display()),
            )
        })?;

        let mut processed = HashSet::new();
        let mut needs_newline = false;
        {
            let mut replay = file.try_clone()?;
            replay.seek(SeekFrom::Start(0))?;
            let reader = BufReader::new(&mut replay);
            for line in reader.lines() {
                let line = line?;
                let uid = line.trim();
                if !uid.is_empty() {
                    processed.insert(uid.to_string());
                }
            }

            let len = replay.seek(SeekFrom::End(0))?;
            if len > 0 {
                replay.seek(SeekFrom::End(-1))?;
                let mut last = [0u8; 1];
                replay.read_exact(&mut last)?;
                if last[0] != b'\n' {
                    tracing::warn!(
                        path = %path.display(),
                        "uid log ends without a newline, repairing before next append"
                    );
                    needs_newline = true;
                }
            }
        }

        tracing::debug!(
            path = %path.display(),
            processed = processed.len(),
            "replayed uid log"
        );

        Ok(Self {
            path,
            processed: Mutex::new(processed),
            file: Mutex::new(file),
            needs_newline: Mutex::new(needs_newline),
        })
    }

    /// Returns the file path for this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of recorded UIDs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processed.lock().map_or(0, |set| set.len())
    }

    /// Returns true if no UIDs have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the recorded UIDs in sorted order.
    #[must_use]
    pub fn uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self
            .processed
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        uids.sort();
        uids
    }
}

impl UidStore for FileUidStore {
    fn contains(&self, uid: &str) -> bool {
        self.processed
            .lock()
            .is_ok_and(|set| set.contains(uid.trim()))
    }

    fn record(&self, uid: &str) -> Result<(), UidStoreError> {
        check_uid(uid)?;
        let mut processed = self
            .processed
            .lock()
            .map_err(|_| UidStoreError::LockPoisoned)?;

        // Write to durable storage BEFORE marking in memory.
        {
            let mut file = self.file.lock().map_err(|_| UidStoreError::LockPoisoned)?;
            let mut needs_newline = self
                .needs_newline
                .lock()
                .map_err(|_| UidStoreError::LockPoisoned)?;
            append_line(&mut *file, &mut *needs_newline, uid)?;
            file.sync_all()?;
            *needs_newline = false;
        }

        processed.insert(uid.to_string());
        Ok(())
    }
}

/// Writes `uid` as one log line.
///
/// `needs_newline` stays set until the caller has synced the line, so a
/// partial write is terminated before the next append.
fn append_line(out: &mut impl Write, needs_newline: &mut bool, uid: &str) -> std::io::Result<()> {
    if std::mem::replace(needs_newline, true) {
        out.write_all(b"\n")?;
    }
    writeln!(out, "{uid}")
}

// =============================================================================
// InMemoryUidStore
// =============================================================================

/// Volatile UID store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryUidStore {
    processed: Mutex<Vec<String>>,
}

impl InMemoryUidStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `uids`.
    #[must_use]
    pub fn with_uids<I, S>(uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            processed: Mutex::new(uids.into_iter().map(Into::into).collect()),
        }
    }

    /// Returns every recorded UID in append order.
    #[must_use]
    pub fn recorded(&self) -> Vec<String> {
        self.processed
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl UidStore for InMemoryUidStore {
    fn contains(&self, uid: &str) -> bool {
        self.processed
            .lock()
            .is_ok_and(|log| log.iter().any(|seen| seen == uid))
    }

    fn record(&self, uid: &str) -> Result<(), UidStoreError> {
        check_uid(uid)?;
        self.processed
            .lock()
            .map_err(|_| UidStoreError::LockPoisoned)?
            .push(uid.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn record_and_query() {
        let dir = TempDir::new().unwrap();
        let store = FileUidStore::open(dir.path().join("uids.txt")).unwrap();

        assert!(!store.contains("4711"));
        store.record("4711").unwrap();
        assert!(store.contains("4711"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_log_is_empty_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("nested").join("uids.txt");
        let store = FileUidStore::open(&path).unwrap();

        assert!(store.is_empty());
        assert!(!store.contains("1"));
        assert!(path.exists());
    }

    #[test]
    fn recorded_uids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uids.txt");

        {
            let store = FileUidStore::open(&path).unwrap();
            store.record("10").unwrap();
            store.record("20").unwrap();
        }
        // Drop simulates process exit.

        let store = FileUidStore::open(&path).unwrap();
        assert!(store.contains("10"));
        assert!(store.contains("20"));
        assert!(!store.contains("30"));
        store.record("30").unwrap();
        assert_eq!(store.uids(), vec!["10", "20", "30"]);
    }

    #[test]
    fn log_is_newline_delimited() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uids.txt");
        {
            let store = FileUidStore::open(&path).unwrap();
            store.record("7").unwrap();
            store.record("8").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7\n8\n");
    }

    #[test]
    fn replay_ignores_blank_lines_and_padding() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uids.txt");
        std::fs::write(&path, "  1 \n\n2\n").unwrap();

        let store = FileUidStore::open(&path).unwrap();
        assert!(store.contains("1"));
        assert!(store.contains("2"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn torn_tail_is_repaired_before_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uids.txt");
        std::fs::write(&path, "1\n2").unwrap();

        {
            let store = FileUidStore::open(&path).unwrap();
            assert!(store.contains("2"));
            store.record("3").unwrap();
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n2\n3\n");
        let store = FileUidStore::open(&path).unwrap();
        assert_eq!(store.uids(), vec!["1", "2", "3"]);
    }

    /// Accepts `budget` bytes, then fails every write.
    struct ShortWriter {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::other("disk full"));
            }
            let n = buf.len().min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_append_is_terminated_before_next_line() {
        let mut out = ShortWriter {
            written: Vec::new(),
            budget: 2,
        };
        let mut needs_newline = false;

        assert!(append_line(&mut out, &mut needs_newline, "12345").is_err());
        assert!(needs_newline);

        out.budget = 64;
        append_line(&mut out, &mut needs_newline, "678").unwrap();
        assert_eq!(out.written, b"12\n678\n");
    }

    #[test]
    fn invalid_uids_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileUidStore::open(dir.path().join("uids.txt")).unwrap();

        assert!(matches!(
            store.record(""),
            Err(UidStoreError::InvalidUid { .. })
        ));
        assert!(matches!(
            store.record("12\n13"),
            Err(UidStoreError::InvalidUid { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn second_open_while_locked_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uids.txt");
        let _held = FileUidStore::open(&path).unwrap();

        let err = FileUidStore::open(&path).unwrap_err();
        assert!(matches!(err, UidStoreError::Io(_)));
    }

    #[test]
    fn in_memory_store_tracks_append_order() {
        let store = InMemoryUidStore::with_uids(["A"]);
        assert!(store.contains("A"));
        store.record("C").unwrap();
        assert_eq!(store.recorded(), vec!["A", "C"]);
    }
}
