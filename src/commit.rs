//! Commit handles surrendered to the state machine.
//!
//! The log creates one handle per applied entry and transfers it to the
//! state machine, which must terminate it exactly once: `close` keeps the
//! entry live, `clean` releases it for compaction. A handle dropped without
//! termination is counted and reported as a leak.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::cleaner::Cleaner;
use crate::entry::Entry;
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    Open,
    Closed,
    Cleaned,
}

/// A bounded-lifetime view of one applied entry.
pub struct Commit {
    entry: Entry,
    /// Monotone application clock, already clamped by the log.
    time_ms: u64,
    state: CommitState,
    cleaner: Cleaner,
    leaks: Arc<AtomicU64>,
}

impl Commit {
    pub(crate) fn new(entry: Entry, time_ms: u64, cleaner: Cleaner, leaks: Arc<AtomicU64>) -> Self {
        Self {
            entry,
            time_ms,
            state: CommitState::Open,
            cleaner,
            leaks,
        }
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.state == CommitState::Open {
            Ok(())
        } else {
            Err(StorageError::InvalidState)
        }
    }

    pub fn index(&self) -> StorageResult<u64> {
        self.check_open()?;
        Ok(self.entry.index)
    }

    pub fn term(&self) -> StorageResult<u64> {
        self.check_open()?;
        Ok(self.entry.term)
    }

    /// Leader wall clock of the entry, clamped so the state machine always
    /// observes a non-decreasing clock.
    pub fn time_ms(&self) -> StorageResult<u64> {
        self.check_open()?;
        Ok(self.time_ms)
    }

    pub fn session(&self) -> StorageResult<u64> {
        self.check_open()?;
        Ok(self.entry.session)
    }

    /// The applied operation.
    pub fn operation(&self) -> StorageResult<&Entry> {
        self.check_open()?;
        Ok(&self.entry)
    }

    /// Terminates the handle, keeping the entry live in the log.
    pub fn close(&mut self) -> StorageResult<()> {
        self.check_open()?;
        self.state = CommitState::Closed;
        Ok(())
    }

    /// Terminates the handle and marks the entry removable by compaction.
    pub fn clean(&mut self) -> StorageResult<()> {
        self.check_open()?;
        self.cleaner.clean(self.entry.index)?;
        self.state = CommitState::Cleaned;
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.state != CommitState::Open
    }
}

impl Drop for Commit {
    fn drop(&mut self) {
        if self.state == CommitState::Open {
            let leaked = self.leaks.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                index = self.entry.index,
                total_leaked = leaked,
                "commit handle dropped without close or clean"
            );
        }
    }
}

impl std::fmt::Debug for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commit")
            .field("index", &self.entry.index)
            .field("term", &self.entry.term)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogConfig, StorageLevel};
    use crate::entry::{BincodeEntryCodec, EntryKind};
    use crate::manager::SegmentManager;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<SegmentManager>, Cleaner, Arc<AtomicU64>) {
        let config = Arc::new(LogConfig {
            directory: dir.path().to_path_buf(),
            name: "raft".into(),
            level: StorageLevel::Disk,
            max_segment_size: 1 << 20,
            max_entries_per_segment: 100,
            compaction_threads: 1,
            minor_compaction_interval: Duration::from_secs(60),
            major_compaction_interval: Duration::from_secs(3600),
            compaction_threshold: 0.5,
            cache_entries_size: 0,
            codec: Arc::new(BincodeEntryCodec),
        });
        let manager = SegmentManager::open(config).unwrap();
        let cleaner = Cleaner::new(manager.clone());
        (manager, cleaner, Arc::new(AtomicU64::new(0)))
    }

    fn applied(index: u64) -> Entry {
        Entry::new(index, 1, EntryKind::Command, b"op".to_vec()).with_session(9)
    }

    #[test]
    fn close_terminates_once() {
        let dir = TempDir::new().unwrap();
        let (manager, cleaner, leaks) = setup(&dir);
        manager.tail().append(&applied(1)).unwrap();

        let mut commit = Commit::new(applied(1), 5, cleaner, leaks.clone());
        assert_eq!(commit.index().unwrap(), 1);
        assert_eq!(commit.session().unwrap(), 9);
        assert_eq!(commit.time_ms().unwrap(), 5);

        commit.close().unwrap();
        assert!(matches!(commit.close(), Err(StorageError::InvalidState)));
        assert!(matches!(commit.clean(), Err(StorageError::InvalidState)));
        assert!(matches!(commit.index(), Err(StorageError::InvalidState)));
        assert!(matches!(commit.operation(), Err(StorageError::InvalidState)));
        drop(commit);
        assert_eq!(leaks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn clean_marks_the_entry() {
        let dir = TempDir::new().unwrap();
        let (manager, cleaner, leaks) = setup(&dir);
        manager.tail().append(&applied(1)).unwrap();

        let mut commit = Commit::new(applied(1), 5, cleaner, leaks);
        commit.clean().unwrap();
        assert!(commit.is_terminated());
        assert_eq!(manager.tail().reclaimable_count(), 1);
    }

    #[test]
    fn dropping_open_handle_counts_a_leak() {
        let dir = TempDir::new().unwrap();
        let (manager, cleaner, leaks) = setup(&dir);
        manager.tail().append(&applied(1)).unwrap();

        let commit = Commit::new(applied(1), 5, cleaner, leaks.clone());
        drop(commit);
        assert_eq!(leaks.load(Ordering::Relaxed), 1);
    }
}
