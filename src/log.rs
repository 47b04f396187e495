//! Public log façade.
//!
//! A `Log` owns one segmented log on disk: the single mutating growth path
//! (`append`), indexed reads, suffix truncation, durability (`flush`), and
//! the background compactor. Commit handles for applied entries are created
//! here so the leak counter and the monotone application clock live in one
//! place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cleaner::Cleaner;
use crate::commit::Commit;
use crate::compaction::{CompactionStats, Compactor};
use crate::config::LogConfig;
use crate::entry::Entry;
use crate::error::{StorageError, StorageResult};
use crate::manager::{DiskStats, SegmentManager};

/// Bounded cache of the most recently appended entries; serves tail reads
/// without touching the file. Entries are contiguous by construction.
struct EntryCache {
    capacity: usize,
    entries: VecDeque<Entry>,
}

impl EntryCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    fn push(&mut self, entry: &Entry) {
        if self.capacity == 0 {
            return;
        }
        if let Some(back) = self.entries.back() {
            if entry.index != back.index + 1 {
                self.entries.clear();
            }
        }
        self.entries.push_back(entry.clone());
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    fn get(&self, index: u64) -> Option<Entry> {
        let front = self.entries.front()?;
        if index < front.index {
            return None;
        }
        self.entries.get((index - front.index) as usize).cloned()
    }

    fn truncate(&mut self, index: u64) {
        while self.entries.back().map_or(false, |e| e.index > index) {
            self.entries.pop_back();
        }
    }
}

pub struct Log {
    config: Arc<LogConfig>,
    manager: Arc<SegmentManager>,
    cleaner: Cleaner,
    compactor: Compactor,
    cache: Mutex<EntryCache>,
    /// Clamp watermark for entry times on the append path.
    append_time_ms: AtomicU64,
    /// Clamp watermark for the clock observed through commit handles.
    applied_time_ms: AtomicU64,
    leaked_commits: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl Log {
    /// Opens or recovers the log described by `config`.
    ///
    /// When called inside a tokio runtime the compaction dispatchers start
    /// immediately; otherwise compaction only runs through the explicit
    /// [`Log::compact_minor`] / [`Log::compact_major`] entry points.
    pub(crate) fn open(config: Arc<LogConfig>) -> StorageResult<Log> {
        let manager = SegmentManager::open(config.clone())?;
        let cleaner = Cleaner::new(manager.clone());
        let compactor = Compactor::start(manager.clone(), config.clone());
        let watermark = recover_time_watermark(&manager);

        info!(
            name = %config.name,
            first_index = manager.first_index(),
            last_index = manager.last_index(),
            "opened log"
        );

        let cache = Mutex::new(EntryCache::new(config.cache_entries_size));
        Ok(Log {
            config,
            manager,
            cleaner,
            compactor,
            cache,
            append_time_ms: AtomicU64::new(watermark),
            applied_time_ms: AtomicU64::new(0),
            leaked_commits: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Appends `entry` at `last_index() + 1`, rolling the tail segment when
    /// it is full. The entry's time is clamped so persisted times never
    /// decrease.
    pub fn append(&self, entry: Entry) -> StorageResult<u64> {
        self.check_open()?;
        if !entry.kind.is_persistent() {
            return Err(StorageError::QueryRefused);
        }

        let mut entry = entry;
        let watermark = self.append_time_ms.load(Ordering::Acquire);
        if entry.time_ms < watermark {
            entry.time_ms = watermark;
        }

        // First failure rolls the tail; a second SegmentFull means the entry
        // cannot fit any segment and surfaces to the caller.
        for attempt in 0..2 {
            match self.manager.tail().append(&entry) {
                Ok(index) => {
                    self.append_time_ms.fetch_max(entry.time_ms, Ordering::AcqRel);
                    self.cache.lock().push(&entry);
                    return Ok(index);
                }
                Err(e) if e.is_roll_signal() && attempt == 0 => {
                    debug!(index = entry.index, "tail segment full, rolling");
                    self.manager.roll()?;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("append retries exhausted");
    }

    /// Appends a contiguous batch, as delivered by one replication round.
    /// Returns the last appended index; the log's last index is unchanged
    /// when the batch is empty.
    pub fn append_batch(&self, entries: Vec<Entry>) -> StorageResult<u64> {
        let mut last = self.last_index();
        for entry in entries {
            last = self.append(entry)?;
        }
        Ok(last)
    }

    /// Reads the entry at `index`. `None` outside the window or when the
    /// entry was compacted away.
    pub fn get(&self, index: u64) -> StorageResult<Option<Entry>> {
        self.check_open()?;
        let Some(segment) = self.manager.segment_for(index) else {
            return Ok(None);
        };
        // Presence is always answered by the segment, so the cache can
        // never resurrect an entry that compaction removed.
        if !segment.is_present((index - segment.first_index()) as u32) {
            return Ok(None);
        }
        if let Some(entry) = self.cache.lock().get(index) {
            return Ok(Some(entry));
        }
        segment.get(index)
    }

    /// Reads the readable entries in `[low, high)`, clamped to the window;
    /// compacted holes are skipped.
    pub fn entries(&self, low: u64, high: u64) -> StorageResult<Vec<Entry>> {
        self.check_open()?;
        let mut out = Vec::new();
        for item in self.iter(low) {
            let entry = item?;
            if entry.index >= high {
                break;
            }
            out.push(entry);
        }
        Ok(out)
    }

    /// Whether a readable entry exists at `index`.
    pub fn contains(&self, index: u64) -> bool {
        if self.check_open().is_err() {
            return false;
        }
        match self.manager.segment_for(index) {
            Some(segment) => {
                let relative = index - segment.first_index();
                segment.is_present(relative as u32)
            }
            None => false,
        }
    }

    pub fn first_index(&self) -> u64 {
        self.manager.first_index()
    }

    pub fn last_index(&self) -> u64 {
        self.manager.last_index()
    }

    pub fn is_empty(&self) -> bool {
        self.last_index() < self.first_index()
    }

    /// Removes all entries with index greater than `index`; used by the
    /// consensus layer to overwrite a losing suffix.
    pub fn truncate(&self, index: u64) -> StorageResult<()> {
        self.check_open()?;
        self.manager.truncate(index)?;
        self.cache.lock().truncate(index);
        // Times beyond the cut are gone; re-derive the append clamp.
        self.append_time_ms
            .store(recover_time_watermark(&self.manager), Ordering::Release);
        Ok(())
    }

    /// Makes all appended entries durable per the storage level.
    pub fn flush(&self) -> StorageResult<()> {
        self.check_open()?;
        self.manager.flush()
    }

    /// Stops compaction workers at their next segment boundary, flushes and
    /// closes the log. Further operations fail with `Closed`.
    pub async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.compactor.shutdown().await;
        self.manager.flush()?;
        info!(name = %self.config.name, "closed log");
        Ok(())
    }

    /// Iterates readable entries starting at `from` (clamped to the
    /// window), skipping compacted holes.
    pub fn iter(&self, from: u64) -> LogIterator {
        LogIterator {
            manager: self.manager.clone(),
            next: from.max(self.first_index()),
        }
    }

    /// Creates the commit handle for the applied entry at `index`.
    ///
    /// The handle's clock is clamped against the last applied time so the
    /// state machine observes a monotone clock even across replays.
    pub fn commit(&self, index: u64) -> StorageResult<Option<Commit>> {
        self.check_open()?;
        let Some(entry) = self.get(index)? else {
            return Ok(None);
        };
        let time_ms = self
            .applied_time_ms
            .fetch_max(entry.time_ms, Ordering::AcqRel)
            .max(entry.time_ms);
        Ok(Some(Commit::new(
            entry,
            time_ms,
            self.cleaner.clone(),
            self.leaked_commits.clone(),
        )))
    }

    /// Liveness tracker handed to commit handles; exposed for callers that
    /// clean entries directly.
    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    /// Commit handles dropped without termination since open.
    pub fn leaked_commits(&self) -> u64 {
        self.leaked_commits.load(Ordering::Relaxed)
    }

    /// Runs one minor compaction pass inline, returning the number of
    /// segments rewritten.
    pub fn compact_minor(&self) -> StorageResult<usize> {
        self.check_open()?;
        self.compactor.run_minor_pass()
    }

    /// Runs one major compaction pass inline, returning the number of
    /// segments rewritten.
    pub fn compact_major(&self) -> StorageResult<usize> {
        self.check_open()?;
        self.compactor.run_major_pass()
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.compactor.stats()
    }

    /// Number of on-disk segments, including the writable tail.
    pub fn segment_count(&self) -> usize {
        self.manager.segments().len()
    }

    /// Disk usage across the log's segments.
    pub fn disk_stats(&self) -> DiskStats {
        self.manager.disk_stats()
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("name", &self.config.name)
            .field("first_index", &self.first_index())
            .field("last_index", &self.last_index())
            .finish_non_exhaustive()
    }
}

/// Iterator over readable entries; holes left by compaction are skipped.
/// Each step resolves segments through the manager, so installed
/// replacements become visible between items, never within one.
pub struct LogIterator {
    manager: Arc<SegmentManager>,
    next: u64,
}

impl Iterator for LogIterator {
    type Item = StorageResult<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.next > self.manager.last_index() {
                return None;
            }
            let index = self.next;
            self.next += 1;
            let Some(segment) = self.manager.segment_for(index) else {
                continue;
            };
            match segment.get(index) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Highest readable entry time at or below the window's end; the clamp
/// baseline after open and truncate.
fn recover_time_watermark(manager: &SegmentManager) -> u64 {
    let (first, last) = manager.index_window();
    let mut index = last;
    while index >= first && index > 0 {
        if let Some(segment) = manager.segment_for(index) {
            if let Ok(Some(entry)) = segment.get(index) {
                return entry.time_ms;
            }
        }
        index -= 1;
    }
    0
}
