//! Ownership and ordering of a log's segments.
//!
//! The manager holds the ordered, contiguous segment list behind a single
//! readers-writer lock. Appends and reads take the read lock to locate a
//! segment; rolling the tail, suffix truncation and compaction installation
//! take the write lock. Readers that obtained a segment keep using it even
//! while a replacement is spliced in; the file stays readable until the last
//! handle drops.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::LogConfig;
use crate::error::{StorageError, StorageResult};
use crate::segment::{Segment, SegmentPaths};

/// A compaction result ready to be spliced over its source segments.
pub(crate) struct Replacement {
    /// The exact segments the rewrite read from, in order.
    pub sources: Vec<Arc<Segment>>,
    pub segments: Vec<Arc<Segment>>,
}

pub(crate) struct SegmentManager {
    config: Arc<LogConfig>,
    segments: RwLock<Vec<Arc<Segment>>>,
}

impl SegmentManager {
    /// Opens the manager, recovering any segments present in the directory.
    pub fn open(config: Arc<LogConfig>) -> StorageResult<Arc<Self>> {
        fs::create_dir_all(&config.directory)?;
        let discovered = discover_segments(&config)?;

        let mut segments: Vec<Arc<Segment>> = Vec::with_capacity(discovered.len());
        for (id, version) in discovered {
            let paths = SegmentPaths::new(&config.directory, &config.name, id, version);
            let segment = Segment::open(config.clone(), paths)?;
            segments.push(segment);
        }
        segments.sort_by_key(|s| s.id());

        // The cover must be contiguous: each segment starts where the
        // previous one ended.
        for pair in segments.windows(2) {
            let expected = pair[0].first_index() + pair[0].entry_count() as u64;
            if pair[1].first_index() != expected {
                return Err(StorageError::corrupt(
                    &config.directory,
                    format!(
                        "gap between segments {} and {}: expected first index {}, found {}",
                        pair[0].id(),
                        pair[1].id(),
                        expected,
                        pair[1].first_index()
                    ),
                ));
            }
        }

        // Every non-tail segment must be sealed; an unsealed one means a
        // roll was interrupted before its seal completed.
        if segments.len() > 1 {
            for segment in &segments[..segments.len() - 1] {
                if !segment.is_sealed() {
                    warn!(id = segment.id(), "sealing segment left unsealed by an interrupted roll");
                    segment.seal()?;
                }
            }
        }

        if segments.is_empty() {
            segments.push(Segment::create(config.clone(), 1, 1, 1)?);
        } else if segments.last().unwrap().is_sealed() {
            // Crash between seal and allocate: create the successor now.
            let tail = segments.last().unwrap();
            let id = tail.id() + 1;
            let first_index = tail.first_index() + tail.entry_count() as u64;
            info!(id, first_index, "creating successor for sealed tail");
            segments.push(Segment::create(config.clone(), id, 1, first_index)?);
        }

        info!(
            name = %config.name,
            segments = segments.len(),
            first_index = segments.first().unwrap().first_index(),
            "opened segment manager"
        );

        Ok(Arc::new(Self {
            config,
            segments: RwLock::new(segments),
        }))
    }

    /// Index of the first entry the log may contain.
    pub fn first_index(&self) -> u64 {
        self.segments.read().first().unwrap().first_index()
    }

    /// Index of the last appended entry; `first_index - 1` when empty.
    pub fn last_index(&self) -> u64 {
        let segments = self.segments.read();
        for segment in segments.iter().rev() {
            if let Some(last) = segment.last_index() {
                return last;
            }
        }
        segments.first().unwrap().first_index() - 1
    }

    pub fn index_window(&self) -> (u64, u64) {
        (self.first_index(), self.last_index())
    }

    /// The writable tail segment.
    pub fn tail(&self) -> Arc<Segment> {
        self.segments.read().last().unwrap().clone()
    }

    pub fn first_segment(&self) -> Arc<Segment> {
        self.segments.read().first().unwrap().clone()
    }

    pub fn last_segment(&self) -> Arc<Segment> {
        self.tail()
    }

    /// Binary search for the segment covering `index`.
    pub fn segment_for(&self, index: u64) -> Option<Arc<Segment>> {
        let segments = self.segments.read();
        let position = segments.partition_point(|s| s.first_index() <= index);
        if position == 0 {
            return None;
        }
        let segment = &segments[position - 1];
        if segment.may_contain(index) {
            Some(segment.clone())
        } else {
            None
        }
    }

    /// Snapshot of the current ordered list.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    /// Snapshot of the sealed (compactible) segments, oldest first.
    pub fn sealed_segments(&self) -> Vec<Arc<Segment>> {
        let segments = self.segments.read();
        segments
            .iter()
            .filter(|s| s.is_sealed())
            .cloned()
            .collect()
    }

    /// Seals the tail and allocates its successor.
    pub fn roll(&self) -> StorageResult<Arc<Segment>> {
        let mut segments = self.segments.write();
        let tail = segments.last().unwrap().clone();
        tail.seal()?;
        let id = tail.id() + 1;
        let first_index = tail.first_index() + tail.entry_count() as u64;
        let fresh = Segment::create(self.config.clone(), id, 1, first_index)?;
        segments.push(fresh.clone());
        info!(id, first_index, "rolled to new segment");
        Ok(fresh)
    }

    /// Removes all entries with index greater than `index` across segments,
    /// leaving a writable tail that ends at `index`.
    pub fn truncate(&self, index: u64) -> StorageResult<()> {
        let mut segments = self.segments.write();
        let first_index = segments.first().unwrap().first_index();
        if index + 1 < first_index {
            let last = segments
                .iter()
                .rev()
                .find_map(|s| s.last_index())
                .unwrap_or(first_index - 1);
            return Err(StorageError::OutOfRange {
                index,
                first: first_index,
                last,
            });
        }

        // Drop whole segments strictly after the target.
        let mut removed: Vec<Arc<Segment>> = Vec::new();
        loop {
            let pop = segments.len() > 1 && segments.last().unwrap().first_index() > index;
            if !pop {
                break;
            }
            removed.push(segments.pop().unwrap());
        }

        let target = segments.last().unwrap().clone();
        if target.is_sealed() {
            target.unseal()?;
        }
        target.truncate(index)?;
        drop(segments);

        for segment in removed {
            if let Err(e) = segment.remove_files() {
                warn!(id = segment.id(), error = %e, "failed to unlink truncated segment");
            }
        }
        Ok(())
    }

    /// Atomically splices compaction replacements into the list, returning
    /// how many were installed.
    ///
    /// Each replacement covers a run of adjacent sealed segments. Readers
    /// traverse via the list under the read guard, so they observe either
    /// the old or the new cover, never a partial splice. A replacement whose
    /// sources were truncated away (or became the tail) since the rewrite
    /// started is skipped and its staged files are discarded. The replaced
    /// files are unlinked after the lock is released.
    pub fn install(&self, replacements: Vec<Replacement>) -> StorageResult<usize> {
        if replacements.is_empty() {
            return Ok(0);
        }
        let mut retired: Vec<Arc<Segment>> = Vec::new();
        let mut discarded: Vec<Arc<Segment>> = Vec::new();
        let mut installed = 0;
        {
            let mut segments = self.segments.write();
            'replacements: for replacement in replacements {
                let first = replacement.sources.first().expect("non-empty sources");
                let Some(start) = segments.iter().position(|s| Arc::ptr_eq(s, first)) else {
                    warn!(id = first.id(), "compaction sources vanished, discarding rewrite");
                    discarded.extend(replacement.segments);
                    continue;
                };
                let end = start + replacement.sources.len() - 1;
                if end >= segments.len() - 1 {
                    // A source became (or still is adjacent to) the tail;
                    // the tail is never replaced.
                    warn!(id = first.id(), "compaction sources reach the tail, discarding rewrite");
                    discarded.extend(replacement.segments);
                    continue;
                }
                for (offset, source) in replacement.sources.iter().enumerate() {
                    let current = &segments[start + offset];
                    if !Arc::ptr_eq(current, source) || !current.is_sealed() {
                        warn!(id = source.id(), "compaction source changed, discarding rewrite");
                        discarded.extend(replacement.segments);
                        continue 'replacements;
                    }
                }

                retired.extend(segments[start..=end].iter().cloned());
                segments.splice(start..=end, replacement.segments.into_iter());
                installed += 1;
            }
        }

        for segment in retired {
            if let Err(e) = segment.remove_files() {
                warn!(id = segment.id(), error = %e, "failed to unlink compacted segment");
            }
        }
        for segment in discarded {
            if let Err(e) = segment.remove_files() {
                warn!(id = segment.id(), error = %e, "failed to discard staged segment");
            }
        }
        Ok(installed)
    }

    /// Flushes every segment per the storage level.
    pub fn flush(&self) -> StorageResult<()> {
        for segment in self.segments() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Disk usage across the log's segments.
    pub fn disk_stats(&self) -> DiskStats {
        let segments = self.segments.read();
        let tail = segments.last().unwrap();
        let sealed_bytes: u64 = segments
            .iter()
            .filter(|s| s.is_sealed())
            .map(|s| s.size_bytes() as u64)
            .sum();
        let live_entries: u64 = segments.iter().map(|s| s.live_count() as u64).sum();
        DiskStats {
            total_bytes: sealed_bytes + tail.size_bytes() as u64,
            tail_bytes: tail.size_bytes() as u64,
            sealed_segment_count: segments.iter().filter(|s| s.is_sealed()).count(),
            sealed_bytes,
            live_entries,
        }
    }
}

/// Disk usage statistics for one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStats {
    /// Bytes across all segment bodies, descriptors included.
    pub total_bytes: u64,
    /// Size of the writable tail segment.
    pub tail_bytes: u64,
    pub sealed_segment_count: usize,
    pub sealed_bytes: u64,
    /// Entries still needed by the state machine.
    pub live_entries: u64,
}

impl DiskStats {
    pub fn to_human_readable(&self) -> String {
        format!(
            "total: {}, tail: {}, sealed: {} segments ({}), live entries: {}",
            Self::format_bytes(self.total_bytes),
            Self::format_bytes(self.tail_bytes),
            self.sealed_segment_count,
            Self::format_bytes(self.sealed_bytes),
            self.live_entries,
        )
    }

    fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2}GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2}MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2}KB", bytes as f64 / KB as f64)
        } else {
            format!("{}B", bytes)
        }
    }
}

/// Scans the directory for this log's segment files, sweeping leftovers:
/// staged `.log.tmp` bodies, superseded versions of an id, and orphan
/// sidecars. Returns `(id, version)` pairs of the surviving segments.
fn discover_segments(config: &LogConfig) -> StorageResult<Vec<(u64, u32)>> {
    let mut best: HashMap<u64, u32> = HashMap::new();
    let mut losers: Vec<PathBuf> = Vec::new();
    let mut sidecars: Vec<(PathBuf, u64, u32)> = Vec::new();

    for dirent in fs::read_dir(&config.directory)? {
        let dirent = dirent?;
        let path = dirent.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if file_name.ends_with(".log.tmp") {
            if parse_segment_stem(&config.name, file_name.trim_end_matches(".log.tmp")).is_some() {
                warn!(path = ?path, "removing abandoned compaction output");
                fs::remove_file(&path)?;
            }
            continue;
        }

        let (stem, is_body) = if let Some(stem) = file_name.strip_suffix(".log") {
            (stem, true)
        } else if let Some(stem) = file_name.strip_suffix(".index") {
            (stem, false)
        } else if let Some(stem) = file_name.strip_suffix(".clean") {
            (stem, false)
        } else {
            continue;
        };

        let Some((id, version)) = parse_segment_stem(&config.name, stem) else {
            continue;
        };

        if !is_body {
            sidecars.push((path, id, version));
            continue;
        }

        match best.get(&id) {
            Some(&kept) if kept >= version => losers.push(path),
            Some(&kept) => {
                let loser = SegmentPaths::new(&config.directory, &config.name, id, kept).log;
                losers.push(loser);
                best.insert(id, version);
            }
            None => {
                best.insert(id, version);
            }
        }
    }

    for path in losers {
        warn!(path = ?path, "removing superseded segment version");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    for (path, id, version) in sidecars {
        if best.get(&id) != Some(&version) {
            warn!(path = ?path, "removing orphan sidecar");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    let mut survivors: Vec<(u64, u32)> = best.into_iter().collect();
    survivors.sort_unstable();
    Ok(survivors)
}

/// Parses `<name>-<id>-<version>` from the end, since `name` may itself
/// contain dashes.
fn parse_segment_stem(name: &str, stem: &str) -> Option<(u64, u32)> {
    let mut parts = stem.rsplitn(3, '-');
    let version: u32 = parts.next()?.parse().ok()?;
    let id: u64 = parts.next()?.parse().ok()?;
    let prefix = parts.next()?;
    if prefix == name {
        Some((id, version))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageLevel;
    use crate::entry::{BincodeEntryCodec, Entry, EntryKind};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, max_entries: u32) -> Arc<LogConfig> {
        Arc::new(LogConfig {
            directory: dir.path().to_path_buf(),
            name: "raft".into(),
            level: StorageLevel::Disk,
            max_segment_size: 1 << 20,
            max_entries_per_segment: max_entries,
            compaction_threads: 1,
            minor_compaction_interval: Duration::from_secs(60),
            major_compaction_interval: Duration::from_secs(3600),
            compaction_threshold: 0.5,
            cache_entries_size: 0,
            codec: Arc::new(BincodeEntryCodec),
        })
    }

    fn entry(index: u64) -> Entry {
        Entry::new(index, 1, EntryKind::Command, format!("cmd-{}", index).into_bytes())
    }

    fn fill(manager: &SegmentManager, from: u64, to: u64) {
        for i in from..=to {
            loop {
                match manager.tail().append(&entry(i)) {
                    Ok(_) => break,
                    Err(StorageError::SegmentFull) => {
                        manager.roll().unwrap();
                    }
                    Err(e) => panic!("append failed: {}", e),
                }
            }
        }
    }

    #[test]
    fn fresh_directory_starts_at_one() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::open(test_config(&dir, 10)).unwrap();
        assert_eq!(manager.first_index(), 1);
        assert_eq!(manager.last_index(), 0);
        assert_eq!(manager.segments().len(), 1);
    }

    #[test]
    fn roll_creates_contiguous_segments() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
        fill(&manager, 1, 250);
        // max_entries 100: segments start at 1, 101, 201.
        let firsts: Vec<u64> = manager.segments().iter().map(|s| s.first_index()).collect();
        assert_eq!(firsts, vec![1, 101, 201]);
        assert_eq!(manager.last_index(), 250);
        assert_eq!(manager.first_segment().id(), 1);
        assert!(!manager.last_segment().is_sealed());
        assert!(manager.first_segment().is_sealed());
    }

    #[test]
    fn segment_for_binary_search() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
        fill(&manager, 1, 250);

        assert_eq!(manager.segment_for(1).unwrap().first_index(), 1);
        assert_eq!(manager.segment_for(100).unwrap().first_index(), 1);
        assert_eq!(manager.segment_for(101).unwrap().first_index(), 101);
        assert_eq!(manager.segment_for(250).unwrap().first_index(), 201);
        assert!(manager.segment_for(251).is_none());
        assert!(manager.segment_for(0).is_none());
    }

    #[test]
    fn recovery_restores_segments() {
        let dir = TempDir::new().unwrap();
        {
            let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
            fill(&manager, 1, 250);
            manager.flush().unwrap();
        }
        let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
        assert_eq!(manager.last_index(), 250);
        assert_eq!(
            manager.segment_for(150).unwrap().get(150).unwrap().unwrap(),
            entry(150)
        );
    }

    #[test]
    fn recovery_creates_successor_for_sealed_tail() {
        let dir = TempDir::new().unwrap();
        {
            let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
            fill(&manager, 1, 10);
            // Simulate a crash between seal and allocate.
            manager.tail().seal().unwrap();
        }
        let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
        assert!(!manager.tail().is_sealed());
        assert_eq!(manager.tail().first_index(), 11);
        assert_eq!(manager.last_index(), 10);
        manager.tail().append(&entry(11)).unwrap();
    }

    #[test]
    fn recovery_sweeps_staged_files(){
        let dir = TempDir::new().unwrap();
        {
            let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
            fill(&manager, 1, 10);
            manager.flush().unwrap();
        }
        let staged = dir.path().join("raft-1-2.log.tmp");
        fs::write(&staged, b"half-written").unwrap();

        let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
        assert!(!staged.exists());
        assert_eq!(manager.last_index(), 10);
    }

    #[test]
    fn recovery_prefers_highest_version() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, 100);
        {
            let manager = SegmentManager::open(config.clone()).unwrap();
            fill(&manager, 1, 150);
            manager.flush().unwrap();
        }
        // Write a version-2 replacement of segment 1 holding the same range.
        {
            let replacement = Segment::create_staged(config.clone(), 1, 2, 1).unwrap();
            for i in 1..=100 {
                replacement.append(&entry(i)).unwrap();
            }
            replacement.finalize().unwrap();
        }
        let manager = SegmentManager::open(config).unwrap();
        let first = manager.first_segment();
        assert_eq!(first.id(), 1);
        assert_eq!(first.version(), 2);
        assert!(!dir.path().join("raft-1-1.log").exists());
        assert_eq!(manager.last_index(), 150);
    }

    #[test]
    fn recovery_fails_on_gap() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, 100);
        {
            let manager = SegmentManager::open(config.clone()).unwrap();
            fill(&manager, 1, 250);
            manager.flush().unwrap();
        }
        // Remove the middle segment and its sidecars.
        for suffix in ["log", "index", "clean"] {
            let path = dir.path().join(format!("raft-2-1.{}", suffix));
            let _ = fs::remove_file(path);
        }
        assert!(matches!(
            SegmentManager::open(config),
            Err(StorageError::CorruptSegment { .. })
        ));
    }

    #[test]
    fn truncate_across_segments() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
        fill(&manager, 1, 250);

        manager.truncate(120).unwrap();
        assert_eq!(manager.last_index(), 120);
        assert_eq!(manager.segments().len(), 2);
        let tail = manager.tail();
        assert!(!tail.is_sealed());
        assert_eq!(tail.first_index(), 101);

        // Later segment files are gone.
        assert!(!dir.path().join("raft-3-1.log").exists());

        // Appending continues from the cut.
        tail.append(&entry(121)).unwrap();
        assert_eq!(manager.last_index(), 121);
    }

    #[test]
    fn truncate_below_window_is_out_of_range() {
        let dir = TempDir::new().unwrap();
        let manager = SegmentManager::open(test_config(&dir, 100)).unwrap();
        fill(&manager, 1, 10);
        assert!(manager.truncate(0).is_ok(), "truncate to empty is allowed");
        assert_eq!(manager.last_index(), 0);
    }

    #[test]
    fn install_swaps_segment_atomically() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir, 100);
        let manager = SegmentManager::open(config.clone()).unwrap();
        fill(&manager, 1, 150);

        // Rewrite segment 1 keeping only odd indices.
        let replacement = Segment::create_staged(config, 1, 2, 1).unwrap();
        for i in 1..=100u64 {
            if i % 2 == 1 {
                replacement.append(&entry(i)).unwrap();
            } else {
                replacement.skip(1).unwrap();
            }
        }
        replacement.finalize().unwrap();

        let source = manager.first_segment();
        let installed = manager
            .install(vec![Replacement {
                sources: vec![source],
                segments: vec![replacement],
            }])
            .unwrap();
        assert_eq!(installed, 1);

        let first = manager.first_segment();
        assert_eq!(first.version(), 2);
        assert!(first.get(2).unwrap().is_none());
        assert_eq!(first.get(3).unwrap().unwrap(), entry(3));
        assert!(!dir.path().join("raft-1-1.log").exists());
        assert!(dir.path().join("raft-1-2.log").exists());
        // The cover is still contiguous.
        assert_eq!(manager.last_index(), 150);
    }
}
