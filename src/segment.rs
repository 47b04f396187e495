//! One append-only segment file and its in-memory state.
//!
//! A segment stores a contiguous interval of entries behind a fixed
//! descriptor. Entry bytes are immutable once written; the only mutations are
//! appends at the tail, truncation of the active segment's suffix, sealing,
//! and cleaner marks. Compaction never edits a segment in place — it writes a
//! replacement and swaps it in at the manager.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cleaner::CleanBitset;
use crate::config::{now_millis, LogConfig};
use crate::descriptor::{SegmentDescriptor, DESCRIPTOR_BYTES};
use crate::entry::{self, Entry, EntryKind, FrameError, FRAME_HEADER_BYTES, FRAME_OVERHEAD_BYTES};
use crate::error::{StorageError, StorageResult};
use crate::offset_index::OffsetIndex;

/// File name stem shared by a segment's body and sidecars.
pub(crate) fn segment_base(name: &str, id: u64, version: u32) -> String {
    format!("{}-{}-{}", name, id, version)
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentPaths {
    pub log: PathBuf,
    pub index: PathBuf,
    pub clean: PathBuf,
}

impl SegmentPaths {
    pub fn new(dir: &Path, name: &str, id: u64, version: u32) -> Self {
        let base = segment_base(name, id, version);
        Self {
            log: dir.join(format!("{}.log", base)),
            index: dir.join(format!("{}.index", base)),
            clean: dir.join(format!("{}.clean", base)),
        }
    }

    /// Path of the staged body written by compaction before rename.
    pub fn staged_log(&self) -> PathBuf {
        let mut os = self.log.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }
}

#[derive(Debug)]
struct SegmentInner {
    index: OffsetIndex,
    /// Next write position; also the segment's current byte size.
    size: u32,
}

#[derive(Debug)]
struct CleanState {
    bits: CleanBitset,
    dirty: bool,
}

#[derive(Debug)]
pub struct Segment {
    descriptor: RwLock<SegmentDescriptor>,
    paths: RwLock<SegmentPaths>,
    /// True while the body still lives at the staged `.tmp` path.
    staged: AtomicBool,
    file: File,
    config: Arc<LogConfig>,
    sealed: AtomicBool,
    inner: RwLock<SegmentInner>,
    clean: Mutex<CleanState>,
}

impl Segment {
    /// Creates a fresh segment file at its final path.
    pub(crate) fn create(
        config: Arc<LogConfig>,
        id: u64,
        version: u32,
        first_index: u64,
    ) -> StorageResult<Arc<Segment>> {
        Self::create_at(config, id, version, first_index, false)
    }

    /// Creates a segment whose body is staged at `<final>.log.tmp` until
    /// [`Segment::finalize`] renames it into place. Used by compaction.
    pub(crate) fn create_staged(
        config: Arc<LogConfig>,
        id: u64,
        version: u32,
        first_index: u64,
    ) -> StorageResult<Arc<Segment>> {
        Self::create_at(config, id, version, first_index, true)
    }

    fn create_at(
        config: Arc<LogConfig>,
        id: u64,
        version: u32,
        first_index: u64,
        staged: bool,
    ) -> StorageResult<Arc<Segment>> {
        let paths = SegmentPaths::new(&config.directory, &config.name, id, version);
        let body_path = if staged { paths.staged_log() } else { paths.log.clone() };

        let descriptor = SegmentDescriptor::new(
            id,
            version,
            first_index,
            config.max_entries_per_segment,
            config.max_segment_size,
            now_millis(),
        );

        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&body_path)?;
        file.write_all_at(&descriptor.encode(), 0)?;
        if config.level.fsync_on_flush() {
            file.sync_data()?;
        }

        debug!(id, version, first_index, path = ?body_path, "created segment");

        Ok(Arc::new(Segment {
            descriptor: RwLock::new(descriptor),
            paths: RwLock::new(paths),
            staged: AtomicBool::new(staged),
            file,
            config,
            sealed: AtomicBool::new(false),
            inner: RwLock::new(SegmentInner {
                index: OffsetIndex::new(),
                size: DESCRIPTOR_BYTES as u32,
            }),
            clean: Mutex::new(CleanState {
                bits: CleanBitset::new(),
                dirty: false,
            }),
        }))
    }

    /// Opens an existing segment during recovery.
    ///
    /// Torn-record policy follows the persisted seal flag: an unsealed
    /// (tail) segment truncates a torn suffix, a sealed segment treats any
    /// damage as corruption.
    pub(crate) fn open(config: Arc<LogConfig>, paths: SegmentPaths) -> StorageResult<Arc<Segment>> {
        let file = OpenOptions::new().read(true).write(true).open(&paths.log)?;
        let file_len = file.metadata()?.len();

        let mut header = [0u8; DESCRIPTOR_BYTES];
        if file_len < DESCRIPTOR_BYTES as u64 {
            return Err(StorageError::corrupt(&paths.log, "file shorter than descriptor"));
        }
        file.read_exact_at(&mut header, 0)?;
        let descriptor = SegmentDescriptor::decode(&header)
            .map_err(|e| StorageError::corrupt(&paths.log, e.to_string()))?;

        let sealed = descriptor.sealed;

        // A sealed segment's sidecar was written at seal time and is
        // authoritative. The tail may have appends the sidecar never saw and
        // a torn final record, so it is always rebuilt by scan.
        let sidecar = if sealed {
            OffsetIndex::load(&paths.index)?
        } else {
            None
        };
        let (index, size) = match sidecar {
            Some(index) => (index, file_len as u32),
            None => {
                let mut index = OffsetIndex::new();
                let size = match scan_body(
                    &file,
                    file_len,
                    &descriptor,
                    config.codec.as_ref(),
                    DESCRIPTOR_BYTES as u32,
                    &mut index,
                    &paths.log,
                )? {
                    ScanEnd::Clean(end) => end,
                    ScanEnd::Torn(at) => {
                        if sealed {
                            return Err(StorageError::corrupt(
                                &paths.log,
                                format!("torn record at offset {} in sealed segment", at),
                            ));
                        }
                        warn!(path = ?paths.log, offset = at, "truncating torn tail record");
                        file.set_len(at as u64)?;
                        file.sync_data()?;
                        at
                    }
                };
                if index.covered() > 0 {
                    debug!(path = ?paths.log, covered = index.covered(), "rebuilt offset index by body scan");
                }
                (index, size)
            }
        };

        let mut bits = CleanBitset::load(&paths.clean)?.unwrap_or_default();
        if bits.len() > index.covered() {
            bits.truncate(index.covered());
        }
        bits.extend_to(index.covered());

        info!(
            id = descriptor.id,
            version = descriptor.segment_version,
            first_index = descriptor.first_index,
            covered = index.covered(),
            sealed,
            "opened segment"
        );

        Ok(Arc::new(Segment {
            descriptor: RwLock::new(descriptor),
            paths: RwLock::new(paths),
            staged: AtomicBool::new(false),
            file,
            config,
            sealed: AtomicBool::new(sealed),
            inner: RwLock::new(SegmentInner { index, size }),
            clean: Mutex::new(CleanState { bits, dirty: false }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.descriptor.read().id
    }

    pub fn version(&self) -> u32 {
        self.descriptor.read().segment_version
    }

    pub fn first_index(&self) -> u64 {
        self.descriptor.read().first_index
    }

    /// Index the next append must carry.
    pub fn next_index(&self) -> u64 {
        self.first_index() + self.inner.read().index.covered() as u64
    }

    /// Highest covered index, `None` while empty.
    pub fn last_index(&self) -> Option<u64> {
        let covered = self.inner.read().index.covered();
        if covered == 0 {
            None
        } else {
            Some(self.first_index() + covered as u64 - 1)
        }
    }

    /// Relative offsets covered, holes included.
    pub fn entry_count(&self) -> u32 {
        self.inner.read().index.covered()
    }

    /// Entries physically stored in the body.
    pub fn present_count(&self) -> u32 {
        self.inner.read().index.present()
    }

    pub fn size_bytes(&self) -> u32 {
        self.inner.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().index.is_empty()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn may_contain(&self, index: u64) -> bool {
        let first = self.first_index();
        index >= first && index < first + self.inner.read().index.covered() as u64
    }

    /// Entries still needed by the state machine: present and not cleaned.
    pub fn live_count(&self) -> u32 {
        let inner = self.inner.read();
        let clean = self.clean.lock();
        let mut live = 0;
        for relative in 0..inner.index.covered() {
            if inner.index.is_present(relative) && !clean.bits.get(relative) {
                live += 1;
            }
        }
        live
    }

    /// Present entries whose clean bit is set; what compaction can reclaim.
    pub fn reclaimable_count(&self) -> u32 {
        let inner = self.inner.read();
        let clean = self.clean.lock();
        let mut reclaimable = 0;
        for relative in 0..inner.index.covered() {
            if inner.index.is_present(relative) && clean.bits.get(relative) {
                reclaimable += 1;
            }
        }
        reclaimable
    }

    /// Fraction of covered offsets that compaction could reclaim.
    pub fn clean_ratio(&self) -> f64 {
        let covered = self.entry_count();
        if covered == 0 {
            return 0.0;
        }
        self.reclaimable_count() as f64 / covered as f64
    }

    /// Appends `entry` at the tail, returning its index.
    pub fn append(&self, entry: &Entry) -> StorageResult<u64> {
        if self.is_sealed() {
            return Err(StorageError::Sealed);
        }
        let descriptor = self.descriptor.read();
        let mut inner = self.inner.write();

        let expected = descriptor.first_index + inner.index.covered() as u64;
        if entry.index != expected {
            return Err(StorageError::NonMonotonicIndex {
                index: entry.index,
                expected,
            });
        }
        if inner.index.covered() >= descriptor.max_entries {
            return Err(StorageError::SegmentFull);
        }

        let mut buf = Vec::new();
        entry::encode_frame(self.config.codec.as_ref(), entry, &mut buf)?;
        if inner.size as u64 + buf.len() as u64 > descriptor.max_bytes as u64 {
            return Err(StorageError::SegmentFull);
        }

        self.file.write_all_at(&buf, inner.size as u64)?;
        let position = inner.size;
        inner.index.push(position);
        inner.size += buf.len() as u32;

        let covered = inner.index.covered();
        drop(inner);
        let mut clean = self.clean.lock();
        clean.bits.extend_to(covered);

        Ok(entry.index)
    }

    /// Covers the next `n` indices without storing entries. Used by
    /// compaction rewrites in place of entries that were dropped.
    pub(crate) fn skip(&self, n: u32) -> StorageResult<()> {
        if self.is_sealed() {
            return Err(StorageError::Sealed);
        }
        let descriptor = self.descriptor.read();
        let mut inner = self.inner.write();
        if inner.index.covered() as u64 + n as u64 > descriptor.max_entries as u64 {
            return Err(StorageError::SegmentFull);
        }
        inner.index.skip(n);
        let covered = inner.index.covered();
        drop(inner);
        self.clean.lock().bits.extend_to(covered);
        Ok(())
    }

    /// Reads the entry at `index`. Returns `None` outside the covered range
    /// or when the entry was compacted away.
    pub fn get(&self, index: u64) -> StorageResult<Option<Entry>> {
        let first = self.first_index();
        if index < first {
            return Ok(None);
        }
        let relative = (index - first) as u32;

        let inner = self.inner.read();
        let position = match inner.index.position(relative) {
            Some(p) => p,
            None => return Ok(None),
        };
        let frame = self.read_frame(position, inner.size)?;
        drop(inner);

        let entry = entry::decode_entry(self.config.codec.as_ref(), &frame).map_err(|e| {
            StorageError::corrupt(&self.paths.read().log, e.to_string())
        })?;
        debug_assert_eq!(entry.index, index);
        Ok(Some(entry))
    }

    /// Entry kind at a relative offset, read from the frame header without
    /// decoding the body. `None` for holes.
    pub(crate) fn kind_at(&self, relative: u32) -> StorageResult<Option<EntryKind>> {
        let inner = self.inner.read();
        let position = match inner.index.position(relative) {
            Some(p) => p,
            None => return Ok(None),
        };
        let mut header = [0u8; FRAME_HEADER_BYTES];
        self.file.read_exact_at(&mut header, position as u64)?;
        let type_id = u16::from_le_bytes(header[4..6].try_into().unwrap());
        match EntryKind::from_type_id(type_id) {
            Some(kind) => Ok(Some(kind)),
            None => Err(StorageError::corrupt(
                &self.paths.read().log,
                format!("unknown entry type id {} at offset {}", type_id, position),
            )),
        }
    }

    pub(crate) fn is_present(&self, relative: u32) -> bool {
        self.inner.read().index.is_present(relative)
    }

    pub(crate) fn is_cleaned(&self, relative: u32) -> bool {
        self.clean.lock().bits.get(relative)
    }

    /// Whether any present, uncleaned entry carries a tombstone kind.
    /// Minor compaction must not touch such segments.
    pub(crate) fn has_live_tombstone(&self) -> StorageResult<bool> {
        let covered = self.entry_count();
        for relative in 0..covered {
            if !self.is_present(relative) || self.is_cleaned(relative) {
                continue;
            }
            if let Some(kind) = self.kind_at(relative)? {
                if kind.is_tombstone() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Removes all entries with index greater than `index`. Only valid on
    /// the writable tail segment.
    pub fn truncate(&self, index: u64) -> StorageResult<()> {
        if self.is_sealed() {
            return Err(StorageError::ReadOnly);
        }
        let first = self.first_index();
        let keep = if index + 1 <= first {
            0
        } else {
            (index + 1 - first) as u32
        };

        let mut inner = self.inner.write();
        if keep >= inner.index.covered() {
            return Ok(());
        }

        // Cut at the first stored entry past the keep point; trailing holes
        // occupy no bytes.
        let mut cut = inner.size;
        for relative in keep..inner.index.covered() {
            if let Some(position) = inner.index.position(relative) {
                cut = position;
                break;
            }
        }

        inner.index.truncate(keep);
        self.file.set_len(cut as u64)?;
        if self.config.level.fsync_on_flush() {
            self.file.sync_data()?;
        }
        inner.size = cut;
        drop(inner);

        let mut clean = self.clean.lock();
        clean.bits.truncate(keep);
        clean.dirty = true;

        debug!(id = self.id(), index, "truncated segment suffix");
        Ok(())
    }

    /// Marks the segment read-only and makes its contents durable.
    /// Idempotent.
    pub fn seal(&self) -> StorageResult<()> {
        if self.sealed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.persist_sidecars()?;
        if self.config.level.fsync_on_seal() {
            self.file.sync_data()?;
        }

        let mut descriptor = self.descriptor.write();
        descriptor.seal(now_millis());
        self.file.write_all_at(&descriptor.encode(), 0)?;
        if self.config.level.fsync_on_seal() {
            self.file.sync_data()?;
        }
        info!(id = descriptor.id, version = descriptor.segment_version, "sealed segment");
        Ok(())
    }

    /// Makes a sealed segment writable again. Used when a suffix truncation
    /// lands in a segment that had already rolled.
    pub(crate) fn unseal(&self) -> StorageResult<()> {
        if !self.sealed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut descriptor = self.descriptor.write();
        descriptor.sealed = false;
        descriptor.updated_millis = now_millis();
        self.file.write_all_at(&descriptor.encode(), 0)?;
        if self.config.level.fsync_on_seal() {
            self.file.sync_data()?;
        }
        self.sealed.store(false, Ordering::Release);
        info!(id = descriptor.id, "unsealed segment for writes");
        Ok(())
    }

    /// Sets the cleaner bit for `index`. Idempotent.
    pub fn mark_clean(&self, index: u64) -> StorageResult<()> {
        let first = self.first_index();
        let covered = self.entry_count();
        if index < first || index >= first + covered as u64 {
            let last = if covered == 0 { first } else { first + covered as u64 - 1 };
            return Err(StorageError::OutOfRange {
                index,
                first,
                last,
            });
        }
        let mut clean = self.clean.lock();
        if clean.bits.set((index - first) as u32) {
            clean.dirty = true;
        }
        Ok(())
    }

    /// Pre-sets cleaner bits during a compaction rewrite, so retained
    /// tombstones stay marked for the next major sweep.
    pub(crate) fn carry_clean_mark(&self, relative: u32) {
        let mut clean = self.clean.lock();
        clean.bits.set(relative);
        clean.dirty = true;
    }

    /// Forces segment data and sidecars to disk per the storage level.
    pub fn flush(&self) -> StorageResult<()> {
        if self.config.level.fsync_on_flush() {
            self.file.sync_data()?;
        }
        self.persist_sidecars()
    }

    fn persist_sidecars(&self) -> StorageResult<()> {
        let paths = self.paths.read().clone();
        {
            let inner = self.inner.read();
            inner.index.save(&paths.index)?;
        }
        let mut clean = self.clean.lock();
        if clean.dirty || !paths.clean.exists() {
            clean.bits.save(&paths.clean)?;
            clean.dirty = false;
        }
        Ok(())
    }

    /// Seals a staged segment and renames its body into the final path.
    pub(crate) fn finalize(&self) -> StorageResult<()> {
        self.seal()?;
        if self.staged.swap(false, Ordering::AcqRel) {
            let paths = self.paths.read().clone();
            fs::rename(paths.staged_log(), &paths.log)?;
        }
        Ok(())
    }

    /// Unlinks the body and sidecars. The caller has already removed the
    /// segment from the manager; open handles keep reading until dropped.
    pub(crate) fn remove_files(&self) -> StorageResult<()> {
        let paths = self.paths.read().clone();
        let body = if self.staged.load(Ordering::Acquire) {
            paths.staged_log()
        } else {
            paths.log.clone()
        };
        for path in [&body, &paths.index, &paths.clean] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(id = self.id(), version = self.version(), "removed segment files");
        Ok(())
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.paths.read().log.clone()
    }

    fn read_frame(&self, position: u32, size: u32) -> StorageResult<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_BYTES];
        self.file.read_exact_at(&mut header, position as u64)?;
        let body_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let total = FRAME_OVERHEAD_BYTES + body_len;
        if position as usize + total > size as usize {
            return Err(StorageError::corrupt(
                &self.paths.read().log,
                format!("frame at offset {} extends past segment end", position),
            ));
        }
        let mut frame = vec![0u8; total];
        self.file.read_exact_at(&mut frame, position as u64)?;
        Ok(frame)
    }
}

enum ScanEnd {
    /// Scan consumed the body cleanly; value is the end position.
    Clean(u32),
    /// A short or CRC-invalid record starts at this position.
    Torn(u32),
}

/// Sequentially parses frames from `start`, appending to `index`.
fn scan_body(
    file: &File,
    file_len: u64,
    descriptor: &SegmentDescriptor,
    codec: &dyn crate::entry::EntryCodec,
    start: u32,
    index: &mut OffsetIndex,
    path: &Path,
) -> StorageResult<ScanEnd> {
    let first_index = descriptor.first_index;
    let mut position = start as u64;
    while position < file_len {
        if position + FRAME_OVERHEAD_BYTES as u64 > file_len {
            return Ok(ScanEnd::Torn(position as u32));
        }
        let mut header = [0u8; FRAME_HEADER_BYTES];
        file.read_exact_at(&mut header, position)?;
        let body_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
        let total = FRAME_OVERHEAD_BYTES as u64 + body_len;
        if position + total > file_len {
            return Ok(ScanEnd::Torn(position as u32));
        }

        let mut frame = vec![0u8; total as usize];
        file.read_exact_at(&mut frame, position)?;
        let parsed = match entry::decode_frame(&frame) {
            Ok(frame) => frame,
            Err(FrameError::Torn) => return Ok(ScanEnd::Torn(position as u32)),
            Err(FrameError::UnknownType(id)) => {
                return Err(StorageError::corrupt(
                    path,
                    format!("unknown entry type id {} at offset {}", id, position),
                ));
            }
        };
        let entry = codec
            .decode_body(parsed.kind, parsed.body)
            .map_err(|e| StorageError::corrupt(path, e.to_string()))?;

        if entry.index < first_index {
            return Err(StorageError::corrupt(
                path,
                format!("entry index {} below segment base {}", entry.index, first_index),
            ));
        }
        let relative = entry.index - first_index;
        if relative >= descriptor.max_entries as u64 {
            return Err(StorageError::corrupt(
                path,
                format!("entry index {} beyond the segment's entry cap", entry.index),
            ));
        }
        if relative < index.covered() as u64 {
            return Err(StorageError::corrupt(
                path,
                format!("entry index {} repeats a covered offset", entry.index),
            ));
        }
        let gap = relative - index.covered() as u64;
        if gap > 0 {
            index.skip(gap as u32);
        }
        index.push(position as u32);
        position += total;
    }
    Ok(ScanEnd::Clean(position as u32))
}
