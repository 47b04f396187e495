//! Storage configuration and factory.
//!
//! `Storage` is an immutable, validated configuration that opens [`Log`] and
//! [`MetaStore`] instances scoped by name within one directory. Validation
//! happens once, at construction; defaults are expressed as constants.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::descriptor::DESCRIPTOR_BYTES;
use crate::entry::{BincodeEntryCodec, EntryCodec};
use crate::error::{StorageError, StorageResult};
use crate::log::Log;
use crate::meta::MetaStore;

pub const DEFAULT_MAX_SEGMENT_SIZE: u32 = 1024 * 1024 * 32;

/// Default and hard cap for entries per segment. Offsets within a segment
/// are 32-bit; together with the segment size cap this keeps them from
/// overflowing.
pub const DEFAULT_MAX_ENTRIES_PER_SEGMENT: u32 = 1024 * 1024;

pub const DEFAULT_MINOR_COMPACTION_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAJOR_COMPACTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.5;
pub const DEFAULT_CACHE_ENTRIES: usize = 1024;

/// How aggressively segment data is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageLevel {
    /// Never fsync. Contents survive process restarts, not host crashes.
    Memory,
    /// Fsync only when a segment is sealed.
    MappedDisk,
    /// Fsync on every flush and at seal.
    Disk,
}

impl StorageLevel {
    pub(crate) fn fsync_on_flush(self) -> bool {
        matches!(self, StorageLevel::Disk)
    }

    pub(crate) fn fsync_on_seal(self) -> bool {
        matches!(self, StorageLevel::Disk | StorageLevel::MappedDisk)
    }
}

/// User-facing configuration. Construct with struct update syntax over
/// `Default::default()` and pass to [`Storage::new`].
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub directory: PathBuf,
    pub storage_level: StorageLevel,
    pub max_segment_size: u32,
    pub max_entries_per_segment: u32,
    pub compaction_threads: usize,
    pub minor_compaction_interval: Duration,
    pub major_compaction_interval: Duration,
    /// Fraction of a segment that must be reclaimable before minor
    /// compaction will rewrite it, in `(0, 1]`.
    pub compaction_threshold: f64,
    /// Recent entries kept in memory so tail reads skip the file.
    /// Zero disables the cache.
    pub cache_entries_size: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            storage_level: StorageLevel::Disk,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_entries_per_segment: DEFAULT_MAX_ENTRIES_PER_SEGMENT,
            compaction_threads: default_compaction_threads(),
            minor_compaction_interval: DEFAULT_MINOR_COMPACTION_INTERVAL,
            major_compaction_interval: DEFAULT_MAJOR_COMPACTION_INTERVAL,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            cache_entries_size: DEFAULT_CACHE_ENTRIES,
        }
    }
}

fn default_compaction_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

/// Validated storage configuration and factory for logs and metastores.
#[derive(Clone)]
pub struct Storage {
    options: Arc<StorageOptions>,
    codec: Arc<dyn EntryCodec>,
}

impl Storage {
    /// Validates `options` and prepares the directory.
    pub fn new(options: StorageOptions) -> StorageResult<Self> {
        Self::with_codec(options, Arc::new(BincodeEntryCodec))
    }

    /// Same as [`Storage::new`] with a custom entry codec.
    pub fn with_codec(options: StorageOptions, codec: Arc<dyn EntryCodec>) -> StorageResult<Self> {
        if options.max_segment_size as usize <= DESCRIPTOR_BYTES {
            return Err(StorageError::Config(format!(
                "max_segment_size must be greater than the {}-byte descriptor",
                DESCRIPTOR_BYTES
            )));
        }
        if options.max_entries_per_segment == 0 {
            return Err(StorageError::Config(
                "max_entries_per_segment must be positive".into(),
            ));
        }
        if options.max_entries_per_segment > DEFAULT_MAX_ENTRIES_PER_SEGMENT {
            return Err(StorageError::Config(format!(
                "max_entries_per_segment cannot exceed {}",
                DEFAULT_MAX_ENTRIES_PER_SEGMENT
            )));
        }
        if options.compaction_threads == 0 {
            return Err(StorageError::Config(
                "compaction_threads must be positive".into(),
            ));
        }
        if !(options.compaction_threshold > 0.0 && options.compaction_threshold <= 1.0) {
            return Err(StorageError::Config(
                "compaction_threshold must be in (0, 1]".into(),
            ));
        }
        fs::create_dir_all(&options.directory)?;
        Ok(Self {
            options: Arc::new(options),
            codec,
        })
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Opens (creating or recovering) the log named `name`.
    pub fn open_log(&self, name: &str) -> StorageResult<Log> {
        Log::open(self.log_config(name))
    }

    /// Opens (creating or loading) the metastore named `name`.
    pub fn open_meta_store(&self, name: &str) -> StorageResult<MetaStore> {
        MetaStore::open(self.options.directory.join(format!("{}.meta", name)))
    }

    fn log_config(&self, name: &str) -> Arc<LogConfig> {
        Arc::new(LogConfig {
            directory: self.options.directory.clone(),
            name: name.to_string(),
            level: self.options.storage_level,
            max_segment_size: self.options.max_segment_size,
            max_entries_per_segment: self.options.max_entries_per_segment,
            compaction_threads: self.options.compaction_threads,
            minor_compaction_interval: self.options.minor_compaction_interval,
            major_compaction_interval: self.options.major_compaction_interval,
            compaction_threshold: self.options.compaction_threshold,
            cache_entries_size: self.options.cache_entries_size,
            codec: self.codec.clone(),
        })
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Per-log view of the configuration shared across the log's components.
pub(crate) struct LogConfig {
    pub directory: PathBuf,
    pub name: String,
    pub level: StorageLevel,
    pub max_segment_size: u32,
    pub max_entries_per_segment: u32,
    pub compaction_threads: usize,
    pub minor_compaction_interval: Duration,
    pub major_compaction_interval: Duration,
    pub compaction_threshold: f64,
    pub cache_entries_size: usize,
    pub codec: Arc<dyn EntryCodec>,
}

impl std::fmt::Debug for LogConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogConfig")
            .field("directory", &self.directory)
            .field("name", &self.name)
            .field("level", &self.level)
            .field("max_segment_size", &self.max_segment_size)
            .field("max_entries_per_segment", &self.max_entries_per_segment)
            .field("compaction_threads", &self.compaction_threads)
            .field("minor_compaction_interval", &self.minor_compaction_interval)
            .field("major_compaction_interval", &self.major_compaction_interval)
            .field("compaction_threshold", &self.compaction_threshold)
            .field("cache_entries_size", &self.cache_entries_size)
            .finish_non_exhaustive()
    }
}

/// Wall clock in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> StorageOptions {
        StorageOptions {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_validate() {
        let dir = TempDir::new().unwrap();
        Storage::new(options(&dir)).unwrap();
    }

    #[test]
    fn rejects_tiny_segment_size() {
        let dir = TempDir::new().unwrap();
        let opts = StorageOptions {
            max_segment_size: DESCRIPTOR_BYTES as u32,
            ..options(&dir)
        };
        assert!(matches!(
            Storage::new(opts),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn rejects_entry_cap_above_limit() {
        let dir = TempDir::new().unwrap();
        let opts = StorageOptions {
            max_entries_per_segment: DEFAULT_MAX_ENTRIES_PER_SEGMENT + 1,
            ..options(&dir)
        };
        assert!(matches!(
            Storage::new(opts),
            Err(StorageError::Config(_))
        ));
    }

    #[test]
    fn rejects_zero_threads_and_bad_threshold() {
        let dir = TempDir::new().unwrap();
        let opts = StorageOptions {
            compaction_threads: 0,
            ..options(&dir)
        };
        assert!(Storage::new(opts).is_err());

        let opts = StorageOptions {
            compaction_threshold: 0.0,
            ..options(&dir)
        };
        assert!(Storage::new(opts).is_err());

        let opts = StorageOptions {
            compaction_threshold: 1.5,
            ..options(&dir)
        };
        assert!(Storage::new(opts).is_err());
    }
}
