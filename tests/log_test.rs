//! End-to-end scenarios against the public storage API.

use std::fs::{self, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

use raft_seglog::{Entry, EntryKind, Storage, StorageError, StorageOptions};

fn storage_with(dir: &Path, max_entries: u32) -> Storage {
    Storage::new(StorageOptions {
        directory: dir.to_path_buf(),
        max_entries_per_segment: max_entries,
        minor_compaction_interval: Duration::from_secs(3600),
        major_compaction_interval: Duration::from_secs(3600),
        ..Default::default()
    })
    .unwrap()
}

fn command(index: u64) -> Entry {
    Entry::new(index, 1, EntryKind::Command, format!("op-{:06}", index).into_bytes())
        .with_time(10_000 + index)
}

fn segment_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "log"))
        .collect();
    files.sort();
    files
}

#[test]
fn basic_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let written: Vec<Entry> = (1..=1000)
        .map(|i| {
            let mut payload = vec![0u8; rng.gen_range(8..=128)];
            rng.fill(&mut payload[..]);
            Entry::new(i, 1, EntryKind::Command, payload).with_time(10_000 + i)
        })
        .collect();
    {
        let log = storage_with(dir.path(), 1 << 20).open_log("raft").unwrap();
        for entry in &written {
            log.append(entry.clone()).unwrap();
        }
        log.flush().unwrap();
    }
    let log = storage_with(dir.path(), 1 << 20).open_log("raft").unwrap();
    assert_eq!(log.last_index(), 1000);
    for entry in &written {
        assert_eq!(log.get(entry.index).unwrap().unwrap(), *entry);
    }
}

#[test]
fn roll_and_read() {
    let dir = TempDir::new().unwrap();
    let log = storage_with(dir.path(), 100).open_log("raft").unwrap();
    for i in 1..=350 {
        log.append(command(i)).unwrap();
    }
    assert_eq!(log.segment_count(), 4);
    assert_eq!(
        segment_files(dir.path()),
        vec![
            dir.path().join("raft-1-1.log"),
            dir.path().join("raft-2-1.log"),
            dir.path().join("raft-3-1.log"),
            dir.path().join("raft-4-1.log"),
        ]
    );
    assert_eq!(log.get(250).unwrap().unwrap(), command(250));
    assert_eq!(log.get(1).unwrap().unwrap(), command(1));
    assert_eq!(log.get(350).unwrap().unwrap(), command(350));
}

#[test]
fn truncate_suffix_across_segments() {
    let dir = TempDir::new().unwrap();
    let log = storage_with(dir.path(), 100).open_log("raft").unwrap();
    for i in 1..=500 {
        log.append(command(i)).unwrap();
    }
    assert_eq!(log.segment_count(), 5);

    log.truncate(120).unwrap();
    assert_eq!(log.last_index(), 120);
    assert_eq!(log.segment_count(), 2);
    assert!(log.get(121).unwrap().is_none());
    assert_eq!(log.get(120).unwrap().unwrap(), command(120));

    // The segment containing 120 is writable again.
    log.append(command(121)).unwrap();
    assert_eq!(log.last_index(), 121);
    assert_eq!(log.get(121).unwrap().unwrap(), command(121));
}

#[test]
fn minor_compaction_drops_cleaned_entries() {
    let dir = TempDir::new().unwrap();
    let log = storage_with(dir.path(), 1000).open_log("raft").unwrap();
    for i in 1..=1005 {
        log.append(command(i)).unwrap();
    }
    // Clean every even index of the sealed segment: ratio 0.5 == threshold.
    for i in (2..=1000).step_by(2) {
        log.cleaner().clean(i).unwrap();
    }
    assert_eq!(log.compact_minor().unwrap(), 1);

    assert!(log.get(2).unwrap().is_none());
    assert_eq!(log.get(3).unwrap().unwrap(), command(3));
    assert_eq!(log.get(999).unwrap().unwrap(), command(999));

    // The rewrite bumped the segment version on disk.
    assert!(dir.path().join("raft-1-2.log").exists());
    assert!(!dir.path().join("raft-1-1.log").exists());

    // The surviving entries persist across a reopen.
    log.flush().unwrap();
    drop(log);
    let log = storage_with(dir.path(), 1000).open_log("raft").unwrap();
    assert!(log.get(2).unwrap().is_none());
    assert_eq!(log.get(3).unwrap().unwrap(), command(3));
    assert_eq!(log.last_index(), 1005);
}

#[test]
fn torn_tail_is_recovered_by_truncation() {
    let dir = TempDir::new().unwrap();
    {
        let log = storage_with(dir.path(), 1 << 20).open_log("raft").unwrap();
        for i in 1..=100 {
            log.append(command(i)).unwrap();
        }
        log.flush().unwrap();
    }
    // Corrupt the last 10 bytes of the tail file.
    let tail = dir.path().join("raft-1-1.log");
    let len = fs::metadata(&tail).unwrap().len();
    let file = OpenOptions::new().write(true).open(&tail).unwrap();
    file.write_all_at(&[0xFF; 10], len - 10).unwrap();

    let log = storage_with(dir.path(), 1 << 20).open_log("raft").unwrap();
    assert_eq!(log.last_index(), 99);
    assert_eq!(log.get(99).unwrap().unwrap(), command(99));
    assert!(log.get(100).unwrap().is_none());

    // The log accepts new appends at the recovered position.
    log.append(command(100)).unwrap();
    assert_eq!(log.last_index(), 100);
}

#[test]
fn crash_during_compaction_leaves_old_segment() {
    let dir = TempDir::new().unwrap();
    {
        let log = storage_with(dir.path(), 100).open_log("raft").unwrap();
        for i in 1..=150 {
            log.append(command(i)).unwrap();
        }
        log.flush().unwrap();
    }
    // A compaction output that was fsynced but never renamed.
    let staged = dir.path().join("raft-1-2.log.tmp");
    fs::write(&staged, b"staged-but-never-installed").unwrap();

    let log = storage_with(dir.path(), 100).open_log("raft").unwrap();
    assert!(!staged.exists(), "startup sweeps abandoned staging files");
    assert!(dir.path().join("raft-1-1.log").exists());
    assert_eq!(log.last_index(), 150);
    for i in 1..=150 {
        assert_eq!(log.get(i).unwrap().unwrap(), command(i));
    }
}

#[test]
fn major_compaction_merges_small_neighbors() {
    let dir = TempDir::new().unwrap();
    // Byte-capped segments: rolls happen well below the entry cap, so
    // compacted survivors have room to merge.
    let storage = Storage::new(StorageOptions {
        directory: dir.path().to_path_buf(),
        max_segment_size: 2048,
        max_entries_per_segment: 1000,
        minor_compaction_interval: Duration::from_secs(3600),
        major_compaction_interval: Duration::from_secs(3600),
        ..Default::default()
    })
    .unwrap();
    let log = storage.open_log("raft").unwrap();
    for i in 1..=400 {
        log.append(command(i)).unwrap();
    }
    let sealed_before = log.segment_count() - 1;
    assert!(sealed_before >= 3, "byte cap must have rolled several segments");

    // Empty out roughly the first two sealed segments.
    for i in 1..=110 {
        log.cleaner().clean(i).unwrap();
    }

    // First sweep drops the cleaned entries segment by segment; the second
    // merges the now-small neighbors into one.
    log.compact_major().unwrap();
    let after_first = log.segment_count();
    log.compact_major().unwrap();
    let after_second = log.segment_count();
    assert!(after_second < after_first, "small survivors merged");

    for i in 111..=400 {
        assert_eq!(log.get(i).unwrap().unwrap(), command(i));
    }
    assert_eq!(log.last_index(), 400);
}

#[test]
fn major_compaction_sweeps_cleaned_ranges() {
    let dir = TempDir::new().unwrap();
    let log = storage_with(dir.path(), 100).open_log("raft").unwrap();
    for i in 1..=350 {
        log.append(command(i)).unwrap();
    }
    // Clean most of the first two segments.
    for i in 1..=180 {
        log.cleaner().clean(i).unwrap();
    }
    assert!(log.compact_major().unwrap() >= 1);

    for i in 1..=180 {
        assert!(!log.contains(i));
    }
    for i in 181..=350 {
        assert_eq!(log.get(i).unwrap().unwrap(), command(i));
    }
    assert_eq!(log.first_index(), 1);
    assert_eq!(log.last_index(), 350);
}

#[test]
fn metastore_round_trip() {
    let dir = TempDir::new().unwrap();
    {
        let storage = storage_with(dir.path(), 100);
        let meta = storage.open_meta_store("raft").unwrap();
        meta.store_term(9, Some(2)).unwrap();
        meta.store_snapshot_marker(400, 8).unwrap();
    }
    let storage = storage_with(dir.path(), 100);
    let meta = storage.open_meta_store("raft").unwrap();
    assert_eq!(meta.current_term(), 9);
    assert_eq!(meta.voted_for(), Some(2));
    assert_eq!(meta.snapshot_marker(), (400, 8));
}

#[test]
fn two_logs_share_one_directory() {
    let dir = TempDir::new().unwrap();
    let storage = storage_with(dir.path(), 100);
    let a = storage.open_log("alpha").unwrap();
    let b = storage.open_log("beta").unwrap();

    for i in 1..=120 {
        a.append(command(i)).unwrap();
    }
    b.append(command(1)).unwrap();

    assert_eq!(a.last_index(), 120);
    assert_eq!(b.last_index(), 1);
    assert_eq!(b.get(1).unwrap().unwrap(), command(1));
}

#[test]
fn commit_contract_round_trip() {
    let dir = TempDir::new().unwrap();
    let log = storage_with(dir.path(), 100).open_log("raft").unwrap();
    let entry = Entry::new(1, 3, EntryKind::Register, b"client".to_vec())
        .with_time(42)
        .with_session(77);
    log.append(entry.clone()).unwrap();

    let mut commit = log.commit(1).unwrap().unwrap();
    assert_eq!(commit.index().unwrap(), 1);
    assert_eq!(commit.term().unwrap(), 3);
    assert_eq!(commit.session().unwrap(), 77);
    assert_eq!(commit.operation().unwrap(), &entry);
    commit.close().unwrap();
    assert!(matches!(commit.clean(), Err(StorageError::InvalidState)));

    assert!(log.commit(2).unwrap().is_none(), "no commit for absent entries");
}

#[tokio::test]
async fn close_stops_background_compaction() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(StorageOptions {
        directory: dir.path().to_path_buf(),
        max_entries_per_segment: 100,
        minor_compaction_interval: Duration::from_millis(20),
        major_compaction_interval: Duration::from_millis(50),
        ..Default::default()
    })
    .unwrap();

    let log = storage.open_log("raft").unwrap();
    for i in 1..=250 {
        log.append(command(i)).unwrap();
    }
    for i in 1..=200 {
        log.cleaner().clean(i).unwrap();
    }
    // Give the dispatchers a couple of ticks to pick the segments up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    log.close().await.unwrap();
    assert!(matches!(log.append(command(251)), Err(StorageError::Closed)));
    assert!(matches!(log.flush(), Err(StorageError::Closed)));

    // Whatever compaction did, the log reopens consistent.
    let log = storage_with(dir.path(), 100).open_log("raft").unwrap();
    assert_eq!(log.last_index(), 250);
    for i in 201..=250 {
        assert_eq!(log.get(i).unwrap().unwrap(), command(i));
    }
}

#[tokio::test]
async fn background_minor_compaction_reclaims_space() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(StorageOptions {
        directory: dir.path().to_path_buf(),
        max_entries_per_segment: 100,
        compaction_threads: 2,
        minor_compaction_interval: Duration::from_millis(10),
        major_compaction_interval: Duration::from_secs(3600),
        ..Default::default()
    })
    .unwrap();

    let log = storage.open_log("raft").unwrap();
    for i in 1..=150 {
        log.append(command(i)).unwrap();
    }
    for i in 1..=100 {
        log.cleaner().clean(i).unwrap();
    }

    // Wait for the background pass to rewrite the sealed segment.
    let mut waited = 0;
    while log.contains(1) && waited < 100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += 1;
    }
    assert!(!log.contains(1), "background compaction reclaimed the segment");
    assert_eq!(log.get(150).unwrap().unwrap(), command(150));
    assert!(log.compaction_stats().segments_rewritten >= 1);

    log.close().await.unwrap();
}
