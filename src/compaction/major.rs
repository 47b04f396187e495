//! Major compaction: the global sweep.
//!
//! A major pass snapshots the sealed chain, walks it oldest to newest and
//! rewrites every run with something to reclaim, removing all cleaned
//! entries — tombstones included — and merging adjacent segments where the
//! caps allow. The rewritten chain is installed in a single manager update;
//! minor compaction is suppressed on the covered segments for the duration
//! of the sweep.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::StorageResult;
use crate::manager::Replacement;
use crate::segment::Segment;

use super::{fits_caps, rewrite_run, CompactorInner, RewriteMode};

pub(super) fn run_sweep(
    inner: &CompactorInner,
    shutdown: &watch::Receiver<bool>,
) -> StorageResult<usize> {
    // Segments a minor task currently owns are left to it; everything else
    // is claimed so minors stay away while the sweep runs.
    let snapshot: Vec<Arc<Segment>> = inner
        .manager
        .sealed_segments()
        .into_iter()
        .filter(|s| !inner.backoff_active(s.id()) && inner.try_claim(s.id()))
        .collect();
    if snapshot.is_empty() {
        return Ok(0);
    }

    let runs = group_runs(inner, &snapshot);
    let mut replacements: Vec<Replacement> = Vec::new();
    for run in runs {
        // Cancellation point: tasks stop at segment-run boundaries.
        if *shutdown.borrow() {
            debug!("major sweep cancelled at run boundary");
            break;
        }
        let first_id = run[0].id();
        match rewrite_run(inner, &run, RewriteMode::Major) {
            Ok(replacement) => {
                inner.backoff.lock().remove(&first_id);
                replacements.push(replacement);
            }
            Err(e) => {
                // A failed run poisons only itself; the rest of the sweep
                // continues and the run retries with backoff.
                inner.record_failure(first_id, &e);
            }
        }
    }

    let result = install_chain(inner, replacements);
    inner.unregister(&snapshot);
    result
}

/// Groups the snapshot into rewrite runs: adjacent segments merge while the
/// caps allow. A run is rewritten when it has something to reclaim or when
/// it spans several segments, so small post-compaction neighbors coalesce
/// on later sweeps.
fn group_runs(inner: &CompactorInner, snapshot: &[Arc<Segment>]) -> Vec<Vec<Arc<Segment>>> {
    let mut runs: Vec<Vec<Arc<Segment>>> = Vec::new();
    let mut current: Vec<Arc<Segment>> = Vec::new();
    let mut covered = 0u64;
    let mut bytes = 0u64;
    let mut reclaimable = 0u64;

    let mut close = |current: &mut Vec<Arc<Segment>>, reclaimable: &mut u64| {
        if *reclaimable > 0 || current.len() > 1 {
            runs.push(std::mem::take(current));
        } else {
            current.clear();
        }
        *reclaimable = 0;
    };

    for segment in snapshot {
        let adjacent = current.last().map_or(true, |prev: &Arc<Segment>| {
            prev.first_index() + prev.entry_count() as u64 == segment.first_index()
        });
        if segment.entry_count() == 0
            || !adjacent
            || !fits_caps(&inner.config, covered, bytes, segment)
        {
            close(&mut current, &mut reclaimable);
            covered = 0;
            bytes = 0;
        }
        if segment.entry_count() == 0 {
            continue;
        }
        covered += segment.entry_count() as u64;
        bytes += segment.size_bytes() as u64;
        reclaimable += segment.reclaimable_count() as u64;
        current.push(segment.clone());
    }
    close(&mut current, &mut reclaimable);
    runs
}

/// Installs the rewritten chain in one manager update.
fn install_chain(
    inner: &CompactorInner,
    replacements: Vec<Replacement>,
) -> StorageResult<usize> {
    if replacements.is_empty() {
        return Ok(0);
    }
    let staged = replacements.len();
    let installed = inner.manager.install(replacements)?;
    if installed < staged {
        warn!(staged, installed, "part of the major sweep was discarded");
    }
    inner
        .segments_rewritten
        .fetch_add(installed as u64, std::sync::atomic::Ordering::Relaxed);
    Ok(installed)
}
