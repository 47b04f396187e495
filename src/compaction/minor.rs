//! Minor compaction: reclaiming cleaned entries from individual runs of
//! sealed segments.
//!
//! A segment is eligible once the fraction of reclaimable entries reaches
//! the configured threshold and it carries no live tombstone (tombstones
//! need the major sweep, which rewrites their dependents first). Adjacent
//! eligible segments are grouped into one replacement when the combined
//! coverage still fits the per-segment caps.

use std::sync::Arc;

use tracing::debug;

use crate::error::StorageResult;
use crate::manager::Replacement;
use crate::segment::Segment;

use super::{fits_caps, rewrite_run, CompactorInner, RewriteMode};

/// Selects and registers the runs a minor pass will rewrite, oldest first.
pub(super) fn select_runs(inner: &CompactorInner) -> StorageResult<Vec<Vec<Arc<Segment>>>> {
    let sealed = inner.manager.sealed_segments();
    let threshold = inner.config.compaction_threshold;

    let mut runs: Vec<Vec<Arc<Segment>>> = Vec::new();
    let mut current: Vec<Arc<Segment>> = Vec::new();
    let mut covered = 0u64;
    let mut bytes = 0u64;

    for segment in sealed {
        let mut eligible = match is_eligible(inner, &segment, threshold) {
            Ok(eligible) => eligible,
            Err(e) => {
                // One bad segment poisons only its own task.
                inner.record_failure(segment.id(), &e);
                false
            }
        };
        // Claim last, so concurrent passes never build overlapping runs.
        if eligible && !inner.try_claim(segment.id()) {
            eligible = false;
        }

        let adjacent = current.last().map_or(true, |prev: &Arc<Segment>| {
            prev.first_index() + prev.entry_count() as u64 == segment.first_index()
        });

        if eligible && adjacent && fits_caps(&inner.config, covered, bytes, &segment) {
            covered += segment.entry_count() as u64;
            bytes += segment.size_bytes() as u64;
            current.push(segment);
            continue;
        }

        if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
            covered = 0;
            bytes = 0;
        }
        if eligible {
            covered = segment.entry_count() as u64;
            bytes = segment.size_bytes() as u64;
            current.push(segment);
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }

    if !runs.is_empty() {
        debug!(runs = runs.len(), "selected minor compaction runs");
    }
    Ok(runs)
}

fn is_eligible(
    inner: &CompactorInner,
    segment: &Arc<Segment>,
    threshold: f64,
) -> StorageResult<bool> {
    if segment.entry_count() == 0
        || inner.is_registered(segment.id())
        || inner.backoff_active(segment.id())
    {
        return Ok(false);
    }
    if segment.clean_ratio() < threshold {
        return Ok(false);
    }
    Ok(!segment.has_live_tombstone()?)
}

/// Rewrites one run, keeping live entries and cleaned tombstones.
pub(super) fn execute_run(
    inner: &CompactorInner,
    run: &[Arc<Segment>],
) -> StorageResult<Replacement> {
    rewrite_run(inner, run, RewriteMode::Minor)
}
