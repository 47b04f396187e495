//! Background compaction.
//!
//! Two periodic pipelines share one bounded worker pool: minor compaction
//! rewrites individual runs of sealed segments to drop cleaned entries, and
//! major compaction sweeps the whole sealed chain, additionally removing
//! tombstones. Workers run on native threads via `spawn_blocking`, bounded
//! by a semaphore of `compaction_threads` permits; the dispatchers guarantee
//! that no two in-flight tasks overlap in segment range.

mod major;
mod minor;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LogConfig;
use crate::entry::Entry;
use crate::error::{StorageError, StorageResult};
use crate::manager::{Replacement, SegmentManager};
use crate::segment::Segment;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX_EXPONENT: u32 = 6;

/// Counters exposed for health monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub minor_passes: u64,
    pub major_passes: u64,
    pub segments_rewritten: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    attempts: u32,
    not_before: Instant,
}

pub(crate) struct CompactorInner {
    manager: Arc<SegmentManager>,
    config: Arc<LogConfig>,
    workers: Arc<Semaphore>,
    /// Segment ids owned by an in-flight task; disjointness guard.
    in_progress: Mutex<HashSet<u64>>,
    major_active: AtomicBool,
    /// Failed runs back off exponentially, keyed by the run's first id.
    backoff: Mutex<HashMap<u64, BackoffState>>,
    minor_passes: AtomicU64,
    major_passes: AtomicU64,
    segments_rewritten: AtomicU64,
    failures: AtomicU64,
}

pub(crate) struct Compactor {
    inner: Arc<CompactorInner>,
    shutdown: watch::Sender<bool>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl Compactor {
    /// Creates the compactor and, when a tokio runtime is available, starts
    /// the minor and major dispatcher loops on it.
    pub fn start(manager: Arc<SegmentManager>, config: Arc<LogConfig>) -> Compactor {
        let inner = Arc::new(CompactorInner {
            manager,
            workers: Arc::new(Semaphore::new(config.compaction_threads)),
            config,
            in_progress: Mutex::new(HashSet::new()),
            major_active: AtomicBool::new(false),
            backoff: Mutex::new(HashMap::new()),
            minor_passes: AtomicU64::new(0),
            major_passes: AtomicU64::new(0),
            segments_rewritten: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        let (shutdown, rx) = watch::channel(false);

        let mut dispatchers = Vec::new();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            dispatchers.push(handle.spawn(dispatcher_loop(
                inner.clone(),
                rx.clone(),
                Pipeline::Minor,
            )));
            dispatchers.push(handle.spawn(dispatcher_loop(inner.clone(), rx, Pipeline::Major)));
        } else {
            debug!("no tokio runtime, compaction dispatchers not started");
        }

        Compactor {
            inner,
            shutdown,
            dispatchers: Mutex::new(dispatchers),
        }
    }

    /// Signals shutdown and waits for dispatchers (and the tasks they are
    /// awaiting) to stop at a segment boundary.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.dispatchers.lock());
        for result in join_all(handles).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(error = %e, "compaction dispatcher panicked");
                }
            }
        }
    }

    pub fn stats(&self) -> CompactionStats {
        self.inner.stats()
    }

    /// Runs one minor pass inline on the calling thread.
    pub fn run_minor_pass(&self) -> StorageResult<usize> {
        self.inner.run_minor_pass(&self.shutdown.subscribe())
    }

    /// Runs one major pass inline on the calling thread.
    pub fn run_major_pass(&self) -> StorageResult<usize> {
        self.inner.run_major_pass(&self.shutdown.subscribe())
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.dispatchers.lock().drain(..) {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Minor,
    Major,
}

async fn dispatcher_loop(
    inner: Arc<CompactorInner>,
    mut shutdown: watch::Receiver<bool>,
    pipeline: Pipeline,
) {
    let period = match pipeline {
        Pipeline::Minor => inner.config.minor_compaction_interval,
        Pipeline::Major => inner.config.major_compaction_interval,
    };
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => match pipeline {
                Pipeline::Minor => dispatch_minor(&inner, &shutdown).await,
                Pipeline::Major => dispatch_major(&inner, &shutdown).await,
            },
        }
    }
    debug!(?pipeline, "compaction dispatcher stopped");
}

/// Fans eligible minor runs out to the worker pool; each run is a disjoint
/// range, so installation order across workers is irrelevant.
async fn dispatch_minor(inner: &Arc<CompactorInner>, shutdown: &watch::Receiver<bool>) {
    let runs = match minor::select_runs(inner) {
        Ok(runs) => runs,
        Err(e) => {
            warn!(error = %e, "minor compaction selection failed");
            inner.failures.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    if runs.is_empty() {
        return;
    }

    let mut tasks = Vec::with_capacity(runs.len());
    for run in runs {
        if *shutdown.borrow() {
            inner.unregister(&run);
            continue;
        }
        let permit = match inner.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let worker = inner.clone();
        let stop = shutdown.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if *stop.borrow() {
                worker.unregister(&run);
                return;
            }
            worker.execute_minor_run(run);
        }));
    }
    for result in join_all(tasks).await {
        if let Err(e) = result {
            warn!(error = %e, "minor compaction worker panicked");
        }
    }
    inner.minor_passes.fetch_add(1, Ordering::Relaxed);
}

async fn dispatch_major(inner: &Arc<CompactorInner>, shutdown: &watch::Receiver<bool>) {
    let worker = inner.clone();
    let stop = shutdown.clone();
    let permit = match inner.workers.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    let task = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        worker.run_major_pass(&stop)
    });
    match task.await {
        Ok(Ok(rewritten)) => {
            if rewritten > 0 {
                info!(rewritten, "major compaction pass finished");
            }
        }
        Ok(Err(e)) => {
            warn!(error = %e, "major compaction pass failed");
        }
        Err(e) => warn!(error = %e, "major compaction worker panicked"),
    }
}

impl CompactorInner {
    fn stats(&self) -> CompactionStats {
        CompactionStats {
            minor_passes: self.minor_passes.load(Ordering::Relaxed),
            major_passes: self.major_passes.load(Ordering::Relaxed),
            segments_rewritten: self.segments_rewritten.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Claims a segment for one task; returns false when another in-flight
    /// task already owns it. This is what keeps concurrent tasks on
    /// disjoint ranges.
    fn try_claim(&self, id: u64) -> bool {
        self.in_progress.lock().insert(id)
    }

    fn unregister(&self, run: &[Arc<Segment>]) {
        let mut in_progress = self.in_progress.lock();
        for segment in run {
            in_progress.remove(&segment.id());
        }
    }

    fn is_registered(&self, id: u64) -> bool {
        self.in_progress.lock().contains(&id)
    }

    fn backoff_active(&self, first_id: u64) -> bool {
        self.backoff
            .lock()
            .get(&first_id)
            .map_or(false, |state| state.not_before > Instant::now())
    }

    fn record_failure(&self, first_id: u64, error: &StorageError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut backoff = self.backoff.lock();
        let attempts = backoff.get(&first_id).map_or(0, |s| s.attempts) + 1;
        let exponent = attempts.min(BACKOFF_MAX_EXPONENT);
        let delay = BACKOFF_BASE * 2u32.pow(exponent);
        backoff.insert(
            first_id,
            BackoffState {
                attempts,
                not_before: Instant::now() + delay,
            },
        );
        warn!(
            first_id,
            attempts,
            retry_in_secs = delay.as_secs(),
            error = %error,
            "compaction task failed, backing off"
        );
    }

    fn record_success(&self, first_id: u64, rewritten: usize) {
        self.backoff.lock().remove(&first_id);
        self.segments_rewritten
            .fetch_add(rewritten as u64, Ordering::Relaxed);
    }

    /// Executes one registered minor run and installs the result.
    fn execute_minor_run(&self, run: Vec<Arc<Segment>>) {
        let first_id = run[0].id();
        let result = minor::execute_run(self, &run);
        match result {
            Ok(replacement) => match self.manager.install(vec![replacement]) {
                Ok(installed) => self.record_success(first_id, installed),
                Err(e) => self.record_failure(first_id, &e),
            },
            Err(e) => self.record_failure(first_id, &e),
        }
        self.unregister(&run);
    }

    /// Inline minor pass: selects runs and executes them sequentially.
    fn run_minor_pass(&self, shutdown: &watch::Receiver<bool>) -> StorageResult<usize> {
        let runs = minor::select_runs(self)?;
        let mut rewritten = 0;
        for run in runs {
            if *shutdown.borrow() {
                self.unregister(&run);
                continue;
            }
            let before = self.segments_rewritten.load(Ordering::Relaxed);
            self.execute_minor_run(run);
            rewritten += (self.segments_rewritten.load(Ordering::Relaxed) - before) as usize;
        }
        self.minor_passes.fetch_add(1, Ordering::Relaxed);
        Ok(rewritten)
    }

    /// One full major sweep. Holds the `major_active` flag so minors are
    /// suppressed on the covered segments for the duration.
    fn run_major_pass(&self, shutdown: &watch::Receiver<bool>) -> StorageResult<usize> {
        if self.major_active.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let result = major::run_sweep(self, shutdown);
        self.major_active.store(false, Ordering::Release);
        self.major_passes.fetch_add(1, Ordering::Relaxed);
        result
    }
}

/// How a rewrite treats cleaned entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RewriteMode {
    /// Drop cleaned entries except tombstones, which are carried forward
    /// with their clean mark intact.
    Minor,
    /// Drop every cleaned entry, tombstones included.
    Major,
}

/// Rewrites one run of adjacent segments into a single replacement covering
/// the same index range. The replacement keeps the run's first id and bumps
/// the version past every source.
fn rewrite_run(
    inner: &CompactorInner,
    sources: &[Arc<Segment>],
    mode: RewriteMode,
) -> StorageResult<Replacement> {
    let id = sources[0].id();
    let version = sources.iter().map(|s| s.version()).max().unwrap() + 1;
    let first_index = sources[0].first_index();

    let staged = Segment::create_staged(inner.config.clone(), id, version, first_index)?;

    for source in sources {
        let source_first = source.first_index();
        for relative in 0..source.entry_count() {
            if !source.is_present(relative) {
                staged.skip(1)?;
                continue;
            }
            let cleaned = source.is_cleaned(relative);
            if cleaned {
                let keep_tombstone = mode == RewriteMode::Minor
                    && source
                        .kind_at(relative)?
                        .map_or(false, |kind| kind.is_tombstone());
                if !keep_tombstone {
                    staged.skip(1)?;
                    continue;
                }
            }

            let index = source_first + relative as u64;
            let entry: Entry = source.get(index)?.ok_or_else(|| {
                StorageError::corrupt(
                    source.log_path(),
                    format!("entry {} disappeared during rewrite", index),
                )
            })?;
            staged.append(&entry)?;
            if cleaned {
                staged.carry_clean_mark(staged.entry_count() - 1);
            }
        }
    }

    staged.finalize()?;
    debug!(
        id,
        version,
        sources = sources.len(),
        live = staged.present_count(),
        "staged compacted segment"
    );
    Ok(Replacement {
        sources: sources.to_vec(),
        segments: vec![staged],
    })
}

/// True when `run + candidate` would still respect the per-segment caps.
fn fits_caps(config: &LogConfig, covered: u64, bytes: u64, candidate: &Arc<Segment>) -> bool {
    let next_covered = covered + candidate.entry_count() as u64;
    let next_bytes = bytes + candidate.size_bytes() as u64;
    next_covered <= config.max_entries_per_segment as u64
        && next_bytes <= config.max_segment_size as u64
}
