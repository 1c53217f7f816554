//! Per-path compression ledger
//!
//! The monitor owns every piece of shared state the adaptive middleware
//! reads and writes: per-path statistics, per-path failure telemetry and
//! the live gzip level of each path. All of it sits behind one
//! reader/writer lock. A background task evicts paths that have been idle
//! for [`STATS_MAX_AGE`].

use crate::config::{AdaptiveConfig, MAX_GZIP_LEVEL, MIN_GZIP_LEVEL};
use crate::panic_message;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use squeeze_core::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Age of a statistics row after which its path is evicted
pub const STATS_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default schedule of the background eviction task
pub const EVICTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Shortest schedule the eviction task accepts
pub const MIN_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on a single eviction sweep
pub const EVICTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum size of a level row created on lookup
pub const DEFAULT_LEVEL_MIN_SIZE: usize = 1024;

/// Level of a level row created on lookup
pub const DEFAULT_LEVEL: u32 = 5;

const EVICTION_BATCH: usize = 64;

/// Compression statistics of one path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathStatistics {
    /// Uncompressed bytes observed
    pub original_bytes: u64,
    /// Bytes actually sent
    pub compressed_bytes: u64,
    /// Successful observations
    pub request_count: u64,
    /// `compressed_bytes / original_bytes`
    pub ratio: f64,
    /// Running mean of request latency
    #[serde(with = "humantime_serde")]
    pub avg_latency: Duration,
    /// Time of the last observation
    pub last_updated: DateTime<Utc>,
    /// Failures recorded against the path
    pub failure_count: u64,
    /// Time of the last failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Occurrences per failure reason
    pub failure_reasons: HashMap<String, u64>,
}

/// Live gzip level of one path
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathLevelConfig {
    /// The path this row belongs to
    pub path: String,
    /// Bodies below this size are sent uncompressed
    pub min_size: usize,
    /// Current gzip level
    pub level: u32,
    /// Ratio seen at the last evaluation
    pub ratio: f64,
    /// Number of level changes applied
    pub adjustments: u64,
    /// Time of the last adjustment evaluation
    pub last_evaluated: DateTime<Utc>,
}

impl PathLevelConfig {
    fn new(path: &str, min_size: usize, level: u32, now: DateTime<Utc>) -> Self {
        Self {
            path: path.to_string(),
            min_size,
            level: level.clamp(MIN_GZIP_LEVEL, MAX_GZIP_LEVEL),
            ratio: 0.0,
            adjustments: 0,
            last_evaluated: now,
        }
    }
}

/// Totals across every tracked path
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionSnapshot {
    /// Successful observations
    pub total_requests: u64,
    /// Recorded failures
    pub total_failures: u64,
    /// Uncompressed bytes observed
    pub total_original_bytes: u64,
    /// Bytes actually sent
    pub total_compressed_bytes: u64,
    /// Ratio recomputed from the byte totals
    pub overall_ratio: f64,
    /// Occurrences per failure reason, merged across paths
    pub failure_reasons: HashMap<String, u64>,
    /// Most recent failure on any path
    pub last_failure: Option<DateTime<Utc>>,
    /// Paths with statistics or failures
    pub tracked_paths: usize,
}

#[derive(Debug)]
struct StatsRow {
    original_bytes: u64,
    compressed_bytes: u64,
    request_count: u64,
    ratio: f64,
    avg_latency: Duration,
    last_updated: DateTime<Utc>,
}

impl StatsRow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            original_bytes: 0,
            compressed_bytes: 0,
            request_count: 0,
            ratio: 0.0,
            avg_latency: Duration::ZERO,
            last_updated: now,
        }
    }

    fn record(&mut self, compressed: u64, original: u64, latency: Duration, now: DateTime<Utc>) {
        let count = self.request_count + 1;
        let n = count as f64;
        let avg = (self.avg_latency.as_secs_f64() * (n - 1.0) + latency.as_secs_f64()) / n;

        self.request_count = count;
        self.compressed_bytes = self.compressed_bytes.saturating_add(compressed);
        self.original_bytes = self.original_bytes.saturating_add(original);
        self.avg_latency = Duration::try_from_secs_f64(avg).unwrap_or(Duration::MAX);

        self.ratio = ratio(self.compressed_bytes, self.original_bytes);
        self.last_updated = now;
    }
}

#[derive(Debug, Default)]
struct FailureRow {
    count: u64,
    last_failure: Option<DateTime<Utc>>,
    reasons: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Tables {
    stats: HashMap<String, StatsRow>,
    failures: HashMap<String, FailureRow>,
    levels: HashMap<String, PathLevelConfig>,
}

impl Tables {
    /// Timestamp a path is aged by during eviction
    ///
    /// A path with statistics is aged by its statistics row alone. Paths
    /// without one fall back to their newest failure or level timestamp.
    fn eviction_stamp(&self, path: &str) -> Option<DateTime<Utc>> {
        if let Some(stats) = self.stats.get(path) {
            return Some(stats.last_updated);
        }
        let failure = self.failures.get(path).and_then(|f| f.last_failure);
        let level = self.levels.get(path).map(|l| l.last_evaluated);
        failure.into_iter().chain(level).max()
    }

    fn stale_paths(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let paths: BTreeSet<&String> = self
            .stats
            .keys()
            .chain(self.failures.keys())
            .chain(self.levels.keys())
            .collect();

        paths
            .into_iter()
            .filter(|path| self.eviction_stamp(path).is_some_and(|at| at < cutoff))
            .cloned()
            .collect()
    }

    fn remove(&mut self, path: &str) {
        self.stats.remove(path);
        self.failures.remove(path);
        self.levels.remove(path);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepEnd {
    Completed,
    Interrupted,
}

#[derive(Debug, Default)]
struct Ledger {
    tables: RwLock<Tables>,
}

impl Ledger {
    async fn evict(
        &self,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        now: DateTime<Utc>,
    ) -> usize {
        let cutoff = now - max_age();
        let mut removed = 0;

        let outcome = tokio::time::timeout(
            EVICTION_TIMEOUT,
            AssertUnwindSafe(self.sweep(ctx, stop, cutoff, &mut removed)).catch_unwind(),
        )
        .await;

        match outcome {
            Ok(Ok(SweepEnd::Completed)) => {
                if removed > 0 {
                    info!(removed, "Evicted stale compression statistics");
                }
            }
            Ok(Ok(SweepEnd::Interrupted)) => {
                info!(removed, "Eviction sweep interrupted");
            }
            Ok(Err(panic)) => {
                error!(
                    removed,
                    panic = %panic_message(&*panic),
                    "Eviction sweep panicked"
                );
            }
            Err(_) => {
                warn!(
                    removed,
                    timeout_secs = EVICTION_TIMEOUT.as_secs(),
                    "Eviction sweep timed out"
                );
            }
        }

        removed
    }

    async fn sweep(
        &self,
        ctx: &CancellationToken,
        stop: &CancellationToken,
        cutoff: DateTime<Utc>,
        removed: &mut usize,
    ) -> SweepEnd {
        let candidates = self.tables.read().stale_paths(cutoff);

        for batch in candidates.chunks(EVICTION_BATCH) {
            if ctx.is_cancelled() || stop.is_cancelled() {
                return SweepEnd::Interrupted;
            }

            {
                let mut tables = self.tables.write();
                for path in batch {
                    // The path may have been touched since the candidates were listed
                    if tables.eviction_stamp(path).is_some_and(|at| at < cutoff) {
                        tables.remove(path);
                        *removed += 1;
                    }
                }
            }

            tokio::task::yield_now().await;
        }

        SweepEnd::Completed
    }
}

/// Shared ledger of per-path compression behaviour
///
/// Construct once per process inside a tokio runtime and share it through an
/// `Arc`. Construction spawns the background eviction task, which runs until
/// the supplied context is cancelled or [`CompressionMonitor::shutdown`] is
/// called.
#[derive(Debug)]
pub struct CompressionMonitor {
    ledger: Arc<Ledger>,
    stop: CancellationToken,
    shut_down: AtomicBool,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl CompressionMonitor {
    /// Create a monitor evicting on the default 24 hour schedule
    pub fn new(ctx: CancellationToken) -> Self {
        Self::with_eviction_interval(ctx, EVICTION_INTERVAL)
    }

    /// Create a monitor with a custom eviction schedule
    ///
    /// Intervals under [`MIN_EVICTION_INTERVAL`] are raised to it.
    pub fn with_eviction_interval(ctx: CancellationToken, interval: Duration) -> Self {
        let ledger = Arc::new(Ledger::default());
        let stop = CancellationToken::new();
        let task = spawn_eviction(Arc::clone(&ledger), ctx, stop.clone(), interval);

        Self {
            ledger,
            stop,
            shut_down: AtomicBool::new(false),
            eviction_task: Mutex::new(Some(task)),
        }
    }

    /// Aggregate totals across every path
    pub fn snapshot(&self) -> CompressionSnapshot {
        let tables = self.ledger.tables.read();
        let mut snapshot = CompressionSnapshot::default();

        for stats in tables.stats.values() {
            snapshot.total_requests += stats.request_count;
            snapshot.total_original_bytes += stats.original_bytes;
            snapshot.total_compressed_bytes += stats.compressed_bytes;
        }

        for failures in tables.failures.values() {
            snapshot.total_failures += failures.count;
            for (reason, count) in &failures.reasons {
                *snapshot.failure_reasons.entry(reason.clone()).or_default() += count;
            }
            snapshot.last_failure = snapshot.last_failure.max(failures.last_failure);
        }

        snapshot.overall_ratio = ratio(
            snapshot.total_compressed_bytes,
            snapshot.total_original_bytes,
        );
        snapshot.tracked_paths = tables
            .stats
            .keys()
            .chain(tables.failures.keys())
            .collect::<BTreeSet<_>>()
            .len();

        snapshot
    }

    /// Record one successful compressed response
    pub fn record_observation(
        &self,
        path: &str,
        compressed_bytes: u64,
        original_bytes: u64,
        latency: Duration,
    ) {
        if path.is_empty() {
            warn!("Ignoring compression observation without a path");
            return;
        }

        let now = Utc::now();
        let mut tables = self.ledger.tables.write();
        let stats = tables
            .stats
            .entry(path.to_string())
            .or_insert_with(|| StatsRow::new(now));
        stats.record(compressed_bytes, original_bytes, latency, now);

        trace!(
            path,
            compressed_bytes,
            original_bytes,
            latency_us = latency.as_micros() as u64,
            requests = stats.request_count,
            ratio = stats.ratio,
            "Recorded compression observation"
        );
    }

    /// Record a compression failure against a path
    pub fn record_failure(&self, path: &str, reason: &str) {
        if path.is_empty() {
            warn!(reason, "Ignoring compression failure without a path");
            return;
        }

        let now = Utc::now();
        let mut tables = self.ledger.tables.write();
        let failures = tables.failures.entry(path.to_string()).or_default();
        failures.count += 1;
        failures.last_failure = Some(now);
        *failures.reasons.entry(reason.to_string()).or_default() += 1;

        warn!(path, reason, failures = failures.count, "Compression failure recorded");
    }

    /// Level row of a path, created with the built-in defaults on first use
    pub fn current_level_config(&self, path: &str) -> PathLevelConfig {
        self.level_config_with(path, DEFAULT_LEVEL_MIN_SIZE, DEFAULT_LEVEL)
    }

    /// Level row of a path, created from the given values on first use
    ///
    /// The row is stored so the adjuster can act on it. An empty path gets a
    /// transient row that is not stored.
    pub fn level_config_with(&self, path: &str, min_size: usize, level: u32) -> PathLevelConfig {
        let existing = self.ledger.tables.read().levels.get(path).cloned();
        if let Some(row) = existing {
            return row;
        }

        let now = Utc::now();
        if path.is_empty() {
            return PathLevelConfig::new(path, min_size, level, now);
        }

        let mut tables = self.ledger.tables.write();
        tables
            .levels
            .entry(path.to_string())
            .or_insert_with(|| {
                debug!(path, level, min_size, "Seeded compression level");
                PathLevelConfig::new(path, min_size, level, now)
            })
            .clone()
    }

    /// Set the level row of a path, replacing any existing one
    pub fn seed_level(&self, path: &str, min_size: usize, level: u32) {
        if path.is_empty() {
            warn!("Ignoring level seed without a path");
            return;
        }

        let row = PathLevelConfig::new(path, min_size, level, Utc::now());
        self.ledger.tables.write().levels.insert(path.to_string(), row);
    }

    /// Run one adjustment evaluation for a path
    ///
    /// Nothing happens unless the path has at least `sample_threshold`
    /// observations, has a level row, and was last evaluated at least
    /// `adjustment_interval` ago. Returns the new level when it changed.
    pub fn adjust(&self, path: &str, config: &AdaptiveConfig) -> Option<u32> {
        let now = Utc::now();
        let mut guard = self.ledger.tables.write();
        let tables = &mut *guard;

        let stats = tables.stats.get(path)?;
        if stats.request_count < config.sample_threshold {
            return None;
        }

        let row = tables.levels.get_mut(path)?;
        let since = now
            .signed_duration_since(row.last_evaluated)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if since < config.adjustment_interval {
            return None;
        }

        row.last_evaluated = now;
        row.ratio = stats.ratio;

        let current = row.level;
        let next = next_level(current, stats.ratio, stats.avg_latency, config);
        if next == current {
            trace!(path, level = current, ratio = stats.ratio, "Compression level unchanged");
            return None;
        }

        row.level = next;
        row.adjustments += 1;

        info!(
            path,
            from = current,
            to = next,
            ratio = stats.ratio,
            avg_latency_ms = stats.avg_latency.as_millis() as u64,
            adjustments = row.adjustments,
            "Adjusted compression level"
        );

        Some(next)
    }

    /// Statistics of one path, if it has any successful observation
    pub fn path_statistics(&self, path: &str) -> Option<PathStatistics> {
        let tables = self.ledger.tables.read();
        let stats = tables.stats.get(path)?;
        let failures = tables.failures.get(path);

        Some(PathStatistics {
            original_bytes: stats.original_bytes,
            compressed_bytes: stats.compressed_bytes,
            request_count: stats.request_count,
            ratio: stats.ratio,
            avg_latency: stats.avg_latency,
            last_updated: stats.last_updated,
            failure_count: failures.map_or(0, |f| f.count),
            last_failure: failures.and_then(|f| f.last_failure),
            failure_reasons: failures.map(|f| f.reasons.clone()).unwrap_or_default(),
        })
    }

    /// Paths that currently have statistics, sorted
    pub fn tracked_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.ledger.tables.read().stats.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Remove every path whose statistics are older than [`STATS_MAX_AGE`]
    ///
    /// The sweep stops early when `ctx` or the monitor is cancelled, keeping
    /// the deletions made so far. Returns the number of paths removed.
    pub async fn evict(&self, ctx: &CancellationToken) -> usize {
        self.ledger.evict(ctx, &self.stop, Utc::now()).await
    }

    /// Stop the background eviction task
    ///
    /// Only the first call signals the task; later calls return `Ok(())`
    /// immediately.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Compression monitor already shut down");
            return Ok(());
        }

        self.stop.cancel();

        let Some(task) = self.eviction_task.lock().take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => {
                info!("Compression monitor stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Internal(format!("Eviction task failed: {e}"))),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Eviction task did not stop in time"
                );
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }

    /// Whether [`CompressionMonitor::shutdown`] has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for CompressionMonitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Pick the next level for a path from its ratio and latency
///
/// Both rules start from `current`. When both fire, the latency rule is
/// evaluated last and its result is the one kept.
pub fn next_level(current: u32, ratio: f64, avg_latency: Duration, config: &AdaptiveConfig) -> u32 {
    let lowered = current.saturating_sub(1).max(config.min_level);
    let mut candidate = current;

    if ratio < config.min_ratio {
        candidate = lowered;
    } else if ratio > config.max_ratio {
        candidate = (current + 1).min(config.max_level);
    }

    if avg_latency > config.target_latency {
        candidate = lowered;
    }

    candidate.max(config.min_level).min(config.max_level)
}

/// Raise an eviction schedule to [`MIN_EVICTION_INTERVAL`] if needed
pub fn eviction_interval_floor(requested: Duration) -> Duration {
    if requested < MIN_EVICTION_INTERVAL {
        warn!(
            requested_ms = requested.as_millis() as u64,
            floor_secs = MIN_EVICTION_INTERVAL.as_secs(),
            "Eviction interval too small, using minimum"
        );
        MIN_EVICTION_INTERVAL
    } else {
        requested
    }
}

fn spawn_eviction(
    ledger: Arc<Ledger>,
    ctx: CancellationToken,
    stop: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = eviction_interval_floor(interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(interval_secs = interval.as_secs(), "Eviction task started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("Eviction task stopping, context cancelled");
                    break;
                }
                _ = stop.cancelled() => {
                    debug!("Eviction task stopping, monitor shut down");
                    break;
                }
                _ = ticker.tick() => {
                    ledger.evict(&ctx, &stop, Utc::now()).await;
                }
            }
        }
    })
}

fn ratio(compressed: u64, original: u64) -> f64 {
    if original == 0 {
        0.0
    } else {
        compressed as f64 / original as f64
    }
}

fn max_age() -> chrono::Duration {
    chrono::Duration::from_std(STATS_MAX_AGE).unwrap_or_else(|_| chrono::Duration::hours(24))
}
