// Operation metrics module
//
// Lightweight counters for installs, uninstalls, migrations and patcher runs

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Process-wide operation metrics
///
/// Uses atomic operations so the manager and background tasks can record
/// without locks. Logged on shutdown by the binary.
#[derive(Debug)]
pub struct Metrics {
    /// Installs that wrote files and a record
    pub installs_completed: AtomicUsize,

    /// Installs that failed or were cancelled and rolled back
    pub installs_failed: AtomicUsize,

    /// Records removed by uninstall or prune
    pub uninstalls_completed: AtomicUsize,

    /// Operations refused because of conflicting paths
    pub conflicts_detected: AtomicUsize,

    /// Successful migration batches
    pub migrations_completed: AtomicUsize,

    /// Mods moved from Yumia to loose over all batches
    pub mods_migrated: AtomicUsize,

    /// Times the yumia patcher was run
    pub patcher_runs: AtomicUsize,

    /// Patcher runs that failed, timed out or left no backups
    pub patcher_failures: AtomicUsize,

    /// Total time spent inside the patcher in milliseconds
    pub total_patcher_time_ms: AtomicU64,

    /// Number of authoritative state saves
    pub state_saves: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            installs_completed: AtomicUsize::new(0),
            installs_failed: AtomicUsize::new(0),
            uninstalls_completed: AtomicUsize::new(0),
            conflicts_detected: AtomicUsize::new(0),
            migrations_completed: AtomicUsize::new(0),
            mods_migrated: AtomicUsize::new(0),
            patcher_runs: AtomicUsize::new(0),
            patcher_failures: AtomicUsize::new(0),
            total_patcher_time_ms: AtomicU64::new(0),
            state_saves: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_install(&self, success: bool) {
        if success {
            self.installs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.installs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_uninstall(&self) {
        self.uninstalls_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished migration batch
    pub fn record_migration(&self, converted: usize) {
        self.migrations_completed.fetch_add(1, Ordering::Relaxed);
        self.mods_migrated.fetch_add(converted, Ordering::Relaxed);
    }

    /// Record one patcher run and how long it took
    pub fn record_patcher_run(&self, duration: Duration, success: bool) {
        self.patcher_runs.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.patcher_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_patcher_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_state_save(&self) {
        self.state_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average patcher run time in milliseconds
    pub fn avg_patcher_time_ms(&self) -> f64 {
        let total = self.total_patcher_time_ms.load(Ordering::Relaxed);
        let count = self.patcher_runs.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Operation Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Installs: {} completed, {} failed; uninstalls: {}; conflicts: {}",
            self.installs_completed.load(Ordering::Relaxed),
            self.installs_failed.load(Ordering::Relaxed),
            self.uninstalls_completed.load(Ordering::Relaxed),
            self.conflicts_detected.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Migrations: {} batch(es), {} mod(s) migrated",
            self.migrations_completed.load(Ordering::Relaxed),
            self.mods_migrated.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Patcher: {} run(s), {} failure(s), {:.2}s total (avg: {:.2}ms)",
            self.patcher_runs.load(Ordering::Relaxed),
            self.patcher_failures.load(Ordering::Relaxed),
            self.total_patcher_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_patcher_time_ms()
        );
        tracing::info!("State saves: {}", self.state_saves.load(Ordering::Relaxed));
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
