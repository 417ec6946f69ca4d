//! Drift repair: re-submission of work requests for mismatched jobs.
//!
//! One reconciliation pass walks the reconcilable logical states in order,
//! asks the sentinel for mismatches, and re-submits a work request for each
//! one under the scheduler's uniqueness key. A cross-process file lock
//! guarantees at most one pass runs at a time across every process of the
//! hosting application.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use jobsync_request::{decode, RequestBuilder};
use jobsync_statemap::JobState;

use crate::scheduler::{ExistingWorkPolicy, WorkScheduler};
use crate::sentinel::{Mismatch, Sentinel};
use crate::store::JobStore;

/// Well-known lock file name, shared by all processes of the application.
pub const LOCK_FILE: &str = "reconciler.lock";

/// Default bound on a whole reconciliation pass.
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(15);

/// Cross-process exclusive lock guarding reconciliation.
///
/// Each acquisition opens its own file descriptor, so the lock excludes
/// concurrent passes in this process as well as in other processes.
pub struct ReconcileLock {
    path: PathBuf,
}

impl ReconcileLock {
    /// Lock keyed by the well-known file name under `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LOCK_FILE),
        }
    }

    /// Try to acquire the lock without blocking.
    ///
    /// `Ok(None)` means another pass holds it and the caller should no-op.
    pub fn try_acquire(&self) -> io::Result<Option<ReconcileGuard>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(ReconcileGuard { file })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Held for the duration of one pass; releases the lock on drop, so an
/// early return or panic during processing cannot leave it held.
pub struct ReconcileGuard {
    file: File,
}

impl Drop for ReconcileGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "Failed to release reconciliation lock");
        }
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    /// Logical states whose job lists were read successfully.
    pub states_checked: u32,

    /// Mismatches reported by the sentinel.
    pub mismatches: u32,

    /// Requests re-submitted and linked.
    pub repaired: u32,

    /// Mismatches skipped (unreconcilable tags or submit failure).
    pub skipped: u32,
}

/// Repairs mismatches reported by the sentinel.
pub struct Reconciler {
    store: Arc<JobStore>,
    scheduler: Arc<dyn WorkScheduler>,
    lock: ReconcileLock,
    pass_timeout: Duration,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(store: Arc<JobStore>, scheduler: Arc<dyn WorkScheduler>, lock: ReconcileLock) -> Self {
        Self {
            store,
            scheduler,
            lock,
            pass_timeout: DEFAULT_PASS_TIMEOUT,
        }
    }

    /// Override the pass timeout.
    pub fn with_pass_timeout(mut self, pass_timeout: Duration) -> Self {
        self.pass_timeout = pass_timeout;
        self
    }

    /// Periodic maintenance loop: one pass every `interval` until shutdown.
    ///
    /// The first tick is swallowed; the startup wake already triggers a
    /// pass, and back-to-back passes would just contend on the lock.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = interval.as_secs(),
            "Starting periodic reconciliation loop"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let repaired = self.reconcile().await;
                    debug!(repaired, "Periodic reconciliation pass finished");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciliation loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one full reconciliation pass.
    ///
    /// Returns `true` iff at least one mismatch was found and repaired.
    /// Lock contention is a normal "already running" signal and returns
    /// `false` immediately. A pass that exceeds the timeout is abandoned;
    /// dropping the pass future cancels its in-flight per-job queries and
    /// the guard drop releases the lock. Job-record updates are one row at
    /// a time and idempotent, so an aborted pass leaves no partial damage.
    pub async fn reconcile(&self) -> bool {
        let guard = match self.lock.try_acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("Reconciliation already in progress, skipping");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Failed to acquire reconciliation lock");
                return false;
            }
        };

        let stats = match tokio::time::timeout(self.pass_timeout, self.run_pass()).await {
            Ok(stats) => stats,
            Err(_) => {
                error!(
                    timeout_secs = self.pass_timeout.as_secs(),
                    "Reconciliation pass timed out"
                );
                drop(guard);
                return false;
            }
        };

        info!(
            states_checked = stats.states_checked,
            mismatches = stats.mismatches,
            repaired = stats.repaired,
            skipped = stats.skipped,
            "Reconciliation pass complete"
        );

        drop(guard);
        stats.repaired > 0
    }

    /// Walk the reconcilable states strictly in order, fully processing one
    /// state's re-submissions before reading the next.
    async fn run_pass(&self) -> ReconcileStats {
        let sentinel = Sentinel::new(Arc::clone(&self.store), Arc::clone(&self.scheduler));
        let mut stats = ReconcileStats::default();

        for &state in JobState::reconciliation_states() {
            // A RUNNING job's request may not be visible to us yet while the
            // scheduler process is still materializing it.
            let ignore_missing = state == JobState::Running;

            let mismatches = match sentinel.check(state, ignore_missing).await {
                Ok(mismatches) => mismatches,
                Err(e) => {
                    warn!(state = %state, error = %e, "Job store read failed, skipping state");
                    continue;
                }
            };

            stats.states_checked += 1;
            if mismatches.is_empty() {
                continue;
            }

            stats.mismatches += mismatches.len() as u32;
            let (repaired, skipped) = self.process(state, mismatches).await;
            stats.repaired += repaired;
            stats.skipped += skipped;
        }

        stats
    }

    /// Repair the given mismatches for one logical state.
    ///
    /// Returns `(repaired, skipped)`. Terminal states are never repaired.
    /// Re-submissions for one state fan out together and all settle before
    /// this returns.
    pub async fn process(&self, state: JobState, mismatches: Vec<Mismatch>) -> (u32, u32) {
        if state.is_terminal() {
            debug!(state = %state, "No reconciliation for terminal state");
            return (0, mismatches.len() as u32);
        }

        debug!(state = %state, count = mismatches.len(), "Reconciling mismatched jobs");

        let results = join_all(mismatches.into_iter().map(|m| self.resubmit(m))).await;

        let repaired = results.iter().filter(|r| **r).count() as u32;
        let skipped = results.len() as u32 - repaired;
        (repaired, skipped)
    }

    /// Rebuild and re-submit one job's work request, then link the new
    /// request id back onto the job record.
    async fn resubmit(&self, mismatch: Mismatch) -> bool {
        let job = &mismatch.job;

        // Prefer rebuilding from the stale request's tags: they preserve the
        // original expedite and long-running intent.
        let builder = match &mismatch.snapshot {
            Some(snapshot) => match decode(&snapshot.tags) {
                Ok(identity) => RequestBuilder::from_identity(&identity),
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        request_id = %snapshot.id,
                        error = %e,
                        "Request tags unreconcilable, skipping job"
                    );
                    return false;
                }
            },
            // Long-running is not persisted in the job store; assume true
            // rather than risk demoting a genuinely long-running job.
            None => RequestBuilder::new(job.id.clone())
                .func(job.func.clone())
                .expedite_for(job.priority)
                .long_running(true)
                .delay_secs(0),
        };

        info!(job_id = %builder.id(), "Re-submitting work request");

        // Replace at the uniqueness key: forcibly supersede whatever the
        // scheduler still holds for this job id.
        let spec = builder.build();
        let request_id = match self
            .scheduler
            .submit(spec, ExistingWorkPolicy::Replace)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Re-submission failed");
                return false;
            }
        };

        // Ref persistence failures are log-only: the job is found again on
        // the next pass and re-submission under Replace is idempotent.
        match self.store.update_request_ref(&job.id, request_id) {
            Ok(0) => error!(job_id = %job.id, "Failed to persist request ref, no row updated"),
            Ok(_) => debug!(job_id = %job.id, request_id = %request_id, "Request ref updated"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to persist request ref"),
        }

        true
    }
}
