//! Drift detection between job records and scheduler requests.
//!
//! The sentinel reads jobs in one logical state, looks up each job's work
//! request at the scheduler, and reports every job whose request is missing
//! or in a state outside the accepted set for that logical state. Results
//! are transient; the reconciler consumes them immediately.

use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, warn};

use jobsync_request::job_id_tag;
use jobsync_statemap::{JobState, WorkState};

use crate::scheduler::{RequestSnapshot, WorkQuery, WorkScheduler};
use crate::store::{JobRecord, JobStore, StoreError};

/// A detected inconsistency for one job.
#[derive(Debug)]
pub struct Mismatch {
    /// The job record as read at check time.
    pub job: JobRecord,

    /// The offending request snapshot, or `None` when no request was found.
    pub snapshot: Option<RequestSnapshot>,
}

impl Mismatch {
    /// True when no work request exists for the job at all.
    pub fn is_missing(&self) -> bool {
        self.snapshot.is_none()
    }
}

/// Watcher that detects drift for jobs in a given logical state.
pub struct Sentinel {
    store: Arc<JobStore>,
    scheduler: Arc<dyn WorkScheduler>,
}

impl Sentinel {
    /// Create a new sentinel.
    pub fn new(store: Arc<JobStore>, scheduler: Arc<dyn WorkScheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Check all jobs in `state` against the scheduler.
    ///
    /// Returns one [`Mismatch`] per drifted job. With an empty job list the
    /// scheduler is never queried. `ignore_missing` skips the "no request
    /// found" classification; used for RUNNING jobs, where the scheduler
    /// process may not have the record available yet.
    ///
    /// Per-job checks fan out concurrently; the result is visible only once
    /// every per-job query has settled. A single job's query failure is
    /// logged and treated as no result for that job.
    pub async fn check(
        &self,
        state: JobState,
        ignore_missing: bool,
    ) -> Result<Vec<Mismatch>, StoreError> {
        let jobs = self.store.list_jobs(state)?;

        if jobs.is_empty() {
            debug!(state = %state, "No jobs to check");
            return Ok(Vec::new());
        }

        debug!(state = %state, job_count = jobs.len(), "Checking jobs against scheduler");

        let accepted = state.accepted_work_states();
        let checks = jobs
            .into_iter()
            .map(|job| self.check_job(job, ignore_missing, accepted));

        let results = join_all(checks).await;
        Ok(results.into_iter().flatten().collect())
    }

    /// Check a single job; `None` means consistent or inconclusive.
    async fn check_job(
        &self,
        job: JobRecord,
        ignore_missing: bool,
        accepted: &[WorkState],
    ) -> Option<Mismatch> {
        // Prefer the stored request ref; fall back to the job-id tag for
        // jobs that were never successfully linked to a request.
        let query = match job.request_ref {
            Some(id) => WorkQuery::ById(id),
            None => {
                debug!(job_id = %job.id, "No request ref stored, using tag lookup");
                WorkQuery::ByTag(job_id_tag(&job.id))
            }
        };

        let snapshots = match self.scheduler.query(query).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Scheduler query failed, check inconclusive");
                return None;
            }
        };

        if snapshots.is_empty() {
            if ignore_missing {
                return None;
            }
            warn!(job_id = %job.id, "No work requests found for job");
            return Some(Mismatch { job, snapshot: None });
        }

        for snapshot in snapshots {
            if !accepted.contains(&snapshot.state) {
                warn!(
                    job_id = %job.id,
                    request_id = %snapshot.id,
                    state = %snapshot.state,
                    "Work request state outside accepted set"
                );
                return Some(Mismatch {
                    job,
                    snapshot: Some(snapshot),
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    use jobsync_statemap::Priority;

    use crate::scheduler::MockScheduler;

    fn job(id: &str, state: JobState, request_ref: Option<Uuid>) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            func: "sync".to_string(),
            priority: Priority::Regular,
            state,
            request_ref,
            updated_at: 100,
        }
    }

    fn sentinel_with(
        jobs: &[JobRecord],
    ) -> (Sentinel, Arc<JobStore>, Arc<MockScheduler>) {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        for j in jobs {
            store.upsert_job(j).unwrap();
        }
        let scheduler = Arc::new(MockScheduler::new());
        let sentinel = Sentinel::new(Arc::clone(&store), Arc::clone(&scheduler) as Arc<_>);
        (sentinel, store, scheduler)
    }

    #[tokio::test]
    async fn test_empty_job_list_skips_scheduler() {
        let (sentinel, _store, scheduler) = sentinel_with(&[]);

        // Any scheduler query would error; an empty state must not issue one.
        scheduler.set_fail_queries(true);

        let mismatches = sentinel.check(JobState::Pending, false).await.unwrap();
        assert!(mismatches.is_empty());
    }

    #[tokio::test]
    async fn test_missing_request_reported() {
        let (sentinel, _store, _scheduler) =
            sentinel_with(&[job("j1", JobState::Pending, None)]);

        let mismatches = sentinel.check(JobState::Pending, false).await.unwrap();
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].is_missing());
        assert_eq!(mismatches[0].job.id, "j1");
    }

    #[tokio::test]
    async fn test_ignore_missing() {
        let (sentinel, _store, _scheduler) =
            sentinel_with(&[job("j1", JobState::Running, None)]);

        let mismatches = sentinel.check(JobState::Running, true).await.unwrap();
        assert!(mismatches.is_empty());
    }

    #[tokio::test]
    async fn test_state_mismatch_reported() {
        let (sentinel, _store, scheduler) =
            sentinel_with(&[job("j1", JobState::Pending, None)]);

        // A PENDING job must not have a CANCELLED request.
        scheduler.insert_request("j1", vec![job_id_tag("j1")], WorkState::Cancelled);

        let mismatches = sentinel.check(JobState::Pending, false).await.unwrap();
        assert_eq!(mismatches.len(), 1);
        let snapshot = mismatches[0].snapshot.as_ref().unwrap();
        assert_eq!(snapshot.state, WorkState::Cancelled);
    }

    #[tokio::test]
    async fn test_consistent_job_not_reported() {
        let (sentinel, _store, scheduler) =
            sentinel_with(&[job("j1", JobState::Pending, None)]);

        scheduler.insert_request("j1", vec![job_id_tag("j1")], WorkState::Enqueued);

        let mismatches = sentinel.check(JobState::Pending, false).await.unwrap();
        assert!(mismatches.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_prefers_stored_ref() {
        let (sentinel, store, scheduler) = sentinel_with(&[]);

        // Request discoverable only by id: tags do not include the job id.
        let req_id = scheduler.insert_request("j1", vec![], WorkState::Running);
        store
            .upsert_job(&job("j1", JobState::Running, Some(req_id)))
            .unwrap();

        let mismatches = sentinel.check(JobState::Running, false).await.unwrap();
        assert!(mismatches.is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_is_inconclusive() {
        let (sentinel, _store, scheduler) = sentinel_with(&[
            job("j1", JobState::Pending, None),
            job("j2", JobState::Pending, None),
        ]);

        scheduler.set_fail_queries(true);

        // Failures never abort the batch; the jobs are just inconclusive.
        let mismatches = sentinel.check(JobState::Pending, false).await.unwrap();
        assert!(mismatches.is_empty());
    }
}
