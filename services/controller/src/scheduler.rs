//! Platform scheduler interface and mock implementation.
//!
//! The scheduler executes and tracks work requests on its own; this seam
//! covers only the contract we consume: submit with a uniqueness policy,
//! query by id or tag, cancel. A mock implementation backs tests and dev
//! runs until a real platform backend is wired in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use jobsync_request::RequestSpec;
use jobsync_statemap::WorkState;

/// Errors from scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The remote scheduler facility is unreachable.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),

    /// The scheduler rejected the request.
    #[error("scheduler rejected request: {0}")]
    Rejected(String),
}

/// Observable snapshot of a scheduler work request.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    /// Scheduler-assigned request id.
    pub id: Uuid,

    /// Discovery tags the request was submitted with.
    pub tags: Vec<String>,

    /// Current execution state as reported by the scheduler.
    pub state: WorkState,
}

/// Lookup key for scheduler queries.
#[derive(Debug, Clone)]
pub enum WorkQuery {
    /// By scheduler-assigned request id.
    ById(Uuid),

    /// By discovery tag.
    ByTag(String),
}

/// What to do when a request already exists at the uniqueness key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingWorkPolicy {
    /// Keep the existing request, drop the new one.
    Keep,

    /// Cancel whatever exists and submit the new request.
    Replace,
}

/// Platform scheduler contract.
#[async_trait]
pub trait WorkScheduler: Send + Sync {
    /// Attach to the scheduler's remote execution facility.
    ///
    /// Idempotent: calling while already connected is a no-op.
    async fn connect(&self) -> Result<(), SchedulerError>;

    /// Submit a work request under its uniqueness key.
    ///
    /// Returns the scheduler-assigned request id.
    async fn submit(
        &self,
        spec: RequestSpec,
        policy: ExistingWorkPolicy,
    ) -> Result<Uuid, SchedulerError>;

    /// Query request snapshots matching the given key.
    async fn query(&self, query: WorkQuery) -> Result<Vec<RequestSnapshot>, SchedulerError>;

    /// Cancel all requests matching the given key.
    async fn cancel(&self, query: WorkQuery) -> Result<(), SchedulerError>;
}

#[derive(Debug, Clone)]
struct MockRequest {
    id: Uuid,
    tags: Vec<String>,
    state: WorkState,
}

/// In-memory scheduler for tests and development.
pub struct MockScheduler {
    requests: Mutex<HashMap<String, MockRequest>>,
    connect_count: AtomicU64,
    fail_queries: AtomicBool,
    fail_submits: AtomicBool,
}

impl MockScheduler {
    /// Create a new mock scheduler.
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            connect_count: AtomicU64::new(0),
            fail_queries: AtomicBool::new(false),
            fail_submits: AtomicBool::new(false),
        }
    }

    /// Number of times `connect` has been called.
    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Make all queries fail until cleared.
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make all submits fail until cleared.
    pub fn set_fail_submits(&self, fail: bool) {
        self.fail_submits.store(fail, Ordering::SeqCst);
    }

    /// Seed a request directly, bypassing submit. Test hook.
    pub fn insert_request(&self, unique_name: &str, tags: Vec<String>, state: WorkState) -> Uuid {
        let id = Uuid::new_v4();
        let mut requests = self.requests.lock().expect("mock scheduler mutex poisoned");
        requests.insert(
            unique_name.to_string(),
            MockRequest { id, tags, state },
        );
        id
    }

    /// Force the state of the request at a uniqueness key. Test hook.
    pub fn set_request_state(&self, unique_name: &str, state: WorkState) {
        let mut requests = self.requests.lock().expect("mock scheduler mutex poisoned");
        if let Some(req) = requests.get_mut(unique_name) {
            req.state = state;
        }
    }

    /// Number of live requests (one per uniqueness key).
    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("mock scheduler mutex poisoned").len()
    }

    fn matches(req: &MockRequest, query: &WorkQuery) -> bool {
        match query {
            WorkQuery::ById(id) => req.id == *id,
            WorkQuery::ByTag(tag) => req.tags.iter().any(|t| t == tag),
        }
    }
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkScheduler for MockScheduler {
    async fn connect(&self) -> Result<(), SchedulerError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        debug!("[MOCK] Scheduler connected");
        Ok(())
    }

    async fn submit(
        &self,
        spec: RequestSpec,
        policy: ExistingWorkPolicy,
    ) -> Result<Uuid, SchedulerError> {
        if self.fail_submits.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable(
                "mock scheduler configured to fail submits".to_string(),
            ));
        }

        let mut requests = self.requests.lock().expect("mock scheduler mutex poisoned");

        if let Some(existing) = requests.get(&spec.unique_name) {
            if policy == ExistingWorkPolicy::Keep {
                return Ok(existing.id);
            }
            // Replace supersedes whatever exists at the key.
        }

        let id = Uuid::new_v4();
        info!(
            unique_name = %spec.unique_name,
            request_id = %id,
            expedited = spec.expedited,
            "[MOCK] Submitting work request"
        );

        requests.insert(
            spec.unique_name.clone(),
            MockRequest {
                id,
                tags: spec.tags,
                state: WorkState::Enqueued,
            },
        );

        Ok(id)
    }

    async fn query(&self, query: WorkQuery) -> Result<Vec<RequestSnapshot>, SchedulerError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(SchedulerError::Unavailable(
                "mock scheduler configured to fail queries".to_string(),
            ));
        }

        let requests = self.requests.lock().expect("mock scheduler mutex poisoned");
        let snapshots = requests
            .values()
            .filter(|req| Self::matches(req, &query))
            .map(|req| RequestSnapshot {
                id: req.id,
                tags: req.tags.clone(),
                state: req.state,
            })
            .collect();

        Ok(snapshots)
    }

    async fn cancel(&self, query: WorkQuery) -> Result<(), SchedulerError> {
        let mut requests = self.requests.lock().expect("mock scheduler mutex poisoned");
        requests.retain(|_, req| !Self::matches(req, &query));
        Ok(())
    }
}
