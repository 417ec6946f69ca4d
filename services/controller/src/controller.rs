//! Wake/sleep controller hosting the scheduler connection.
//!
//! A small state machine living in the long-running background process.
//! Application lifecycle transitions deliver control signals (WAKE, SLEEP,
//! STOP, RECONCILE) as opcode messages; the controller processes them
//! strictly one at a time, lazily attaches the scheduler connection on
//! wake, runs reconciliation passes in the background, and terminates the
//! hosting process once it is asleep with no work in flight.
//!
//! # Invariants
//!
//! - Signals are handled FIFO, at most one concurrently.
//! - The live task counter is incremented before a signal is processed and
//!   decremented when its queued work finishes; idle termination is
//!   evaluated only at decrement time.
//! - At most one reconciliation pass is requested per sleep/wake cycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::reconciler::Reconciler;
use crate::scheduler::WorkScheduler;

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Not connected to anything; the process exits once idle.
    Sleeping,
    /// Connected and serving control signals.
    Awake,
    /// Awake, but the host has signaled memory pressure. Sticky until the
    /// next SLEEP; informs future wake policy rather than forcing action.
    AwakeLowMemory,
    /// Terminated.
    Stopped,
}

impl ControllerState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Sleeping => 0,
            Self::Awake => 1,
            Self::AwakeLowMemory => 2,
            Self::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Awake,
            2 => Self::AwakeLowMemory,
            3 => Self::Stopped,
            _ => Self::Sleeping,
        }
    }
}

/// Control signals and their wire opcodes.
///
/// The host protocol is an integer opcode with no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Wake,
    Sleep,
    Stop,
    Reconcile,
}

impl Signal {
    /// Wire opcode for this signal.
    pub fn opcode(&self) -> i32 {
        match self {
            Self::Wake => 1,
            Self::Sleep => 2,
            Self::Stop => 3,
            Self::Reconcile => 4,
        }
    }

    /// Parse a wire opcode.
    pub fn from_opcode(opcode: i32) -> Option<Self> {
        match opcode {
            1 => Some(Self::Wake),
            2 => Some(Self::Sleep),
            3 => Some(Self::Stop),
            4 => Some(Self::Reconcile),
            _ => None,
        }
    }
}

type ControlTask = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Shared {
    state: AtomicU8,
    task_count: AtomicU32,
    connected: AtomicBool,
    should_reconcile: AtomicBool,
    terminated_tx: watch::Sender<bool>,
}

impl Shared {
    fn new() -> Self {
        let (terminated_tx, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(ControllerState::Sleeping.as_u8()),
            task_count: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            should_reconcile: AtomicBool::new(false),
            terminated_tx,
        }
    }

    fn state(&self) -> ControllerState {
        ControllerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ControllerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn begin_task(&self) {
        self.task_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Idle termination is evaluated only here, when a task's work settles.
    fn finish_task(&self) {
        let remaining = self.task_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.state() != ControllerState::Awake {
            info!("No tasks in flight and not awake, terminating");
            self.terminate();
        }
    }

    fn terminate(&self) {
        self.set_state(ControllerState::Stopped);
        let _ = self.terminated_tx.send(true);
    }
}

/// Handle for delivering control signals to a spawned controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Signal>,
    shared: Arc<Shared>,
}

impl ControllerHandle {
    /// Deliver a control signal. Returns false if the controller is gone.
    pub async fn signal(&self, signal: Signal) -> bool {
        self.tx.send(signal).await.is_ok()
    }

    /// Deliver a signal by wire opcode. Unknown opcodes are logged and dropped.
    pub async fn signal_opcode(&self, opcode: i32) -> bool {
        match Signal::from_opcode(opcode) {
            Some(signal) => self.signal(signal).await,
            None => {
                warn!(opcode, "Unknown control opcode");
                false
            }
        }
    }

    /// Host memory-pressure callback. Forces AWAKE_LOW_MEMORY; purely
    /// informational for subsequent WAKE handling.
    pub fn notify_low_memory(&self) {
        debug!("Host signaled memory pressure");
        self.shared.set_state(ControllerState::AwakeLowMemory);
    }

    /// Current controller state.
    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    /// Number of in-flight control tasks.
    pub fn task_count(&self) -> u32 {
        self.shared.task_count.load(Ordering::SeqCst)
    }

    /// Watch that flips to true when the controller terminates.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.shared.terminated_tx.subscribe()
    }
}

/// The wake/sleep controller.
pub struct WorkController {
    shared: Arc<Shared>,
    scheduler: Arc<dyn WorkScheduler>,
    reconciler: Arc<Reconciler>,
}

impl WorkController {
    /// Create a controller over the given scheduler and reconciler.
    pub fn new(scheduler: Arc<dyn WorkScheduler>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            scheduler,
            reconciler,
        }
    }

    /// Spawn the controller's signal loop and its serialized task worker.
    pub fn spawn(self, mailbox_size: usize) -> ControllerHandle {
        let (signal_tx, signal_rx) = mpsc::channel(mailbox_size);
        let (work_tx, work_rx) = mpsc::channel::<ControlTask>(mailbox_size);

        let handle = ControllerHandle {
            tx: signal_tx,
            shared: Arc::clone(&self.shared),
        };

        tokio::spawn(run_task_worker(work_rx, Arc::clone(&self.shared)));
        tokio::spawn(self.run(signal_rx, work_tx));

        handle
    }

    /// Serialized signal loop: strictly FIFO, one signal at a time.
    async fn run(self, mut rx: mpsc::Receiver<Signal>, work_tx: mpsc::Sender<ControlTask>) {
        let mut terminated = self.shared.terminated_tx.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = terminated.changed() => {
                    if *terminated.borrow() {
                        debug!("Controller terminated, closing signal loop");
                        break;
                    }
                }

                signal = rx.recv() => {
                    match signal {
                        Some(signal) => self.handle(signal, &work_tx).await,
                        None => {
                            debug!("Controller mailbox closed");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Handle one signal: mutate state synchronously, queue its async work.
    async fn handle(&self, signal: Signal, work_tx: &mpsc::Sender<ControlTask>) {
        debug!(opcode = signal.opcode(), "Handling control signal");
        self.shared.begin_task();

        let work: ControlTask = match signal {
            Signal::Wake => self.on_wake(),
            Signal::Sleep => self.on_sleep(),
            Signal::Stop => self.on_stop(),
            Signal::Reconcile => self.on_reconcile(),
        };

        if work_tx.send(work).await.is_err() {
            // Worker already gone; settle this signal's counter slot.
            self.shared.finish_task();
        }
    }

    fn on_wake(&self) -> ControlTask {
        let was_sleeping = self.shared.state() == ControllerState::Sleeping;

        // Memory pressure is sticky until the next SLEEP.
        if self.shared.state() != ControllerState::AwakeLowMemory {
            self.shared.set_state(ControllerState::Awake);
        }

        if was_sleeping {
            // One reconciliation per sleep/wake cycle.
            self.shared.should_reconcile.store(true, Ordering::SeqCst);
        }

        if self.shared.connected.load(Ordering::SeqCst) {
            return Box::pin(async {});
        }

        let scheduler = Arc::clone(&self.scheduler);
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            match scheduler.connect().await {
                Ok(()) => {
                    shared.connected.store(true, Ordering::SeqCst);
                    info!("Scheduler connection established");
                }
                Err(e) => error!(error = %e, "Failed to connect to scheduler"),
            }
        })
    }

    fn on_sleep(&self) -> ControlTask {
        self.shared.set_state(ControllerState::Sleeping);
        self.shared.should_reconcile.store(false, Ordering::SeqCst);
        // Termination happens at this signal's own decrement if nothing
        // else is in flight.
        Box::pin(async {})
    }

    fn on_stop(&self) -> ControlTask {
        info!("Stop requested, terminating");
        self.shared.terminate();
        Box::pin(async {})
    }

    fn on_reconcile(&self) -> ControlTask {
        if !self.shared.should_reconcile.swap(false, Ordering::SeqCst) {
            debug!("Reconciliation already ran this cycle, skipping");
            return Box::pin(async {});
        }

        let reconciler = Arc::clone(&self.reconciler);
        Box::pin(async move {
            let repaired = reconciler.reconcile().await;
            debug!(repaired, "Reconciliation task finished");
        })
    }
}

/// Drains queued control tasks one at a time, in order.
async fn run_task_worker(mut rx: mpsc::Receiver<ControlTask>, shared: Arc<Shared>) {
    while let Some(task) = rx.recv().await {
        task.await;
        shared.finish_task();
    }
    debug!("Control task worker drained");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use uuid::Uuid;

    use jobsync_request::RequestSpec;
    use jobsync_statemap::{JobState, Priority};

    use crate::reconciler::ReconcileLock;
    use crate::scheduler::{
        ExistingWorkPolicy, MockScheduler, RequestSnapshot, SchedulerError, WorkQuery,
    };
    use crate::store::{JobRecord, JobStore};

    /// Delegates to a mock but takes a while to connect.
    struct SlowConnectScheduler {
        inner: MockScheduler,
        connect_delay: Duration,
    }

    #[async_trait]
    impl WorkScheduler for SlowConnectScheduler {
        async fn connect(&self) -> Result<(), SchedulerError> {
            tokio::time::sleep(self.connect_delay).await;
            self.inner.connect().await
        }

        async fn submit(
            &self,
            spec: RequestSpec,
            policy: ExistingWorkPolicy,
        ) -> Result<Uuid, SchedulerError> {
            self.inner.submit(spec, policy).await
        }

        async fn query(&self, query: WorkQuery) -> Result<Vec<RequestSnapshot>, SchedulerError> {
            self.inner.query(query).await
        }

        async fn cancel(&self, query: WorkQuery) -> Result<(), SchedulerError> {
            self.inner.cancel(query).await
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<JobStore>,
        handle: ControllerHandle,
    }

    fn spawn_controller(scheduler: Arc<dyn WorkScheduler>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            ReconcileLock::new(dir.path()),
        ));
        let handle = WorkController::new(scheduler, reconciler).spawn(16);
        Fixture {
            _dir: dir,
            store,
            handle,
        }
    }

    async fn wait_terminated(handle: &ControllerHandle, within: Duration) -> bool {
        let mut terminated = handle.terminated();
        let ok = tokio::time::timeout(within, terminated.wait_for(|t| *t))
            .await
            .is_ok();
        ok
    }

    #[test]
    fn test_opcode_roundtrip() {
        for signal in [Signal::Wake, Signal::Sleep, Signal::Stop, Signal::Reconcile] {
            assert_eq!(Signal::from_opcode(signal.opcode()), Some(signal));
        }
        assert_eq!(Signal::from_opcode(0), None);
        assert_eq!(Signal::from_opcode(99), None);
    }

    #[tokio::test]
    async fn test_wake_then_sleep_terminates() {
        let f = spawn_controller(Arc::new(MockScheduler::new()));

        assert!(f.handle.signal(Signal::Wake).await);
        assert!(f.handle.signal(Signal::Sleep).await);

        assert!(wait_terminated(&f.handle, Duration::from_secs(2)).await);
        assert_eq!(f.handle.state(), ControllerState::Stopped);
        assert_eq!(f.handle.task_count(), 0);
    }

    #[tokio::test]
    async fn test_sleep_defers_until_pending_task_finishes() {
        let scheduler = Arc::new(SlowConnectScheduler {
            inner: MockScheduler::new(),
            connect_delay: Duration::from_millis(300),
        });
        let f = spawn_controller(scheduler);

        f.handle.signal(Signal::Wake).await;
        f.handle.signal(Signal::Sleep).await;

        // The connect task is still in flight; no termination yet.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_ne!(f.handle.state(), ControllerState::Stopped);

        // Its completion decrements the counter to zero while sleeping.
        assert!(wait_terminated(&f.handle, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_stop_terminates_unconditionally() {
        let f = spawn_controller(Arc::new(MockScheduler::new()));

        f.handle.signal(Signal::Wake).await;
        f.handle.signal(Signal::Stop).await;

        assert!(wait_terminated(&f.handle, Duration::from_secs(2)).await);
        assert_eq!(f.handle.state(), ControllerState::Stopped);
    }

    #[tokio::test]
    async fn test_repeated_wake_connects_once() {
        let scheduler = Arc::new(MockScheduler::new());
        let f = spawn_controller(Arc::clone(&scheduler) as Arc<dyn WorkScheduler>);

        f.handle.signal(Signal::Wake).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.handle.signal(Signal::Wake).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(scheduler.connect_count(), 1);
        assert_eq!(f.handle.state(), ControllerState::Awake);
    }

    #[tokio::test]
    async fn test_low_memory_is_sticky_across_wake() {
        let f = spawn_controller(Arc::new(MockScheduler::new()));

        f.handle.signal(Signal::Wake).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        f.handle.notify_low_memory();
        f.handle.signal(Signal::Wake).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // WAKE must not clear the pressure marker.
        assert_eq!(f.handle.state(), ControllerState::AwakeLowMemory);
    }

    #[tokio::test]
    async fn test_reconcile_flag_is_one_shot_per_cycle() {
        let scheduler = Arc::new(MockScheduler::new());
        let f = spawn_controller(Arc::clone(&scheduler) as Arc<dyn WorkScheduler>);

        let job = |id: &str| JobRecord {
            id: id.to_string(),
            func: "sync".to_string(),
            priority: Priority::Regular,
            state: JobState::Pending,
            request_ref: None,
            updated_at: 100,
        };

        f.store.upsert_job(&job("j1")).unwrap();

        f.handle.signal(Signal::Wake).await;
        f.handle.signal(Signal::Reconcile).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.request_count(), 1);

        // Second RECONCILE in the same awake cycle is a no-op.
        f.store.upsert_job(&job("j2")).unwrap();
        f.handle.signal(Signal::Reconcile).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.request_count(), 1);
    }
}
