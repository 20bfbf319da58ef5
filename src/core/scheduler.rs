//! Tick scheduling
//!
//! The host simulation advances in fixed ticks and the service schedules all
//! deferred work (auto-unset timers, animation updates, conditional scans)
//! against that clock. [`TickScheduler`] is the seam; [`StepScheduler`] is
//! the cooperative implementation the host drives by calling
//! [`StepScheduler::advance`] from its loop.
//!
//! Every handle supports cancel-then-replace: starting a new task for a key
//! always cancels the prior one first. A panicking job is caught, logged and
//! its task self-cancels instead of repeating the fault.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// A job run once at its due tick.
pub type OneShotJob = Box<dyn FnOnce() + Send>;

/// A job run repeatedly until it breaks, is cancelled, or panics.
pub type RepeatingJob = Box<dyn FnMut() -> ControlFlow<()> + Send>;

// =============================================================================
// TASK HANDLE
// =============================================================================

/// Cancellation handle for a scheduled task. Cancelling an already finished
/// or already cancelled task is a no-op.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// =============================================================================
// SCHEDULER SEAM
// =============================================================================

pub trait TickScheduler: Send + Sync {
    /// The tick the scheduler has advanced to.
    fn current_tick(&self) -> u64;

    /// Run `job` once, `delay_ticks` from now.
    fn run_after(&self, delay_ticks: u64, job: OneShotJob) -> TaskHandle;

    /// Run `job` every `interval_ticks`, first run one interval from now.
    fn run_every(&self, interval_ticks: u64, job: RepeatingJob) -> TaskHandle;
}

// =============================================================================
// STEP SCHEDULER
// =============================================================================

enum JobKind {
    Once(Option<OneShotJob>),
    Every { interval: u64, job: RepeatingJob },
}

struct Scheduled {
    due: u64,
    seq: u64,
    handle: TaskHandle,
    kind: JobKind,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // BinaryHeap is a max-heap; reverse so the earliest (due, seq) surfaces
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cooperative scheduler driven by the host's tick loop.
pub struct StepScheduler {
    tick: AtomicU64,
    seq: AtomicU64,
    queue: Mutex<BinaryHeap<Scheduled>>,
}

impl StepScheduler {
    pub fn new() -> Self {
        Self {
            tick: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            queue: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Advance the clock by `ticks`, running every due job in (due, seq)
    /// order. Jobs scheduled while running are first eligible on the next
    /// step, which keeps a job that reschedules itself from starving the
    /// loop.
    pub fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            let now = self.tick.fetch_add(1, Ordering::SeqCst) + 1;

            let mut due = Vec::new();
            {
                let mut queue = self.queue.lock();
                while queue.peek().is_some_and(|s| s.due <= now) {
                    due.push(queue.pop().expect("peeked"));
                }
            }

            for mut task in due {
                if task.handle.is_cancelled() {
                    continue;
                }
                match &mut task.kind {
                    JobKind::Once(job) => {
                        let job = job.take().expect("one-shot job runs once");
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!(due = task.due, "[SCHED] One-shot job panicked");
                        }
                    }
                    JobKind::Every { interval, job } => {
                        match catch_unwind(AssertUnwindSafe(|| job())) {
                            Ok(ControlFlow::Continue(())) => {
                                task.due = now + *interval;
                                self.queue.lock().push(task);
                            }
                            Ok(ControlFlow::Break(())) => {}
                            Err(_) => {
                                error!(due = task.due, "[SCHED] Repeating job panicked, cancelling");
                                task.handle.cancel();
                            }
                        }
                    }
                }
            }
        }
    }

    fn push(&self, due: u64, kind: JobKind) -> TaskHandle {
        let handle = TaskHandle::new();
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().push(Scheduled {
            due,
            seq,
            handle: handle.clone(),
            kind,
        });
        handle
    }
}

impl Default for StepScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TickScheduler for StepScheduler {
    fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    fn run_after(&self, delay_ticks: u64, job: OneShotJob) -> TaskHandle {
        let due = self.current_tick() + delay_ticks;
        self.push(due, JobKind::Once(Some(job)))
    }

    fn run_every(&self, interval_ticks: u64, job: RepeatingJob) -> TaskHandle {
        let interval = interval_ticks.max(1);
        let due = self.current_tick() + interval;
        self.push(due, JobKind::Every { interval, job })
    }
}

// =============================================================================
// TESTS
// =============================================================================
