//! Keyed task serialization.
//!
//! Grant writes for the same (command, scope) pair must apply in the
//! order their triggering notifications were observed, or a
//! late-resolving push can bury a newer grant under stale data. The
//! [`SerialTaskQueue`] enforces that: at most one task in flight per
//! key, the rest queued FIFO and drained strictly in submission order,
//! each waiting for the prior to finish (success or failure). Tasks on
//! different keys never wait on each other.
//!
//! [`CoalescingTaskQueue`] is the discard-excess flavor for bursty
//! presentation updates where only the end state matters: while a task
//! is in flight, a newly enqueued task replaces whatever was pending.
//! Permission writes never use it; every individual subject's state
//! matters there.
//!
//! Neither queue cancels: a queued task whose target disappeared is
//! expected to look the target up and no-op.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn lock_poison_safe<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pending-task accounting shared between enqueuers and lane workers.
#[derive(Debug, Default)]
struct QueueState {
    pending: AtomicUsize,
    idle: Notify,
}

impl QueueState {
    fn task_queued(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// SerialTaskQueue
// ---------------------------------------------------------------------------

/// FIFO-fair, at-most-one-in-flight task execution per key.
#[derive(Debug)]
pub struct SerialTaskQueue<K> {
    lanes: Mutex<HashMap<K, mpsc::UnboundedSender<TaskFuture>>>,
    state: Arc<QueueState>,
}

impl<K> Default for SerialTaskQueue<K> {
    fn default() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            state: Arc::new(QueueState::default()),
        }
    }
}

impl<K> SerialTaskQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a task for `key`. Runs immediately if nothing is in
    /// flight for the key; otherwise it waits behind every task
    /// submitted for the key before it. Submission order is the
    /// application order.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F>(&self, key: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let boxed: TaskFuture = Box::pin(task);
        self.state.task_queued();
        let mut lanes = lock_poison_safe(&self.lanes);
        let sender = lanes
            .entry(key.clone())
            .or_insert_with(|| Self::spawn_lane(&self.state));
        if let Err(rejected) = sender.send(boxed) {
            // Lane worker died (a task panicked). Replace the lane and
            // resubmit on the fresh one.
            let fresh = Self::spawn_lane(&self.state);
            if fresh.send(rejected.0).is_err() {
                self.state.task_done();
            }
            lanes.insert(key, fresh);
        }
    }

    /// Wait until every submitted task has completed. Intended for
    /// shutdown and tests; new tasks submitted while draining extend
    /// the wait.
    pub async fn drain(&self) {
        self.state.drained().await;
    }

    fn spawn_lane(state: &Arc<QueueState>) -> mpsc::UnboundedSender<TaskFuture> {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskFuture>();
        let state = Arc::clone(state);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task.await;
                state.task_done();
            }
        });
        tx
    }
}

// ---------------------------------------------------------------------------
// CoalescingTaskQueue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CoalescingLane {
    busy: bool,
    pending_task: Option<TaskFuture>,
}

/// Latest-only task execution per key: while a task is in flight, a new
/// submission replaces any task still waiting, which is then dropped
/// without running.
#[derive(Default)]
pub struct CoalescingTaskQueue<K> {
    lanes: Arc<Mutex<HashMap<K, CoalescingLane>>>,
    state: Arc<QueueState>,
}

impl<K> CoalescingTaskQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(QueueState::default()),
        }
    }

    /// Submit a task for `key`. Runs immediately when the key is idle;
    /// otherwise it becomes the key's sole pending task, displacing any
    /// earlier pending submission.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F>(&self, key: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let boxed: TaskFuture = Box::pin(task);
        self.state.task_queued();
        let mut lanes = lock_poison_safe(&self.lanes);
        let lane = lanes.entry(key.clone()).or_default();
        if lane.busy {
            if lane.pending_task.replace(boxed).is_some() {
                // The displaced task never runs.
                self.state.task_done();
            }
            return;
        }
        lane.busy = true;
        drop(lanes);

        let lanes = Arc::clone(&self.lanes);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut current = boxed;
            loop {
                current.await;
                state.task_done();
                let next = {
                    let mut lanes = lock_poison_safe(&lanes);
                    match lanes.get_mut(&key) {
                        Some(lane) => {
                            let task = lane.pending_task.take();
                            if task.is_none() {
                                lane.busy = false;
                            }
                            task
                        }
                        None => None,
                    }
                };
                match next {
                    Some(task) => current = task,
                    None => break,
                }
            }
        });
    }

    /// Wait until every task that will still run has completed.
    pub async fn drain(&self) {
        self.state.drained().await;
    }
}
