use crate::error::TaskQueueError;
use crate::task::{TaskHandle, TaskShared, Work};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

thread_local! {
    // Queue whose task is currently executing on this worker thread, used to
    // reject a drain that would wait on itself.
    static ACTIVE_QUEUE: Cell<Option<Uuid>> = const { Cell::new(None) };
}

/// Bounded-concurrency FIFO task queue.
///
/// Must be created inside a Tokio runtime; workers are spawned onto the
/// runtime that was current at construction time.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    id: Uuid,
    name: String,
    runtime: tokio::runtime::Handle,
    state: Mutex<QueueState>,
    idle: Notify,
}

struct QueueState {
    max_concurrency: usize,
    suspended: bool,
    pending: VecDeque<QueuedTask>,
    running: usize,
}

struct QueuedTask {
    shared: Arc<TaskShared>,
    work: Work,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub pending: usize,
    pub running: usize,
    pub suspended: bool,
    pub max_concurrency: usize,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: Uuid::new_v4(),
                name: name.into(),
                runtime: tokio::runtime::Handle::current(),
                state: Mutex::new(QueueState {
                    max_concurrency: max_concurrency.max(1),
                    suspended: false,
                    pending: VecDeque::new(),
                    running: 0,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Serial queue: at most one task runs at a time.
    pub fn serial(name: impl Into<String>) -> Self {
        Self::new(name, 1)
    }

    /// Append a task and start it immediately if a slot is free and the queue
    /// is not suspended. Always succeeds.
    pub fn submit<F>(&self, work: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(TaskShared::new());
        let handle = TaskHandle::new(Arc::clone(&shared), Arc::downgrade(&self.inner));
        {
            let mut state = self.inner.state.lock();
            state.pending.push_back(QueuedTask {
                shared,
                work: Box::new(work),
            });
        }
        debug!("Submitted task {} to queue '{}'", handle.id(), self.inner.name);
        QueueInner::pump(&self.inner);
        handle
    }

    /// Suspending halts promotion of pending tasks; tasks that are already
    /// running are unaffected. Resuming promotes immediately.
    pub fn set_suspended(&self, suspended: bool) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.suspended == suspended {
                false
            } else {
                state.suspended = suspended;
                true
            }
        };
        if !changed {
            return;
        }
        info!(
            "Queue '{}' {}",
            self.inner.name,
            if suspended { "suspended" } else { "resumed" }
        );
        if !suspended {
            QueueInner::pump(&self.inner);
        }
    }

    /// Change the concurrency limit. Values below 1 are clamped to 1. Raising
    /// the limit promotes waiting tasks; lowering it never interrupts running
    /// work, the queue just stops promoting until enough tasks finish.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let raised = {
            let mut state = self.inner.state.lock();
            let new = max_concurrency.max(1);
            let raised = new > state.max_concurrency;
            state.max_concurrency = new;
            raised
        };
        if raised {
            QueueInner::pump(&self.inner);
        }
    }

    /// Cancel every task that has not started yet. Running tasks are left
    /// alone; cancellation here is non-preemptive. Idempotent.
    pub fn cancel_all(&self) {
        let drained: Vec<QueuedTask> = {
            let mut state = self.inner.state.lock();
            state.pending.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        for task in &drained {
            task.shared.mark_cancelled();
        }
        info!(
            "Cancelled {} pending tasks on queue '{}'",
            drained.len(),
            self.inner.name
        );
        QueueInner::notify_if_idle(&self.inner);
    }

    /// Wait until no task is running and none is pending.
    ///
    /// Calling this from inside one of this queue's own tasks can never
    /// complete (the caller occupies a slot the drain is waiting on) and is
    /// rejected with [`TaskQueueError::DeadlockRisk`].
    pub async fn wait_until_idle(&self) -> Result<(), TaskQueueError> {
        self.check_reentrant_wait()?;
        self.idle_wait().await;
        Ok(())
    }

    /// Like [`wait_until_idle`](Self::wait_until_idle) but gives up with
    /// [`TaskQueueError::Timeout`] if the queue is not idle within `bound`.
    pub async fn wait_until_idle_timeout(&self, bound: Duration) -> Result<(), TaskQueueError> {
        self.check_reentrant_wait()?;
        tokio::time::timeout(bound, self.idle_wait())
            .await
            .map_err(|_| TaskQueueError::Timeout(self.inner.name.clone(), bound))
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            name: self.inner.name.clone(),
            pending: state.pending.len(),
            running: state.running,
            suspended: state.suspended,
            max_concurrency: state.max_concurrency,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspended
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.state.lock().max_concurrency
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.running == 0 && state.pending.is_empty()
    }

    fn check_reentrant_wait(&self) -> Result<(), TaskQueueError> {
        if ACTIVE_QUEUE.with(|active| active.get()) == Some(self.inner.id) {
            return Err(TaskQueueError::DeadlockRisk(self.inner.name.clone()));
        }
        Ok(())
    }

    async fn idle_wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a completion between the check and
            // the await is not missed.
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl QueueInner {
    // Promote pending tasks until the queue is empty, suspended or at its
    // concurrency limit. Strict FIFO; entries cancelled through their handle
    // are skipped and dropped.
    fn pump(inner: &Arc<QueueInner>) {
        loop {
            let (shared, work) = {
                let mut state = inner.state.lock();
                if state.suspended || state.running >= state.max_concurrency {
                    return;
                }
                let next = loop {
                    match state.pending.pop_front() {
                        Some(task) if task.shared.is_cancelled() => continue,
                        other => break other,
                    }
                };
                let Some(task) = next else { return };
                task.shared.mark_running();
                state.running += 1;
                (task.shared, task.work)
            };
            debug!("Promoted task {} on queue '{}'", shared.id, inner.name);
            Self::spawn_runner(inner, shared, work);
        }
    }

    // The caller's work runs on a blocking worker, outside the queue lock. A
    // panic is caught at the join boundary and recorded on the task.
    fn spawn_runner(inner: &Arc<QueueInner>, shared: Arc<TaskShared>, work: Work) {
        let inner = Arc::clone(inner);
        let runtime = inner.runtime.clone();
        runtime.spawn(async move {
            let queue_id = inner.id;
            let task_id = shared.id;
            let join = tokio::task::spawn_blocking(move || {
                let _mark = WorkerMark::set(queue_id);
                work();
            })
            .await;
            let error = join.err().map(panic_message);
            if let Some(err) = &error {
                warn!("Task {} on queue '{}' panicked: {}", task_id, inner.name, err);
            }
            shared.mark_completed(error);
            {
                let mut state = inner.state.lock();
                state.running -= 1;
            }
            Self::pump(&inner);
            Self::notify_if_idle(&inner);
        });
    }

    pub(crate) fn cancel_task(inner: &Arc<QueueInner>, id: Uuid) -> bool {
        let removed = {
            let mut state = inner.state.lock();
            match state.pending.iter().position(|task| task.shared.id == id) {
                Some(index) => state.pending.remove(index),
                None => None,
            }
        };
        match removed {
            Some(task) => {
                task.shared.mark_cancelled();
                debug!("Cancelled pending task {} on queue '{}'", id, inner.name);
                Self::notify_if_idle(inner);
                true
            }
            None => false,
        }
    }

    fn notify_if_idle(inner: &Arc<QueueInner>) {
        let state = inner.state.lock();
        if state.running == 0 && state.pending.is_empty() {
            inner.idle.notify_waiters();
        }
    }
}

// Resets the thread-local on drop so a panicking task cannot leave a stale
// mark on a pooled worker thread.
struct WorkerMark;

impl WorkerMark {
    fn set(queue_id: Uuid) -> WorkerMark {
        ACTIVE_QUEUE.with(|active| active.set(Some(queue_id)));
        WorkerMark
    }
}

impl Drop for WorkerMark {
    fn drop(&mut self) {
        ACTIVE_QUEUE.with(|active| active.set(None));
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(msg) = payload.downcast_ref::<&str>() {
                (*msg).to_string()
            } else if let Some(msg) = payload.downcast_ref::<String>() {
                msg.clone()
            } else {
                "task panicked".to_string()
            }
        }
        Err(err) => err.to_string(),
    }
}
