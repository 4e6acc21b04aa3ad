use crate::queue::QueueInner;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use uuid::Uuid;

pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    /// `error` is set when the task's work panicked; the panic is caught at
    /// the task boundary and never takes down a worker.
    Completed { error: Option<String> },
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed { .. } | TaskState::Cancelled)
    }
}

/// Point-in-time copy of a task's metadata, safe to hold or serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub(crate) struct TaskShared {
    pub(crate) id: Uuid,
    meta: Mutex<TaskMeta>,
}

struct TaskMeta {
    state: TaskState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskShared {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            meta: Mutex::new(TaskMeta {
                state: TaskState::Pending,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.meta.lock().state == TaskState::Cancelled
    }

    pub(crate) fn mark_running(&self) {
        let mut meta = self.meta.lock();
        meta.state = TaskState::Running;
        meta.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_completed(&self, error: Option<String>) {
        let mut meta = self.meta.lock();
        meta.state = TaskState::Completed { error };
        meta.finished_at = Some(Utc::now());
    }

    /// Pending -> Cancelled; any other state is left alone.
    pub(crate) fn mark_cancelled(&self) -> bool {
        let mut meta = self.meta.lock();
        if meta.state != TaskState::Pending {
            return false;
        }
        meta.state = TaskState::Cancelled;
        meta.finished_at = Some(Utc::now());
        true
    }
}

/// Handle to a submitted task, returned by [`TaskQueue::submit`].
///
/// [`TaskQueue::submit`]: crate::queue::TaskQueue::submit
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
    queue: Weak<QueueInner>,
}

impl TaskHandle {
    pub(crate) fn new(shared: Arc<TaskShared>, queue: Weak<QueueInner>) -> Self {
        Self { shared, queue }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.meta.lock().state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let meta = self.shared.meta.lock();
        TaskSnapshot {
            id: self.shared.id,
            state: meta.state.clone(),
            created_at: meta.created_at,
            started_at: meta.started_at,
            finished_at: meta.finished_at,
        }
    }

    /// Cancel this task if it has not started yet. Returns whether the cancel
    /// took effect; a task that is already running, finished or cancelled is
    /// left alone.
    pub fn cancel(&self) -> bool {
        match self.queue.upgrade() {
            Some(queue) => QueueInner::cancel_task(&queue, self.shared.id),
            // Queue is gone, nothing can start this task anymore.
            None => self.shared.mark_cancelled(),
        }
    }
}
