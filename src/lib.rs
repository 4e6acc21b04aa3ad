//! In-process bounded-concurrency task queues.
//!
//! [`TaskQueue`] runs caller-supplied closures with a configurable number of
//! concurrent workers, FIFO start order, suspension, cancellation of
//! not-yet-started work, and a drain that waits for the queue to go idle.
//! [`MainContext`] is the degenerate serial case: a queue bound to one
//! designated thread, with an unforgeable [`MainToken`] proving that code
//! runs on that thread.

pub mod error;
pub mod main_context;
pub mod queue;
pub mod task;

pub use error::TaskQueueError;
pub use main_context::{MainContext, MainContextDriver, MainToken};
pub use queue::{QueueStats, TaskQueue};
pub use task::{TaskHandle, TaskSnapshot, TaskState};
