use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskQueueError {
    #[error("waiting for queue '{0}' to go idle from one of its own tasks would deadlock")]
    DeadlockRisk(String),

    #[error("queue '{0}' did not go idle within {1:?}")]
    Timeout(String, Duration),
}
