//! Concurrency primitives for a render: the worker gate, the task
//! scheduler, and cooperative cancellation checkpoints.

pub mod scheduler;
pub mod worker_gate;

pub use scheduler::{ScheduledTask, SchedulerError, TaskScheduler, TaskStatus};
pub use tokio_util::sync::CancellationToken;
pub use worker_gate::WorkerGate;

use thiserror::Error;

/// Returned by [`checkpoint`] once cancellation has been requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Cooperative cancellation point. Work stops at the next checkpoint after
/// the token fires, never in the middle of a backend call.
pub fn checkpoint(token: &CancellationToken) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        Err(Cancelled)
    } else {
        Ok(())
    }
}
