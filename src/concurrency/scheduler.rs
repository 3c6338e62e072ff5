//! Bounded parallel task runner with a whole-run deadline.
//!
//! Every submitted task is spawned immediately and then waits for a worker
//! slot, so at most `workers` run at once. Each run gets its own gate, closed
//! as soon as the run gives up so queued tasks never start. Completion order
//! is arbitrary; results come back in submission order. The optional timeout
//! bounds the wait for the whole batch, and on expiry the tasks still
//! outstanding are aborted and reported by id. `run` returns only after the
//! aborted tasks have been dropped.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::worker_gate::WorkerGate;

/// Lifecycle of one scheduled unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("timed out after {}s waiting for tasks: {}", .elapsed.as_secs_f32(), .outstanding.join(", "))]
    Timeout {
        elapsed: Duration,
        /// Ids of tasks that had not finished, in submission order.
        outstanding: Vec<String>,
    },

    #[error("task {0} panicked")]
    Panicked(String),
}

/// A named future to run on the scheduler.
pub struct ScheduledTask<F> {
    pub id: String,
    pub future: F,
}

impl<F> ScheduledTask<F> {
    pub fn new(id: impl Into<String>, future: F) -> Self {
        Self {
            id: id.into(),
            future,
        }
    }
}

pub struct TaskScheduler {
    workers: NonZeroUsize,
}

impl TaskScheduler {
    pub fn new(workers: NonZeroUsize) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> usize {
        self.workers.get()
    }

    /// Run all tasks and return their outputs in submission order.
    pub async fn run<F, T>(
        &self,
        tasks: Vec<ScheduledTask<F>>,
        timeout: Option<Duration>,
    ) -> Result<Vec<T>, SchedulerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(tasks.len()).collect();

        let gate = WorkerGate::new(self.workers);
        let mut set = JoinSet::new();
        let mut task_ids = HashMap::new();
        for (slot, task) in tasks.into_iter().enumerate() {
            let gate = gate.clone();
            let id = task.id;
            let handle = set.spawn(async move {
                let _permit = gate.acquire().await?;
                debug!(task = %id, "task running");
                Some((slot, task.future.await))
            });
            task_ids.insert(handle.id(), slot);
        }

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        gate.close();
                        set.abort_all();
                        while set.join_next().await.is_some() {}
                        let outstanding: Vec<String> = results
                            .iter()
                            .zip(&ids)
                            .filter(|(r, _)| r.is_none())
                            .map(|(_, id)| id.clone())
                            .collect();
                        warn!(?outstanding, "scheduler timed out");
                        return Err(SchedulerError::Timeout {
                            elapsed: started.elapsed(),
                            outstanding,
                        });
                    }
                },
                None => set.join_next().await,
            };

            match next {
                None => break,
                Some(Ok(Some((slot, value)))) => results[slot] = Some(value),
                // gate closed: the run is already being torn down
                Some(Ok(None)) => {}
                Some(Err(e)) => {
                    gate.close();
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    let id = task_ids
                        .get(&e.id())
                        .map(|&slot| ids[slot].clone())
                        .unwrap_or_default();
                    error!(task = %id, error = %e, "scheduled task did not complete");
                    return Err(SchedulerError::Panicked(id));
                }
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}
