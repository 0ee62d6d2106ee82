//! Deferred execution of slow follow-up work.
//!
//! Mutators never perform persistent side effects themselves. They queue
//! tasks on a per-request buffer which the dispatcher hands to the
//! scheduler once a decision exists. Tasks are fire-and-forget: failures
//! are logged and dropped, nothing is retried or persisted.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, error};

use crate::error::Result;
use crate::health::HealthState;

/// A unit of deferred work.
pub struct ScheduledTask {
    pub name: &'static str,
    pub delay: Duration,
    pub work: BoxFuture<'static, Result<()>>,
}

impl ScheduledTask {
    pub fn new<F>(name: &'static str, delay: Duration, work: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            delay,
            work: Box::pin(work),
        }
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .finish()
    }
}

/// Runs tasks after their delay, independently of the admission path.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: ScheduledTask);
}

/// Tasks queued while a single request is being decided.
#[derive(Default)]
pub struct TaskBuffer {
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl TaskBuffer {
    pub fn push(&self, task: ScheduledTask) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    pub fn drain(&self) -> Vec<ScheduledTask> {
        std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scheduler spawning one tokio task per scheduled item.
#[derive(Clone, Default)]
pub struct TokioScheduler {
    health_state: Option<Arc<HealthState>>,
}

impl TokioScheduler {
    pub fn new(health_state: Option<Arc<HealthState>>) -> Self {
        Self { health_state }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: ScheduledTask) {
        let health_state = self.health_state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(task.delay).await;
            let outcome = match task.work.await {
                Ok(()) => {
                    debug!(task = task.name, "Scheduled task completed");
                    "success"
                }
                Err(e) => {
                    error!(task = task.name, error = %e, "Scheduled task failed");
                    "error"
                }
            };
            if let Some(state) = health_state {
                state.metrics.record_task(task.name, outcome);
            }
        });
    }
}
