use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{MashError, Result};

/// Result of removing a job from the scheduler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Removal {
    /// The run had not started and never will.
    Cancelled,
    /// The run is in progress and finishes on its own.
    Running,
    /// Nothing was scheduled for the id.
    NotFound,
}

struct Entry {
    cancel: CancellationToken,
    running: bool,
    generation: u64,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("running", &self.running)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// Background scheduler with at most one instance per job id.
///
/// Runs are spawned on the Tokio runtime and gated by a semaphore of
/// `max_workers` permits. A job id occupies its slot from `schedule` until
/// the run calls [`JobScheduler::release`] (or the task ends), so a second
/// attempt in that window is rejected instead of queued.
#[derive(Clone)]
pub struct JobScheduler {
    permits: Arc<Semaphore>,
    max_workers: usize,
    state: Arc<Mutex<SchedulerState>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("max_workers", &self.max_workers)
            .field("available_permits", &self.permits.available_permits())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl JobScheduler {
    /// Creates a scheduler running at most `max_workers` jobs at once
    /// (at least one).
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Concurrency limit.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Schedules `task` for `job_id`, to start at `run_at` (immediately when
    /// `None` or in the past).
    pub async fn schedule<F>(
        &self,
        job_id: &str,
        run_at: Option<DateTime<Utc>>,
        task: F,
    ) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(MashError::Cancelled("scheduler is shut down".into()));
        }

        let mut state = self.state.lock().await;
        if state.entries.contains_key(job_id) {
            return Err(MashError::AlreadyScheduled(job_id.to_string()));
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let cancel = self.shutdown.child_token();
        state.entries.insert(
            job_id.to_string(),
            Entry {
                cancel: cancel.clone(),
                running: false,
                generation,
            },
        );
        drop(state);

        let delay = run_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        debug!(job_id, delay_ms = delay.as_millis() as u64, "job scheduled");

        let permits = Arc::clone(&self.permits);
        let shared = Arc::clone(&self.state);
        let id = job_id.to_string();
        tokio::spawn(async move {
            let started = async {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = permits.acquire_owned() => permit.ok()?,
                };
                let mut state = shared.lock().await;
                match state.entries.get_mut(&id) {
                    Some(entry) if entry.generation == generation && !cancel.is_cancelled() => {
                        entry.running = true;
                        Some(permit)
                    }
                    _ => None,
                }
            }
            .await;

            if let Some(permit) = started {
                trace!(job_id = %id, "job run starting");
                // Run on its own task so a panic surfaces as a JoinError here
                // and the slot below is still released.
                if let Err(err) = tokio::spawn(task).await {
                    error!(job_id = %id, error = %err, "scheduled job task aborted");
                }
                drop(permit);
            } else {
                trace!(job_id = %id, "job run cancelled before start");
            }

            let mut state = shared.lock().await;
            if state
                .entries
                .get(&id)
                .is_some_and(|entry| entry.generation == generation)
            {
                state.entries.remove(&id);
            }
        });
        Ok(())
    }

    /// Removes `job_id`. A pending run is cancelled; a running one is left to
    /// finish and keeps its slot until it releases it.
    pub async fn remove(&self, job_id: &str) -> Removal {
        let mut state = self.state.lock().await;
        match state.entries.get(job_id) {
            None => Removal::NotFound,
            Some(entry) if entry.running => Removal::Running,
            Some(_) => {
                if let Some(entry) = state.entries.remove(job_id) {
                    entry.cancel.cancel();
                }
                Removal::Cancelled
            }
        }
    }

    /// Frees the slot of a run that has finished its work. Idempotent.
    pub async fn release(&self, job_id: &str) {
        let mut state = self.state.lock().await;
        if state.entries.get(job_id).is_some_and(|entry| entry.running) {
            state.entries.remove(job_id);
        }
    }

    /// True while `job_id` holds a slot, pending or running.
    pub async fn contains(&self, job_id: &str) -> bool {
        self.state.lock().await.entries.contains_key(job_id)
    }

    /// True once the run for `job_id` has started and not yet released.
    pub async fn is_running(&self, job_id: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .get(job_id)
            .is_some_and(|entry| entry.running)
    }

    /// Number of pending plus running jobs.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// True when no job holds a slot.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cancels every pending run and refuses new ones. Running jobs finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
