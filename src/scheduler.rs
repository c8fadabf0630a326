//! In-process job scheduling
//!
//! The payment core needs exactly two scheduling primitives: run a task
//! once after a delay (monitor wake-ups) and run a task on a fixed
//! period (cleanup). Jobs are tokio tasks tracked in a registry keyed
//! by a generated job id; there is no cancellation API — monitor chains
//! terminate by observing terminal payment state on their next wake.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to the process-wide scheduler
#[derive(Clone)]
pub struct JobScheduler {
    jobs: Arc<DashMap<String, JoinHandle<()>>>,
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
        }
    }

    /// Run `job` once after `delay`. Returns the job id.
    pub fn run_after<F>(&self, delay: Duration, job: F) -> String
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap_finished();

        let id = uuid::Uuid::new_v4().to_string();
        let jobs = self.jobs.clone();
        let job_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
            jobs.remove(&job_id);
        });
        debug!("Scheduled job {} in {:?}", id, delay);
        self.jobs.insert(id.clone(), handle);
        id
    }

    /// Run a task on a fixed period, first firing one full period from
    /// now. Returns the job id; the task runs until shutdown.
    pub fn run_every<F, Fut>(&self, period: Duration, task: F) -> String
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.reap_finished();

        let id = uuid::Uuid::new_v4().to_string();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                task().await;
            }
        });
        debug!("Scheduled periodic job {} every {:?}", id, period);
        self.jobs.insert(id.clone(), handle);
        id
    }

    /// Number of jobs currently registered (including finished ones
    /// not yet reaped)
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Abort every outstanding job
    pub fn shutdown(&self) {
        for entry in self.jobs.iter() {
            entry.value().abort();
        }
        self.jobs.clear();
    }

    fn reap_finished(&self) {
        self.jobs.retain(|_, handle| !handle.is_finished());
    }
}
