//! Bounded scheduler for extraction tasks.
//!
//! One [`TaskPool`] is shared by both parse phases. At most `workers` jobs
//! run at once and at most `workers + capacity` are admitted; `submit`
//! waits for room, which is what keeps memory flat on huge shards. Each
//! phase gets its own [`TaskGroup`] whose `wait` is the phase barrier.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TaskPool {
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
}

impl TaskPool {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        Self {
            admission: Arc::new(Semaphore::new(workers + capacity)),
            workers: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn group(&self, name: &'static str) -> TaskGroup {
        TaskGroup {
            name,
            admission: Arc::clone(&self.admission),
            workers: Arc::clone(&self.workers),
            tasks: JoinSet::new(),
            submitted: 0,
        }
    }

    /// Stops admitting work. Pending `submit` calls fail.
    pub fn shutdown(&self) {
        self.admission.close();
        self.workers.close();
    }
}

pub struct TaskGroup {
    name: &'static str,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    tasks: JoinSet<Result<()>>,
    submitted: u64,
}

impl TaskGroup {
    /// Runs `job` on the blocking thread pool once a worker is free.
    /// Waits while the pool is full, and returns the first failure of any
    /// job in this group as soon as one is seen.
    pub async fn submit<F>(&mut self, job: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.reap_finished()?;

        let admitted = Arc::clone(&self.admission)
            .acquire_owned()
            .await
            .with_context(|| format!("Failed submitting to {}: pool is shut down", self.name))?;
        let workers = Arc::clone(&self.workers);
        let name = self.name;
        self.tasks.spawn(async move {
            let _admitted = admitted;
            let _worker = workers
                .acquire_owned()
                .await
                .with_context(|| format!("Failed starting {name} task: pool is shut down"))?;
            tokio::task::spawn_blocking(job)
                .await
                .map_err(|err| anyhow!("{name} task panicked: {err}"))?
        });
        self.submitted += 1;
        Ok(())
    }

    fn reap_finished(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            joined.with_context(|| format!("Failed joining {} task", self.name))??;
        }
        Ok(())
    }

    /// Barrier: returns once every submitted job has finished, or with the
    /// first error. Returns the number of jobs run.
    pub async fn wait(mut self) -> Result<u64> {
        debug!(group = self.name, pending = self.tasks.len(), "waiting for task group");
        while let Some(joined) = self.tasks.join_next().await {
            joined.with_context(|| format!("Failed joining {} task", self.name))??;
        }
        Ok(self.submitted)
    }
}
