use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tracing::{error, info};

use crate::config::Config;
use crate::jobs::pipeline::{self, TrainerMode};
use crate::jobs::{archive, JobRegistry};

/// One accepted job, waiting on the queue for a worker.
pub struct QueuedJob {
    pub job_id: String,
    pub mode: TrainerMode,
    pub cancel_rx: watch::Receiver<bool>,
}

/// Background worker for processing reconstruction jobs
pub struct JobWorker {
    registry: Arc<JobRegistry>,
    config: Arc<Config>,
    queue: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
}

impl JobWorker {
    pub fn new(
        registry: Arc<JobRegistry>,
        config: Arc<Config>,
        queue: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    ) -> Self {
        Self {
            registry,
            config,
            queue,
        }
    }

    /// Run worker with semaphore-based bounded concurrency
    ///
    /// # Architecture
    /// - Pulls jobs off the shared queue (the receiver is shared across
    ///   workers behind a mutex, held only while waiting)
    /// - Acquires a semaphore permit before running the pipeline, bounding
    ///   the number of simultaneously running external tools
    /// - Runs the pipeline to completion, then archives the output tree and
    ///   reports the outcome to the registry
    /// - Stops when the shutdown signal fires or the queue closes; a job
    ///   already being processed is finished first
    pub async fn run(
        &self,
        worker_id: u32,
        semaphore: Arc<Semaphore>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Worker {} started", worker_id);

        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    _ = shutdown_rx.changed() => None,
                    job = queue.recv() => job,
                }
            };
            let Some(job) = next else {
                info!("Worker {} stopping", worker_id);
                break;
            };

            info!("Worker {} acquired job: id={}", worker_id, job.job_id);
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed during shutdown.
                    break;
                }
            };

            self.process(job).await;
            drop(permit);
        }
    }

    async fn process(&self, job: QueuedJob) {
        let QueuedJob {
            job_id,
            mode,
            cancel_rx,
        } = job;
        self.registry.mark_running(&job_id);

        let layout = self.registry.layout(&job_id);
        let outcome = pipeline::run(&layout, &self.config.tools, mode, cancel_rx).await;
        info!(
            "Completed job {}: stage={:?}, exit_code={}",
            job_id, outcome.stage, outcome.exit_code
        );

        // Archive whatever the output tree holds, success or not; the zip
        // with the logs and partial results is useful for diagnosis too.
        let src = layout.output_dir.clone();
        let dest = layout.zip_path.clone();
        let archived = tokio::task::spawn_blocking(move || archive::zip_dir(&src, &dest)).await;
        match archived {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Failed to archive job {}: {}", job_id, e),
            Err(e) => error!("Archive task for job {} panicked: {}", job_id, e),
        }

        self.registry.complete(&job_id, &outcome);
    }
}
