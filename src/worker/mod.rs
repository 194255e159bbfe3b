//! Job loop between the queue and the inference service
//!
//! Jobs are taken one at a time; the next poll only starts after the previous
//! result has been handed back.

use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use crate::job::{Job, JobResult};
use crate::service::InferenceService;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod http;
pub mod local;

pub use http::{HttpJobQueue, HttpQueueConfig};
pub use local::LocalJobSource;

/// Outcome of asking a source for work
#[derive(Debug)]
pub enum JobPoll {
    Ready(Job),
    /// Nothing queued right now
    Idle,
    /// The source will never produce another job
    Closed,
}

/// Where jobs come from and where their results go
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn next_job(&self) -> Result<JobPoll>;

    async fn complete(&self, job: &Job, result: &JobResult) -> Result<()>;

    /// Start a liveness heartbeat, if the source needs one
    fn start_heartbeat(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// Pick the job source for this process.
///
/// An explicit test input wins, then the queue from the environment, then a
/// test input file in the working directory.
pub fn select_source(test_input: Option<&str>, settings: &RuntimeSettings) -> Result<Box<dyn JobSource>> {
    if let Some(json) = test_input {
        info!("Running a single job from --test-input");
        return Ok(Box::new(LocalJobSource::from_json(json)?));
    }

    if let Some(config) = HttpQueueConfig::from_env(settings)? {
        info!("Polling job queue at {}", config.job_take_url());
        return Ok(Box::new(HttpJobQueue::new(config)?));
    }

    if settings.test_input_path.exists() {
        info!("Running a single job from {}", settings.test_input_path.display());
        return Ok(Box::new(LocalJobSource::from_file(&settings.test_input_path)?));
    }

    Err(Error::ConfigurationError(format!(
        "No job source configured: set RUNPOD_WEBHOOK_GET_JOB, pass --test-input, or provide {}",
        settings.test_input_path.display()
    )))
}

/// Counters reported when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_failed: u64,
}

pub struct Worker {
    service: Arc<InferenceService>,
    source: Box<dyn JobSource>,
    backoff: Duration,
    shutdown_grace: Duration,
}

impl Worker {
    pub fn new(service: Arc<InferenceService>, source: Box<dyn JobSource>, backoff: Duration) -> Self {
        Self {
            service,
            source,
            backoff,
            shutdown_grace: Duration::ZERO,
        }
    }

    /// Let a job request already in flight at shutdown finish within `grace`.
    ///
    /// A job taken during the grace period is still handled and delivered;
    /// otherwise the queue could have dispatched it to a worker that is gone.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Serve jobs until the source closes or `shutdown` resolves.
    ///
    /// A job already being handled when shutdown arrives is finished and its
    /// result delivered before returning.
    pub async fn run<F>(&self, shutdown: F) -> WorkerStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = WorkerStats::default();
        let mut stopping = false;

        while !stopping {
            let poll = {
                let next = self.source.next_job();
                tokio::pin!(next);

                tokio::select! {
                    _ = &mut shutdown => {
                        stopping = true;
                        match self.drain(next).await {
                            Some(poll) => poll,
                            None => break,
                        }
                    }
                    poll = &mut next => poll,
                }
            };

            match poll {
                Ok(JobPoll::Ready(job)) => {
                    info!(job_id = %job.id, "Job received");
                    let result = self.service.handle(&job.input).await;

                    stats.jobs_processed += 1;
                    if !result.is_success() {
                        stats.jobs_failed += 1;
                    }

                    if let Err(e) = self.source.complete(&job, &result).await {
                        error!(job_id = %job.id, "Failed to deliver job result: {}", e);
                    } else {
                        info!(job_id = %job.id, success = result.is_success(), "Job completed");
                    }
                }
                Ok(JobPoll::Idle) => {
                    if !stopping && self.pause(&mut shutdown).await {
                        break;
                    }
                }
                Ok(JobPoll::Closed) => {
                    info!("Job source closed");
                    break;
                }
                Err(e) => {
                    warn!("Failed to fetch job: {}", e);
                    if !stopping && self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        stats
    }

    /// Wait out a job request interrupted by shutdown; None when the grace period ran out
    async fn drain<P>(&self, next: std::pin::Pin<&mut P>) -> Option<Result<JobPoll>>
    where
        P: Future<Output = Result<JobPoll>>,
    {
        info!("Shutdown requested, stopping job loop");
        match tokio::time::timeout(self.shutdown_grace, next).await {
            Ok(poll) => Some(poll),
            Err(_) => {
                debug!("Abandoned job request still in flight after {:?}", self.shutdown_grace);
                None
            }
        }
    }

    /// Sleep for the backoff; true when shutdown fired meanwhile
    async fn pause<F>(&self, shutdown: &mut std::pin::Pin<&mut F>) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown.as_mut() => {
                info!("Shutdown requested, stopping job loop");
                true
            }
            _ = tokio::time::sleep(self.backoff) => false,
        }
    }
}
