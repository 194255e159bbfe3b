//! HTTP job queue client for the RunPod serverless protocol
//!
//! The platform injects the endpoints into the worker's environment:
//! - `RUNPOD_WEBHOOK_GET_JOB` - job-take URL, `$ID` is replaced with the pod id
//! - `RUNPOD_WEBHOOK_POST_OUTPUT` - job-done URL, `$ID` is replaced with the job id
//! - `RUNPOD_WEBHOOK_PING` - optional heartbeat URL, `$RUNPOD_POD_ID` is replaced with the pod id
//! - `RUNPOD_AI_API_KEY` - sent verbatim as the `Authorization` header
//! - `RUNPOD_POD_ID` - identity of this worker
//! - `RUNPOD_PING_INTERVAL` - heartbeat interval in milliseconds

use super::{JobPoll, JobSource};
use crate::config::RuntimeSettings;
use crate::error::{Error, Result};
use crate::job::{Job, JobResult};
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Endpoints and credentials of the job queue
#[derive(Debug, Clone, PartialEq)]
pub struct HttpQueueConfig {
    pub get_job_url: String,
    pub post_output_url: String,
    pub ping_url: Option<String>,
    pub api_key: Option<String>,
    pub pod_id: Option<String>,
    pub ping_interval: Duration,
}

impl HttpQueueConfig {
    /// Read the queue configuration from the process environment.
    ///
    /// Returns `None` when no job-take URL is configured.
    pub fn from_env(settings: &RuntimeSettings) -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok(), settings)
    }

    /// Same as [`HttpQueueConfig::from_env`] over an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F, settings: &RuntimeSettings) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let get_job_url = match var("RUNPOD_WEBHOOK_GET_JOB") {
            Some(url) => url,
            None => return Ok(None),
        };
        let post_output_url = var("RUNPOD_WEBHOOK_POST_OUTPUT").ok_or_else(|| {
            Error::ConfigurationError(
                "RUNPOD_WEBHOOK_POST_OUTPUT must be set together with RUNPOD_WEBHOOK_GET_JOB".to_string(),
            )
        })?;
        let pod_id = var("RUNPOD_POD_ID");
        if pod_id.is_none() && get_job_url.contains("$ID") {
            return Err(Error::ConfigurationError(
                "RUNPOD_POD_ID environment variable not set, required by RUNPOD_WEBHOOK_GET_JOB".to_string(),
            ));
        }

        let ping_interval_ms = match var("RUNPOD_PING_INTERVAL") {
            Some(value) => value.trim().parse::<u64>().map_err(|_| {
                Error::ConfigurationError(format!("RUNPOD_PING_INTERVAL must be milliseconds, got '{}'", value))
            })?,
            None => settings.ping_interval_ms,
        };

        Ok(Some(Self {
            get_job_url,
            post_output_url,
            ping_url: var("RUNPOD_WEBHOOK_PING"),
            api_key: var("RUNPOD_AI_API_KEY"),
            pod_id,
            ping_interval: Duration::from_millis(ping_interval_ms.max(1)),
        }))
    }

    pub fn job_take_url(&self) -> String {
        match &self.pod_id {
            Some(pod_id) => self.get_job_url.replace("$ID", pod_id),
            None => self.get_job_url.clone(),
        }
    }

    pub fn job_done_url(&self, job_id: &str) -> String {
        self.post_output_url.replace("$ID", job_id)
    }

    pub fn heartbeat_url(&self) -> Option<String> {
        let url = self.ping_url.as_ref()?;
        Some(match &self.pod_id {
            Some(pod_id) => url.replace("$RUNPOD_POD_ID", pod_id),
            None => url.clone(),
        })
    }
}

/// Body posted to the job-done endpoint
pub fn completion_body(result: &JobResult) -> Value {
    match result {
        JobResult::Success { .. } => json!({ "output": result }),
        JobResult::Error { error } => json!({ "output": result, "error": error }),
    }
}

/// Parse a job-take response body; blank bodies mean no job
pub fn parse_job(body: &[u8]) -> Result<JobPoll> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(JobPoll::Idle);
    }
    let job: Job = serde_json::from_slice(body)
        .map_err(|e| Error::RuntimeError(format!("Invalid job payload: {}", e)))?;
    Ok(JobPoll::Ready(job))
}

pub struct HttpJobQueue {
    client: Client,
    config: HttpQueueConfig,
}

impl HttpJobQueue {
    pub fn new(config: HttpQueueConfig) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = &config.api_key {
            let auth_value = header::HeaderValue::from_str(key)
                .map_err(|e| Error::ConfigurationError(format!("Invalid RUNPOD_AI_API_KEY: {}", e)))?;
            headers.insert(header::AUTHORIZATION, auth_value);
        }
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(concat!("medgemma-worker/", env!("CARGO_PKG_VERSION"))),
        );

        // No overall timeout: job-take is a long poll.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl JobSource for HttpJobQueue {
    async fn next_job(&self) -> Result<JobPoll> {
        let response = self.client.get(self.config.job_take_url()).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(JobPoll::Idle),
            status if status.is_success() => parse_job(&response.bytes().await?),
            status => Err(Error::RuntimeError(format!("Job request failed with status {}", status))),
        }
    }

    async fn complete(&self, job: &Job, result: &JobResult) -> Result<()> {
        self.client
            .post(self.config.job_done_url(&job.id))
            .json(&completion_body(result))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn start_heartbeat(&self) -> Option<JoinHandle<()>> {
        let url = self.config.heartbeat_url()?;
        let client = self.client.clone();
        let interval = self.config.ping_interval;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match client.get(&url).send().await {
                    Ok(response) if !response.status().is_success() => {
                        tracing::debug!("Heartbeat rejected with status {}", response.status());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Heartbeat failed: {}", e),
                }
            }
        }))
    }
}
