//! Single-job source for local runs
//!
//! Accepts the same document the queue would deliver, `{"input": {...}}`,
//! runs it once and prints the result as JSON.

use super::{JobPoll, JobSource};
use crate::error::{Error, Result};
use crate::job::{Job, JobResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;

pub struct LocalJobSource {
    pending: Mutex<Option<Job>>,
    results: Mutex<Vec<(String, JobResult)>>,
    echo: bool,
}

impl LocalJobSource {
    pub fn from_json(json: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(json)
            .map_err(|e| Error::ValidationError(format!("Test input is not valid JSON: {}", e)))?;
        if document.get("input").is_none() {
            return Err(Error::ValidationError(
                "Test input must contain an 'input' object".to_string(),
            ));
        }
        let job: Job = serde_json::from_value(document)?;
        Ok(Self::new(job))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigurationError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn new(job: Job) -> Self {
        Self {
            pending: Mutex::new(Some(job)),
            results: Mutex::new(Vec::new()),
            echo: true,
        }
    }

    /// Keep results in memory only, without printing them
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Results delivered so far, by job id
    pub fn results(&self) -> Vec<(String, JobResult)> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl JobSource for LocalJobSource {
    async fn next_job(&self) -> Result<JobPoll> {
        Ok(match self.pending.lock().take() {
            Some(job) => JobPoll::Ready(job),
            None => JobPoll::Closed,
        })
    }

    async fn complete(&self, job: &Job, result: &JobResult) -> Result<()> {
        if self.echo {
            let rendered = serde_json::to_string_pretty(result)
                .map_err(|e| Error::RuntimeError(format!("Failed to render result: {}", e)))?;
            println!("{}", rendered);
        }
        self.results.lock().push((job.id.clone(), result.clone()));
        Ok(())
    }
}
