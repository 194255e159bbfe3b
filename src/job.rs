//! Job contract shared with the serverless queue
//!
//! A job arrives as `{"id": ..., "input": {...}}`. The input is untyped at the
//! boundary and is only trusted after [`JobInput::parse`].

use crate::config::GenerationSettings;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message returned when a job carries no usable prompt
pub const MISSING_PROMPT: &str = "Missing required parameter: 'prompt'";

/// A unit of work delivered by the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "default_job_id")]
    pub id: String,
    #[serde(default)]
    pub input: Value,
}

fn default_job_id() -> String {
    "local_test".to_string()
}

/// Response value for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobResult {
    Success { output: String },
    Error { error: String },
}

impl JobResult {
    pub fn success(output: impl Into<String>) -> Self {
        JobResult::Success { output: output.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        JobResult::Error { error: message.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success { .. })
    }
}

impl From<Result<String>> for JobResult {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(output) => JobResult::success(output),
            Err(err) => JobResult::error(err.to_string()),
        }
    }
}

/// Validated job input with defaults applied
#[derive(Debug, Clone, PartialEq)]
pub struct JobInput {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<u64>,
}

impl JobInput {
    /// Extract and check the job's parameters.
    ///
    /// `null` for an optional parameter selects its default; unknown keys are
    /// ignored.
    pub fn parse(input: &Value, defaults: &GenerationSettings) -> Result<Self> {
        let empty = Map::new();
        let fields = match input {
            Value::Object(fields) => fields,
            Value::Null => &empty,
            _ => return Err(Error::ValidationError("Job input must be a JSON object".to_string())),
        };

        let prompt = match fields.get("prompt") {
            None | Some(Value::Null) => return Err(Error::ValidationError(MISSING_PROMPT.to_string())),
            Some(Value::String(prompt)) if prompt.is_empty() => {
                return Err(Error::ValidationError(MISSING_PROMPT.to_string()))
            }
            Some(Value::String(prompt)) => prompt.clone(),
            Some(_) => {
                return Err(Error::ValidationError(
                    "Invalid parameter 'prompt': expected a string".to_string(),
                ))
            }
        };

        let max_tokens = match optional(fields, "max_tokens") {
            None => defaults.max_tokens,
            Some(value) => {
                let max_tokens = value
                    .as_u64()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| invalid("max_tokens", "expected a positive integer"))?;
                if max_tokens > defaults.max_tokens_limit as u64 {
                    return Err(invalid(
                        "max_tokens",
                        &format!("must be at most {}", defaults.max_tokens_limit),
                    ));
                }
                max_tokens as usize
            }
        };

        let temperature = match optional(fields, "temperature") {
            None => defaults.temperature,
            Some(value) => value
                .as_f64()
                .filter(|t| t.is_finite() && *t > 0.0 && *t <= defaults.max_temperature)
                .ok_or_else(|| {
                    invalid(
                        "temperature",
                        &format!("must be a number greater than 0 and at most {}", defaults.max_temperature),
                    )
                })?,
        };

        let top_p = match optional(fields, "top_p") {
            None => defaults.top_p,
            Some(value) => value
                .as_f64()
                .filter(|p| p.is_finite() && *p > 0.0 && *p <= 1.0)
                .ok_or_else(|| invalid("top_p", "must be a number greater than 0 and at most 1"))?,
        };

        let seed = match optional(fields, "seed") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .ok_or_else(|| invalid("seed", "expected a non-negative integer"))?,
            ),
        };

        Ok(Self {
            prompt,
            max_tokens,
            temperature,
            top_p,
            seed,
        })
    }
}

fn optional<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    fields.get(key).filter(|value| !value.is_null())
}

fn invalid(parameter: &str, reason: &str) -> Error {
    Error::ValidationError(format!("Invalid parameter '{}': {}", parameter, reason))
}
