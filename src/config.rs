//! Configuration management for the MedGemma worker.
//!
//! Configuration is loaded from multiple sources, later sources overriding
//! earlier ones:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/medgemma-worker/config.toml`)
//! 3. User-specified configuration file (`--config`)
//! 4. Environment variables (prefixed with `MEDGEMMA__`, e.g. `MEDGEMMA__MODEL__DEVICE=cpu`)
//! 5. Command-line arguments
//!
//! # Environment Variables
//!
//! Secrets and queue endpoints are not part of this file's schema and are read
//! from their well-known variables:
//! - `HF_TOKEN` - Hugging Face access token (name configurable via `model.token_env`)
//! - `RUNPOD_WEBHOOK_GET_JOB`, `RUNPOD_WEBHOOK_POST_OUTPUT`, `RUNPOD_WEBHOOK_PING`,
//!   `RUNPOD_AI_API_KEY`, `RUNPOD_POD_ID` - job queue endpoints, see [`crate::worker::http`]

use crate::cli::LoggingConfig;
use crate::error::{Error, Result};
use crate::runtime::{DevicePolicy, Precision};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[command(author, version, about = "Serverless MedGemma text-generation worker", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Hugging Face model identifier
    #[arg(long)]
    pub model_id: Option<String>,

    /// Device placement (auto, cpu, cuda, cuda:N)
    #[arg(long)]
    pub device: Option<String>,

    /// Weight precision (bf16, f16, f32)
    #[arg(long)]
    pub precision: Option<String>,

    /// Run a single job from this JSON document and exit
    #[arg(long, value_name = "JSON")]
    pub test_input: Option<String>,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

/// Worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Model loading settings
    #[serde(default)]
    pub model: ModelSettings,
    /// Generation defaults and limits
    #[serde(default)]
    pub generation: GenerationSettings,
    /// Job loop settings
    #[serde(default)]
    pub runtime: RuntimeSettings,
}

/// Model loading settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Hub repository of the model
    #[serde(default = "default_model_id")]
    pub id: String,
    /// Environment variable holding the access token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Weight precision
    #[serde(default)]
    pub precision: Precision,
    /// Device placement policy
    #[serde(default)]
    pub device: DevicePolicy,
    /// Hub revision (branch, tag or commit); `main` when unset
    #[serde(default)]
    pub revision: Option<String>,
    /// Download cache for tokenizer, config and weights
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            token_env: default_token_env(),
            precision: Precision::default(),
            device: DevicePolicy::default(),
            revision: None,
            cache_dir: None,
        }
    }
}

/// Generation defaults applied to job inputs, and the bounds they are checked against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Largest `max_tokens` a job may request
    #[serde(default = "default_max_tokens_limit")]
    pub max_tokens_limit: usize,
    /// Largest `temperature` a job may request
    #[serde(default = "default_max_temperature")]
    pub max_temperature: f64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens_limit: default_max_tokens_limit(),
            max_temperature: default_max_temperature(),
        }
    }
}

/// Job loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Delay before polling again after a queue error
    #[serde(default = "default_poll_backoff_ms")]
    pub poll_backoff_ms: u64,
    /// Heartbeat interval, overridden by `RUNPOD_PING_INTERVAL`
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// How long a job request already in flight at shutdown may still finish
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// File picked up as a single local job when no queue is configured
    #[serde(default = "default_test_input_path")]
    pub test_input_path: PathBuf,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_backoff_ms: default_poll_backoff_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            test_input_path: default_test_input_path(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/medgemma-worker/config.toml").required(false));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MEDGEMMA")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: WorkerConfig = builder.build()?.try_deserialize()?;

        if let Some(model_id) = &args.model_id {
            config.model.id = model_id.clone();
        }
        if let Some(device) = &args.device {
            config.model.device = device.parse()?;
        }
        if let Some(precision) = &args.precision {
            config.model.precision = precision.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.model.id.trim().is_empty() {
            return Err(Error::ConfigurationError("model.id must not be empty".to_string()));
        }
        if self.model.token_env.trim().is_empty() {
            return Err(Error::ConfigurationError(
                "model.token_env must name an environment variable".to_string(),
            ));
        }
        let generation = &self.generation;
        if generation.max_tokens == 0 || generation.max_tokens > generation.max_tokens_limit {
            return Err(Error::ConfigurationError(format!(
                "generation.max_tokens must be between 1 and {}",
                generation.max_tokens_limit
            )));
        }
        if !(generation.temperature > 0.0 && generation.temperature <= generation.max_temperature) {
            return Err(Error::ConfigurationError(format!(
                "generation.temperature must be in (0, {}]",
                generation.max_temperature
            )));
        }
        if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
            return Err(Error::ConfigurationError(
                "generation.top_p must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_model_id() -> String {
    "google/medgemma-27b-text-it".to_string()
}

fn default_token_env() -> String {
    "HF_TOKEN".to_string()
}

fn default_max_tokens() -> usize {
    512
}

fn default_temperature() -> f64 {
    0.7
}

fn default_top_p() -> f64 {
    0.9
}

fn default_max_tokens_limit() -> usize {
    8192
}

fn default_max_temperature() -> f64 {
    2.0
}

fn default_poll_backoff_ms() -> u64 {
    1000
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

fn default_test_input_path() -> PathBuf {
    PathBuf::from("test_input.json")
}
