//! Inference service
//!
//! Owns the process-wide model and tokenizer, loads them at most once, and
//! turns one job input into one [`JobResult`].
//!
//! Loading goes through an async once-cell: concurrent first requests wait on
//! a single load, and a failed load leaves the cell empty so the next request
//! retries it.

use crate::config::{GenerationSettings, ModelSettings, WorkerConfig};
use crate::error::{Error, Result};
use crate::job::{JobInput, JobResult};
use crate::runtime::{GenerationRequest, ModelHandle, ModelInfo, ModelProvider, TokenizerHandle};
use anyhow::anyhow;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Tokenizer and model, only ever stored together
struct LoadedModel {
    tokenizer: Arc<dyn TokenizerHandle>,
    model: Arc<dyn ModelHandle>,
}

pub struct InferenceService {
    provider: Arc<dyn ModelProvider>,
    model: ModelSettings,
    generation: GenerationSettings,
    state: OnceCell<LoadedModel>,
}

impl InferenceService {
    pub fn new(provider: Arc<dyn ModelProvider>, config: &WorkerConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            generation: config.generation.clone(),
            state: OnceCell::new(),
        }
    }

    /// Whether the model and tokenizer are loaded
    pub fn is_ready(&self) -> bool {
        self.state.initialized()
    }

    /// Information about the loaded model, if any
    pub fn model_info(&self) -> Option<ModelInfo> {
        self.state.get().map(|loaded| loaded.model.model_info())
    }

    /// Load the model and tokenizer unless already loaded.
    ///
    /// Provider errors are returned unchanged; the caller decides whether
    /// they are fatal.
    pub async fn initialize(&self) -> Result<()> {
        self.loaded().await.map(|_| ())
    }

    async fn loaded(&self) -> Result<&LoadedModel> {
        self.state.get_or_try_init(|| self.load()).await
    }

    async fn load(&self) -> Result<LoadedModel> {
        let credential = read_credential(&self.model.token_env)?;
        let model_id = self.model.id.as_str();

        info!("Loading model: {}", model_id);
        let start = Instant::now();

        let tokenizer = self
            .provider
            .load_tokenizer(model_id, &credential)
            .await
            .map_err(Error::ProviderError)?;
        let model = self
            .provider
            .load_model(model_id, &credential, self.model.precision, self.model.device)
            .await
            .map_err(Error::ProviderError)?;

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model loaded successfully"
        );
        Ok(LoadedModel { tokenizer, model })
    }

    /// Handle one job input. Never fails: every error becomes an error result.
    pub async fn handle(&self, input: &Value) -> JobResult {
        match self.generate(input).await {
            Ok(output) => JobResult::success(output),
            Err(err) => {
                warn!(kind = err.kind(), retryable = err.is_retryable(), "Job failed: {}", err);
                JobResult::error(err.to_string())
            }
        }
    }

    /// Generate the completion for one job input, with the prompt removed.
    pub async fn generate(&self, input: &Value) -> Result<String> {
        let loaded = self.loaded().await?;
        let job = JobInput::parse(input, &self.generation)?;

        debug!(
            prompt_chars = job.prompt.len(),
            max_tokens = job.max_tokens,
            temperature = job.temperature,
            top_p = job.top_p,
            "Generating"
        );

        let tokenizer = Arc::clone(&loaded.tokenizer);
        let model = Arc::clone(&loaded.model);
        let start = Instant::now();
        let output = tokio::task::spawn_blocking(move || generate_text(tokenizer.as_ref(), model.as_ref(), &job))
            .await
            .map_err(|e| Error::GenerationError(anyhow!("Generation task failed: {}", e)))??;

        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Generation finished");
        Ok(output)
    }
}

fn read_credential(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(Error::ConfigurationError(format!(
            "{} environment variable not set. Please set your Hugging Face token to access MedGemma models.",
            var
        ))),
    }
}

fn generate_text(tokenizer: &dyn TokenizerHandle, model: &dyn ModelHandle, job: &JobInput) -> Result<String> {
    let prompt_tokens = tokenizer.encode(&job.prompt).map_err(Error::GenerationError)?;

    let request = GenerationRequest {
        max_new_tokens: job.max_tokens,
        temperature: job.temperature,
        top_p: job.top_p,
        do_sample: true,
        seed: job.seed,
        stop_tokens: tokenizer.eos_token_ids(),
    };
    let output = model
        .generate(&prompt_tokens, &request)
        .map_err(Error::GenerationError)?;

    strip_prompt(tokenizer, &job.prompt, &prompt_tokens, &output)
}

/// Decode only what the model added after the prompt.
///
/// When the output does not start with the prompt tokens, the prompt text is
/// removed only if it is a literal prefix of the decoded output.
fn strip_prompt(
    tokenizer: &dyn TokenizerHandle,
    prompt: &str,
    prompt_tokens: &[u32],
    output: &[u32],
) -> Result<String> {
    let text = match output.strip_prefix(prompt_tokens) {
        Some(generated) => tokenizer.decode(generated, true),
        None => tokenizer.decode(output, true).map(|decoded| match decoded.strip_prefix(prompt) {
            Some(rest) => rest.to_string(),
            None => decoded,
        }),
    }
    .map_err(Error::GenerationError)?;

    Ok(text.trim().to_string())
}
