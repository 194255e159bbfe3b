//! Candle-based model provider
//!
//! Downloads tokenizer, config and safetensors weights from the Hugging Face
//! Hub and runs Gemma 3 generation with a KV cache.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::gemma3::{Config as Gemma3Config, Model as Gemma3Model};
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;

use crate::config::ModelSettings;

use super::{
    DevicePolicy, GenerationRequest, ModelHandle, ModelInfo, ModelProvider, Precision, TokenizerHandle,
};

/// Tokens Gemma emits to end a turn or a document
const EOS_TOKENS: &[&str] = &["<eos>", "<end_of_turn>"];

/// Provider backed by candle and the Hugging Face Hub
#[derive(Debug, Clone, Default)]
pub struct CandleProvider {
    revision: Option<String>,
    /// Hub cache location; the hf-hub default when unset
    cache_dir: Option<PathBuf>,
}

impl CandleProvider {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            revision: settings.revision.clone(),
            cache_dir: settings.cache_dir.clone(),
        }
    }

    fn repo(&self, model_id: &str, credential: &str) -> Result<ApiRepo> {
        let mut builder = ApiBuilder::new().with_token(Some(credential.to_string()));
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api = builder
            .build()
            .map_err(|e| anyhow!("Failed to initialize HF API: {}", e))?;

        let repo = match &self.revision {
            Some(revision) => Repo::with_revision(model_id.to_string(), RepoType::Model, revision.clone()),
            None => Repo::model(model_id.to_string()),
        };
        Ok(api.repo(repo))
    }
}

#[async_trait]
impl ModelProvider for CandleProvider {
    async fn load_tokenizer(&self, model_id: &str, credential: &str) -> Result<Arc<dyn TokenizerHandle>> {
        let repo = self.repo(model_id, credential)?;
        let path = repo
            .get("tokenizer.json")
            .await
            .with_context(|| format!("Failed to download tokenizer for {}", model_id))?;

        let tokenizer = Tokenizer::from_file(&path).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let eos_token_ids: Vec<u32> = EOS_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect();
        if eos_token_ids.is_empty() {
            tracing::warn!("Tokenizer for {} has no known end-of-sequence token", model_id);
        }

        tracing::debug!(vocab_size = tokenizer.get_vocab_size(true), "Tokenizer loaded");
        Ok(Arc::new(CandleTokenizer {
            tokenizer,
            eos_token_ids,
        }))
    }

    async fn load_model(
        &self,
        model_id: &str,
        credential: &str,
        precision: Precision,
        device: DevicePolicy,
    ) -> Result<Arc<dyn ModelHandle>> {
        let device = device.resolve()?;
        let effective = precision.effective_for(&device);
        if effective != precision {
            tracing::warn!("{} is not supported on {:?}, loading weights as {}", precision, device, effective);
        }

        let repo = self.repo(model_id, credential)?;
        let config_path = repo
            .get("config.json")
            .await
            .with_context(|| format!("Failed to download config for {}", model_id))?;
        let config: Gemma3Config = serde_json::from_str(&tokio::fs::read_to_string(&config_path).await?)
            .context("Unsupported model config")?;

        let weight_files = download_safetensors(&repo).await?;
        tracing::info!(
            "Loading {} weight file(s) for {} as {} on {:?}",
            weight_files.len(),
            model_id,
            effective,
            device
        );

        let info = ModelInfo {
            name: model_id.to_string(),
            architecture: "gemma3".to_string(),
            device: format!("{:?}", device),
            precision: effective.to_string(),
            vocab_size: config.vocab_size,
            context_length: config.max_position_embeddings,
        };

        let load_device = device.clone();
        let model = tokio::task::spawn_blocking(move || -> Result<Gemma3Model> {
            // SAFETY: the hub cache files are not modified while mapped.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weight_files, effective.dtype(), &load_device)? };
            Ok(Gemma3Model::new(false, &config, vb)?)
        })
        .await
        .map_err(|e| anyhow!("Model loading task failed: {}", e))??;

        Ok(Arc::new(CandleModel {
            model: Mutex::new(model),
            device,
            info,
        }))
    }
}

/// Fetch every safetensors shard listed by the index, or the single-file checkpoint
async fn download_safetensors(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let index_path = match repo.get("model.safetensors.index.json").await {
        Ok(path) => path,
        Err(_) => {
            let single = repo
                .get("model.safetensors")
                .await
                .context("Failed to download model.safetensors")?;
            return Ok(vec![single]);
        }
    };

    let index: serde_json::Value = serde_json::from_str(&tokio::fs::read_to_string(&index_path).await?)?;
    let mut paths = Vec::new();
    for (idx, file) in weight_files_from_index(&index)?.iter().enumerate() {
        tracing::debug!("Fetching shard {}: {}", idx + 1, file);
        paths.push(
            repo.get(file)
                .await
                .with_context(|| format!("Failed to download {}", file))?,
        );
    }
    Ok(paths)
}

/// Unique shard file names referenced by a `model.safetensors.index.json`
fn weight_files_from_index(index: &serde_json::Value) -> Result<Vec<String>> {
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| anyhow!("model.safetensors.index.json has no weight_map"))?;

    let mut files: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

struct CandleTokenizer {
    tokenizer: Tokenizer,
    eos_token_ids: Vec<u32>,
}

impl TokenizerHandle for CandleTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(|e| anyhow!("Decoding failed: {}", e))
    }

    fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_ids.clone()
    }
}

struct CandleModel {
    /// Forward passes mutate the KV cache
    model: Mutex<Gemma3Model>,
    device: Device,
    info: ModelInfo,
}

impl ModelHandle for CandleModel {
    fn generate(&self, prompt_tokens: &[u32], request: &GenerationRequest) -> Result<Vec<u32>> {
        if prompt_tokens.is_empty() {
            bail!("Cannot generate from an empty prompt");
        }
        if prompt_tokens.len() >= self.info.context_length {
            bail!(
                "Prompt is {} tokens, the model context is {} tokens",
                prompt_tokens.len(),
                self.info.context_length
            );
        }
        let max_new_tokens = request
            .max_new_tokens
            .min(self.info.context_length - prompt_tokens.len());

        let sampling = if request.do_sample {
            Sampling::TopP {
                p: request.top_p,
                temperature: request.temperature,
            }
        } else {
            Sampling::ArgMax
        };
        let seed = request.seed.unwrap_or_else(rand::random);
        let mut logits_processor = LogitsProcessor::from_sampling(seed, sampling);

        let mut model = self.model.lock();
        model.clear_kv_cache();

        let mut tokens = prompt_tokens.to_vec();
        let mut index_pos = 0;
        for step in 0..max_new_tokens {
            let context_size = if step == 0 { tokens.len() } else { 1 };
            let context = &tokens[tokens.len() - context_size..];
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input, index_pos)?;
            let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
            index_pos += context_size;

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);
            if request.stop_tokens.contains(&next_token) {
                break;
            }
        }

        tracing::debug!(
            "Generated {} tokens (limit {})",
            tokens.len() - prompt_tokens.len(),
            max_new_tokens
        );
        Ok(tokens)
    }

    fn model_info(&self) -> ModelInfo {
        self.info.clone()
    }
}
