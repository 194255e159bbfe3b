//! Model runtime abstraction
//!
//! The worker never touches tensors directly: a [`ModelProvider`] loads a
//! tokenizer and a model for a hub identifier, and hands back handles the
//! inference service drives.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod candle_engine;
pub mod precision;

pub use candle_engine::CandleProvider;
pub use precision::{DevicePolicy, Precision};

/// Loads tokenizers and models for a hub identifier
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Load the tokenizer published with `model_id`
    async fn load_tokenizer(&self, model_id: &str, credential: &str) -> Result<Arc<dyn TokenizerHandle>>;

    /// Load the model weights for `model_id` at `precision`, placed per `device`
    async fn load_model(
        &self,
        model_id: &str,
        credential: &str,
        precision: Precision,
        device: DevicePolicy,
    ) -> Result<Arc<dyn ModelHandle>>;
}

/// Text to token conversion for a loaded model
pub trait TokenizerHandle: Send + Sync {
    /// Encode text, including the model's leading special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode tokens back to text
    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Tokens that end a generated sequence
    fn eos_token_ids(&self) -> Vec<u32>;
}

/// A loaded generation model
pub trait ModelHandle: Send + Sync {
    /// Run generation to completion.
    ///
    /// Blocks for the whole generation. Returns the full sequence: the
    /// prompt tokens followed by the generated ones.
    fn generate(&self, prompt_tokens: &[u32], request: &GenerationRequest) -> Result<Vec<u32>>;

    /// Model information
    fn model_info(&self) -> ModelInfo;
}

/// Model information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub architecture: String,
    pub device: String,
    pub precision: String,
    pub vocab_size: usize,
    pub context_length: usize,
}

/// Generation request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    /// Sample from the distribution; greedy decoding when false
    pub do_sample: bool,
    pub seed: Option<u64>,
    /// Generation stops after emitting any of these
    pub stop_tokens: Vec<u32>,
}
