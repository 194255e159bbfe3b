//! Shared test doubles for the inference service and worker tests

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use medgemma_worker::config::WorkerConfig;
use medgemma_worker::runtime::{
    DevicePolicy, GenerationRequest, ModelHandle, ModelInfo, ModelProvider, Precision, TokenizerHandle,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const OOM_MESSAGE: &str = "CUDA out of memory. Tried to allocate 2.00 GiB";

/// Worker config whose credential lives in `token_env`, set to a dummy token
pub fn config_with_token(token_env: &str) -> WorkerConfig {
    std::env::set_var(token_env, "hf_test_token");
    config_without_token(token_env)
}

/// Worker config whose credential variable is guaranteed unset
pub fn config_without_token(token_env: &str) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.model.token_env = token_env.to_string();
    config
}

/// One token per byte; token 0 is end-of-sequence
pub struct ByteTokenizer;

impl TokenizerHandle for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|t| !(skip_special_tokens && **t == 0))
            .map(|t| *t as u8)
            .collect();
        String::from_utf8(bytes).map_err(|e| anyhow!("invalid utf-8: {}", e))
    }

    fn eos_token_ids(&self) -> Vec<u32> {
        vec![0]
    }
}

#[derive(Default)]
pub struct Counters {
    pub tokenizer_loads: AtomicUsize,
    pub model_loads: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub last_request: Mutex<Option<GenerationRequest>>,
    pub last_credential: Mutex<Option<String>>,
    pub last_precision: Mutex<Option<Precision>>,
}

/// Model that echoes the prompt followed by a fixed completion and EOS
pub struct EchoModel {
    suffix: String,
    panic_on_generate: bool,
    counters: Arc<Counters>,
}

impl ModelHandle for EchoModel {
    fn generate(&self, prompt_tokens: &[u32], request: &GenerationRequest) -> Result<Vec<u32>> {
        self.counters.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_request.lock() = Some(request.clone());
        if self.panic_on_generate {
            panic!("generation kernel crashed");
        }

        let mut tokens = prompt_tokens.to_vec();
        tokens.extend(self.suffix.bytes().map(u32::from));
        tokens.push(0);
        Ok(tokens)
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "stub".to_string(),
            architecture: "echo".to_string(),
            device: "Cpu".to_string(),
            precision: "f32".to_string(),
            vocab_size: 256,
            context_length: 4096,
        }
    }
}

/// Provider with scripted load behaviour
pub struct StubProvider {
    pub counters: Arc<Counters>,
    suffix: String,
    failing_model_loads: AtomicUsize,
    load_delay: Duration,
    panic_on_generate: bool,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            suffix: " [gen]".to_string(),
            failing_model_loads: AtomicUsize::new(0),
            load_delay: Duration::ZERO,
            panic_on_generate: false,
        }
    }

    /// The first `count` model loads fail with an out-of-memory error
    pub fn failing_model_loads(self, count: usize) -> Self {
        self.failing_model_loads.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic_on_generate = true;
        self
    }

    pub fn tokenizer_loads(&self) -> usize {
        self.counters.tokenizer_loads.load(Ordering::SeqCst)
    }

    pub fn model_loads(&self) -> usize {
        self.counters.model_loads.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.counters.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.counters.last_request.lock().clone()
    }
}

#[async_trait]
impl ModelProvider for StubProvider {
    async fn load_tokenizer(&self, _model_id: &str, credential: &str) -> Result<Arc<dyn TokenizerHandle>> {
        self.counters.tokenizer_loads.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_credential.lock() = Some(credential.to_string());
        Ok(Arc::new(ByteTokenizer))
    }

    async fn load_model(
        &self,
        _model_id: &str,
        _credential: &str,
        precision: Precision,
        _device: DevicePolicy,
    ) -> Result<Arc<dyn ModelHandle>> {
        self.counters.model_loads.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_precision.lock() = Some(precision);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        let remaining = self.failing_model_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_model_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!(OOM_MESSAGE));
        }

        Ok(Arc::new(EchoModel {
            suffix: self.suffix.clone(),
            panic_on_generate: self.panic_on_generate,
            counters: Arc::clone(&self.counters),
        }))
    }
}
