//! Bundled text-mode backend: a local Llama export run with candle.
//!
//! Epistemic foundation:
//! - K_i: Weights, config and tokenizer come from one local export directory
//! - K_i: Each forward pass re-reads the full sequence (KV caching off),
//!   so an input grown by the classifier needs no extra bookkeeping
//! - K_i: With KV caching off the cache only holds rotary tables and causal
//!   masks, so one cache serves every forward pass
//! - I^B: Accelerator availability is unknowable up front → CPU fallback

use super::{EncodedInput, LanguageModel, Processor};
use crate::models::{ModelConfig, ModelDtype, Result, SieveError};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config as LlamaRuntimeConfig, Llama, LlamaConfig};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{info, warn};

/// Pick the execution device for a model config.
pub fn select_device(config: &ModelConfig) -> Result<Device> {
    if config.cpu {
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    if device.is_cpu() {
        warn!("CUDA not available, running on CPU");
    }
    Ok(device)
}

/// Weight dtype for a device; half precision falls back to f32 on CPU.
pub fn select_dtype(dtype: ModelDtype, device: &Device) -> DType {
    match (dtype, device.is_cpu()) {
        (ModelDtype::F32, _) => DType::F32,
        (_, true) => {
            warn!(requested = ?dtype, "Half precision is not used on CPU, falling back to f32");
            DType::F32
        }
        (ModelDtype::F16, false) => DType::F16,
        (ModelDtype::Bf16, false) => DType::BF16,
    }
}

/// Collect the safetensors shards of an export, in name order.
pub fn find_safetensors(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("*.safetensors");
    let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| SieveError::Internal(format!("Invalid glob pattern: {e}")))?
        .filter_map(|r| r.ok())
        .collect();

    if paths.is_empty() {
        return Err(SieveError::WeightsNotFound(dir.to_path_buf()));
    }
    paths.sort();
    Ok(paths)
}

/// Llama causal language model.
pub struct LlamaModel {
    model: Llama,
    cache: Cache,
    device: Device,
}

impl LlamaModel {
    /// Load the model from a local export directory.
    pub fn load(dir: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let raw = std::fs::read(dir.join("config.json"))
            .map_err(|e| SieveError::io("reading model config.json", e))?;
        let llama_config: LlamaConfig = serde_json::from_slice(&raw)
            .map_err(|e| SieveError::ParseError(format!("Invalid model config.json: {e}")))?;
        let config = llama_config.into_config(false);

        let shards = find_safetensors(dir)?;
        info!(dir = %dir.display(), shards = shards.len(), ?dtype, "Loading model weights");

        // SAFETY: the shards are not modified while the model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&shards, dtype, device)? };
        Self::from_var_builder(vb, &config, dtype, device)
    }

    /// Build the model from already resolved weights.
    pub fn from_var_builder(
        vb: VarBuilder,
        config: &LlamaRuntimeConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let model = Llama::load(vb, config)?;
        let cache = Cache::new(false, dtype, config, device)?;

        Ok(Self {
            model,
            cache,
            device: device.clone(),
        })
    }

    /// Device the weights live on.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl LanguageModel for LlamaModel {
    fn forward(&mut self, input: &EncodedInput) -> Result<Tensor> {
        Ok(self.model.forward(input.input_ids(), 0, &mut self.cache)?)
    }
}

/// Render a single-turn Llama 3 chat with the assistant header open.
pub fn llama3_chat(system: &str, user: &str) -> String {
    format!(
        "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>\
         <|start_header_id|>user<|end_header_id|>\n\n{user}<|eot_id|>\
         <|start_header_id|>assistant<|end_header_id|>\n\n"
    )
}

/// Tokenizer-backed processor applying the Llama 3 chat format.
pub struct ChatProcessor {
    tokenizer: Tokenizer,
    system_prompt: String,
    device: Device,
}

impl ChatProcessor {
    /// Load `tokenizer.json` from a local export directory.
    pub fn load(dir: &Path, system_prompt: impl Into<String>, device: &Device) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(dir.join("tokenizer.json")).map_err(SieveError::tokenizer)?;
        Ok(Self::new(tokenizer, system_prompt, device))
    }

    pub fn new(tokenizer: Tokenizer, system_prompt: impl Into<String>, device: &Device) -> Self {
        Self {
            tokenizer,
            system_prompt: system_prompt.into(),
            device: device.clone(),
        }
    }
}

impl Processor for ChatProcessor {
    fn encode(&self, prompt: &str, image: Option<&DynamicImage>) -> Result<EncodedInput> {
        if image.is_some() {
            return Err(SieveError::InvalidInput(
                "ChatProcessor is text-only and cannot encode images".to_string(),
            ));
        }

        let chat = llama3_chat(&self.system_prompt, prompt);
        let encoding = self
            .tokenizer
            .encode(chat, false)
            .map_err(SieveError::tokenizer)?;
        EncodedInput::from_ids(encoding.get_ids(), &self.device)
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(SieveError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Load the bundled model and processor described by a model config.
pub fn load_text_backend(config: &ModelConfig) -> Result<(LlamaModel, ChatProcessor)> {
    let device = select_device(config)?;
    let dtype = select_dtype(config.dtype, &device);
    let model = LlamaModel::load(&config.dir, dtype, &device)?;
    let processor = ChatProcessor::load(&config.dir, config.system_prompt.clone(), &device)?;
    Ok((model, processor))
}
