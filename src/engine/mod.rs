mod slot;
mod synthetic;
#[cfg(feature = "tch-backend")]
mod torch;

use std::ops::ControlFlow;

use serde::Serialize;
use thiserror::Error;

pub use slot::{EngineSlot, LoadTimings, WarmupMetrics, load_engine};
pub use synthetic::{Script, SyntheticEngine};
#[cfg(feature = "tch-backend")]
pub use torch::TorchEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model execution failed: {0}")]
    Inference(String),
    #[error("model load failed: {0}")]
    Load(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    ids: Vec<u32>,
    pieces: Vec<String>,
}

impl TokenBatch {
    pub fn new(ids: Vec<u32>, pieces: Vec<String>) -> Self {
        Self { ids, pieces }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn pieces(&self) -> &[String] {
        &self.pieces
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
}

impl SamplingParams {
    pub fn warmup() -> Self {
        Self {
            max_new_tokens: 2,
            temperature: 0.0,
            top_p: 1.0,
        }
    }
}

pub trait GenerationEngine: Send + Sync {
    fn tokenize(&self, prompt: &str) -> Result<TokenBatch, EngineError>;

    /// `Break` from `on_fragment` means nobody is listening and generation should stop.
    fn generate(
        &self,
        tokens: TokenBatch,
        params: &SamplingParams,
        on_fragment: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<(), EngineError>;
}
