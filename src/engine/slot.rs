use std::{
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, Instant},
};

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::info;

use super::{EngineError, GenerationEngine, SamplingParams, SyntheticEngine};
use crate::{
    config::{AppConfig, EngineKind},
    error::ServiceError,
    pipeline::metrics::round_ms,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WarmupMetrics {
    pub warmup_tokenization_ms: Option<f64>,
    pub warmup_load_ms: Option<f64>,
    pub warmup_generate_ms: Option<f64>,
    pub warmup_total_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadTimings {
    pub tokenizer: Duration,
    pub model: Duration,
}

struct LoadedEngine {
    engine: Arc<dyn GenerationEngine>,
    warmup: WarmupMetrics,
}

/// Written once by the startup loader, read by every request afterwards.
#[derive(Default)]
pub struct EngineSlot {
    loaded: OnceCell<LoadedEngine>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_engine(engine: Arc<dyn GenerationEngine>) -> Self {
        let slot = Self::new();
        slot.install(engine, WarmupMetrics::default());
        slot
    }

    /// Returns `false` when an engine was already installed; the first one wins.
    pub fn install(&self, engine: Arc<dyn GenerationEngine>, warmup: WarmupMetrics) -> bool {
        self.loaded.set(LoadedEngine { engine, warmup }).is_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.loaded.get().is_some()
    }

    pub fn ready(&self) -> Result<Arc<dyn GenerationEngine>, ServiceError> {
        self.loaded
            .get()
            .map(|loaded| loaded.engine.clone())
            .ok_or(ServiceError::EngineNotReady)
    }

    pub fn warmup(&self) -> WarmupMetrics {
        self.loaded
            .get()
            .map(|loaded| loaded.warmup)
            .unwrap_or_default()
    }
}

pub fn load_engine(
    config: &AppConfig,
) -> Result<(Arc<dyn GenerationEngine>, WarmupMetrics), EngineError> {
    let started = Instant::now();

    let (engine, timings) = match config.engine {
        EngineKind::Synthetic => {
            let engine = SyntheticEngine::echo()
                .with_prefill_delay(config.synthetic_prefill_delay)
                .with_token_delay(config.synthetic_token_delay);
            (Arc::new(engine) as Arc<dyn GenerationEngine>, LoadTimings::default())
        }
        EngineKind::Torch => load_torch(config)?,
    };

    let warmup_started = Instant::now();
    let tokens = engine.tokenize("Hello")?;
    engine.generate(tokens, &SamplingParams::warmup(), &mut |_| {
        ControlFlow::Continue(())
    })?;
    let warmup_generate = warmup_started.elapsed();
    let total = started.elapsed();

    let warmup = WarmupMetrics {
        warmup_tokenization_ms: Some(round_ms(timings.tokenizer)),
        warmup_load_ms: Some(round_ms(timings.model)),
        warmup_generate_ms: Some(round_ms(warmup_generate)),
        warmup_total_ms: Some(round_ms(total)),
    };

    info!(
        engine = ?config.engine,
        tokenizer_ms = ?warmup.warmup_tokenization_ms,
        load_ms = ?warmup.warmup_load_ms,
        warmup_ms = ?warmup.warmup_generate_ms,
        total_ms = ?warmup.warmup_total_ms,
        "model loaded"
    );

    Ok((engine, warmup))
}

#[cfg(feature = "tch-backend")]
fn load_torch(
    config: &AppConfig,
) -> Result<(Arc<dyn GenerationEngine>, LoadTimings), EngineError> {
    let (engine, timings) = super::TorchEngine::load(config)?;
    Ok((Arc::new(engine), timings))
}

#[cfg(not(feature = "tch-backend"))]
fn load_torch(
    _config: &AppConfig,
) -> Result<(Arc<dyn GenerationEngine>, LoadTimings), EngineError> {
    Err(EngineError::Load(
        "torch engine requested but the crate was built without `tch-backend`".into(),
    ))
}
