pub mod assembler;
pub mod metrics;
mod producer;
mod tokenize;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

pub use assembler::{
    Fragment, Generation, RequestPhase, StreamEvent, collect_blocking, event_stream,
};
pub use metrics::{MetricsRecord, RequestTimeline, ResponseMode};
pub use producer::{ProducerExit, ProducerHandle, spawn_producer};
pub use tokenize::{Tokenized, TokenizerPool};

use crate::{
    config::AppConfig,
    engine::{GenerationEngine, SamplingParams},
    error::ServiceError,
    types::GenerationRequest,
};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub defaults: SamplingParams,
    pub channel_capacity: usize,
    pub fragment_timeout: Duration,
    pub producer_join_timeout: Duration,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            defaults: SamplingParams {
                max_new_tokens: config.max_new_tokens,
                temperature: config.temperature,
                top_p: config.top_p,
            },
            channel_capacity: config.channel_capacity.max(1),
            fragment_timeout: config.fragment_timeout,
            producer_join_timeout: config.producer_join_timeout,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    settings: PipelineSettings,
    tokenizer: TokenizerPool,
    generation_limit: Option<Arc<Semaphore>>,
}

impl Pipeline {
    pub fn new(config: &AppConfig) -> Self {
        let generation_limit = match config.generation_workers {
            0 => None,
            workers => Some(Arc::new(Semaphore::new(workers))),
        };
        Self {
            settings: PipelineSettings::from(config),
            tokenizer: TokenizerPool::new(config.tokenizer_workers),
            generation_limit,
        }
    }

    pub async fn start(
        &self,
        engine: Arc<dyn GenerationEngine>,
        request: GenerationRequest,
    ) -> Result<Generation, ServiceError> {
        let request_id = Uuid::new_v4();
        let mut timeline = RequestTimeline::new(Instant::now());
        debug!(%request_id, phase = ?RequestPhase::Received, "request accepted");

        let params = request.sampling_params(&self.settings.defaults)?;

        debug!(%request_id, phase = ?RequestPhase::Tokenizing, "tokenizing prompt");
        let tokenized = self
            .tokenizer
            .tokenize(engine.clone(), request.prompt)
            .await
            .inspect_err(|err| {
                debug!(
                    %request_id,
                    phase = ?RequestPhase::Error,
                    error = %err,
                    "tokenization failed"
                );
            })?;
        timeline.record_tokenization(tokenized.started, tokenized.finished);

        let permit = match &self.generation_limit {
            Some(limit) => Some(
                limit
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ServiceError::Other("generation limiter closed".into()))?,
            ),
            None => None,
        };

        let prompt_tokens = tokenized.tokens.len();
        let (sink, fragments) = flume::bounded(self.settings.channel_capacity);
        let producer = spawn_producer(request_id, engine, tokenized.tokens, params, sink, permit)?;
        debug!(%request_id, phase = ?RequestPhase::Generating, prompt_tokens, "producer started");

        Ok(Generation::new(
            request_id,
            timeline,
            fragments,
            producer,
            self.settings.fragment_timeout,
            self.settings.producer_join_timeout,
        ))
    }
}
