use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    engine::GenerationEngine,
    error::ServiceError,
    pipeline::{
        Generation, MetricsRecord, Pipeline, StreamEvent, collect_blocking, event_stream,
        metrics::round2,
    },
    types::GenerationRequest,
};

const MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchmarkRequest {
    pub prompts: Option<Vec<String>>,
    pub iterations: Option<usize>,
    pub max_new_tokens: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleReport {
    pub prompt: String,
    pub iteration: usize,
    pub blocking: MetricsRecord,
    pub streaming: MetricsRecord,
    pub texts_match: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModeSummary {
    pub avg_ttft_ms: f64,
    pub avg_latency_ms: f64,
    pub avg_prefill_ms: f64,
    pub avg_decode_ms: f64,
    pub avg_decode_tokens_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateMetrics {
    pub blocking: ModeSummary,
    pub streaming: ModeSummary,
    pub text_match_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub samples: Vec<SampleReport>,
    pub aggregate: AggregateMetrics,
}

// One request at a time so the two modes never compete for the engine.
pub async fn run_benchmark(
    pipeline: &Pipeline,
    engine: Arc<dyn GenerationEngine>,
    request: BenchmarkRequest,
) -> Result<BenchmarkReport, ServiceError> {
    let prompts = request.prompts.unwrap_or_else(fallback_prompts);
    if prompts.is_empty() {
        return Err(ServiceError::BadRequest(
            "at least one benchmark prompt is required".into(),
        ));
    }
    let iterations = request.iterations.unwrap_or(1);
    if iterations == 0 || iterations > MAX_ITERATIONS {
        return Err(ServiceError::BadRequest(format!(
            "iterations must be between 1 and {MAX_ITERATIONS}"
        )));
    }

    info!(prompts = prompts.len(), iterations, "running latency benchmark");

    let mut samples = Vec::with_capacity(prompts.len() * iterations);
    for iteration in 0..iterations {
        for prompt in &prompts {
            let make_request = || GenerationRequest {
                max_new_tokens: request.max_new_tokens,
                ..GenerationRequest::new(prompt.clone())
            };

            let blocking =
                collect_blocking(pipeline.start(engine.clone(), make_request()).await?).await;
            let (streamed_text, streaming) =
                drain_stream(pipeline.start(engine.clone(), make_request()).await?).await?;

            samples.push(SampleReport {
                prompt: prompt.clone(),
                iteration,
                texts_match: blocking.text == streamed_text,
                blocking: blocking.metrics,
                streaming,
            });
        }
    }

    let aggregate = summarize(&samples);
    Ok(BenchmarkReport { samples, aggregate })
}

async fn drain_stream(
    generation: Generation,
) -> Result<(String, MetricsRecord), ServiceError> {
    let events: Vec<StreamEvent> = event_stream(generation).collect().await;

    let mut text = String::new();
    let mut metrics = None;
    for event in events {
        match event {
            StreamEvent::Token(token) => text.push_str(&token.text),
            StreamEvent::Metrics(record) => metrics = Some(record),
            StreamEvent::Error(message) => return Err(ServiceError::Other(message)),
            StreamEvent::Start(_) | StreamEvent::Done => {}
        }
    }

    let metrics =
        metrics.ok_or_else(|| ServiceError::Other("stream ended without metrics".into()))?;
    Ok((text, metrics))
}

pub fn fallback_prompts() -> Vec<String> {
    vec![
        "Explain the difference between prefill and decode in transformer inference.".to_string(),
        "Summarize the rust borrow checker in one sentence.".to_string(),
        "Write a haiku about waiting for the first token.".to_string(),
    ]
}

fn summarize(samples: &[SampleReport]) -> AggregateMetrics {
    let matches = samples.iter().filter(|s| s.texts_match).count();
    let text_match_rate = if samples.is_empty() {
        0.0
    } else {
        matches as f64 / samples.len() as f64
    };

    AggregateMetrics {
        blocking: summarize_mode(samples.iter().map(|s| &s.blocking)),
        streaming: summarize_mode(samples.iter().map(|s| &s.streaming)),
        text_match_rate: round2(text_match_rate),
    }
}

fn summarize_mode<'a, I>(records: I) -> ModeSummary
where
    I: Iterator<Item = &'a MetricsRecord> + Clone,
{
    ModeSummary {
        avg_ttft_ms: mean(records.clone().map(|r| r.ttft_ms)),
        avg_latency_ms: mean(records.clone().map(|r| r.latency_ms)),
        avg_prefill_ms: mean(records.clone().map(|r| r.prefill_ms)),
        avg_decode_ms: mean(records.clone().map(|r| r.decode_ms)),
        avg_decode_tokens_per_second: mean(records.map(|r| r.decode_tokens_per_second)),
    }
}

fn mean<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut acc = 0.0;
    for value in values {
        count += 1;
        acc += value;
    }
    if count == 0 { 0.0 } else { round2(acc / count as f64) }
}
