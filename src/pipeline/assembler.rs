use std::time::{Duration, Instant};

use futures::Stream;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    metrics::{MetricsRecord, RequestTimeline, ResponseMode},
    producer::ProducerHandle,
};
use crate::types::GenerationResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Tokenizing,
    Generating,
    Draining,
    Finalized,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    pub sequence_number: usize,
}

pub struct Generation {
    request_id: Uuid,
    timeline: RequestTimeline,
    fragments: flume::Receiver<String>,
    producer: ProducerHandle,
    delivered: usize,
    pending_whitespace: String,
    exhausted: bool,
    phase: RequestPhase,
    fragment_timeout: Duration,
    join_timeout: Duration,
}

impl Generation {
    pub(crate) fn new(
        request_id: Uuid,
        timeline: RequestTimeline,
        fragments: flume::Receiver<String>,
        producer: ProducerHandle,
        fragment_timeout: Duration,
        join_timeout: Duration,
    ) -> Self {
        Self {
            request_id,
            timeline,
            fragments,
            producer,
            delivered: 0,
            pending_whitespace: String::new(),
            exhausted: false,
            phase: RequestPhase::Generating,
            fragment_timeout,
            join_timeout,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Next non-blank fragment. Blank ones are held back and prepended to it.
    pub async fn next_fragment(&mut self) -> Option<Fragment> {
        if self.exhausted {
            return None;
        }
        if self.phase == RequestPhase::Generating {
            debug!(
                request_id = %self.request_id,
                phase = ?RequestPhase::Draining,
                "draining fragments"
            );
            self.phase = RequestPhase::Draining;
        }

        loop {
            match tokio::time::timeout(self.fragment_timeout, self.fragments.recv_async()).await {
                Ok(Ok(mut text)) => {
                    if text.trim().is_empty() {
                        self.pending_whitespace.push_str(&text);
                        continue;
                    }
                    self.timeline.record_fragment(Instant::now());
                    if !self.pending_whitespace.is_empty() {
                        text.insert_str(0, &std::mem::take(&mut self.pending_whitespace));
                    }
                    self.delivered += 1;
                    return Some(Fragment {
                        text,
                        sequence_number: self.delivered,
                    });
                }
                Ok(Err(flume::RecvError::Disconnected)) => {
                    self.exhausted = true;
                    return None;
                }
                Err(_) => {
                    warn!(
                        request_id = %self.request_id,
                        timeout_secs = self.fragment_timeout.as_secs_f64(),
                        "no fragment within timeout, treating stream as exhausted"
                    );
                    self.exhausted = true;
                    return None;
                }
            }
        }
    }

    pub async fn finish(self, mode: ResponseMode) -> MetricsRecord {
        let Generation {
            request_id,
            mut timeline,
            fragments,
            producer,
            delivered,
            join_timeout,
            ..
        } = self;
        // Anything still queued after the consumer stopped reading is not counted.
        drop(fragments);

        let exit = producer.join(join_timeout).await;
        timeline.record_generation_end(Instant::now());

        let metrics = MetricsRecord::derive(request_id, mode, &timeline, delivered);
        debug!(%request_id, phase = ?RequestPhase::Finalized, "timeline closed");
        info!(
            %request_id,
            ?mode,
            ?exit,
            ttft_ms = metrics.ttft_ms,
            latency_ms = metrics.latency_ms,
            tokens = metrics.decode_token_count,
            tok_per_s = metrics.decode_tokens_per_second,
            "generation finalized"
        );
        metrics
    }
}

pub async fn collect_blocking(mut generation: Generation) -> GenerationResponse {
    let mut text = String::new();
    while let Some(fragment) = generation.next_fragment().await {
        text.push_str(&fragment.text);
    }
    let metrics = generation.finish(ResponseMode::Blocking).await;
    GenerationResponse { metrics, text }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartEvent {
    pub request_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEvent {
    pub text: String,
    pub sequence_number: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start(StartEvent),
    Token(TokenEvent),
    Metrics(MetricsRecord),
    Done,
    Error(String),
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start(_) => "start",
            StreamEvent::Token(_) => "token",
            StreamEvent::Metrics(_) => "metrics",
            StreamEvent::Done => "done",
            StreamEvent::Error(_) => "error",
        }
    }

    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            StreamEvent::Start(event) => serde_json::to_value(event),
            StreamEvent::Token(event) => serde_json::to_value(event),
            StreamEvent::Metrics(record) => serde_json::to_value(record),
            StreamEvent::Done => Ok(serde_json::json!({})),
            StreamEvent::Error(message) => Ok(serde_json::json!({ "error": message })),
        }
    }
}

pub fn event_stream(mut generation: Generation) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        yield StreamEvent::Start(StartEvent {
            request_id: generation.request_id(),
            status: "generating",
        });

        while let Some(fragment) = generation.next_fragment().await {
            yield StreamEvent::Token(TokenEvent {
                text: fragment.text,
                sequence_number: fragment.sequence_number,
            });
            tokio::task::yield_now().await;
        }

        let metrics = generation.finish(ResponseMode::Streaming).await;
        yield StreamEvent::Metrics(metrics);
        yield StreamEvent::Done;
    }
}
