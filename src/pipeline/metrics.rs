use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMode {
    #[serde(rename = "non_streaming")]
    Blocking,
    #[serde(rename = "streaming")]
    Streaming,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestTimeline {
    request_start: Instant,
    tokenization_start: Instant,
    tokenization_end: Instant,
    first_fragment: Option<Instant>,
    generation_end: Option<Instant>,
}

impl RequestTimeline {
    pub fn new(request_start: Instant) -> Self {
        Self {
            request_start,
            tokenization_start: request_start,
            tokenization_end: request_start,
            first_fragment: None,
            generation_end: None,
        }
    }

    pub fn record_tokenization(&mut self, start: Instant, end: Instant) {
        self.tokenization_start = start;
        self.tokenization_end = end;
    }

    /// Only the first call sticks.
    pub fn record_fragment(&mut self, at: Instant) {
        self.first_fragment.get_or_insert(at);
    }

    pub fn record_generation_end(&mut self, at: Instant) {
        self.generation_end = Some(at);
    }

    fn end(&self) -> Instant {
        self.generation_end.unwrap_or_else(|| {
            self.first_fragment
                .map_or(self.tokenization_end, |first| first.max(self.tokenization_end))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub request_id: Uuid,
    pub mode: ResponseMode,
    pub ttft_ms: f64,
    pub latency_ms: f64,
    pub tokenization_ms: f64,
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub decode_token_count: usize,
    pub decode_tokens_per_second: f64,
}

impl MetricsRecord {
    /// A request that never saw a fragment counts its first fragment as
    /// arriving at generation end: decode time and throughput are then zero.
    pub fn derive(
        request_id: Uuid,
        mode: ResponseMode,
        timeline: &RequestTimeline,
        decode_token_count: usize,
    ) -> Self {
        let end = timeline.end();
        let first = timeline.first_fragment.map_or(end, |first| first.min(end));

        let ttft = first.saturating_duration_since(timeline.request_start);
        let latency = end.saturating_duration_since(timeline.request_start);
        let tokenization = timeline
            .tokenization_end
            .saturating_duration_since(timeline.tokenization_start);
        let prefill = first.saturating_duration_since(timeline.tokenization_end);
        let decode = end.saturating_duration_since(first);

        let decode_tokens_per_second = if decode > Duration::ZERO {
            decode_token_count as f64 / decode.as_secs_f64()
        } else {
            0.0
        };

        Self {
            request_id,
            mode,
            ttft_ms: round_ms(ttft),
            latency_ms: round_ms(latency),
            tokenization_ms: round_ms(tokenization),
            prefill_ms: round_ms(prefill),
            decode_ms: round_ms(decode),
            decode_token_count,
            decode_tokens_per_second: round2(decode_tokens_per_second),
        }
    }
}

pub fn round_ms(duration: Duration) -> f64 {
    round2(duration.as_secs_f64() * 1000.0)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
