use serde::{Deserialize, Serialize};

use crate::{
    engine::{SamplingParams, WarmupMetrics},
    error::ServiceError,
    pipeline::MetricsRecord,
};

/// Largest `max_new_tokens` a request may ask for.
pub const MAX_NEW_TOKENS_LIMIT: usize = 8192;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_new_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_new_tokens: None,
            temperature: None,
            top_p: None,
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }

    /// Fills unset fields from `defaults` and rejects values no engine can use.
    pub fn sampling_params(
        &self,
        defaults: &SamplingParams,
    ) -> Result<SamplingParams, ServiceError> {
        if self.prompt.trim().is_empty() {
            return Err(ServiceError::BadRequest("prompt must not be empty".into()));
        }

        let params = SamplingParams {
            max_new_tokens: self.max_new_tokens.unwrap_or(defaults.max_new_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
        };

        if params.max_new_tokens == 0 || params.max_new_tokens > MAX_NEW_TOKENS_LIMIT {
            return Err(ServiceError::BadRequest(format!(
                "max_new_tokens must be between 1 and {MAX_NEW_TOKENS_LIMIT}"
            )));
        }
        if !params.temperature.is_finite() || params.temperature < 0.0 {
            return Err(ServiceError::BadRequest(
                "temperature must be a non-negative number".into(),
            ));
        }
        if !(params.top_p > 0.0 && params.top_p <= 1.0) {
            return Err(ServiceError::BadRequest("top_p must be in (0, 1]".into()));
        }

        Ok(params)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub metrics: MetricsRecord,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ready,
    Loading,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub model: String,
    pub device: String,
    pub warmup: WarmupMetrics,
}
