use std::convert::Infallible;

use axum::http::StatusCode;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::{engine::EngineError, pipeline::StreamEvent, server::sse_event};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Model not ready")]
    EngineNotReady,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    #[error("generation could not start: {0}")]
    Generation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::EngineNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Tokenization(_) | ServiceError::Generation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_event_stream(self) -> Response {
        let status = self.status();
        let event = sse_event(&StreamEvent::Error(self.to_string()));
        let stream = futures::stream::once(async move { Ok::<_, Infallible>(event) });

        (status, Sse::new(stream)).into_response()
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Tokenizer(msg) => ServiceError::Tokenization(msg),
            other => ServiceError::Other(other.to_string()),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
