use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    benchmark::{BenchmarkReport, BenchmarkRequest, run_benchmark},
    config::AppConfig,
    engine::EngineSlot,
    error::ServiceError,
    pipeline::{Pipeline, StreamEvent, collect_blocking, event_stream},
    types::{GenerationRequest, GenerationResponse, HealthResponse, HealthStatus},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<EngineSlot>,
    pub pipeline: Pipeline,
    pub last_benchmark: Arc<RwLock<Option<BenchmarkReport>>>,
}

pub fn build_router(config: Arc<AppConfig>, engine: Arc<EngineSlot>) -> Router {
    let state = AppState {
        pipeline: Pipeline::new(config.as_ref()),
        last_benchmark: Arc::new(RwLock::new(None)),
        engine,
        config,
    };

    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/generate_stream", post(generate_stream))
        .route("/benchmark", get(last_benchmark).post(benchmark))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.engine.is_ready() {
        HealthStatus::Ready
    } else {
        HealthStatus::Loading
    };
    Json(HealthResponse {
        status,
        model: state.config.model_id.clone(),
        device: state.config.device.clone(),
        warmup: state.engine.warmup(),
    })
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ServiceError> {
    let engine = state.engine.ready()?;
    let generation = state.pipeline.start(engine, request).await?;
    Ok(Json(collect_blocking(generation).await))
}

async fn generate_stream(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Response {
    let started = match state.engine.ready() {
        Ok(engine) => state.pipeline.start(engine, request).await,
        Err(err) => Err(err),
    };

    match started {
        Ok(generation) => Sse::new(to_sse(event_stream(generation)))
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response(),
        Err(err) => {
            warn!(error = %err, "streaming generation could not start");
            err.into_event_stream()
        }
    }
}

fn to_sse(
    events: impl Stream<Item = StreamEvent> + Send,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    events.map(|event| Ok(sse_event(&event)))
}

pub(crate) fn sse_event(event: &StreamEvent) -> Event {
    let sse = Event::default().event(event.name());
    match event.payload() {
        Ok(payload) => sse.data(payload.to_string()),
        Err(err) => {
            warn!(error = %err, event = event.name(), "failed to encode stream event");
            sse.data("{}")
        }
    }
}

async fn benchmark(
    State(state): State<AppState>,
    Json(request): Json<BenchmarkRequest>,
) -> Result<Json<BenchmarkReport>, ServiceError> {
    let engine = state.engine.ready()?;
    let report = run_benchmark(&state.pipeline, engine, request).await?;
    info!(
        samples = report.samples.len(),
        text_match_rate = report.aggregate.text_match_rate,
        "benchmark finished"
    );
    state.last_benchmark.write().replace(report.clone());
    Ok(Json(report))
}

async fn last_benchmark(State(state): State<AppState>) -> Json<Option<BenchmarkReport>> {
    Json(state.last_benchmark.read().clone())
}
