
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use streaming_latency_bench::{AppConfig, EngineSlot, SyntheticEngine, build_router};

fn router_with(engine: Option<SyntheticEngine>) -> Router {
    let slot = match engine {
        Some(engine) => EngineSlot::with_engine(Arc::new(engine)),
        None => EngineSlot::new(),
    };
    build_router(Arc::new(AppConfig::default()), Arc::new(slot))
}

fn post_json(uri: &str, body: Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))?)
}

async fn body_text(response: axum::response::Response) -> Result<String> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Splits an event-stream body into `(event name, JSON data)` pairs,
/// skipping keep-alive comments.
fn parse_events(raw: &str) -> Result<Vec<(String, Value)>> {
    let mut events = Vec::new();
    for block in raw.split("\n\n").filter(|b| !b.trim().is_empty()) {
        let mut name = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if let Some(name) = name {
            events.push((name, serde_json::from_str(&data)?));
        }
    }
    Ok(events)
}

#[tokio::test]
async fn health_reports_loading_before_the_engine_is_installed() -> Result<()> {
    let app = router_with(None);

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(json["status"], "loading");
    assert_eq!(json["model"], AppConfig::default().model_id);
    assert_eq!(json["device"], "cpu");
    assert!(json["warmup"]["warmup_total_ms"].is_null());
    Ok(())
}

#[tokio::test]
async fn health_reports_ready_once_installed() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::echo()));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty())?)
        .await?;

    let json: Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(json["status"], "ready");
    assert!(json["warmup"].is_object());
    Ok(())
}

#[tokio::test]
async fn generate_returns_503_while_loading() -> Result<()> {
    let app = router_with(None);

    let response = app
        .oneshot(post_json("/generate", json!({ "prompt": "hi" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = serde_json::from_str(&body_text(response).await?)?;
    assert!(json["error"].is_string());
    Ok(())
}

#[tokio::test]
async fn generate_stream_emits_a_single_error_event_while_loading() -> Result<()> {
    let app = router_with(None);

    let response = app
        .oneshot(post_json("/generate_stream", json!({ "prompt": "hi" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let events = parse_events(&body_text(response).await?)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    assert!(events[0].1["error"].is_string());
    Ok(())
}

#[tokio::test]
async fn generate_skips_whitespace_only_fragments() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::scripted(["Hello", " ", "world"])));

    let response = app
        .oneshot(post_json("/generate", json!({ "prompt": "greet me" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let json: Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(json["text"], "Hello world");
    let metrics = &json["metrics"];
    assert_eq!(metrics["decode_token_count"], 2);
    assert_eq!(metrics["mode"], "non_streaming");
    assert!(metrics["request_id"].is_string());
    for field in ["ttft_ms", "latency_ms", "tokenization_ms", "prefill_ms", "decode_ms"] {
        assert!(metrics[field].as_f64().unwrap() >= 0.0, "{field} negative");
    }
    Ok(())
}

#[tokio::test]
async fn generate_stream_emits_start_tokens_metrics_done() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::scripted(["Hello", " ", "world"])));

    let response = app
        .oneshot(post_json("/generate_stream", json!({ "prompt": "greet me" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let events = parse_events(&body_text(response).await?)?;
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["start", "token", "token", "metrics", "done"]);

    let start = &events[0].1;
    assert_eq!(start["status"], "generating");
    let request_id = start["request_id"].as_str().unwrap();

    assert_eq!(events[1].1["sequence_number"], 1);
    assert_eq!(events[2].1["sequence_number"], 2);
    let text: String = events[1..3]
        .iter()
        .map(|(_, data)| data["text"].as_str().unwrap())
        .collect();
    assert_eq!(text, "Hello world");

    let metrics = &events[3].1;
    assert_eq!(metrics["request_id"], request_id);
    assert_eq!(metrics["mode"], "streaming");
    assert_eq!(metrics["decode_token_count"], 2);
    assert_eq!(events[4].1, json!({}));
    Ok(())
}

#[tokio::test]
async fn empty_generation_completes_with_zero_decode() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::scripted(Vec::<String>::new())));

    let response = app
        .oneshot(post_json("/generate_stream", json!({ "prompt": "anything" }))?)
        .await?;

    let events = parse_events(&body_text(response).await?)?;
    let names: Vec<&str> = events.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["start", "metrics", "done"]);
    let metrics = &events[1].1;
    assert_eq!(metrics["ttft_ms"], metrics["latency_ms"]);
    assert_eq!(metrics["decode_ms"], 0.0);
    assert_eq!(metrics["decode_tokens_per_second"], 0.0);
    Ok(())
}

#[tokio::test]
async fn tokenization_failure_is_a_500() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::echo().failing_tokenization()));

    let response = app
        .clone()
        .oneshot(post_json("/generate", json!({ "prompt": "hi" }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = app
        .oneshot(post_json("/generate_stream", json!({ "prompt": "hi" }))?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let events = parse_events(&body_text(response).await?)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    Ok(())
}

#[tokio::test]
async fn invalid_sampling_parameters_are_rejected() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::echo()));

    let response = app
        .oneshot(post_json("/generate", json!({ "prompt": "hi", "top_p": 0.0 }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn oversized_token_budget_is_rejected_in_both_modes() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::echo()));
    let body = json!({ "prompt": "hi", "max_new_tokens": u64::MAX });

    let response = app
        .clone()
        .oneshot(post_json("/generate", body.clone())?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app.oneshot(post_json("/generate_stream", body)?).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let events = parse_events(&body_text(response).await?)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, "error");
    Ok(())
}

#[tokio::test]
async fn benchmark_report_is_kept_for_later_reads() -> Result<()> {
    let app = router_with(Some(SyntheticEngine::echo()));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/benchmark").body(Body::empty())?)
        .await?;
    assert_eq!(body_text(response).await?, "null");

    let response = app
        .clone()
        .oneshot(post_json(
            "/benchmark",
            json!({ "prompts": ["alpha beta gamma"], "iterations": 2 }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let report: Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(report["samples"].as_array().unwrap().len(), 2);
    assert_eq!(report["aggregate"]["text_match_rate"], 1.0);

    let response = app
        .oneshot(Request::builder().uri("/benchmark").body(Body::empty())?)
        .await?;
    let stored: Value = serde_json::from_str(&body_text(response).await?)?;
    assert_eq!(stored["samples"].as_array().unwrap().len(), 2);
    Ok(())
}
