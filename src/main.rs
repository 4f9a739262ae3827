use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streaming_latency_bench::{AppConfig, EngineSlot, build_router, engine::load_engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let slot = Arc::new(EngineSlot::new());
    let router = build_router(config.clone(), slot.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(
        %addr,
        model = %config.model_id,
        device = %config.device,
        "REST server ready, loading model"
    );

    // Requests get 503 until the loader has filled the slot.
    let loader_config = config.clone();
    tokio::task::spawn_blocking(move || match load_engine(&loader_config) {
        Ok((engine, warmup)) => {
            slot.install(engine, warmup);
        }
        Err(err) => tracing::error!(error = %err, "model loading failed, staying in loading state"),
    });

    axum::serve(listener, router).await?;

    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
