use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod app_state;
mod config;
mod inference;
mod prompts;

use app_state::AppState;
use config::ServerConfig;
use inference::{llama::LlamaGenerator, InferenceService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = ServerConfig::from_env().context("invalid server configuration")?;
    info!(?cfg, "starting instruct server");

    // -----------------------------
    // Model (loaded once, before serving)
    // -----------------------------
    let model_settings = cfg.model.clone();
    let generator = tokio::task::spawn_blocking(move || LlamaGenerator::load(&model_settings))
        .await
        .context("model loader panicked")??;

    let state = AppState::new(InferenceService::new(
        Arc::new(generator),
        cfg.sampling,
        cfg.max_new_tokens_limit,
    ));

    // -----------------------------
    // Routers
    // -----------------------------
    let app = Router::new()
        .merge(api::api_router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let listener = TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;

    info!("HTTP listening on http://{}", cfg.bind_addr);
    info!("POST http://{}/generate", cfg.bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router owned the only handle to the model; it is released here.
    info!("server stopped, model released");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
