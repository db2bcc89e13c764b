//! Media-stream server: the WebSocket endpoint a telephony provider connects
//! to for bidirectional call audio. Each connection gets its own gateway
//! instance wired to the streaming STT/LLM/TTS providers.

mod stream;

use axum::routing::get;
use axum::Router;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let state = stream::AppState::from_env()?;

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/stream", get(stream::media_stream))
        .with_state(state);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(target: "companion::server", %addr, "media-stream server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
