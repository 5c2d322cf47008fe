mod bridge;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::{Method, header::CONTENT_TYPE};
use axum::{Router, routing::get};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use roomdrop_transfer::{EngineConfig, TransferEngine};

use crate::bridge::Bridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "roomdrop_server=debug,roomdrop_transfer=info,tower_http=info".into()
            }),
        )
        .init();

    // Config
    let host = std::env::var("ROOMDROP_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ROOMDROP_PORT")
        .unwrap_or_else(|_| "4210".into())
        .parse()?;
    let upload_dir: PathBuf = std::env::var("ROOMDROP_UPLOAD_DIR")
        .unwrap_or_else(|_| "./uploads".into())
        .into();
    let transfer_timeout_secs: u64 = std::env::var("ROOMDROP_TRANSFER_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30 * 60);

    tokio::fs::create_dir_all(&upload_dir).await?;
    info!("uploads directory: {}", upload_dir.display());

    let engine = TransferEngine::new(EngineConfig {
        upload_dir: upload_dir.clone(),
        transfer_timeout: Duration::from_secs(transfer_timeout_secs),
        ..EngineConfig::default()
    });
    let state = Bridge::new(engine.clone());

    // CORS — permissive; peers connect from whatever origin hosts the room UI
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let app = Router::new()
        .route("/ws", get(bridge::ws_handler))
        .route("/health", get(bridge::health))
        .nest_service("/files", ServeDir::new(&upload_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("roomdrop control plane listening on {}", addr);
    info!(
        "transfer timeout: {}s, room listener ports: 5000-5999",
        transfer_timeout_secs
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // close every room listener and clean up in-flight transfers before exit
    engine.shutdown_all().await;
    info!("all rooms shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
