//! # Beacon Server
//!
//! Main binary for the Beacon one-to-many signaling broker:
//! - WebSocket signaling for presenters and viewers
//! - Kurento media server control over JSON-RPC
//! - Periodic sweep of stale buffered ICE candidates
//!
//! Configuration comes from `config.toml`, `.env` and `BEACON_*` environment
//! variables; the flags below override them.

use beacon_common::config::AppConfig;
use beacon_gateway::GatewayState;
use beacon_media::{KurentoClient, MediaServer};
use beacon_signaling::{CandidateQueue, QueueLimits, SessionRegistry, SignalingHandler};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Parser)]
#[command(name = "beacon", version, about = "One-to-many WebRTC signaling broker")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BEACON_HOST")]
    host: Option<String>,

    /// Port to listen on.
    #[arg(long, env = "BEACON_PORT")]
    port: Option<u16>,

    /// Kurento media server WebSocket URI.
    #[arg(long = "media-uri", env = "BEACON_MEDIA_URI")]
    media_uri: Option<String>,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(uri) = self.media_uri {
            config.media.uri = uri;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = beacon_common::config::init()?;
    args.apply(&mut config);
    config.validate()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Beacon v{}", env!("CARGO_PKG_VERSION"));

    // === Media server ===
    // Connected lazily: the first presenter or viewer request dials it.
    let media: Arc<dyn MediaServer> = Arc::new(KurentoClient::new(
        config.media.uri.clone(),
        config.media.request_timeout(),
    ));
    tracing::info!(uri = %media.uri(), "Media server configured");

    // === Session registry + candidate queue ===
    let queue = CandidateQueue::new(QueueLimits::from(&config.candidates));
    let registry = SessionRegistry::new(media, queue.clone(), config.session.presenter_policy);
    tracing::info!(policy = ?registry.policy(), "Presenter policy");

    if let Some(sweep_interval) = config.candidates.sweep_interval() {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                let removed = queue.sweep_expired().await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired candidates");
                }
            }
        });
    }

    // === Signaling gateway ===
    let gateway_state = GatewayState::new(SignalingHandler::new(registry));
    let router = beacon_gateway::build_router(gateway_state, &config.server.ws_path)
        .layer(TraceLayer::new_for_http());
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Signaling listening on ws://{addr}{}", config.server.ws_path);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Beacon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
