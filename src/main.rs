use castor::config::Config;
use castor::server::router::{GatewayState, gateway_router};
use castor::store::DataDir;
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const DATA_DIR: &str = "./data";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let data = DataDir::open(DATA_DIR).await?;
    let cfg = Config::load(&data.config_path())?;
    info!(
        listen_addr = %cfg.server.host,
        listen_port = cfg.server.port,
        upstream = %cfg.api.url,
        token_endpoint = %cfg.api.host,
        "configuration loaded"
    );

    let state = GatewayState::initialize(cfg.clone(), &data).await?;
    let _background = state.spawn_background_tasks();
    state.logs.clone().record("info", "gateway starting").await;

    let app = gateway_router(state.clone());
    let addr = SocketAddr::from((cfg.server.host, cfg.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.logs.clone().record("info", "gateway shutting down").await;
    state.flush_all().await;
    info!("Server has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { /* ... */ },
        _ = terminate => { /* ... */ },
    }
}
