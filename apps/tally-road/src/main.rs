use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tally_road::{build_router, Config, RoadState};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tally-road", about = "Signaling rendezvous server for tally peers", version)]
struct Cli {
    /// Port to listen on; overrides TALLY_ROAD_PORT
    #[arg(long)]
    port: Option<u16>,

    /// Evict sockets silent for this many seconds; overrides TALLY_ROAD_HEARTBEAT_TIMEOUT_SECS
    #[arg(long = "heartbeat-timeout-secs")]
    heartbeat_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to INFO level if RUST_LOG is not set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(secs) = cli.heartbeat_timeout_secs.filter(|secs| *secs > 0) {
        config = Config {
            port: config.port,
            ..Config::with_heartbeat_timeout(std::time::Duration::from_secs(secs))
        };
    }

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus metrics recorder")?;

    info!(
        port = config.port,
        heartbeat_timeout_secs = config.heartbeat_timeout.as_secs(),
        "starting tally-road"
    );

    let app = build_router(RoadState::new(&config), Some(metrics));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("tally-road listening on {}", addr);

    axum::serve(listener, app).await.context("server error")
}
