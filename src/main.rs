use peer_forwarder::config::PeerForwarderConfig;
use peer_forwarder::forwarding::{ForwardingServer, PeerForwarderProvider};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Config file used when no path is given on the command line
const CONFIG_PATH_ENV: &str = "PEER_FORWARDER_CONFIG";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config() -> Result<PeerForwarderConfig, Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_PATH_ENV).ok());
    let config = match path {
        Some(path) => {
            info!(%path, "loading peer forwarder config");
            PeerForwarderConfig::from_file(&path)?
        }
        None => PeerForwarderConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = load_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server_thread_count)
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: PeerForwarderConfig) -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(PeerForwarderProvider::from_config(config.clone())?);
    let server = ForwardingServer::bind(&config, provider.clone()).await?;
    let shutdown = server.shutdown_token();

    info!(
        port = config.port,
        discovery_mode = config.discovery_mode.name(),
        ssl = config.ssl,
        "peer forwarder starting"
    );
    let serving = tokio::spawn(server.serve());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining receive buffers");

    shutdown.cancel();
    if provider.await_drain().await {
        info!("receive buffers drained");
    }
    provider.shutdown();
    if let Err(e) = serving.await {
        warn!(error = %e, "forwarding server task failed");
    }
    Ok(())
}
