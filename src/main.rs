//! Iris - SPARQL Event Processing broker
//!
//! This is the main entry point: it loads the configuration, connects the
//! endpoint, builds the subscription manager and starts the HTTP/WebSocket
//! gateway.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use iris::config::{EndpointMode, EngineConfig};
use iris::endpoint::embedded::EmbeddedEndpoint;
use iris::endpoint::sparql_protocol::Sparql11Protocol;
use iris::endpoint::SparqlEndpoint;
use iris::http::start_server;
use iris::subscriptions::manager::SpuManager;
use iris::subscriptions::metrics::SpuManagerMetrics;
use iris::subscriptions::spu::NaivePolicy;

#[derive(Parser, Debug)]
#[command(name = "iris")]
#[command(about = "SPARQL Event Processing broker", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured gateway host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Override the configured gateway port
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let endpoint: Arc<dyn SparqlEndpoint> = match config.endpoint.mode {
        EndpointMode::Remote => {
            info!(url = %config.endpoint.url, "connecting to remote endpoint");
            Arc::new(Sparql11Protocol::new(&config.endpoint)?)
        }
        EndpointMode::Embedded => {
            info!("using embedded endpoint");
            Arc::new(EmbeddedEndpoint::new()?)
        }
    };

    let metrics = Arc::new(SpuManagerMetrics::new(&config.processing));
    let manager = SpuManager::with_options(
        Arc::clone(&endpoint),
        Arc::clone(&metrics),
        Arc::new(NaivePolicy),
        config.processing.filter_mode,
    );

    let host = args.host.unwrap_or_else(|| config.gateway.host.clone());
    let port = args.port.unwrap_or(config.gateway.port);
    let addr = format!("{}:{}", host, port);

    info!(version = env!("CARGO_PKG_VERSION"), %addr, "starting engine");

    // The gateway runs on its own runtime; core calls hop through blocking
    // tasks, so the endpoint client can stay synchronous.
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(start_server(&addr, manager, endpoint, metrics))
}
