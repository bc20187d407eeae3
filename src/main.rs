//! resilb - a fault-tolerant HTTP load balancer
//!
//! Usage:
//!     resilb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use resilb::backend::Router;
use resilb::config::{load_config, Config};
use resilb::frontend::FrontendListener;
use resilb::metrics::MetricsServer;
use resilb::transport::HttpTransport;
use resilb::util::{init_logging, ShutdownSignal};

/// A fault-tolerant HTTP load balancer with circuit breakers, health
/// monitoring and sticky sessions.
#[derive(Parser, Debug)]
#[command(name = "resilb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format)?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.frontend.listen);
        println!("  Algorithm: {:?}", config.balancer.algorithm);
        println!("  Servers: {}", config.servers.len());
        for server in &config.servers {
            println!(
                "    - {} ({}) weight={} max_connections={}",
                server.id,
                server.base_url(),
                server.weight,
                server.max_connections
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        listen = %config.frontend.listen,
        algorithm = ?config.balancer.algorithm,
        servers = config.servers.len(),
        "resilb starting"
    );

    run(config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(config))
}

/// Async entry point for the load balancer.
async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();

    let router = Router::new(config.balancer.clone(), Arc::new(HttpTransport::new()));
    for server in config.servers {
        let id = server.id.clone();
        if !router.add_server(server) {
            warn!(server = %id, "skipped duplicate server");
        }
    }

    let mut handles = Vec::new();

    handles.push(tokio::spawn(
        router.health_monitor().run(shutdown.subscribe()),
    ));

    handles.push(tokio::spawn(Arc::clone(router.sessions()).run_sweeper(
        config.balancer.session_sweep_interval,
        shutdown.subscribe(),
    )));

    if config.global.metrics.enabled {
        let metrics_server = MetricsServer::bind(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            router.clone(),
        )
        .await
        .with_context(|| {
            format!(
                "failed to bind metrics server on {}",
                config.global.metrics.address
            )
        })?;
        handles.push(tokio::spawn(metrics_server.run(shutdown.subscribe())));
    }

    let listen = config.frontend.listen;
    let listener = FrontendListener::bind(config.frontend, router)
        .await
        .with_context(|| format!("failed to bind frontend on {}", listen))?;
    handles.push(tokio::spawn(listener.run(shutdown.subscribe())));

    info!("resilb is running");
    info!("press Ctrl+C to stop");

    shutdown.trigger_on_ctrl_c().await;

    for handle in handles {
        let _ = handle.await;
    }

    info!("resilb shut down complete");
    Ok(())
}
