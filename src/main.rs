//! sessionlb - session-aware TCP load balancer
//!
//! Usage:
//!     sessionlb --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use sessionlb::balancer::{BalancingPlugin, PluginServer, StateCallback};
use sessionlb::config::{Config, ConfigWatcher, DetectionStrategy, load_config};
use sessionlb::frontend::FrontendListener;
use sessionlb::health::{
    FaultDetectorFactory, HeartbeatDetectorFactory, HeartbeatServer, ProbeDetectorFactory,
    ProbeSettings,
};
use sessionlb::metrics::{MetricsCollector, MetricsServer};
use sessionlb::proxy::StreamPluginHandler;
use sessionlb::state::AppState;
use sessionlb::util::{init_logging, log_state_change};

/// Session-aware TCP load balancer with backend failover.
#[derive(Parser, Debug)]
#[command(name = "sessionlb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Detect backend failures from heartbeats instead of probes
    #[arg(long)]
    heartbeat: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;
    if cli.heartbeat {
        config.fault_detection.strategy = DetectionStrategy::Heartbeat;
    }

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Frontends: {}", config.frontends.len());
        println!("  Pools: {}", config.pools.len());
        for frontend in &config.frontends {
            println!("    - {} ({}) -> {}", frontend.name, frontend.listen, frontend.pool);
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        frontends = config.frontends.len(),
        pools = config.pools.len(),
        strategy = ?config.fault_detection.strategy,
        "sessionlb starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(config, cli.config))
}

/// Build the detector factory for the configured strategy.
///
/// Also returns the heartbeat server when one was started.
async fn build_detector_factory(
    config: &Config,
) -> Result<(Arc<dyn FaultDetectorFactory>, Option<HeartbeatServer>)> {
    let detection = &config.fault_detection;
    match detection.strategy {
        DetectionStrategy::Probe => {
            let settings = ProbeSettings::from(&detection.probe);
            Ok((Arc::new(ProbeDetectorFactory::new(settings)), None))
        }
        DetectionStrategy::Heartbeat => {
            let server = HeartbeatServer::bind(detection.heartbeat.listen)
                .await
                .with_context(|| {
                    format!(
                        "failed to bind heartbeat server on {}",
                        detection.heartbeat.listen
                    )
                })?;
            info!(
                address = %server.local_addr(),
                frequency = ?detection.heartbeat.frequency,
                timeout = ?detection.heartbeat.timeout,
                "backends must send heartbeats here"
            );
            let factory = HeartbeatDetectorFactory::new(server.clone(), detection.heartbeat.timeout);
            Ok((Arc::new(factory), Some(server)))
        }
    }
}

async fn run(config: Config, config_path: PathBuf) -> Result<()> {
    let metrics = MetricsCollector::new();
    let observer: StateCallback = Arc::new(log_state_change);
    let state = Arc::new(AppState::new(config.clone(), Some(Arc::clone(&observer))));
    let mut handles = Vec::new();

    if config.global.metrics.enabled {
        let metrics_config = &config.global.metrics;
        let server =
            MetricsServer::bind(metrics_config.address, metrics_config.path.clone(), metrics.clone())
                .await
                .with_context(|| {
                    format!("failed to bind metrics server on {}", metrics_config.address)
                })?;
        handles.push(tokio::spawn(server.run(state.shutdown().subscribe())));
    }

    let (detectors, heartbeat) = build_detector_factory(&config).await?;

    // One plugin server and plugin per frontend.
    for frontend in &config.frontends {
        let Some(pool) = config.pool(&frontend.pool) else {
            // Validation guarantees the pool exists.
            continue;
        };
        let server = PluginServer::new(frontend.name.clone());
        let handler = StreamPluginHandler::new(
            pool.protocol.clone(),
            frontend.name.clone(),
            frontend.connect_timeout,
            metrics.clone(),
        );
        let plugin = BalancingPlugin::new(
            server.handle(),
            Arc::new(handler),
            Arc::clone(&detectors),
            config.balancing,
            metrics.clone(),
        );
        server
            .add_plugin(Arc::clone(&plugin))
            .context("failed to attach plugin")?;

        for addr in &pool.servers {
            if let Err(e) = plugin
                .add_backend_server(addr, Some(Arc::clone(&observer)))
                .await
            {
                error!(pool = %pool.name, server = %addr, error = %e, "failed to add backend server");
            }
        }
        state.register_plugin(&pool.name, Arc::clone(&plugin));
        state.add_server(server.clone());

        let listener = FrontendListener::bind(frontend.clone(), server)
            .await
            .with_context(|| format!("failed to bind frontend '{}'", frontend.name))?;
        handles.push(tokio::spawn(listener.run(state.shutdown().subscribe())));
    }

    let reload_state = Arc::clone(&state);
    let watcher = ConfigWatcher::new(
        config_path,
        Box::new(move |config| {
            let state = Arc::clone(&reload_state);
            tokio::spawn(async move {
                if let Err(e) = state.apply_reload(config).await {
                    warn!(error = %e, "configuration partially applied");
                }
            });
        }),
    );
    handles.push(tokio::spawn(watcher.run(state.shutdown().subscribe())));

    info!("sessionlb running");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    if let Err(e) = state.stop().await {
        warn!(errors = e.len(), error = %e, "errors during shutdown");
    }
    if let Some(heartbeat) = heartbeat {
        heartbeat.stop();
    }
    for handle in handles {
        let _ = handle.await;
    }

    info!("sessionlb shut down complete");
    Ok(())
}
