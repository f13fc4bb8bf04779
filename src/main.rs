//! # Flow Gateway - Main Entry Point
//!
//! ```text
//! flow-gateway [--config <path>] [--validate]
//! ```
//!
//! The configuration path defaults to `GATEWAY_CONFIG_PATH`, then
//! `config/gateway.yaml`. With `--validate` the configuration is loaded, every
//! API is compiled and the process exits without serving.
//!
//! On SIGTERM or Ctrl+C the node moves to `STOPPING`: the listener stops
//! accepting connections and sends HTTP/2 GOAWAY, responses ask HTTP/1 clients
//! to close their connections, and in-flight requests drain for at most the
//! configured drain timeout.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use flow_gateway::gateway::registry::DeploymentReport;
use flow_gateway::observability::{init_logging, install_metrics};
use flow_gateway::{
    ApiRegistry, ConfigManager, GatewayError, GatewayResult, GatewayServer, NodeLifecycle,
    Reactor,
};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

/// How long open connections may linger once draining is over
const CONNECTION_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "flow-gateway")]
#[command(about = "Flow-driven API gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Options {
    /// Gateway configuration file (YAML or JSON)
    #[arg(short, long, env = "GATEWAY_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Load and compile the configuration, then exit without serving
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> GatewayResult<()> {
    let options = Options::parse();

    let manager = if options.validate {
        ConfigManager::new(&options.config).await?
    } else {
        ConfigManager::watched(&options.config).await?
    };
    let config = manager.get_config().await;
    init_logging(&config.observability.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %options.config.display(),
        "Starting flow gateway"
    );

    if options.validate {
        let registry = ApiRegistry::new(Arc::new(flow_gateway::flow::TeraEngine::new()));
        let report = registry.deploy(&config.platform.flows, &config.apis)?;
        log_report(&report);
        if !report.rejected.is_empty() {
            return Err(GatewayError::config(format!(
                "{} API(s) failed validation",
                report.rejected.len()
            )));
        }
        info!("Configuration is valid");
        return Ok(());
    }

    install_metrics(&config.observability.metrics)?;

    let lifecycle = NodeLifecycle::new();
    let (reactor, report) = Reactor::from_config(&config, lifecycle.clone())?;
    log_report(&report);
    let reactor = Arc::new(reactor);

    spawn_redeployer(&manager, reactor.registry().clone());

    let bind_addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .map_err(|e| GatewayError::config(format!("Invalid bind address: {}", e)))?;
    let server = GatewayServer::new(reactor, bind_addr);

    lifecycle.start();
    let drain_timeout = config.node.drain_timeout;
    let draining = lifecycle.clone();
    let mut drain = tokio::spawn(async move {
        shutdown_signal().await;
        info!(timeout = ?drain_timeout, "Shutdown requested, draining in-flight requests");
        if draining.stop(drain_timeout).await {
            info!("All in-flight requests completed");
        }
    });

    // the listener winds down as soon as the node is stopping, so HTTP/2
    // clients get their GOAWAY while requests are still draining
    let stopping = lifecycle.clone();
    let serve = server.serve(async move { stopping.stopping().await });
    tokio::pin!(serve);
    tokio::select! {
        result = &mut serve => {
            result?;
            if let Err(e) = drain.await {
                error!(error = %e, "Drain task failed");
            }
        }
        _ = &mut drain => {
            match tokio::time::timeout(CONNECTION_GRACE, &mut serve).await {
                Ok(result) => result?,
                Err(_) => warn!("Client connections still open after drain, exiting"),
            }
        }
    }

    // keep the watcher alive until the server is gone
    drop(manager);
    info!("Flow gateway stopped");
    Ok(())
}

/// Redeploy the APIs whenever the configuration file changes
fn spawn_redeployer(manager: &ConfigManager, registry: Arc<ApiRegistry>) {
    let mut changes = manager.subscribe_to_changes();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(event) => {
                    info!(file = %event.file_path.display(), "Configuration changed, redeploying APIs");
                    match registry.deploy(&event.config.platform.flows, &event.config.apis) {
                        Ok(report) => log_report(&report),
                        Err(e) => error!(error = %e, "Redeployment failed, keeping current APIs"),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed configuration changes");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn log_report(report: &DeploymentReport) {
    info!(deployed = report.deployed.len(), rejected = report.rejected.len(), "APIs deployed");
    for (api, reason) in &report.rejected {
        warn!(api = %api, reason = %reason, "API not activated");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_options_definition() {
        Options::command().debug_assert();
    }

    #[test]
    fn test_options_parse_flags() {
        let options =
            Options::try_parse_from(["flow-gateway", "-c", "/etc/gateway.yaml", "--validate"])
                .unwrap();
        assert_eq!(options.config, PathBuf::from("/etc/gateway.yaml"));
        assert!(options.validate);

        let options = Options::try_parse_from(["flow-gateway", "--config", "gw.json"]).unwrap();
        assert_eq!(options.config, PathBuf::from("gw.json"));
        assert!(!options.validate);
    }

    #[test]
    fn test_help_and_unknown_arguments() {
        let help = Options::try_parse_from(["flow-gateway", "--help"]).unwrap_err();
        assert_eq!(help.kind(), clap::error::ErrorKind::DisplayHelp);

        let unknown = Options::try_parse_from(["flow-gateway", "--bogus"]).unwrap_err();
        assert_eq!(unknown.kind(), clap::error::ErrorKind::UnknownArgument);
    }
}
