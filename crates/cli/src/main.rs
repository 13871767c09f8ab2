use anyhow::Context;
use botfleet_core::{AppConfig, ConfigLoader};
use botfleet_orchestrator::{FleetController, SimulatedBroker, Topics};
use botfleet_web_api::ApiServer;
use clap::{Parser, Subcommand};
use std::sync::Arc;

mod simulation;

#[derive(Parser)]
#[command(name = "botfleet")]
#[command(about = "Fleet controller for broker-connected trading bots", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BOTFLEET_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker, reconcile the fleet and serve the web API
    Serve {
        /// Config file path
        #[arg(short, long, default_value = botfleet_core::DEFAULT_CONFIG_PATH)]
        config: String,
        /// Use an in-process broker with a few simulated bots instead of MQTT
        #[arg(long)]
        simulated: bool,
    },
    /// Print the effective configuration after file and environment overrides
    ShowConfig {
        /// Config file path
        #[arg(short, long, default_value = botfleet_core::DEFAULT_CONFIG_PATH)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Serve { config, simulated } => {
            let config = ConfigLoader::load_from(&config)?;
            run_serve(config, simulated).await?;
        }
        Commands::ShowConfig { config } => {
            let config = ConfigLoader::load_from(&config)?;
            println!("{config:#?}");
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_serve(config: AppConfig, simulated: bool) -> anyhow::Result<()> {
    tracing::info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        namespace = %config.broker.namespace,
        simulated,
        "Starting fleet controller"
    );

    // Held for the lifetime of the process so simulated bots keep beating.
    let mut simulation = None;
    let controller = if simulated {
        let broker = SimulatedBroker::new();
        let topics = Topics::new(config.broker.namespace.as_str());
        let controller =
            FleetController::with_transport(broker.transport(), topics.clone(), &config.fleet)
                .await
                .context("Failed to start simulated broker")?;
        simulation = Some(simulation::seed(&broker, &topics, config.fleet.liveness_window()));
        controller
    } else {
        FleetController::connect(&config.broker, &config.fleet)
            .await
            .context("Failed to connect to broker")?
    };
    let controller = Arc::new(controller);

    let ticker = controller.start_ticker(config.fleet.reconcile_interval());

    let server = ApiServer::new(Arc::clone(&controller));
    let addr = config.server.bind_addr();
    server.serve(&addr, shutdown_signal()).await?;

    tracing::info!("Stopping reconciliation ticker");
    ticker.stop().await;
    if let Some(simulation) = simulation {
        simulation.stop();
    }
    if let Err(e) = controller.shutdown().await {
        tracing::error!("Error during broker shutdown: {}", e);
    }

    tracing::info!("Fleet controller stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to create SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_to_config_toml() {
        let cli = Cli::try_parse_from(["botfleet", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { config, simulated } => {
                assert_eq!(config, "config/Config.toml");
                assert!(!simulated);
            }
            Commands::ShowConfig { .. } => panic!("expected serve"),
        }
        assert!(!cli.log_json);
    }

    #[test]
    fn log_json_is_global() {
        let cli =
            Cli::try_parse_from(["botfleet", "serve", "--simulated", "--log-json"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Commands::Serve { simulated: true, .. }));
    }
}
