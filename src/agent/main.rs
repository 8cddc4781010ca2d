use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;

use stackwatch::agent::auto_deploy::AutoDeployTask;
use stackwatch::agent::rest;
use stackwatch::agent::settings::Settings;
use stackwatch::agent::state::{SharedState, State};

/// Wait for shutdown signal (CTRL+C or SIGTERM)
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
        _ = ctrl_c => {
            log::info!("Received CTRL+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let matches = Command::new("stackwatch-agent")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Watches git repositories and registries, redeploys the swarm stack on change")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config/stackwatch.yaml"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default value");
    let settings = Settings::load(config_path)
        .with_context(|| format!("cannot load configuration from {config_path}"))?;
    log::info!("loaded configuration from {config_path}");

    let state = SharedState::new();
    let task = AutoDeployTask::new(settings.main.clone(), state.clone())?;

    let host = settings.main.host.clone();
    let port = settings.main.port;
    let api_state = state.clone();
    let api = tokio::spawn(async move { rest::serve(&host, port, api_state).await });

    // The loop runs beside the API: after a terminal init failure the health
    // endpoint must keep reporting SERVICE_FAILED until swarm restarts us.
    let _agent_loop = tokio::spawn(async move { task.run().await });

    tokio::select! {
        result = api => {
            result.context("rest api task panicked")??;
        }
        _ = shutdown_signal() => {
            state.set(State::Stopped);
        }
    }

    Ok(())
}
