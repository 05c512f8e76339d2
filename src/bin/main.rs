use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use dockyard::config::Configuration;
use tokio::{signal, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Opt {
    /// Configuration files, later ones override earlier ones.
    #[clap(short, long, value_parser)]
    pub config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_ansi(false)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = Opt::parse();
    let config = Configuration::config(Configuration::figment(options.config))?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();
    dockyard::start(config, &mut tasks, shutdown.clone()).await?;

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(err) = result {
                error!("Unable to listen for shutdown signal: {err}");
            }
            info!("Shutting down");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(())) => warn!("A service stopped unexpectedly"),
                Ok(Err(err)) => error!("A service failed: {err:?}"),
                Err(err) => error!("A service panicked: {err}"),
            }
        }
    }

    shutdown.cancel();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Error during shutdown: {err:?}"),
            Err(err) => warn!("Task failed during shutdown: {err}"),
        }
    }

    Ok(())
}
