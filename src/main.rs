use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use backhaul::{AccessLog, Config, Dispatcher, Result, Router, Server};

/// Multi-tenant HTTP reverse proxy with persistent backend connections.
#[derive(Debug, Parser)]
#[command(name = "backhaul", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log filter, e.g. `info` or `backhaul=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)?;

    let router = Arc::new(Router::from_targets(&config.targets)?);
    router.connect_all();

    let access_log = AccessLog::open(config.access_log.as_deref()).await?;
    let dispatcher = Dispatcher::new(router, access_log);

    let server = Server::bind(&config, dispatcher).await?;
    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("waiting for shutdown signal failed: {e}");
            }
            log::info!("shutting down");
        })
        .await
}
