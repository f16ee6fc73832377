use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cli;

use cli::{Cli, Commands, ConsumeArgs};
use shipping_worker::processor::LogProcessor;
use shipping_worker::queue::{Consumer, ConsumerSettings, SqsSource};
use shipping_worker::telemetry::{self, CycleTracer};
use shipping_worker::utils::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let telemetry = match telemetry::init_telemetry() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to initialize telemetry: {:#}", e);
            None
        }
    };

    let cli = Cli::parse();

    match &cli.command {
        Commands::Consume(args) => {
            consume_command(cli.config.as_deref(), args).await?;
        }
    }

    if let Some(guard) = telemetry {
        guard.shutdown();
    }

    Ok(())
}

async fn consume_command(config_path: Option<&Path>, args: &ConsumeArgs) -> Result<()> {
    let mut config = Config::load(config_path)?;
    args.apply(&mut config)?;
    config.validate().context("Refusing to start consumer")?;

    info!("{}", config);

    let source = SqsSource::from_config(&config).await;
    let processor = LogProcessor::new(config.processing_delay()).reject_empty(args.reject_empty);

    let consumer = Consumer::new(
        Arc::new(source),
        Arc::new(processor),
        CycleTracer::new(config.queue_url.clone()),
        ConsumerSettings::from(&config),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    consumer.run(shutdown).await;

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining in-flight work");
    token.cancel();
}
