use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use shipping_worker::utils::config::{parse_duration, Config};
use shipping_worker::ConsumerError;

#[derive(Parser)]
#[command(name = "shipping-worker")]
#[command(about = "Long-polls an SQS queue and processes each message", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// YAML file applied before environment variables and flags
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    Consume(ConsumeArgs),
}

#[derive(Args, Debug, Default)]
pub struct ConsumeArgs {
    #[arg(long)]
    pub queue_url: Option<String>,

    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub max_messages: Option<i32>,

    #[arg(long)]
    pub wait_seconds: Option<i32>,

    /// e.g. "1s", "500ms"
    #[arg(long)]
    pub poll_interval: Option<String>,

    #[arg(long)]
    pub reject_empty: bool,
}

impl ConsumeArgs {
    pub fn apply(&self, config: &mut Config) -> Result<(), ConsumerError> {
        if let Some(queue_url) = &self.queue_url {
            config.queue_url = queue_url.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = Some(endpoint.clone());
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(max_messages) = self.max_messages {
            config.max_messages = max_messages;
        }
        if let Some(wait_seconds) = self.wait_seconds {
            config.wait_seconds = wait_seconds;
        }
        if let Some(interval) = &self.poll_interval {
            config.poll_interval = parse_duration("--poll-interval", interval)?;
        }
        Ok(())
    }
}
