use core::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use duration_string::DurationString;
use serde::Deserialize;
use url::Url;

use crate::error::{ConsumerError, Result};

pub const ENV_QUEUE_URL: &str = "SQS_QUEUE_URL";
pub const ENV_ENDPOINT: &str = "SQS_ENDPOINT";
pub const ENV_REGION: &str = "AWS_REGION";
pub const ENV_WAIT_SECONDS: &str = "SQS_WAIT_SECONDS";
pub const ENV_MAX_MESSAGES: &str = "SQS_MAX_MESSAGES";
pub const ENV_POLL_INTERVAL: &str = "POLL_INTERVAL";
pub const ENV_PROCESSING_TIMEOUT: &str = "PROCESSING_TIMEOUT";
pub const ENV_SHUTDOWN_GRACE: &str = "SHUTDOWN_GRACE";
pub const ENV_PROCESSING_DELAY: &str = "PROCESSING_DELAY";

/// SQS caps long polling at 20 seconds.
pub const MAX_WAIT_SECONDS: i32 = 20;
/// SQS caps a single receive at 10 messages.
pub const MAX_BATCH_SIZE: i32 = 10;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub queue_url: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub wait_seconds: i32,
    pub max_messages: i32,
    pub poll_interval: DurationString,
    pub processing_timeout: DurationString,
    pub shutdown_grace: DurationString,
    pub processing_delay: DurationString,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_url: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            wait_seconds: 5,
            max_messages: 1,
            poll_interval: DurationString::new(Duration::from_secs(1)),
            processing_timeout: DurationString::new(Duration::from_secs(30)),
            shutdown_grace: DurationString::new(Duration::from_secs(10)),
            processing_delay: DurationString::new(Duration::from_millis(50)),
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Consuming from {}", self.queue_url)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " via {}", endpoint)?;
        }
        Ok(())
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ConsumerError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&contents).map_err(|e| {
            ConsumerError::Configuration(format!("invalid config file {}: {}", path.display(), e))
        })
    }

    /// Reads `path` when given, otherwise starts from the defaults, then layers
    /// the process environment on top. The result is not validated yet.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_lookup(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overrides every field whose key `lookup` resolves. Empty values count as unset.
    pub fn apply_lookup<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_QUEUE_URL) {
            self.queue_url = v;
        }
        if let Some(v) = get(ENV_ENDPOINT) {
            self.endpoint = Some(v);
        }
        if let Some(v) = get(ENV_REGION) {
            self.region = v;
        }
        if let Some(v) = get(ENV_WAIT_SECONDS) {
            self.wait_seconds = parse_number(ENV_WAIT_SECONDS, &v)?;
        }
        if let Some(v) = get(ENV_MAX_MESSAGES) {
            self.max_messages = parse_number(ENV_MAX_MESSAGES, &v)?;
        }
        if let Some(v) = get(ENV_POLL_INTERVAL) {
            self.poll_interval = parse_duration(ENV_POLL_INTERVAL, &v)?;
        }
        if let Some(v) = get(ENV_PROCESSING_TIMEOUT) {
            self.processing_timeout = parse_duration(ENV_PROCESSING_TIMEOUT, &v)?;
        }
        if let Some(v) = get(ENV_SHUTDOWN_GRACE) {
            self.shutdown_grace = parse_duration(ENV_SHUTDOWN_GRACE, &v)?;
        }
        if let Some(v) = get(ENV_PROCESSING_DELAY) {
            self.processing_delay = parse_duration(ENV_PROCESSING_DELAY, &v)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_url.trim().is_empty() {
            return Err(ConsumerError::Configuration(format!(
                "{} must be set",
                ENV_QUEUE_URL
            )));
        }
        Url::parse(&self.queue_url).map_err(|e| {
            ConsumerError::Configuration(format!("queue url '{}' is invalid: {}", self.queue_url, e))
        })?;

        if let Some(endpoint) = &self.endpoint {
            Url::parse(endpoint).map_err(|e| {
                ConsumerError::Configuration(format!("endpoint '{}' is invalid: {}", endpoint, e))
            })?;
        }

        if !(0..=MAX_WAIT_SECONDS).contains(&self.wait_seconds) {
            return Err(ConsumerError::Configuration(format!(
                "wait seconds must be between 0 and {}, got {}",
                MAX_WAIT_SECONDS, self.wait_seconds
            )));
        }

        if !(1..=MAX_BATCH_SIZE).contains(&self.max_messages) {
            return Err(ConsumerError::Configuration(format!(
                "max messages must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.max_messages
            )));
        }

        if self.processing_timeout().is_zero() {
            return Err(ConsumerError::Configuration(
                "processing timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.clone().into()
    }

    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout.clone().into()
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace.clone().into()
    }

    pub fn processing_delay(&self) -> Duration {
        self.processing_delay.clone().into()
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        ConsumerError::Configuration(format!("{} has invalid value '{}': {}", key, value, e))
    })
}

pub fn parse_duration(key: &str, value: &str) -> Result<DurationString> {
    DurationString::try_from(value.trim().to_string()).map_err(|e| {
        ConsumerError::Configuration(format!("{} has invalid duration '{}': {}", key, value, e))
    })
}
