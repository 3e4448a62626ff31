// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;

use reqwest::Url;
use tokio::sync::Semaphore;

use crate::errors::StartupError;
use crate::pubsub::DEFAULT_PUBSUB_API_URL;
use crate::relay::{DEFAULT_CONCURRENCY, DEFAULT_SAMPLE_RATE};

pub const DEFAULT_PROJECT_ID: &str = "your-gcp-project-id";
pub const DEFAULT_SUBSCRIPTION_ID: &str = "istio-sidecar-log-sink";
pub const DEFAULT_HONEYCOMB_DATASET: &str = "test-istio-sidecar-logs";
pub const DEFAULT_HONEYCOMB_HOST: &str = "https://api.honeycomb.io/";
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Relay configuration, read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// GCP project owning the subscription
    pub project_id: String,
    pub subscription_id: String,
    pub honeycomb_dataset: String,
    /// Base URL of the Honeycomb API
    pub honeycomb_host: String,
    pub honeycomb_api_key: String,
    /// Rate applied to events no policy matches
    pub default_sample_rate: u32,
    /// Maximum number of messages handled at once
    pub concurrency: usize,
    /// Port of the health and stats server
    pub port: u16,
    pub log_level: String,
    /// Pub/Sub API base URL, overridable to target an emulator
    pub pubsub_api_url: String,
    /// Static bearer token for Pub/Sub. When unset, tokens come from the
    /// metadata server.
    pub pubsub_access_token: Option<String>,
    pub https_proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: DEFAULT_PROJECT_ID.to_string(),
            subscription_id: DEFAULT_SUBSCRIPTION_ID.to_string(),
            honeycomb_dataset: DEFAULT_HONEYCOMB_DATASET.to_string(),
            honeycomb_host: DEFAULT_HONEYCOMB_HOST.to_string(),
            honeycomb_api_key: String::new(),
            default_sample_rate: DEFAULT_SAMPLE_RATE,
            concurrency: DEFAULT_CONCURRENCY,
            port: DEFAULT_HEALTH_PORT,
            log_level: "info".to_string(),
            pubsub_api_url: DEFAULT_PUBSUB_API_URL.to_string(),
            pubsub_access_token: None,
            https_proxy: None,
        }
    }
}

impl Config {
    /// Reads the configuration from environment variables and validates it.
    pub fn from_env() -> Result<Self, StartupError> {
        let defaults = Self::default();

        let config = Self {
            project_id: non_empty_var("PROJECT_ID").unwrap_or(defaults.project_id),
            subscription_id: non_empty_var("PUBSUB_SUBSCRIPTION_ID")
                .unwrap_or(defaults.subscription_id),
            honeycomb_dataset: non_empty_var("HC_DATASET_NAME")
                .unwrap_or(defaults.honeycomb_dataset),
            honeycomb_host: non_empty_var("HC_API_URL").unwrap_or(defaults.honeycomb_host),
            honeycomb_api_key: non_empty_var("HC_API_KEY").unwrap_or_default(),
            default_sample_rate: positive_var("DEFAULT_SAMPLE_RATE")
                .unwrap_or(defaults.default_sample_rate),
            concurrency: positive_var("CONCURRENCY").unwrap_or(defaults.concurrency),
            port: env::var("PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok())
                .unwrap_or(defaults.port),
            log_level: env::var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            pubsub_api_url: non_empty_var("PUBSUB_API_URL").unwrap_or(defaults.pubsub_api_url),
            pubsub_access_token: non_empty_var("PUBSUB_ACCESS_TOKEN"),
            https_proxy: non_empty_var("HTTPS_PROXY"),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        if self.honeycomb_api_key.trim().is_empty() {
            return Err(StartupError::MissingApiKey);
        }

        if self.port == 0 {
            return Err(StartupError::InvalidConfig(
                "PORT must be greater than 0".to_string(),
            ));
        }

        if self.default_sample_rate == 0 || self.concurrency == 0 {
            return Err(StartupError::InvalidConfig(
                "DEFAULT_SAMPLE_RATE and CONCURRENCY must be greater than 0".to_string(),
            ));
        }

        if self.concurrency > Semaphore::MAX_PERMITS {
            return Err(StartupError::InvalidConfig(format!(
                "CONCURRENCY must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        for (name, url) in [
            ("HC_API_URL", &self.honeycomb_host),
            ("PUBSUB_API_URL", &self.pubsub_api_url),
        ] {
            if let Err(e) = Url::parse(url) {
                return Err(StartupError::InvalidConfig(format!(
                    "{name} '{url}' is not a valid URL: {e}"
                )));
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(StartupError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|val| !val.trim().is_empty())
}

/// Unset, unparsable and zero values all fall back to the default.
fn positive_var<T>(name: &str) -> Option<T>
where
    T: std::str::FromStr + Default + PartialEq,
{
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .filter(|val| *val != T::default())
}
