// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event sinks.
//!
//! [`HoneycombSink`] ships one presampled event per request to the Honeycomb
//! single-event API. Failures are reported to the caller and never retried
//! here: the source message is nacked and the queue redelivers it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use tracing::debug;

use crate::config::Config;
use crate::errors::{DeliveryError, StartupError};
use crate::event::Event;
use crate::http_utils::build_client;

const HONEYCOMB_TEAM_HEADER: &str = "X-Honeycomb-Team";
const HONEYCOMB_EVENT_TIME_HEADER: &str = "X-Honeycomb-Event-Time";
const HONEYCOMB_SAMPLE_RATE_HEADER: &str = "X-Honeycomb-Samplerate";
const SINK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Sends an event that has already been through local sampling.
    async fn send_presampled(&self, event: &Event) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct HoneycombSink {
    client: reqwest::Client,
    events_url: Url,
    headers: HeaderMap,
}

impl HoneycombSink {
    pub fn new(config: &Config) -> Result<Self, StartupError> {
        let client = build_client(config.https_proxy.as_deref(), SINK_TIMEOUT).map_err(|e| {
            StartupError::ClientConstruction {
                client: "honeycomb",
                reason: e.to_string(),
            }
        })?;
        Self::with_client(
            client,
            &config.honeycomb_host,
            &config.honeycomb_dataset,
            &config.honeycomb_api_key,
        )
    }

    pub fn with_client(
        client: reqwest::Client,
        host: &str,
        dataset: &str,
        api_key: &str,
    ) -> Result<Self, StartupError> {
        let invalid = |reason: String| StartupError::ClientConstruction {
            client: "honeycomb",
            reason,
        };

        let mut events_url = Url::parse(host).map_err(|e| invalid(e.to_string()))?;
        events_url
            .path_segments_mut()
            .map_err(|()| invalid(format!("{host} cannot be a base URL")))?
            .pop_if_empty()
            .extend(["1", "events", dataset]);

        let mut headers = HeaderMap::new();
        headers.insert(
            HONEYCOMB_TEAM_HEADER,
            HeaderValue::from_str(api_key)
                .map_err(|_| invalid("API key is not a valid header value".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        debug!("Honeycomb events endpoint: {events_url}");
        Ok(Self {
            client,
            events_url,
            headers,
        })
    }

    #[must_use]
    pub fn events_url(&self) -> &Url {
        &self.events_url
    }
}

#[async_trait]
impl EventSink for HoneycombSink {
    async fn send_presampled(&self, event: &Event) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(event.fields())
            .map_err(|e| DeliveryError::Payload(e.to_string()))?;

        let time = Instant::now();
        let resp = self
            .client
            .post(self.events_url.clone())
            .headers(self.headers.clone())
            .header(
                HONEYCOMB_EVENT_TIME_HEADER,
                event.timestamp().to_rfc3339_opts(SecondsFormat::Nanos, true),
            )
            .header(HONEYCOMB_SAMPLE_RATE_HEADER, event.sample_rate())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            debug!(
                "Sent event with sample rate {} in {} ms",
                event.sample_rate(),
                time.elapsed().as_millis()
            );
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DeliveryError::Destination { status, body })
    }
}
