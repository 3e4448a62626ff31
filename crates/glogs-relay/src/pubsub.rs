// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Google Cloud Pub/Sub pull subscription over the REST API.
//!
//! Only the calls the relay needs are implemented: `pull`, `acknowledge`,
//! and `modifyAckDeadline`, which both extends leases and, with a zero
//! deadline, nacks.
//! Requests are authorized with a bearer token that is either configured
//! statically or fetched from the GCE metadata server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{StartupError, SubscriptionError};
use crate::http_utils::build_client;
use crate::subscription::{ReceivedMessage, Subscription};

pub const DEFAULT_PUBSUB_API_URL: &str = "https://pubsub.googleapis.com";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Upper bound Pub/Sub accepts for `maxMessages` in a single pull.
pub const MAX_MESSAGES_PER_PULL: usize = 1000;

// Pull is a long poll, so it gets more room than the other calls.
const PUBSUB_TIMEOUT: Duration = Duration::from_secs(90);
// Refresh metadata tokens this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Produces bearer tokens for Pub/Sub requests.
#[derive(Debug, Clone)]
pub enum TokenFactory {
    Static(String),
    Metadata {
        client: reqwest::Client,
        url: String,
        cached: Arc<Mutex<Option<CachedToken>>>,
    },
}

impl TokenFactory {
    #[must_use]
    pub fn new_from_static_token(token: &str) -> Self {
        Self::Static(token.to_string())
    }

    #[must_use]
    pub fn new_from_metadata_server(client: reqwest::Client, url: &str) -> Self {
        Self::Metadata {
            client,
            url: url.to_string(),
            cached: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get_token(&self) -> Result<String, SubscriptionError> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::Metadata {
                client,
                url,
                cached,
            } => {
                let mut cached = cached.lock().await;
                if let Some(current) = cached.as_ref() {
                    if current.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                        return Ok(current.token.clone());
                    }
                }

                debug!("Fetching access token from metadata server");
                let resp = client
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| SubscriptionError::Token(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(SubscriptionError::Token(format!(
                        "metadata server responded with {}",
                        resp.status()
                    )));
                }
                let fetched: MetadataToken = resp
                    .json()
                    .await
                    .map_err(|e| SubscriptionError::Token(e.to_string()))?;

                let token = fetched.access_token;
                *cached = Some(CachedToken {
                    token: token.clone(),
                    expires_at: Instant::now() + Duration::from_secs(fetched.expires_in),
                });
                Ok(token)
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: [&'a str; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyAckDeadlineRequest<'a> {
    ack_ids: [&'a str; 1],
    ack_deadline_seconds: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct WireMessage {
    data: String,
    attributes: HashMap<String, String>,
    message_id: String,
    publish_time: String,
}

impl WireReceivedMessage {
    fn into_received(self) -> Result<ReceivedMessage, SubscriptionError> {
        let WireMessage {
            data,
            attributes,
            message_id,
            publish_time,
        } = self.message;

        let data = STANDARD
            .decode(data.as_bytes())
            .map_err(|e| SubscriptionError::InvalidMessage {
                message_id: message_id.clone(),
                reason: format!("data is not base64: {e}"),
            })?;
        let publish_time = DateTime::parse_from_rfc3339(&publish_time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| {
                debug!("Message {message_id} has no valid publishTime, using receive time");
                Utc::now()
            });

        Ok(ReceivedMessage {
            ack_id: self.ack_id,
            message_id,
            data: Bytes::from(data),
            attributes,
            publish_time,
        })
    }
}

/// A Pub/Sub subscription reached through `{api_url}/v1/projects/{project}/subscriptions/{id}`.
#[derive(Debug, Clone)]
pub struct PubSubSubscription {
    client: reqwest::Client,
    subscription_url: String,
    token_factory: TokenFactory,
}

impl PubSubSubscription {
    pub fn new(config: &Config) -> Result<Self, StartupError> {
        let client = build_client(config.https_proxy.as_deref(), PUBSUB_TIMEOUT).map_err(|e| {
            StartupError::ClientConstruction {
                client: "pubsub",
                reason: e.to_string(),
            }
        })?;
        let token_factory = match &config.pubsub_access_token {
            Some(token) => TokenFactory::new_from_static_token(token),
            None => TokenFactory::new_from_metadata_server(client.clone(), METADATA_TOKEN_URL),
        };
        Ok(Self::with_client(
            client,
            &config.pubsub_api_url,
            &config.project_id,
            &config.subscription_id,
            token_factory,
        ))
    }

    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        api_url: &str,
        project_id: &str,
        subscription_id: &str,
        token_factory: TokenFactory,
    ) -> Self {
        let subscription_url = format!(
            "{}/v1/projects/{project_id}/subscriptions/{subscription_id}",
            api_url.trim_end_matches('/')
        );
        Self {
            client,
            subscription_url,
            token_factory,
        }
    }

    #[must_use]
    pub fn subscription_url(&self) -> &str {
        &self.subscription_url
    }

    async fn post<T: Serialize + Sync>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<reqwest::Response, SubscriptionError> {
        let token = self.token_factory.get_token().await?;
        let resp = self
            .client
            .post(format!("{}:{method}", self.subscription_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SubscriptionError::Status { status, body })
    }

    async fn modify_ack_deadline(
        &self,
        ack_id: &str,
        ack_deadline_seconds: u32,
    ) -> Result<(), SubscriptionError> {
        self.post(
            "modifyAckDeadline",
            &ModifyAckDeadlineRequest {
                ack_ids: [ack_id],
                ack_deadline_seconds,
            },
        )
        .await
        .map(drop)
    }
}

#[async_trait]
impl Subscription for PubSubSubscription {
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
        let max_messages = max_messages.clamp(1, MAX_MESSAGES_PER_PULL);
        let resp = self.post("pull", &PullRequest { max_messages }).await?;
        let pulled: PullResponse = resp.json().await?;

        let mut messages = Vec::with_capacity(pulled.received_messages.len());
        for wire in pulled.received_messages {
            let ack_id = wire.ack_id.clone();
            match wire.into_received() {
                Ok(message) => messages.push(message),
                Err(e) => {
                    // The body can never be decoded, so hand it straight back.
                    warn!("{e}");
                    if let Err(e) = self.modify_ack_deadline(&ack_id, 0).await {
                        warn!("Failed to nack undecodable message: {e}");
                    }
                }
            }
        }
        debug!("Pulled {} messages", messages.len());
        Ok(messages)
    }

    async fn acknowledge(&self, ack_id: &str) -> Result<(), SubscriptionError> {
        self.post("acknowledge", &AcknowledgeRequest { ack_ids: [ack_id] })
            .await
            .map(drop)
    }

    async fn extend_ack_deadline(
        &self,
        ack_id: &str,
        seconds: u32,
    ) -> Result<(), SubscriptionError> {
        self.modify_ack_deadline(ack_id, seconds).await
    }

    async fn nack(&self, ack_id: &str) -> Result<(), SubscriptionError> {
        self.modify_ack_deadline(ack_id, 0).await
    }
}
