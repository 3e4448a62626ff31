// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the relay pipeline.

use reqwest::StatusCode;

/// The inbound message body could not be turned into a payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("issue unmarshaling pubsub payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("issue unmarshaling pubsub payload: expected a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// The sink refused or never received an event.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to encode event: {0}")]
    Payload(String),

    #[error("failed to reach event sink: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("event sink responded with {status}: {body}")]
    Destination { status: StatusCode, body: String },
}

/// Errors talking to the upstream queue. These never count against a message.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("failed to obtain access token: {0}")]
    Token(String),

    #[error("pubsub request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("pubsub responded with {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("invalid pubsub message {message_id}: {reason}")]
    InvalidMessage { message_id: String, reason: String },
}

/// Fatal problems found before the consumption loop starts.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("missing Honeycomb API Key (HC_API_KEY)")]
    MissingApiKey,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to build {client} client: {reason}")]
    ClientConstruction {
        client: &'static str,
        reason: String,
    },

    #[error("failed to bind health server on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single message ended in the failed state.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_display() {
        assert_eq!(
            StartupError::MissingApiKey.to_string(),
            "missing Honeycomb API Key (HC_API_KEY)"
        );
        assert_eq!(
            StartupError::InvalidConfig("PORT must be greater than 0".to_string()).to_string(),
            "Invalid configuration: PORT must be greater than 0"
        );
    }

    #[test]
    fn test_processing_error_is_transparent() {
        let decode = DecodeError::NotAnObject("array");
        let expected = decode.to_string();
        let err = ProcessingError::from(decode);
        assert_eq!(err.to_string(), expected);
    }

    #[test]
    fn test_destination_error_display() {
        let err = DeliveryError::Destination {
            status: StatusCode::UNAUTHORIZED,
            body: "unknown API key".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "event sink responded with 401 Unauthorized: unknown API key"
        );
    }
}
