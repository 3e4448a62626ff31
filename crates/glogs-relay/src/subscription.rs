// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::errors::SubscriptionError;

/// A message leased from the upstream queue.
///
/// The lease is released with [`Subscription::acknowledge`] once the message
/// is handled, or with [`Subscription::nack`] to have it redelivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message_id: String,
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
    pub publish_time: DateTime<Utc>,
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Leases up to `max_messages` messages. May return fewer, including none.
    async fn pull(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, SubscriptionError>;

    /// Marks a message as handled so it is never redelivered.
    async fn acknowledge(&self, ack_id: &str) -> Result<(), SubscriptionError>;

    /// Pushes the message's ack deadline `seconds` from now, keeping the lease
    /// while it is still being worked on.
    async fn extend_ack_deadline(
        &self,
        ack_id: &str,
        seconds: u32,
    ) -> Result<(), SubscriptionError>;

    /// Releases the lease immediately, making the message eligible for
    /// redelivery.
    async fn nack(&self, ack_id: &str) -> Result<(), SubscriptionError>;
}
