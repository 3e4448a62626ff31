// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The consumption loop and per-message delivery worker.
//!
//! Each pulled message is handled on its own task:
//! decode, normalize, score, keep or drop, deliver, then ack or nack.
//! Delivery is at-least-once. A message is only acknowledged once it has
//! either been delivered or deliberately dropped by sampling, and anything
//! that fails is nacked so the queue redelivers it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Level};

use crate::errors::ProcessingError;
use crate::event::{event_timestamp, Event};
use crate::payload;
use crate::pubsub::MAX_MESSAGES_PER_PULL;
use crate::sampling::{apply_sampling_policy, KeepDecider, SamplePolicies, ThreadRngDecider};
use crate::sink::EventSink;
use crate::stats::{RelayStats, StatsSnapshot};
use crate::subscription::{ReceivedMessage, Subscription};

pub const DEFAULT_SAMPLE_RATE: u32 = 10;
pub const DEFAULT_CONCURRENCY: usize = 1000;

/// How often the lease of an in-flight message is extended. Well under the
/// 10s minimum ack deadline of a subscription.
pub const DEFAULT_LEASE_EXTENSION_INTERVAL: Duration = Duration::from_secs(5);
/// Ack deadline requested on every extension.
pub const LEASE_EXTENSION_SECONDS: u32 = 30;

const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const MIN_LEASE_EXTENSION_INTERVAL: Duration = Duration::from_millis(10);

/// How a single message ended.
#[derive(Debug)]
pub enum Outcome {
    /// Kept by sampling and accepted by the sink.
    Delivered { sample_rate: u32 },
    /// Dropped by sampling. Not an error: the message is still acknowledged.
    Skipped { sample_rate: u32 },
    Failed(ProcessingError),
}

pub struct RelayConfig {
    pub subscription: Arc<dyn Subscription>,
    pub sink: Arc<dyn EventSink>,
    pub policies: SamplePolicies,
    pub keep_decider: Arc<dyn KeepDecider>,
    pub default_sample_rate: u32,
    /// Maximum number of messages in flight at once
    pub concurrency: usize,
    pub lease_extension_interval: Duration,
}

impl RelayConfig {
    /// Production settings: default policies, thread-local randomness.
    #[must_use]
    pub fn new(subscription: Arc<dyn Subscription>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            subscription,
            sink,
            policies: SamplePolicies::default(),
            keep_decider: Arc::new(ThreadRngDecider),
            default_sample_rate: DEFAULT_SAMPLE_RATE,
            concurrency: DEFAULT_CONCURRENCY,
            lease_extension_interval: DEFAULT_LEASE_EXTENSION_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    subscription: Arc<dyn Subscription>,
    sink: Arc<dyn EventSink>,
    policies: Arc<SamplePolicies>,
    keep_decider: Arc<dyn KeepDecider>,
    default_sample_rate: u32,
    concurrency: usize,
    lease_extension_interval: Duration,
    stats: Arc<RelayStats>,
}

impl Relay {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            subscription: config.subscription,
            sink: config.sink,
            policies: Arc::new(config.policies),
            keep_decider: config.keep_decider,
            default_sample_rate: config.default_sample_rate.max(1),
            concurrency: config.concurrency.clamp(1, Semaphore::MAX_PERMITS),
            lease_extension_interval: config
                .lease_extension_interval
                .max(MIN_LEASE_EXTENSION_INTERVAL),
            stats: Arc::new(RelayStats::new()),
        }
    }

    /// Shared handle to the counters, for the health server.
    #[must_use]
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pulls and handles messages until `cancel_token` fires, then waits for
    /// every in-flight message to be acked or nacked.
    ///
    /// At most `concurrency` messages are in flight; each pull asks for no
    /// more than the free slots.
    pub async fn subscribe(&self, cancel_token: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let tracker = TaskTracker::new();
        info!("Relaying messages with up to {} in flight", self.concurrency);

        loop {
            // Hold one slot before pulling so a pull never asks for zero.
            let first_slot = tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                slot = Arc::clone(&slots).acquire_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };
            let max_messages = (slots.available_permits() + 1).min(MAX_MESSAGES_PER_PULL);

            let pulled = tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                pulled = self.subscription.pull(max_messages) => pulled,
            };
            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Failed to pull messages: {e}");
                    drop(first_slot);
                    tokio::select! {
                        () = cancel_token.cancelled() => break,
                        () = tokio::time::sleep(PULL_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let mut first_slot = Some(first_slot);
            for message in messages {
                let slot = match first_slot.take() {
                    Some(slot) => slot,
                    None => match Arc::clone(&slots).acquire_owned().await {
                        Ok(slot) => slot,
                        Err(_) => break,
                    },
                };
                let relay = self.clone();
                tracker.spawn(async move {
                    relay.handle_message(message).await;
                    drop(slot);
                });
            }
        }

        tracker.close();
        debug!("Waiting for {} in-flight messages", tracker.len());
        tracker.wait().await;
        info!("Stopped relaying messages");
    }

    /// Runs one message through the pipeline, records it in the stats and
    /// settles it with the queue.
    pub async fn handle_message(&self, message: ReceivedMessage) -> Outcome {
        self.stats.add_total(1);
        let outcome = self.process_with_lease(&message).await;

        let settled = match &outcome {
            Outcome::Delivered { .. } => {
                self.stats.add_sampled(1);
                self.subscription.acknowledge(&message.ack_id).await
            }
            Outcome::Skipped { .. } => self.subscription.acknowledge(&message.ack_id).await,
            Outcome::Failed(e) => {
                self.stats.add_error(1);
                error!("Failed to relay message {}: {e}", message.message_id);
                self.subscription.nack(&message.ack_id).await
            }
        };
        if let Err(e) = settled {
            warn!("Failed to settle message {}: {e}", message.message_id);
        }
        outcome
    }

    /// Runs [`Relay::process_message`] while periodically extending the
    /// message's ack deadline, so a slow sink does not let the lease lapse.
    async fn process_with_lease(&self, message: &ReceivedMessage) -> Outcome {
        let process = self.process_message(message);
        tokio::pin!(process);

        let period = self.lease_extension_interval;
        let mut extend = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        extend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut process => return outcome,
                _ = extend.tick() => {
                    if let Err(e) = self
                        .subscription
                        .extend_ack_deadline(&message.ack_id, LEASE_EXTENSION_SECONDS)
                        .await
                    {
                        warn!("Failed to extend lease of message {}: {e}", message.message_id);
                    }
                }
            }
        }
    }

    /// Decides what happens to a message without touching stats or the queue.
    pub async fn process_message(&self, message: &ReceivedMessage) -> Outcome {
        let fields = match payload::decode(&message.data) {
            Ok(fields) => payload::normalize(fields),
            Err(e) => return Outcome::Failed(e.into()),
        };
        if tracing::enabled!(Level::DEBUG) {
            debug!(
                "Normalized message {}: {}",
                message.message_id,
                serde_json::to_string(&fields).unwrap_or_default()
            );
        }

        let sample_rate = apply_sampling_policy(&fields, &self.policies, self.default_sample_rate);
        if !self.keep_decider.should_keep(sample_rate) {
            return Outcome::Skipped { sample_rate };
        }

        let timestamp = event_timestamp(&message.attributes, message.publish_time);
        let event = Event::new(fields, timestamp, sample_rate);
        match self.sink.send_presampled(&event).await {
            Ok(()) => Outcome::Delivered { sample_rate },
            Err(e) => Outcome::Failed(e.into()),
        }
    }
}
