// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Relays Cloud Logging entries exported to a Pub/Sub subscription into a
//! Honeycomb dataset.
//!
//! Every message is decoded, flattened ([`payload`]), given a sample rate
//! ([`sampling`]), kept or dropped, and shipped presampled ([`sink`]). The
//! [`relay`] loop ties the stages together and keeps the counters exposed by
//! the [`health`] server.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod event;
pub mod health;
pub mod http_utils;
pub mod payload;
pub mod pubsub;
pub mod relay;
pub mod sampling;
pub mod sink;
pub mod stats;
pub mod subscription;
