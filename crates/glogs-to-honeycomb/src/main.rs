// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::error::Error;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use glogs_relay::{
    config::Config,
    health,
    pubsub::PubSubSubscription,
    relay::{Relay, RelayConfig},
    sink::HoneycombSink,
};

const HEALTH_HOST: [u8; 4] = [0, 0, 0, 0];

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = run().await {
        error!("issue running: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = Config::from_env()?;

    let sink = HoneycombSink::new(&config)?;
    let subscription = PubSubSubscription::new(&config)?;
    info!(
        "Relaying {} to Honeycomb dataset {}",
        subscription.subscription_url(),
        config.honeycomb_dataset
    );

    let relay = Relay::new(RelayConfig {
        default_sample_rate: config.default_sample_rate,
        concurrency: config.concurrency,
        ..RelayConfig::new(Arc::new(subscription), Arc::new(sink))
    });

    let listener = health::bind(SocketAddr::from((HEALTH_HOST, config.port))).await?;

    let cancel_token = CancellationToken::new();
    let health_handle = tokio::spawn(health::serve(listener, relay.stats(), cancel_token.clone()));
    let relay_handle = tokio::spawn({
        let relay = relay.clone();
        let cancel_token = cancel_token.clone();
        async move { relay.subscribe(cancel_token).await }
    });

    info!("servers started.");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {e}");
        }
    };
    let supervised = supervise(relay_handle, health_handle, cancel_token, shutdown_signal).await;
    info!("final stats: {}", relay.stats());
    supervised.map_err(Into::into)
}

/// Waits for the shutdown signal or for either task to stop, whichever comes
/// first, then cancels and joins both. Either task stopping on its own is a
/// failure.
async fn supervise<F>(
    mut relay_handle: JoinHandle<()>,
    mut health_handle: JoinHandle<io::Result<()>>,
    cancel_token: CancellationToken,
    shutdown_signal: F,
) -> Result<(), String>
where
    F: Future<Output = ()>,
{
    let (relay_stopped, health_stopped) = tokio::select! {
        () = shutdown_signal => (None, None),
        result = &mut relay_handle => (Some(result), None),
        result = &mut health_handle => (None, Some(result)),
    };
    info!("shutting down.");
    cancel_token.cancel();

    let relay_stopped_early = relay_stopped.is_some();
    let health_stopped_early = health_stopped.is_some();
    let relay_result = match relay_stopped {
        Some(result) => result,
        None => relay_handle.await,
    };
    let health_result = match health_stopped {
        Some(result) => result,
        None => health_handle.await,
    };

    let mut failures = Vec::new();
    match relay_result {
        Err(e) => failures.push(format!("relay task failed: {e}")),
        Ok(()) if relay_stopped_early => failures.push("relay stopped unexpectedly".to_string()),
        Ok(()) => {}
    }
    match health_result {
        Err(e) => failures.push(format!("health server task failed: {e}")),
        Ok(Err(e)) => failures.push(format!("health server failed: {e}")),
        Ok(Ok(())) if health_stopped_early => {
            failures.push("health server stopped unexpectedly".to_string());
        }
        Ok(Ok(())) => {}
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn waits_for_cancel(cancel_token: &CancellationToken) -> JoinHandle<()> {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { cancel_token.cancelled().await })
    }

    fn health_waits_for_cancel(cancel_token: &CancellationToken) -> JoinHandle<io::Result<()>> {
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move {
            cancel_token.cancelled().await;
            Ok(())
        })
    }

    async fn supervise_with_timeout(
        relay_handle: JoinHandle<()>,
        health_handle: JoinHandle<io::Result<()>>,
        cancel_token: CancellationToken,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<(), String> {
        tokio::time::timeout(
            Duration::from_secs(5),
            supervise(relay_handle, health_handle, cancel_token, shutdown_signal),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_both_tasks() {
        let cancel_token = CancellationToken::new();
        let result = supervise_with_timeout(
            waits_for_cancel(&cancel_token),
            health_waits_for_cancel(&cancel_token),
            cancel_token.clone(),
            async {},
        )
        .await;

        assert_eq!(result, Ok(()));
        assert!(cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_relay_panic_stops_health_server() {
        let cancel_token = CancellationToken::new();
        let relay_handle = tokio::spawn(async { panic!("semaphore limit") });
        let health_handle = health_waits_for_cancel(&cancel_token);

        let err = supervise_with_timeout(
            relay_handle,
            health_handle,
            cancel_token.clone(),
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert!(err.contains("relay task failed"), "{err}");
        assert!(!err.contains("health"), "{err}");
        assert!(cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_health_failure_stops_relay() {
        let cancel_token = CancellationToken::new();
        let relay_handle = waits_for_cancel(&cancel_token);
        let health_handle = tokio::spawn(async {
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        });

        let err = supervise_with_timeout(
            relay_handle,
            health_handle,
            cancel_token.clone(),
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, "health server failed: too many open files");
        assert!(cancel_token.is_cancelled());
    }

    #[tokio::test]
    async fn test_relay_returning_on_its_own_is_a_failure() {
        let cancel_token = CancellationToken::new();
        let relay_handle = tokio::spawn(async {});
        let health_handle = health_waits_for_cancel(&cancel_token);

        let err = supervise_with_timeout(
            relay_handle,
            health_handle,
            cancel_token.clone(),
            std::future::pending(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, "relay stopped unexpectedly");
    }
}
