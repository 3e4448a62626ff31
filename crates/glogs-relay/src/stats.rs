// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Point-in-time copy of the relay counters.
///
/// Field names match what the health endpoint has always exposed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    #[serde(rename = "Errors")]
    pub errors: u64,
    #[serde(rename = "TotalMessages")]
    pub total_messages: u64,
    #[serde(rename = "SampledMessages")]
    pub sampled_messages: u64,
}

/// Message counters shared by every delivery worker.
///
/// All three counters sit behind a single lock, so a snapshot never observes
/// half of an update. Counters only grow.
#[derive(Debug, Default)]
pub struct RelayStats {
    counters: Mutex<StatsSnapshot>,
}

impl RelayStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_total(&self, n: u64) {
        self.lock().total_messages += n;
    }

    pub fn add_sampled(&self, n: u64) {
        self.lock().sampled_messages += n;
    }

    pub fn add_error(&self, n: u64) {
        self.lock().errors += n;
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        *self.lock()
    }

    // A panic while holding the lock cannot leave the counters half-written,
    // so a poisoned lock is still safe to read.
    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        let encoded = serde_json::to_string(&snapshot).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}
