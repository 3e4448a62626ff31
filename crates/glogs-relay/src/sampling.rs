// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static sampling rules.
//!
//! Every normalized payload is scored with a sample rate `R`: the event is
//! forwarded with probability `1/R` and shipped with `R` attached, so the sink
//! can extrapolate the real volume. Payloads that look like failed requests are
//! always kept.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::payload::Payload;

pub const RESPONSE_FLAGS_FIELD: &str = "jsonPayload.response_flags";
pub const RESPONSE_CODE_FIELD: &str = "jsonPayload.response_code";
pub const CANONICAL_SERVICE_FIELD: &str = "labels.k8s-pod/service_istio_io/canonical-name";

/// Envoy writes this when no response flag applies.
const EMPTY_RESPONSE_FLAGS: &str = "-";

/// Sample rates keyed by payload field, then by the field's string value.
///
/// Keying by field means a field can carry at most one policy, so lookups never
/// depend on iteration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePolicies {
    policies: BTreeMap<String, HashMap<String, u32>>,
}

impl SamplePolicies {
    /// A table with no rules: every payload gets the default rate.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    /// Adds a rule sampling payloads whose `field` equals `value` at `rate`.
    /// Rates below 1 are raised to 1.
    #[must_use]
    pub fn with_policy(mut self, field: &str, value: &str, rate: u32) -> Self {
        self.policies
            .entry(field.to_string())
            .or_default()
            .insert(value.to_string(), rate.max(1));
        self
    }

    /// Returns the configured rate for the first field whose value has a rule.
    #[must_use]
    pub fn rate_for(&self, payload: &Payload) -> Option<u32> {
        self.policies.iter().find_map(|(field, rates)| {
            match payload.get(field) {
                Some(Value::String(value)) => rates.get(value).copied(),
                _ => None,
            }
        })
    }
}

impl Default for SamplePolicies {
    /// The collector's own access logs are extremely chatty and rarely
    /// interesting, so they are kept 1 in 1000.
    fn default() -> Self {
        Self::empty().with_policy(CANONICAL_SERVICE_FIELD, "opentelemetry-collector", 1000)
    }
}

/// Returns the sample rate for a payload.
///
/// Error-looking payloads always get 1. Otherwise the first matching policy
/// wins, falling back to `default_sample_rate`. The result is never below 1.
#[must_use]
pub fn apply_sampling_policy(
    payload: &Payload,
    policies: &SamplePolicies,
    default_sample_rate: u32,
) -> u32 {
    if is_likely_error(payload) {
        return 1;
    }
    policies
        .rate_for(payload)
        .unwrap_or(default_sample_rate)
        .max(1)
}

/// A payload is an error if Envoy set response flags, or the response code is
/// a server error.
#[must_use]
pub fn is_likely_error(payload: &Payload) -> bool {
    if let Some(Value::String(flags)) = payload.get(RESPONSE_FLAGS_FIELD) {
        if !flags.is_empty() && flags != EMPTY_RESPONSE_FLAGS {
            return true;
        }
    }

    match payload.get(RESPONSE_CODE_FIELD) {
        // as_i64 only fails for floats and integers above i64::MAX
        Some(Value::Number(code)) => code.as_i64().map_or(code.is_u64(), |code| code >= 500),
        _ => false,
    }
}

/// Bernoulli trial for a sample rate: `rate <= 1` always keeps, otherwise a
/// uniform draw over `[0, rate)` keeps only on 0.
pub fn should_keep<R: Rng + ?Sized>(rate: u32, rng: &mut R) -> bool {
    if rate <= 1 {
        return true;
    }
    rng.gen_range(0..rate) == 0
}

/// Source of keep/drop decisions, injectable so tests can be deterministic.
pub trait KeepDecider: Send + Sync {
    fn should_keep(&self, rate: u32) -> bool;
}

/// Draws from the thread-local generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngDecider;

impl KeepDecider for ThreadRngDecider {
    fn should_keep(&self, rate: u32) -> bool {
        should_keep(rate, &mut rand::thread_rng())
    }
}

/// Draws from a seeded generator, so a run can be replayed.
#[derive(Debug)]
pub struct SeededDecider {
    rng: Mutex<StdRng>,
}

impl SeededDecider {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl KeepDecider for SeededDecider {
    fn should_keep(&self, rate: u32) -> bool {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        should_keep(rate, &mut *rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn test_apply_sampling_policy() {
        let policies = SamplePolicies::default();
        let cases = [
            ("empty", json!({}), 10),
            (
                "otel-trace",
                json!({CANONICAL_SERVICE_FIELD: "opentelemetry-collector"}),
                1000,
            ),
            (
                "other-service",
                json!({CANONICAL_SERVICE_FIELD: "foo-service"}),
                10,
            ),
            (
                "other-service-with-500",
                json!({
                    CANONICAL_SERVICE_FIELD: "foo-service",
                    RESPONSE_CODE_FIELD: 500,
                }),
                1,
            ),
            (
                "other-service-with-UC",
                json!({
                    CANONICAL_SERVICE_FIELD: "foo-service",
                    RESPONSE_CODE_FIELD: 504,
                    RESPONSE_FLAGS_FIELD: "UC",
                }),
                1,
            ),
        ];
        for (name, p, want) in cases {
            assert_eq!(
                apply_sampling_policy(&payload(p), &policies, 10),
                want,
                "case {name}"
            );
        }
    }

    #[test]
    fn test_error_overrides_matching_policy() {
        let policies = SamplePolicies::default();
        let p = payload(json!({
            CANONICAL_SERVICE_FIELD: "opentelemetry-collector",
            RESPONSE_CODE_FIELD: 503,
        }));
        assert_eq!(apply_sampling_policy(&p, &policies, 10), 1);
    }

    #[test]
    fn test_is_likely_error() {
        assert!(!is_likely_error(&payload(json!({}))));
        assert!(!is_likely_error(&payload(json!({RESPONSE_FLAGS_FIELD: "-"}))));
        assert!(!is_likely_error(&payload(json!({RESPONSE_FLAGS_FIELD: ""}))));
        assert!(is_likely_error(&payload(json!({RESPONSE_FLAGS_FIELD: "NR"}))));
        assert!(!is_likely_error(&payload(json!({RESPONSE_CODE_FIELD: 499}))));
        assert!(is_likely_error(&payload(json!({RESPONSE_CODE_FIELD: 500}))));
        // unconverted strings and floats are not integer response codes
        assert!(!is_likely_error(&payload(json!({RESPONSE_CODE_FIELD: "500"}))));
        assert!(!is_likely_error(&payload(json!({RESPONSE_CODE_FIELD: 500.0}))));
        assert!(is_likely_error(&payload(json!({RESPONSE_CODE_FIELD: u64::MAX}))));
    }

    #[test]
    fn test_policy_requires_string_value() {
        let policies = SamplePolicies::empty().with_policy("jsonPayload.method", "1", 50);
        assert_eq!(
            apply_sampling_policy(&payload(json!({"jsonPayload.method": 1})), &policies, 7),
            7
        );
        assert_eq!(
            apply_sampling_policy(&payload(json!({"jsonPayload.method": "1"})), &policies, 7),
            50
        );
    }

    #[test]
    fn test_empty_table_uses_default_rate() {
        let p = payload(json!({CANONICAL_SERVICE_FIELD: "opentelemetry-collector"}));
        assert_eq!(apply_sampling_policy(&p, &SamplePolicies::empty(), 25), 25);
        assert_eq!(SamplePolicies::empty().rate_for(&p), None);
    }

    #[test]
    fn test_rates_are_never_zero() {
        let policies = SamplePolicies::empty().with_policy("a", "b", 0);
        assert_eq!(apply_sampling_policy(&payload(json!({"a": "b"})), &policies, 10), 1);
        assert_eq!(
            apply_sampling_policy(&payload(json!({})), &SamplePolicies::empty(), 0),
            1
        );
    }

    #[test]
    fn test_should_keep_rate_one_always_keeps() {
        let decider = SeededDecider::new(7);
        assert!((0..10_000).all(|_| decider.should_keep(1)));
        assert!((0..10_000).all(|_| decider.should_keep(0)));
        assert!((0..10_000).all(|_| ThreadRngDecider.should_keep(1)));
    }

    #[test]
    fn test_should_keep_frequency_converges() {
        const TRIALS: u32 = 200_000;
        for rate in [2_u32, 10, 100] {
            let decider = SeededDecider::new(u64::from(rate));
            let kept = (0..TRIALS).filter(|_| decider.should_keep(rate)).count();
            let expected = f64::from(TRIALS) / f64::from(rate);
            let observed = kept as f64;
            assert!(
                (observed - expected).abs() < expected * 0.1,
                "rate {rate}: kept {kept}, expected about {expected}"
            );
        }
    }

    #[test]
    fn test_seeded_decider_is_replayable() {
        let first = SeededDecider::new(42);
        let second = SeededDecider::new(42);
        let a: Vec<bool> = (0..1000).map(|_| first.should_keep(10)).collect();
        let b: Vec<bool> = (0..1000).map(|_| second.should_keep(10)).collect();
        assert_eq!(a, b);
    }
}
