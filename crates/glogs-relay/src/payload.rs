// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload decoding and normalization.
//!
//! A Cloud Logging entry arrives as an arbitrary JSON object. Before it can be
//! scored and shipped it is reshaped in two passes:
//!
//! 1. nested objects are flattened into dot-joined keys, up to a bounded depth
//!    (`{"jsonPayload": {"duration": "21"}}` becomes
//!    `{"jsonPayload.duration": "21"}`);
//! 2. a fixed set of proxy access-log fields that Envoy emits as strings are
//!    coerced to integers, and dropped when they do not parse.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::DecodeError;

/// A log entry as an ordered mapping of field name to JSON value.
pub type Payload = Map<String, Value>;

/// How many levels of nested objects are merged into their parent.
pub const DEFAULT_UNNEST_DEPTH: usize = 2;

/// Fields that are emitted as strings but should be numeric downstream.
pub const NUMERIC_FIELD_PATHS: [&str; 5] = [
    "jsonPayload.bytes_received",
    "jsonPayload.bytes_sent",
    "jsonPayload.duration",
    "jsonPayload.response_code",
    "jsonPayload.upstream_service_time",
];

/// Parses a message body into a payload.
///
/// A JSON `null` body is treated as an empty entry. Any other non-object
/// document is rejected.
pub fn decode(data: &[u8]) -> Result<Payload, DecodeError> {
    match serde_json::from_slice::<Value>(data)? {
        Value::Object(payload) => Ok(payload),
        Value::Null => Ok(Payload::new()),
        Value::Bool(_) => Err(DecodeError::NotAnObject("a boolean")),
        Value::Number(_) => Err(DecodeError::NotAnObject("a number")),
        Value::String(_) => Err(DecodeError::NotAnObject("a string")),
        Value::Array(_) => Err(DecodeError::NotAnObject("an array")),
    }
}

/// Flattens `payload` to [`DEFAULT_UNNEST_DEPTH`] and fixes numeric field types.
#[must_use]
pub fn normalize(payload: Payload) -> Payload {
    normalize_with_depth(payload, DEFAULT_UNNEST_DEPTH)
}

#[must_use]
pub fn normalize_with_depth(payload: Payload, depth: usize) -> Payload {
    let mut payload = unnest_fields(payload, depth);
    fix_field_types(&mut payload);
    payload
}

/// Merges object values into their parent under `"parent.child"` keys.
///
/// Each nested object is itself unnested with `depth - 1` before being merged,
/// so with a depth of 2 up to three levels of objects collapse into one. Once
/// the depth is exhausted remaining objects are kept as opaque values.
///
/// When a flattened key collides with an existing one the result is decided by
/// position, not by iteration luck: a key that was already flat at this level
/// keeps its value, and between two flattened keys the first one in document
/// order is kept.
#[must_use]
pub fn unnest_fields(payload: Payload, depth: usize) -> Payload {
    if depth == 0 {
        return payload;
    }

    let flat_keys: HashSet<String> = payload
        .iter()
        .filter(|(_, value)| !value.is_object())
        .map(|(key, _)| key.clone())
        .collect();

    let mut result = Payload::with_capacity(payload.len());
    for (key, value) in payload {
        match value {
            Value::Object(nested) => {
                for (sub_key, sub_value) in unnest_fields(nested, depth - 1) {
                    let flattened = format!("{key}.{sub_key}");
                    if flat_keys.contains(&flattened) || result.contains_key(&flattened) {
                        debug!("Dropping flattened field {flattened}: key already present");
                        continue;
                    }
                    result.insert(flattened, sub_value);
                }
            }
            value @ (Value::Null
            | Value::Bool(_)
            | Value::Number(_)
            | Value::String(_)
            | Value::Array(_)) => {
                result.insert(key, value);
            }
        }
    }
    result
}

/// Coerces the [`NUMERIC_FIELD_PATHS`] that hold strings into integers.
///
/// A field whose string does not parse as an integer is removed. Fields that
/// are missing or already hold a non-string value are left alone, which makes
/// this idempotent.
pub fn fix_field_types(payload: &mut Payload) {
    for field in NUMERIC_FIELD_PATHS {
        let parsed = match payload.get(field) {
            Some(Value::String(raw)) => raw.parse::<i64>().ok(),
            Some(
                Value::Null
                | Value::Bool(_)
                | Value::Number(_)
                | Value::Array(_)
                | Value::Object(_),
            )
            | None => continue,
        };
        match parsed {
            Some(number) => {
                payload.insert(field.to_string(), Value::from(number));
            }
            None => {
                debug!("Removing non-numeric value of {field}");
                payload.remove(field);
            }
        }
    }
}
