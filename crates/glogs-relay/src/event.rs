// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::trace;

use crate::payload::Payload;

/// Message attribute Cloud Logging sets to the entry's own timestamp.
pub const TIMESTAMP_ATTRIBUTE: &str = "logging.googleapis.com/timestamp";

/// Field recording which relay schema produced an event.
pub const VERSION_FIELD: &str = "glogs-to-honeycomb-version";
pub const VERSION: u64 = 2;

/// A presampled event ready for the sink.
///
/// The sink must not sample it again: `sample_rate` records the local
/// decision so the sink can weight the event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    fields: Payload,
    timestamp: DateTime<Utc>,
    sample_rate: u32,
}

impl Event {
    /// Builds an event from a normalized payload. The version field is always
    /// set, replacing any value the payload carried under the same name.
    #[must_use]
    pub fn new(mut fields: Payload, timestamp: DateTime<Utc>, sample_rate: u32) -> Self {
        fields.insert(VERSION_FIELD.to_string(), Value::from(VERSION));
        Self {
            fields,
            timestamp,
            sample_rate: sample_rate.max(1),
        }
    }

    #[must_use]
    pub fn fields(&self) -> &Payload {
        &self.fields
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// The entry timestamp from the message attributes, or the publish time when
/// the attribute is missing or not RFC 3339.
#[must_use]
pub fn event_timestamp(
    attributes: &HashMap<String, String>,
    publish_time: DateTime<Utc>,
) -> DateTime<Utc> {
    let Some(raw) = attributes.get(TIMESTAMP_ATTRIBUTE) else {
        return publish_time;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(timestamp) => timestamp.with_timezone(&Utc),
        Err(e) => {
            trace!("Ignoring unparsable {TIMESTAMP_ATTRIBUTE} {raw:?}: {e}");
            publish_time
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn publish_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_timestamp_from_attribute() {
        let attributes = HashMap::from([(
            TIMESTAMP_ATTRIBUTE.to_string(),
            "2024-05-01T11:59:58.123456789Z".to_string(),
        )]);
        let ts = event_timestamp(&attributes, publish_time());
        assert_eq!(
            ts,
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 59, 58).unwrap()
                + chrono::Duration::nanoseconds(123_456_789)
        );
    }

    #[test]
    fn test_timestamp_with_offset_is_converted_to_utc() {
        let attributes = HashMap::from([(
            TIMESTAMP_ATTRIBUTE.to_string(),
            "2024-05-01T14:00:00+02:00".to_string(),
        )]);
        let fallback = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(event_timestamp(&attributes, fallback), publish_time());
    }

    #[test]
    fn test_timestamp_falls_back_to_publish_time() {
        assert_eq!(event_timestamp(&HashMap::new(), publish_time()), publish_time());

        let attributes =
            HashMap::from([(TIMESTAMP_ATTRIBUTE.to_string(), "yesterday".to_string())]);
        assert_eq!(event_timestamp(&attributes, publish_time()), publish_time());
    }

    #[test]
    fn test_event_sets_version_field() {
        let fields = match json!({"jsonPayload.duration": 21, VERSION_FIELD: 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let event = Event::new(fields, publish_time(), 10);
        assert_eq!(event.fields()[VERSION_FIELD], json!(2));
        assert_eq!(event.fields()["jsonPayload.duration"], json!(21));
        assert_eq!(event.sample_rate(), 10);
        assert_eq!(event.timestamp(), publish_time());
    }
}
