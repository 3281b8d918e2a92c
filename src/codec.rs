//! Retry metadata codec.
//!
//! Retry bookkeeping travels inside the message's application properties so the broker, not
//! this crate, owns its durability. This module is the only place that reads or writes those
//! keys; every numeric, date and list coercion happens here.
//!
//! Wire contract (keys and value shapes are fixed for interop):
//!
//! | key | value |
//! |---|---|
//! | `x-retry-original-id` | string |
//! | `x-retry-attempt` | integer, completed attempts |
//! | `x-retry-first-attempt` | ISO-8601, millisecond precision, `Z` suffix |
//! | `x-retry-last-attempt` | ISO-8601, millisecond precision, `Z` suffix |
//! | `x-retry-max-attempts` | integer |
//! | `x-retry-delay-intervals` | JSON array of integer milliseconds, as a string |
//!
//! Malformed values never fail extraction: each unreadable field falls back to the policy (or
//! to "now" for timestamps, `0` for the attempt count).

use crate::clock::{Clock, SystemClock};
use crate::message::{OutboundMessage, ReceivedMessage};
use crate::policy::RetryPolicy;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const RETRY_ORIGINAL_ID: &str = "x-retry-original-id";
pub const RETRY_ATTEMPT: &str = "x-retry-attempt";
pub const RETRY_FIRST_ATTEMPT: &str = "x-retry-first-attempt";
pub const RETRY_LAST_ATTEMPT: &str = "x-retry-last-attempt";
pub const RETRY_MAX_ATTEMPTS: &str = "x-retry-max-attempts";
pub const RETRY_DELAY_INTERVALS: &str = "x-retry-delay-intervals";

/// Typed view of the retry properties of one in-flight message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryMetadata {
    /// Id of the first delivery; stable across every retry generation.
    pub original_message_id: String,
    /// Failed attempts recorded so far, not counting the one being handled.
    pub attempt_count: u32,
    pub first_attempt_time: DateTime<Utc>,
    pub last_attempt_time: DateTime<Utc>,
    /// Policy budget frozen when the message first failed.
    pub max_retries: u32,
    /// Policy schedule frozen when the message first failed.
    pub delay_intervals: Vec<Duration>,
}

/// Translates between property bags and [`RetryMetadata`].
#[derive(Debug, Clone)]
pub struct MetadataCodec {
    clock: Arc<dyn Clock>,
}

impl Default for MetadataCodec {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MetadataCodec {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Read retry metadata from `message`, or start fresh metadata for a first failure.
    pub fn extract(&self, message: &ReceivedMessage, policy: &RetryPolicy) -> RetryMetadata {
        let now = self.clock.now();
        let props = &message.properties;

        let Some(original_id) = props.get(RETRY_ORIGINAL_ID).and_then(value_as_string) else {
            let original_message_id = match message.message_id.as_deref() {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => format!("msg-{}", now.timestamp_millis()),
            };
            return RetryMetadata {
                original_message_id,
                attempt_count: 0,
                first_attempt_time: now,
                last_attempt_time: now,
                max_retries: policy.max_attempts(),
                delay_intervals: policy.delay_schedule().to_vec(),
            };
        };

        RetryMetadata {
            original_message_id: original_id,
            attempt_count: props.get(RETRY_ATTEMPT).and_then(value_as_u32).unwrap_or(0),
            first_attempt_time: props
                .get(RETRY_FIRST_ATTEMPT)
                .and_then(value_as_timestamp)
                .unwrap_or(now),
            last_attempt_time: props
                .get(RETRY_LAST_ATTEMPT)
                .and_then(value_as_timestamp)
                .unwrap_or(now),
            max_retries: props
                .get(RETRY_MAX_ATTEMPTS)
                .and_then(value_as_u32)
                .filter(|n| *n > 0)
                .unwrap_or_else(|| policy.max_attempts()),
            delay_intervals: props
                .get(RETRY_DELAY_INTERVALS)
                .and_then(value_as_delays)
                .unwrap_or_else(|| policy.delay_schedule().to_vec()),
        }
    }

    /// Build the clone that carries `metadata` into the next delivery.
    ///
    /// The clone keeps body, content type and any foreign properties of `message`; the six
    /// retry keys are overwritten, with `attempt_count` as the recorded count and the last
    /// attempt stamped now.
    pub fn embed(
        &self,
        metadata: &RetryMetadata,
        attempt_count: u32,
        message: &ReceivedMessage,
    ) -> OutboundMessage {
        let mut properties = message.properties.clone();
        properties.insert(
            RETRY_ORIGINAL_ID.to_string(),
            Value::from(metadata.original_message_id.clone()),
        );
        properties.insert(RETRY_ATTEMPT.to_string(), Value::from(attempt_count));
        properties.insert(
            RETRY_FIRST_ATTEMPT.to_string(),
            Value::from(format_timestamp(metadata.first_attempt_time)),
        );
        properties.insert(
            RETRY_LAST_ATTEMPT.to_string(),
            Value::from(format_timestamp(self.clock.now())),
        );
        properties.insert(RETRY_MAX_ATTEMPTS.to_string(), Value::from(metadata.max_retries));
        properties.insert(
            RETRY_DELAY_INTERVALS.to_string(),
            Value::from(encode_delays(&metadata.delay_intervals)),
        );

        OutboundMessage {
            message_id: Some(format!("{}-retry-{}", metadata.original_message_id, attempt_count)),
            body: message.body.clone(),
            content_type: message.content_type.clone(),
            properties,
        }
    }
}

/// Render a timestamp the way JavaScript's `toISOString` does.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn encode_delays(delays: &[Duration]) -> String {
    let millis: Vec<u64> =
        delays.iter().map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)).collect();
    Value::from(millis).to_string()
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn value_as_delays(value: &Value) -> Option<Vec<Duration>> {
    let parsed;
    let items = match value {
        Value::String(s) => {
            parsed = serde_json::from_str::<Value>(s).ok()?;
            parsed.as_array()?
        }
        Value::Array(items) => items,
        _ => return None,
    };
    let delays = items
        .iter()
        .map(|v| v.as_u64().map(Duration::from_millis))
        .collect::<Option<Vec<_>>>()?;
    if delays.is_empty() {
        None
    } else {
        Some(delays)
    }
}
