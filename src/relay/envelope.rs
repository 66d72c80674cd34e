//! Pure message-envelope processing for the relay
//!
//! Everything here is deterministic given its inputs (the clock is passed in),
//! so the whole validate/transform/stamp cycle is testable without a broker.

use super::topic::{validate_topic_name, TopicTransformer};
use crate::connection::{InboundMessage, PublishOptions, QoS};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field injected into every republished object
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Caller-supplied publish options; every field present wins over the per-message default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOverrides {
    pub qos: Option<QoS>,
    pub retain: Option<bool>,
}

impl PublishOverrides {
    pub fn new(qos: QoS, retain: bool) -> Self {
        Self {
            qos: Some(qos),
            retain: Some(retain),
        }
    }

    /// Merge field by field over the defaults derived from the inbound delivery
    pub fn resolve(&self, inbound_qos: QoS) -> PublishOptions {
        PublishOptions {
            qos: self.qos.unwrap_or(inbound_qos),
            retain: self.retain.unwrap_or(false),
        }
    }
}

/// Why an inbound message was not republished
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("Invalid json message: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Will not republish message of type {kind}")]
    NotAnObject { kind: &'static str },
    #[error("Not forwarding retained message")]
    Retained,
    #[error("Topic transformer produced unpublishable topic '{topic}'")]
    InvalidDestination { topic: String },
}

/// A message ready to hand to the connection
#[derive(Debug, Clone, PartialEq)]
pub struct Republish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

/// JSON type name used in diagnostics
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse the payload and require a top-level JSON object
pub fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, Rejection> {
    let value: Value = serde_json::from_slice(payload).map_err(Rejection::InvalidJson)?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Rejection::NotAnObject {
            kind: json_kind(&other),
        }),
    }
}

/// Whether a timestamp value counts as missing: absent, null, false, zero or ""
pub fn timestamp_is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f == 0.0),
        Some(Value::Bool(true)) | Some(Value::Array(_)) | Some(Value::Object(_)) => false,
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2020-01-01T00:00:00.000Z`
pub fn format_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Set the timestamp field unless a truthy value is already present; returns true if stamped
pub fn ensure_timestamp(object: &mut Map<String, Value>, now: DateTime<Utc>) -> bool {
    if timestamp_is_missing(object.get(TIMESTAMP_FIELD)) {
        object.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(format_timestamp(now)),
        );
        true
    } else {
        false
    }
}

/// Run the full validation and transformation cycle for one inbound message
///
/// Checks run in order: JSON parse, object shape, retain flag. Only then is
/// the transformer invoked, exactly once.
pub fn prepare_republish(
    message: &InboundMessage,
    transformer: &dyn TopicTransformer,
    overrides: &PublishOverrides,
    now: DateTime<Utc>,
) -> Result<Republish, Rejection> {
    let mut object = parse_object(&message.payload)?;

    if message.retain {
        return Err(Rejection::Retained);
    }

    let topic = transformer.transform(&message.topic);
    if validate_topic_name(&topic).is_err() {
        return Err(Rejection::InvalidDestination { topic });
    }

    ensure_timestamp(&mut object, now);

    // Serializing a Map<String, Value> cannot fail: keys are strings, values are plain JSON.
    let payload = serde_json::to_vec(&object).unwrap_or_default();

    Ok(Republish {
        topic,
        payload,
        options: overrides.resolve(message.qos),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 45).unwrap()
            + chrono::Duration::milliseconds(123)
    }

    fn to_new_topic(_: &str) -> String {
        "newTopic".to_string()
    }

    #[test]
    fn test_format_timestamp_millis_utc() {
        assert_eq!(format_timestamp(fixed_now()), "2024-03-09T12:30:45.123Z");
    }

    #[test]
    fn test_timestamp_missing_predicate() {
        assert!(timestamp_is_missing(None));
        assert!(timestamp_is_missing(Some(&Value::Null)));
        assert!(timestamp_is_missing(Some(&json!(false))));
        assert!(timestamp_is_missing(Some(&json!(0))));
        assert!(timestamp_is_missing(Some(&json!(0.0))));
        assert!(timestamp_is_missing(Some(&json!(""))));

        assert!(!timestamp_is_missing(Some(&json!(true))));
        assert!(!timestamp_is_missing(Some(&json!(1))));
        assert!(!timestamp_is_missing(Some(&json!(-1))));
        assert!(!timestamp_is_missing(Some(&json!("2020-01-01T00:00:00.000Z"))));
        assert!(!timestamp_is_missing(Some(&json!([]))));
        assert!(!timestamp_is_missing(Some(&json!({}))));
    }

    #[test]
    fn test_ensure_timestamp_respects_existing() {
        let mut object = Map::new();
        object.insert(TIMESTAMP_FIELD.to_string(), json!(1_700_000_000));
        assert!(!ensure_timestamp(&mut object, fixed_now()));
        assert_eq!(object[TIMESTAMP_FIELD], json!(1_700_000_000));

        let mut object = Map::new();
        object.insert(TIMESTAMP_FIELD.to_string(), json!(""));
        assert!(ensure_timestamp(&mut object, fixed_now()));
        assert_eq!(object[TIMESTAMP_FIELD], json!("2024-03-09T12:30:45.123Z"));
    }

    #[test]
    fn test_parse_object_kinds() {
        assert!(parse_object(b"{}").is_ok());
        assert!(matches!(
            parse_object(b"invalid json"),
            Err(Rejection::InvalidJson(_))
        ));

        for (payload, expected) in [
            (&b"true"[..], "boolean"),
            (&b"5"[..], "number"),
            (&b"\"invalid\""[..], "string"),
            (&b"[1,2,3]"[..], "array"),
            (&b"null"[..], "null"),
        ] {
            match parse_object(payload) {
                Err(Rejection::NotAnObject { kind }) => assert_eq!(kind, expected),
                other => panic!("expected NotAnObject for {payload:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_resolve_options() {
        let none = PublishOverrides::default();
        assert_eq!(
            none.resolve(QoS::AtLeastOnce),
            PublishOptions {
                qos: QoS::AtLeastOnce,
                retain: false
            }
        );

        let full = PublishOverrides::new(QoS::ExactlyOnce, true);
        assert_eq!(
            full.resolve(QoS::AtMostOnce),
            PublishOptions {
                qos: QoS::ExactlyOnce,
                retain: true
            }
        );

        let retain_only = PublishOverrides {
            qos: None,
            retain: Some(true),
        };
        assert_eq!(
            retain_only.resolve(QoS::AtLeastOnce),
            PublishOptions {
                qos: QoS::AtLeastOnce,
                retain: true
            }
        );
    }

    #[test]
    fn test_prepare_republish_stamps_and_rewrites() {
        let message =
            InboundMessage::new("woop", br#"{"value":42}"#.to_vec()).with_qos(QoS::AtLeastOnce);
        let republish = prepare_republish(
            &message,
            &to_new_topic,
            &PublishOverrides::default(),
            fixed_now(),
        )
        .unwrap();

        assert_eq!(republish.topic, "newTopic");
        assert_eq!(republish.options.qos, QoS::AtLeastOnce);
        let body: Value = serde_json::from_slice(&republish.payload).unwrap();
        assert_eq!(body["value"], json!(42));
        assert_eq!(body[TIMESTAMP_FIELD], json!("2024-03-09T12:30:45.123Z"));
    }

    #[test]
    fn test_prepare_republish_retained_skips_transformer() {
        let calls = AtomicUsize::new(0);
        let transformer = |topic: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            topic.to_string()
        };
        let message = InboundMessage::new("woop", b"{}".to_vec()).with_retain(true);

        let result = prepare_republish(
            &message,
            &transformer,
            &PublishOverrides::default(),
            fixed_now(),
        );
        assert!(matches!(result, Err(Rejection::Retained)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_prepare_republish_invalid_destination() {
        let wildcard = |_: &str| "out/#".to_string();
        let message = InboundMessage::new("woop", b"{}".to_vec());
        let result = prepare_republish(
            &message,
            &wildcard,
            &PublishOverrides::default(),
            fixed_now(),
        );
        match result {
            Err(Rejection::InvalidDestination { topic }) => assert_eq!(topic, "out/#"),
            other => panic!("expected InvalidDestination, got {other:?}"),
        }

        let empty = |_: &str| String::new();
        assert!(matches!(
            prepare_republish(&message, &empty, &PublishOverrides::default(), fixed_now()),
            Err(Rejection::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            Rejection::NotAnObject { kind: "array" }.to_string(),
            "Will not republish message of type array"
        );
        assert_eq!(
            Rejection::Retained.to_string(),
            "Not forwarding retained message"
        );
    }
}
