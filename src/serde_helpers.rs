//! Envelope deserialization.
//!
//! The optional `timestamp` and `id` fields are read leniently: any JSON number is accepted for
//! either, and a value of the wrong shape is dropped rather than failing the whole envelope.
//!
//! When the `tracing` feature is enabled, unknown top-level envelope fields and the path of a
//! failed decode are logged, which helps spot servers drifting from the envelope shape.

#[cfg(feature = "tracing")]
use std::any::type_name;

use serde::de::DeserializeOwned;
use serde::{Deserialize as _, Deserializer};
use serde_json::{Number, Value};

use crate::types::Timestamp;

/// Read an optional timestamp from any JSON number or numeric string. Fractional milliseconds
/// are truncated; anything else is treated as absent.
pub fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Timestamp>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(number) => timestamp_from_number(&number),
        Value::String(text) => text
            .trim()
            .parse::<Number>()
            .ok()
            .and_then(|number| timestamp_from_number(&number)),
        _ => None,
    })
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "float to int casts saturate and the fraction is dropped on purpose"
)]
fn timestamp_from_number(number: &Number) -> Option<Timestamp> {
    number
        .as_i64()
        .or_else(|| number.as_u64().map(|n| Timestamp::try_from(n).unwrap_or(Timestamp::MAX)))
        .or_else(|| {
            number
                .as_f64()
                .filter(|f| f.is_finite())
                .map(|f| f.trunc() as Timestamp)
        })
}

/// Read an optional identifier from a JSON string or number. Anything else is treated as absent.
pub fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(id) => Some(id),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

/// Deserialize an inbound JSON object into an envelope, reporting unknown fields.
#[cfg(feature = "tracing")]
pub fn deserialize_envelope<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    let original = value.clone();
    let mut unknown_fields: Vec<String> = Vec::new();

    let result: T = serde_ignored::deserialize(value, |path| {
        unknown_fields.push(path.to_string());
    })
    .inspect_err(|_| {
        let json = original.to_string();
        let de = &mut serde_json::Deserializer::from_str(&json);
        let path_result: Result<T, _> = serde_path_to_error::deserialize(de);
        if let Err(path_err) = path_result {
            tracing::trace!(
                type_name = %type_name::<T>(),
                path = %path_err.path(),
                error = %path_err.inner(),
                "frame is not a message envelope"
            );
        }
    })?;

    for field in unknown_fields {
        let field_value = original
            .get(&field)
            .map_or_else(|| "<missing>".to_owned(), Value::to_string);
        tracing::debug!(
            type_name = %type_name::<T>(),
            field = %field,
            value = %field_value,
            "unknown field in message envelope"
        );
    }

    Ok(result)
}

/// Pass-through deserialization when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn deserialize_envelope<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::Message;

    #[test]
    fn extra_fields_do_not_reject_the_envelope() {
        let message: Message = deserialize_envelope(json!({
            "type": "chat",
            "data": 1,
            "channel": "general"
        }))
        .unwrap();

        assert_eq!(message.msg_type, "chat");
        assert_eq!(message.data, json!(1));
    }

    #[test]
    fn wrong_type_tag_is_an_error() {
        let result: crate::Result<Message> =
            deserialize_envelope(json!({ "type": ["chat"], "data": 1 }));

        assert!(result.is_err(), "array type tag should be rejected");
    }

    #[test]
    fn missing_data_is_an_error() {
        let result: crate::Result<Message> = deserialize_envelope(json!({ "type": "chat" }));

        assert!(result.is_err(), "envelope without data should be rejected");
    }

    #[test]
    fn badly_typed_optional_fields_are_dropped() {
        let message: Message = deserialize_envelope(json!({
            "type": "chat",
            "data": 1,
            "timestamp": "soon",
            "id": { "nested": true }
        }))
        .unwrap();

        assert_eq!(message.msg_type, "chat");
        assert_eq!(message.timestamp, None);
        assert_eq!(message.id, None);
    }

    #[test]
    fn numeric_strings_are_accepted_as_timestamps() {
        let message: Message =
            deserialize_envelope(json!({ "type": "chat", "data": 1, "timestamp": " 1700000000000 " }))
                .unwrap();

        assert_eq!(message.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn out_of_range_timestamps_saturate() {
        let message: Message =
            deserialize_envelope(json!({ "type": "chat", "data": 1, "timestamp": u64::MAX }))
                .unwrap();

        assert_eq!(message.timestamp, Some(Timestamp::MAX));
    }
}
