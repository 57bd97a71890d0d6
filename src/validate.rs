//! Schema validation at the ingestion edge.
//!
//! Turns an untyped JSON body into a [`TelemetryEvent`] or explains which
//! field was wrong. The allow-list of event types comes from configuration.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{now_epoch_secs, TelemetryEvent};

/// Reasons an inbound body is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("field '{field}' must be a {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },

    #[error("event type '{event_type}' is not one of {allowed:?}")]
    UnknownEventType {
        event_type: String,
        allowed: Vec<String>,
    },
}

impl ValidationError {
    /// Short machine-readable tag for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::MissingField { .. } => "missing_field",
            ValidationError::TypeMismatch { .. } => "type_mismatch",
            ValidationError::UnknownEventType { .. } => "unknown_event_type",
        }
    }

    /// The offending field.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingField { field } => field,
            ValidationError::TypeMismatch { field, .. } => field,
            ValidationError::UnknownEventType { .. } => "type",
        }
    }
}

/// Validates inbound telemetry against the accepted shape and allow-list.
#[derive(Debug, Clone)]
pub struct Validator {
    allowed_types: Vec<String>,
}

impl Validator {
    pub fn new(allowed_types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed_types: allowed_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate a raw body.
    ///
    /// Fields are checked in order `device_id`, `type` (including the
    /// allow-list), `reading`, `timestamp`; the first failure is reported.
    /// `timestamp` may be omitted, in which case the current time is used.
    pub fn validate(&self, raw: &Value) -> Result<TelemetryEvent, ValidationError> {
        let obj = raw.as_object().ok_or(ValidationError::TypeMismatch {
            field: "$",
            expected: "JSON object",
        })?;

        let device_id = required_str(obj, "device_id")?;
        let event_type = required_str(obj, "type")?;

        if !self.allowed_types.iter().any(|t| t == event_type) {
            return Err(ValidationError::UnknownEventType {
                event_type: event_type.to_string(),
                allowed: self.allowed_types.clone(),
            });
        }

        let reading = required_f64(obj, "reading")?;

        let timestamp = match obj.get("timestamp") {
            None => now_epoch_secs(),
            Some(value) => value.as_f64().ok_or(ValidationError::TypeMismatch {
                field: "timestamp",
                expected: "number",
            })?,
        };

        Ok(TelemetryEvent::new(device_id, event_type, reading, timestamp))
    }
}

fn required<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a Value, ValidationError> {
    obj.get(field).ok_or(ValidationError::MissingField { field })
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    required(obj, field)?
        .as_str()
        .ok_or(ValidationError::TypeMismatch {
            field,
            expected: "string",
        })
}

fn required_f64(obj: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    required(obj, field)?
        .as_f64()
        .ok_or(ValidationError::TypeMismatch {
            field,
            expected: "number",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> Validator {
        Validator::new(["VIBRATION", "TEMPERATURE"])
    }

    #[test]
    fn test_valid_event() {
        let event = validator()
            .validate(&json!({
                "device_id": "DEV-001",
                "type": "VIBRATION",
                "reading": 15.4,
                "timestamp": 1733911200.5
            }))
            .unwrap();

        assert_eq!(event.device_id(), "DEV-001");
        assert_eq!(event.event_type(), "VIBRATION");
        assert_eq!(event.reading(), 15.4);
        assert_eq!(event.timestamp(), 1733911200.5);
    }

    #[test]
    fn test_timestamp_defaults_to_now() {
        let before = now_epoch_secs();
        let event = validator()
            .validate(&json!({"device_id": "DEV-001", "type": "VIBRATION", "reading": 1}))
            .unwrap();

        assert!(event.timestamp() >= before);
        // integers are accepted as readings
        assert_eq!(event.reading(), 1.0);
    }

    #[test]
    fn test_missing_fields() {
        let err = validator()
            .validate(&json!({"type": "VIBRATION", "reading": 1.0}))
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "device_id" });

        let err = validator()
            .validate(&json!({"device_id": "DEV-004", "type": "VIBRATION"}))
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField { field: "reading" });
        assert_eq!(err.kind(), "missing_field");
    }

    #[test]
    fn test_type_mismatch() {
        let err = validator()
            .validate(&json!({"device_id": 7, "type": "VIBRATION", "reading": 1.0}))
            .unwrap_err();
        assert_eq!(err.field(), "device_id");

        let err = validator()
            .validate(&json!({"device_id": "DEV-001", "type": "VIBRATION", "reading": "high"}))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                field: "reading",
                expected: "number"
            }
        );

        let err = validator()
            .validate(&json!({"device_id": "DEV-001", "type": "VIBRATION", "reading": 1.0, "timestamp": null}))
            .unwrap_err();
        assert_eq!(err.field(), "timestamp");
    }

    #[test]
    fn test_non_object_body() {
        let err = validator().validate(&json!([1, 2, 3])).unwrap_err();
        assert_eq!(err.field(), "$");
    }

    #[test]
    fn test_unknown_event_type() {
        // the allow-list is checked before the reading
        let err = validator()
            .validate(&json!({"device_id": "DEV-004", "type": "SEISMIC"}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownEventType { ref event_type, .. } if event_type == "SEISMIC"));
        assert_eq!(err.field(), "type");
    }
}
