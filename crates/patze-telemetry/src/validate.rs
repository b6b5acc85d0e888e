//! Schema validation for inbound telemetry.
//!
//! Inbound events arrive as untyped JSON from bridges; everything downstream
//! of [`validate_event`] takes strongly-typed values only.

use chrono::{DateTime, Utc};
use patze_proto::{EventKind, Severity, TELEMETRY_VERSION, TelemetryEvent, TraceContext};
use serde_json::Value;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_STRING_LEN: usize = 8 * 1024;
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate one raw event into a [`TelemetryEvent`].
pub fn validate_event(raw: &Value) -> Result<TelemetryEvent, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::new("invalid_body", "event must be a JSON object"))?;

    let version = require_str(obj, "version")?;
    if version != TELEMETRY_VERSION {
        return Err(ValidationError::new(
            "unsupported_version",
            format!("unsupported version '{version}'"),
        ));
    }

    let id = require_id(obj, "id")?;
    let machine_id = require_id(obj, "machineId")?;

    let ts_raw = require_str(obj, "ts")?;
    let ts: DateTime<Utc> = ts_raw
        .parse()
        .map_err(|_| ValidationError::new("invalid_field", "ts is not an RFC-3339 timestamp"))?;

    let severity: Severity = parse_field(obj, "severity")?;
    let kind: EventKind = parse_field(obj, "type")?;

    let payload = obj.get("payload").cloned().unwrap_or(Value::Object(Default::default()));
    if !payload.is_object() {
        return Err(ValidationError::new("invalid_field", "payload must be an object"));
    }
    let payload_bytes = serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(usize::MAX);
    if payload_bytes > MAX_PAYLOAD_BYTES {
        return Err(ValidationError::new(
            "payload_too_large",
            format!("payload exceeds {MAX_PAYLOAD_BYTES} bytes"),
        ));
    }
    check_payload_strings(&payload)?;
    check_required_payload_fields(kind, &payload)?;

    let trace = match obj.get("trace") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            serde_json::from_value::<TraceContext>(value.clone())
                .map_err(|_| ValidationError::new("invalid_field", "trace must carry traceId"))?,
        ),
    };

    Ok(TelemetryEvent {
        version: version.to_string(),
        id,
        ts,
        machine_id,
        severity,
        kind,
        payload,
        trace,
    })
}

fn require_str<'a>(
    obj: &'a serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::new("missing_field", format!("missing string field '{field}'")))
}

fn require_id(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    let value = require_str(obj, field)?;
    if value.is_empty() || value.len() > MAX_ID_LEN || !patze_proto::validate_id(value) {
        return Err(ValidationError::new(
            "invalid_field",
            format!("'{field}' is not a valid identifier"),
        ));
    }
    Ok(value.to_string())
}

fn parse_field<T: serde::de::DeserializeOwned>(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<T, ValidationError> {
    let value = obj
        .get(field)
        .ok_or_else(|| ValidationError::new("missing_field", format!("missing field '{field}'")))?;
    serde_json::from_value(value.clone())
        .map_err(|_| ValidationError::new("invalid_field", format!("unrecognized value for '{field}'")))
}

/// Every string anywhere in the payload is bounded; one oversized field
/// rejects the whole event.
fn check_payload_strings(value: &Value) -> Result<(), ValidationError> {
    match value {
        Value::String(s) if s.len() > MAX_STRING_LEN => Err(ValidationError::new(
            "invalid_field",
            format!("payload string exceeds {MAX_STRING_LEN} bytes"),
        )),
        Value::Array(items) => items.iter().try_for_each(check_payload_strings),
        Value::Object(map) => map.values().try_for_each(check_payload_strings),
        _ => Ok(()),
    }
}

fn check_required_payload_fields(kind: EventKind, payload: &Value) -> Result<(), ValidationError> {
    let required: &[&str] = match kind {
        EventKind::SessionStarted | EventKind::SessionUpdated | EventKind::SessionEnded => {
            &["sessionId"]
        }
        EventKind::RunStarted => &["runId", "sessionId"],
        EventKind::RunUpdated
        | EventKind::RunCompleted
        | EventKind::RunFailed
        | EventKind::RunCancelled => &["runId"],
        EventKind::ToolInvoked | EventKind::ToolCompleted => &["runId", "tool"],
        EventKind::LogEmitted => &["message"],
        EventKind::SpanStarted | EventKind::SpanEnded => &["spanId"],
        EventKind::MachineRegistered | EventKind::MachineHeartbeat => &[],
    };

    for field in required {
        let present = payload.get(field).and_then(Value::as_str).is_some_and(|s| !s.is_empty());
        if !present {
            return Err(ValidationError::new(
                "missing_field",
                format!("{kind} payload requires '{field}'"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: &str, payload: Value) -> Value {
        serde_json::json!({
            "version": "telemetry.v1",
            "id": "evt-1",
            "ts": "2026-01-15T10:00:00Z",
            "machineId": "m-1",
            "severity": "info",
            "type": kind,
            "payload": payload,
        })
    }

    #[test]
    fn test_valid_event() {
        let event = validate_event(&raw("run.started", serde_json::json!({"runId": "r-1", "sessionId": "s-1"})))
            .expect("valid");
        assert_eq!(event.kind, EventKind::RunStarted);
        assert_eq!(event.machine_id, "m-1");
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut value = raw("machine.heartbeat", serde_json::json!({}));
        value["version"] = "telemetry.v0".into();
        let err = validate_event(&value).expect_err("rejected");
        assert_eq!(err.code, "unsupported_version");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = validate_event(&raw("machine.exploded", serde_json::json!({}))).expect_err("rejected");
        assert_eq!(err.code, "invalid_field");
    }

    #[test]
    fn test_missing_required_payload_field() {
        let err = validate_event(&raw("run.started", serde_json::json!({"runId": "r-1"})))
            .expect_err("rejected");
        assert_eq!(err.code, "missing_field");
        assert!(err.message.contains("sessionId"));
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let mut value = raw("machine.heartbeat", serde_json::json!({}));
        value["ts"] = "yesterday".into();
        let err = validate_event(&value).expect_err("rejected");
        assert_eq!(err.code, "invalid_field");
    }

    #[test]
    fn test_oversized_payload_string_rejected() {
        let big = "x".repeat(MAX_STRING_LEN + 1);
        let err = validate_event(&raw("log.emitted", serde_json::json!({"message": big})))
            .expect_err("rejected");
        assert_eq!(err.code, "invalid_field");
    }

    #[test]
    fn test_non_object_rejected() {
        let err = validate_event(&serde_json::json!("just a string")).expect_err("rejected");
        assert_eq!(err.code, "invalid_body");
    }

    #[test]
    fn test_trace_context_parsed() {
        let mut value = raw("machine.heartbeat", serde_json::json!({}));
        value["trace"] = serde_json::json!({"traceId": "t-1", "spanId": "sp-1"});
        let event = validate_event(&value).expect("valid");
        assert_eq!(event.trace.expect("trace").trace_id, "t-1");
    }
}
