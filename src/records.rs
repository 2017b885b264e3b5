// Normalizes client payloads into `ObservationRecord`s.
//
// Stop confirmations are strict: the five identifying fields must be
// present. Location pings are lenient and fill in defaults, since the
// background tracker sends whatever it has.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::Principal;
use crate::models::{ObservationRecord, RecordType};

pub type Payload = Map<String, Value>;

const STOP_REQUIRED_FIELDS: [&str; 5] = ["route_id", "stop_id", "stop_name", "lat", "lon"];

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("Field {0} must be a number")]
    NotANumber(&'static str),
}

pub fn build_stop_record(
    payload: &Payload,
    principal: &Principal,
) -> Result<ObservationRecord, ValidationError> {
    let missing: Vec<&'static str> = STOP_REQUIRED_FIELDS
        .into_iter()
        .filter(|field| !payload.contains_key(*field))
        .collect();

    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    let latitude = number_field(payload, "lat").ok_or(ValidationError::NotANumber("lat"))?;
    let longitude = number_field(payload, "lon").ok_or(ValidationError::NotANumber("lon"))?;

    Ok(ObservationRecord {
        id: Uuid::new_v4().to_string(),
        route_id: text_field(payload, "route_id").unwrap_or_default(),
        stop_id: text_field(payload, "stop_id").unwrap_or_default(),
        stop_name: text_field(payload, "stop_name").unwrap_or_default(),
        latitude,
        longitude,
        timestamp: Utc::now(),
        kind: RecordType::StopRecord,
        device_id: text_field(payload, "device_id"),
        device_name: text_field(payload, "device_name"),
        app_version: text_field(payload, "app_version"),
        user_id: principal.user_id().map(str::to_string),
    })
}

/// Never fails: absent or unusable fields fall back to `""`, `0.0` or the server clock.
pub fn build_location_record(payload: &Payload, principal: &Principal) -> ObservationRecord {
    ObservationRecord {
        id: Uuid::new_v4().to_string(),
        route_id: text_field(payload, "route_id").unwrap_or_default(),
        stop_id: text_field(payload, "stop_id").unwrap_or_default(),
        stop_name: text_field(payload, "stop_name").unwrap_or_default(),
        latitude: number_field(payload, "lat").unwrap_or(0.0),
        longitude: number_field(payload, "lon").unwrap_or(0.0),
        timestamp: payload
            .get("timestamp")
            .and_then(client_timestamp)
            .unwrap_or_else(Utc::now),
        kind: RecordType::LocationRecord,
        device_id: text_field(payload, "device_id"),
        device_name: text_field(payload, "device_name"),
        app_version: text_field(payload, "app_version"),
        user_id: principal.user_id().map(str::to_string),
    }
}

fn text_field(payload: &Payload, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number_field(payload: &Payload, key: &str) -> Option<f64> {
    match payload.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// The web UI and the Android tracker service send RFC 3339 strings; the
// Android main screen sends epoch milliseconds.
fn client_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    }
}
