// Data structures for the route/stop catalog and survey observations.
//
// Upstream route API shapes:
// - Route list:  { "routes": [ { "routeCode", "routeName", "routeStart", "routeEnd" } ] }
// - Route stops: { "features": [ GeoJSON feature ] } where stops are Point features
//   with "Stop Code" / "Stop Name" properties and [longitude, latitude] coordinates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Upstream (raw) shapes
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRoute {
    pub route_code: String,
    pub route_name: String,
    #[serde(default)]
    pub route_start: String,
    #[serde(default)]
    pub route_end: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawFeature {
    pub geometry: RawGeometry,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct RouteListResponse {
    pub routes: Vec<RawRoute>,
}

#[derive(Debug, Deserialize)]
pub struct RouteDetailResponse {
    pub features: Vec<RawFeature>,
}

// ============================================================================
// Catalog served to clients
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub route_code: String,
    pub route_name: String,
    #[serde(rename = "route_start_point")]
    pub start_point: String,
    #[serde(rename = "route_end_point")]
    pub end_point: String,
}

impl From<RawRoute> for Route {
    fn from(raw: RawRoute) -> Self {
        Route {
            route_code: raw.route_code,
            route_name: raw.route_name,
            start_point: raw.route_start,
            end_point: raw.route_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lon")]
    pub longitude: f64,
}

impl Stop {
    /// Only `Point` features become stops. Coordinates arrive as `[lon, lat]`.
    pub fn from_feature(feature: &RawFeature) -> Option<Stop> {
        if feature.geometry.kind != "Point" {
            return None;
        }

        let coords = feature.geometry.coordinates.as_array()?;
        let longitude = coords.first()?.as_f64()?;
        let latitude = coords.get(1)?.as_f64()?;

        Some(Stop {
            stop_id: property_string(&feature.properties, "Stop Code"),
            stop_name: property_string(&feature.properties, "Stop Name"),
            latitude,
            longitude,
        })
    }
}

pub fn stops_from_features(features: &[RawFeature]) -> Vec<Stop> {
    features.iter().filter_map(Stop::from_feature).collect()
}

fn property_string(properties: &Map<String, Value>, key: &str) -> String {
    match properties.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

// ============================================================================
// Observations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    StopRecord,
    LocationRecord,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::StopRecord => "STOP_RECORD",
            RecordType::LocationRecord => "LOCATION_RECORD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub id: String,
    pub route_id: String,
    pub stop_id: String,
    pub stop_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: RecordType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}
