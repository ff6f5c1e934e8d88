use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Agency {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub timezone: String,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Stop {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Route {
    pub id: i64,
    pub agency_id: i64,
    pub short_name: String,
    pub long_name: String,
    pub color: String,
    /// GTFS `route_type` code. Exported as bus when absent.
    pub route_type: Option<i64>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Trip {
    pub id: i64,
    pub route_id: i64,
    pub service_id: String,
    pub headsign: String,
    /// Name of the shape this trip follows, empty when it has none.
    pub shape_id: String,
}

/// A stop occurrence within a trip. Stored in `trip_stops`.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StopVisit {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub trip_id: i64,
    pub stop_id: i64,
    pub sequence: i64,
    #[serde(default)]
    pub arrival_time: String,
    #[serde(default)]
    pub departure_time: String,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ShapePoint {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub shape_id: String,
    pub lat: f64,
    pub lon: f64,
    pub sequence: i64,
}

/// Row of the legacy `route_stops` table, where stops hung off routes instead of trips.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct LegacyRouteStop {
    pub route_id: i64,
    pub stop_id: i64,
    pub sequence: i64,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
}

#[derive(sqlx::FromRow, Serialize, Debug, Clone)]
pub struct ActivityLog {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub details: String,
}

pub struct NewAgency<'a> {
    pub name: &'a str,
    pub url: &'a str,
    pub timezone: &'a str,
}

pub struct NewRoute<'a> {
    pub agency_id: i64,
    pub short_name: &'a str,
    pub long_name: &'a str,
    pub color: &'a str,
    pub route_type: Option<i64>,
}

pub struct NewTrip<'a> {
    pub route_id: i64,
    pub service_id: &'a str,
    pub headsign: &'a str,
    pub shape_id: &'a str,
}
