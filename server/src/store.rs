use std::str::FromStr;

use chrono::Utc;
use futures::stream::BoxStream;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::SqliteConnection;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::models::*;

pub const LEGACY_STOPS_TABLE: &str = "route_stops";
pub const STOP_VISITS_TABLE: &str = "trip_stops";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agencies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        timezone TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS stops (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL DEFAULT '',
        lat REAL NOT NULL DEFAULT 0,
        lon REAL NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agency_id INTEGER NOT NULL,
        short_name TEXT NOT NULL DEFAULT '',
        long_name TEXT NOT NULL DEFAULT '',
        color TEXT NOT NULL DEFAULT '',
        route_type INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_routes_agency_id ON routes (agency_id)",
    "CREATE TABLE IF NOT EXISTS trips (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        route_id INTEGER NOT NULL,
        service_id TEXT NOT NULL DEFAULT '',
        headsign TEXT NOT NULL DEFAULT '',
        shape_id TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_trips_route_id ON trips (route_id)",
    "CREATE INDEX IF NOT EXISTS idx_trips_shape_id ON trips (shape_id)",
    "CREATE TABLE IF NOT EXISTS trip_stops (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trip_id INTEGER NOT NULL,
        stop_id INTEGER NOT NULL,
        sequence INTEGER NOT NULL,
        arrival_time TEXT NOT NULL DEFAULT '',
        departure_time TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_trip_stops_trip_id ON trip_stops (trip_id)",
    "CREATE INDEX IF NOT EXISTS idx_trip_stops_stop_id ON trip_stops (stop_id)",
    "CREATE TABLE IF NOT EXISTS shape_points (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        shape_id TEXT NOT NULL,
        lat REAL NOT NULL,
        lon REAL NOT NULL,
        sequence INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_shape_points_shape_id ON shape_points (shape_id)",
    "CREATE TABLE IF NOT EXISTS activity_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        action TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT ''
    )",
];

/// Handle to the relational store. Built once at startup and handed to every component.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(config: &Config) -> EngineResult<Self> {
        let options =
            SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;
        log::info!("Connected to {}", config.database_url);
        Ok(Self { pool })
    }

    /// A private in-memory database. The pool keeps its single connection alive forever,
    /// otherwise the database would vanish between statements.
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create_schema(&self) -> EngineResult<()> {
        let mut conn = self.pool.acquire().await?;
        create_schema(&mut *conn).await
    }

    pub async fn table_exists(&self, table: &str) -> EngineResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Row count of a table known to exist. Only ever called with the crate's own table names.
    pub async fn count_rows(&self, table: &'static str) -> EngineResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn drop_table(&self, table: &'static str) -> EngineResult<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_agency(&self, agency: &NewAgency<'_>) -> EngineResult<i64> {
        let result = sqlx::query("INSERT INTO agencies (name, url, timezone) VALUES (?, ?, ?)")
            .bind(agency.name)
            .bind(agency.url)
            .bind(agency.timezone)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn create_stop(&self, name: &str, lat: f64, lon: f64) -> EngineResult<i64> {
        let result = sqlx::query("INSERT INTO stops (name, lat, lon) VALUES (?, ?, ?)")
            .bind(name)
            .bind(lat)
            .bind(lon)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Fails with `NotFound` unless the agency exists.
    pub async fn create_route(&self, route: &NewRoute<'_>) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        if !row_exists(&mut tx, "agencies", route.agency_id).await? {
            return Err(EngineError::not_found("agency", route.agency_id));
        }
        let result = sqlx::query(
            "INSERT INTO routes (agency_id, short_name, long_name, color, route_type)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(route.agency_id)
        .bind(route.short_name)
        .bind(route.long_name)
        .bind(route.color)
        .bind(route.route_type)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    /// Fails with `NotFound` unless the route exists.
    pub async fn create_trip(&self, trip: &NewTrip<'_>) -> EngineResult<i64> {
        let mut tx = self.pool.begin().await?;
        if !row_exists(&mut tx, "routes", trip.route_id).await? {
            return Err(EngineError::not_found("route", trip.route_id));
        }
        let result = sqlx::query(
            "INSERT INTO trips (route_id, service_id, headsign, shape_id) VALUES (?, ?, ?, ?)",
        )
        .bind(trip.route_id)
        .bind(trip.service_id)
        .bind(trip.headsign)
        .bind(trip.shape_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_trip(&self, id: i64) -> EngineResult<Option<Trip>> {
        Ok(sqlx::query_as("SELECT * FROM trips WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn agencies(&self) -> EngineResult<Vec<Agency>> {
        Ok(sqlx::query_as("SELECT * FROM agencies ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn stops(&self) -> EngineResult<Vec<Stop>> {
        Ok(sqlx::query_as("SELECT * FROM stops ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn routes(&self) -> EngineResult<Vec<Route>> {
        Ok(sqlx::query_as("SELECT * FROM routes ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn trips(&self) -> EngineResult<Vec<Trip>> {
        Ok(sqlx::query_as("SELECT * FROM trips ORDER BY id")
            .fetch_all(&self.pool)
            .await?)
    }

    /// Visits of one trip in travel order.
    pub async fn trip_stop_visits(&self, trip_id: i64) -> EngineResult<Vec<StopVisit>> {
        Ok(
            sqlx::query_as("SELECT * FROM trip_stops WHERE trip_id = ? ORDER BY sequence, id")
                .bind(trip_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub fn stream_stop_visits(&self) -> BoxStream<'_, Result<StopVisit, sqlx::Error>> {
        sqlx::query_as("SELECT * FROM trip_stops ORDER BY trip_id, sequence, id").fetch(&self.pool)
    }

    pub async fn shape_points(&self, shape_id: &str) -> EngineResult<Vec<ShapePoint>> {
        Ok(
            sqlx::query_as("SELECT * FROM shape_points WHERE shape_id = ? ORDER BY sequence, id")
                .bind(shape_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub fn stream_shape_points(&self) -> BoxStream<'_, Result<ShapePoint, sqlx::Error>> {
        sqlx::query_as("SELECT * FROM shape_points ORDER BY shape_id, sequence, id")
            .fetch(&self.pool)
    }

    pub async fn shape_ids(&self) -> EngineResult<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT shape_id FROM shape_points ORDER BY shape_id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn routes_serving_stop(&self, stop_id: i64) -> EngineResult<Vec<Route>> {
        Ok(sqlx::query_as(
            "SELECT * FROM routes WHERE id IN (
                SELECT trips.route_id FROM trip_stops
                JOIN trips ON trips.id = trip_stops.trip_id
                WHERE trip_stops.stop_id = ?
            ) ORDER BY id",
        )
        .bind(stop_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Appends to the activity record. A failure here never fails the operation being recorded.
    pub async fn record_activity(&self, action: &str, details: &str) {
        let result =
            sqlx::query("INSERT INTO activity_logs (timestamp, action, details) VALUES (?, ?, ?)")
                .bind(Utc::now())
                .bind(action)
                .bind(details)
                .execute(&self.pool)
                .await;
        if let Err(err) = result {
            log::warn!("Failed to record activity {action}: {err}");
        }
    }

    pub async fn recent_activity(&self, limit: i64) -> EngineResult<Vec<ActivityLog>> {
        Ok(
            sqlx::query_as("SELECT * FROM activity_logs ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

pub async fn create_schema(conn: &mut SqliteConnection) -> EngineResult<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Whether `table` has a row with this id. Only ever called with the crate's own table names.
pub async fn row_exists(
    conn: &mut SqliteConnection,
    table: &'static str,
    id: i64,
) -> EngineResult<bool> {
    let found: Option<i64> = sqlx::query_scalar(&format!("SELECT id FROM {table} WHERE id = ?"))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}
