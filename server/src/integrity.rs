//! Cascading deletes and set replacements that keep the agency → route → trip → stop visit
//! hierarchy consistent. Every public operation runs in a single transaction; an error drops the
//! transaction, which rolls it back, so a cascade is never partially committed.

use std::collections::BTreeSet;

use sqlx::SqliteConnection;

use crate::error::{EngineError, EngineResult};
use crate::models::{ShapePoint, StopVisit};
use crate::store::{row_exists, Store};
use crate::timing;

/// What a cascade removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CascadeSummary {
    pub routes: u64,
    pub trips: u64,
    pub stop_visits: u64,
    /// Shapes whose points were deleted because no trip refers to them anymore.
    pub reclaimed_shapes: Vec<String>,
}

pub async fn delete_agency(store: &Store, agency_id: i64) -> EngineResult<CascadeSummary> {
    let mut tx = store.pool().begin().await?;
    if !row_exists(&mut tx, "agencies", agency_id).await? {
        return Err(EngineError::not_found("agency", agency_id));
    }

    let route_ids: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM routes WHERE agency_id = ? ORDER BY id")
            .bind(agency_id)
            .fetch_all(&mut *tx)
            .await?;
    let mut summary = delete_trips_of_routes(&mut tx, &route_ids).await?;

    summary.routes = sqlx::query("DELETE FROM routes WHERE agency_id = ?")
        .bind(agency_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM agencies WHERE id = ?")
        .bind(agency_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    log::info!("Deleted agency {agency_id}: {summary:?}");
    Ok(summary)
}

pub async fn delete_route(store: &Store, route_id: i64) -> EngineResult<CascadeSummary> {
    let mut tx = store.pool().begin().await?;
    if !row_exists(&mut tx, "routes", route_id).await? {
        return Err(EngineError::not_found("route", route_id));
    }

    let mut summary = delete_trips_of_routes(&mut tx, &[route_id]).await?;
    summary.routes = sqlx::query("DELETE FROM routes WHERE id = ?")
        .bind(route_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    log::info!("Deleted route {route_id}: {summary:?}");
    Ok(summary)
}

pub async fn delete_trip(store: &Store, trip_id: i64) -> EngineResult<CascadeSummary> {
    let mut tx = store.pool().begin().await?;
    let shape_id: Option<String> = sqlx::query_scalar("SELECT shape_id FROM trips WHERE id = ?")
        .bind(trip_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(shape_id) = shape_id else {
        return Err(EngineError::not_found("trip", trip_id));
    };

    let mut summary = CascadeSummary {
        stop_visits: delete_visits_of_trip(&mut tx, trip_id).await?,
        ..Default::default()
    };
    summary.trips = sqlx::query("DELETE FROM trips WHERE id = ?")
        .bind(trip_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let mut candidates = BTreeSet::new();
    if !shape_id.is_empty() {
        candidates.insert(shape_id);
    }
    summary.reclaimed_shapes = reclaim_orphaned_shapes(&mut tx, &candidates).await?;

    tx.commit().await?;
    log::info!("Deleted trip {trip_id}: {summary:?}");
    Ok(summary)
}

/// Removes the stop and every visit to it. Trips and routes that visited it are kept.
pub async fn delete_stop(store: &Store, stop_id: i64) -> EngineResult<u64> {
    let mut tx = store.pool().begin().await?;
    let visits = sqlx::query("DELETE FROM trip_stops WHERE stop_id = ?")
        .bind(stop_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM stops WHERE id = ?")
        .bind(stop_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    log::info!("Deleted stop {stop_id} and {visits} visits to it");
    Ok(visits)
}

/// Swaps the trip's whole visit list. Each visit is attached to `trip_id` whatever trip it
/// names, and blank times are synthesized from its sequence.
pub async fn replace_trip_stop_visits(
    store: &Store,
    trip_id: i64,
    visits: Vec<StopVisit>,
) -> EngineResult<usize> {
    let mut tx = store.pool().begin().await?;
    if !row_exists(&mut tx, "trips", trip_id).await? {
        return Err(EngineError::not_found("trip", trip_id));
    }
    let mut sequences = BTreeSet::new();
    if let Some(repeated) = visits.iter().find(|v| !sequences.insert(v.sequence)) {
        return Err(EngineError::ValidationFailed(format!(
            "stop sequence {} appears more than once in trip {trip_id}",
            repeated.sequence
        )));
    }

    let removed = delete_visits_of_trip(&mut tx, trip_id).await?;
    let count = visits.len();
    for visit in visits {
        insert_visit(&mut tx, trip_id, visit).await?;
    }

    tx.commit().await?;
    log::info!("Replaced {removed} visits of trip {trip_id} with {count}");
    Ok(count)
}

/// Appends one visit to a trip, synthesizing blank times like `replace_trip_stop_visits`. The
/// sequence must not be taken by another visit of the trip.
pub async fn add_stop_visit(store: &Store, visit: StopVisit) -> EngineResult<i64> {
    let mut tx = store.pool().begin().await?;
    let trip_id = visit.trip_id;
    if !row_exists(&mut tx, "trips", trip_id).await? {
        return Err(EngineError::not_found("trip", trip_id));
    }
    let taken: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM trip_stops WHERE trip_id = ? AND sequence = ?")
            .bind(trip_id)
            .bind(visit.sequence)
            .fetch_one(&mut *tx)
            .await?;
    if taken > 0 {
        return Err(EngineError::ValidationFailed(format!(
            "trip {trip_id} already has a stop at sequence {}",
            visit.sequence
        )));
    }
    let id = insert_visit(&mut tx, trip_id, visit).await?;
    tx.commit().await?;
    Ok(id)
}

/// Makes `stop_id` a stop of exactly the given routes: its old visits go away and every trip of
/// every listed route gets one visit after its last one, at sequence 1 on a trip with no visits.
pub async fn assign_stop_to_routes(
    store: &Store,
    stop_id: i64,
    route_ids: &[i64],
) -> EngineResult<u64> {
    let mut tx = store.pool().begin().await?;
    sqlx::query("DELETE FROM trip_stops WHERE stop_id = ?")
        .bind(stop_id)
        .execute(&mut *tx)
        .await?;

    let mut created = 0;
    for route_id in route_ids {
        let trip_ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM trips WHERE route_id = ? ORDER BY id")
                .bind(route_id)
                .fetch_all(&mut *tx)
                .await?;
        for trip_id in trip_ids {
            let last: Option<i64> =
                sqlx::query_scalar("SELECT MAX(sequence) FROM trip_stops WHERE trip_id = ?")
                    .bind(trip_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let visit = StopVisit {
                id: 0,
                trip_id,
                stop_id,
                sequence: last.map_or(1, |last| last + 1),
                arrival_time: String::new(),
                departure_time: String::new(),
            };
            insert_visit(&mut tx, trip_id, visit).await?;
            created += 1;
        }
    }

    tx.commit().await?;
    log::info!("Assigned stop {stop_id} to routes {route_ids:?}: {created} visits");
    Ok(created)
}

/// Replaces every point of a shape. The points are renamed to `shape_id`.
pub async fn replace_shape(
    store: &Store,
    shape_id: &str,
    points: Vec<ShapePoint>,
) -> EngineResult<usize> {
    if points.is_empty() {
        return Err(EngineError::ValidationFailed("no points provided".to_string()));
    }

    let mut tx = store.pool().begin().await?;
    sqlx::query("DELETE FROM shape_points WHERE shape_id = ?")
        .bind(shape_id)
        .execute(&mut *tx)
        .await?;
    for point in &points {
        sqlx::query("INSERT INTO shape_points (shape_id, lat, lon, sequence) VALUES (?, ?, ?, ?)")
            .bind(shape_id)
            .bind(point.lat)
            .bind(point.lon)
            .bind(point.sequence)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(points.len())
}

/// Deletes the shape's points. Trips naming it keep the name until they are edited.
pub async fn delete_shape(store: &Store, shape_id: &str) -> EngineResult<u64> {
    let deleted = sqlx::query("DELETE FROM shape_points WHERE shape_id = ?")
        .bind(shape_id)
        .execute(store.pool())
        .await?
        .rows_affected();
    Ok(deleted)
}

/// Deletes all trips of the given routes together with their visits, then reclaims the shapes
/// they used. The orphan check runs once after every trip of the batch is gone, so a shape
/// shared by two trips of the batch is only judged after both are deleted.
async fn delete_trips_of_routes(
    conn: &mut SqliteConnection,
    route_ids: &[i64],
) -> EngineResult<CascadeSummary> {
    let mut summary = CascadeSummary::default();
    let mut candidates = BTreeSet::new();

    for route_id in route_ids {
        let trips: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, shape_id FROM trips WHERE route_id = ? ORDER BY id")
                .bind(route_id)
                .fetch_all(&mut *conn)
                .await?;
        for (trip_id, shape_id) in trips {
            if !shape_id.is_empty() {
                candidates.insert(shape_id);
            }
            summary.stop_visits += delete_visits_of_trip(conn, trip_id).await?;
        }
    }

    for route_id in route_ids {
        summary.trips += sqlx::query("DELETE FROM trips WHERE route_id = ?")
            .bind(route_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }

    summary.reclaimed_shapes = reclaim_orphaned_shapes(conn, &candidates).await?;
    Ok(summary)
}

/// Deletes the points of every candidate shape that no remaining trip refers to.
async fn reclaim_orphaned_shapes(
    conn: &mut SqliteConnection,
    candidates: &BTreeSet<String>,
) -> EngineResult<Vec<String>> {
    let mut reclaimed = vec![];
    for shape_id in candidates {
        let referrers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trips WHERE shape_id = ?")
            .bind(shape_id)
            .fetch_one(&mut *conn)
            .await?;
        if referrers > 0 {
            log::debug!("Shape {shape_id} still used by {referrers} trips");
            continue;
        }
        sqlx::query("DELETE FROM shape_points WHERE shape_id = ?")
            .bind(shape_id)
            .execute(&mut *conn)
            .await?;
        reclaimed.push(shape_id.clone());
    }
    Ok(reclaimed)
}

async fn delete_visits_of_trip(conn: &mut SqliteConnection, trip_id: i64) -> EngineResult<u64> {
    Ok(sqlx::query("DELETE FROM trip_stops WHERE trip_id = ?")
        .bind(trip_id)
        .execute(&mut *conn)
        .await?
        .rows_affected())
}

async fn insert_visit(
    conn: &mut SqliteConnection,
    trip_id: i64,
    mut visit: StopVisit,
) -> EngineResult<i64> {
    timing::fill_missing(
        visit.sequence,
        &mut visit.arrival_time,
        &mut visit.departure_time,
    );
    let result = sqlx::query(
        "INSERT INTO trip_stops (trip_id, stop_id, sequence, arrival_time, departure_time)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(trip_id)
    .bind(visit.stop_id)
    .bind(visit.sequence)
    .bind(&visit.arrival_time)
    .bind(&visit.departure_time)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}
