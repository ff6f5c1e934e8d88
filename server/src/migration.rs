use std::collections::HashMap;

use indicatif::ProgressIterator;

use crate::error::EngineResult;
use crate::models::{LegacyRouteStop, StopVisit};
use crate::store::{self, Store, LEGACY_STOPS_TABLE, STOP_VISITS_TABLE};
use crate::timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// There is no legacy table.
    Skipped,
    /// Trip-level visits already existed, so the legacy table was dropped without reading it.
    DiscardedStale,
    /// This many visits were created and the legacy table was dropped.
    Migrated(u64),
    /// Nothing could be migrated. The legacy table is kept so no data is lost.
    RetainedForSafety,
}

/// Moves stop assignments from the legacy per-route table to per-trip visits. Must run before
/// anything else touches the store. Running it again is harmless: once the legacy table is gone
/// it does nothing, and a retained table is simply retried.
pub async fn run_legacy_migration(store: &Store) -> EngineResult<MigrationOutcome> {
    if !store.table_exists(LEGACY_STOPS_TABLE).await? {
        log::debug!("No {LEGACY_STOPS_TABLE} table, nothing to migrate");
        return Ok(MigrationOutcome::Skipped);
    }

    if store.table_exists(STOP_VISITS_TABLE).await?
        && store.count_rows(STOP_VISITS_TABLE).await? > 0
    {
        log::info!("{STOP_VISITS_TABLE} is already populated, dropping stale {LEGACY_STOPS_TABLE}");
        drop_legacy_table(store).await;
        return Ok(MigrationOutcome::DiscardedStale);
    }

    log::info!("Found {LEGACY_STOPS_TABLE}, migrating stops to trips...");
    let mut tx = store.pool().begin().await?;
    store::create_schema(&mut tx).await?;

    let legacy: Vec<LegacyRouteStop> = sqlx::query_as(
        "SELECT route_id, stop_id, sequence, arrival_time, departure_time
         FROM route_stops ORDER BY route_id, sequence",
    )
    .fetch_all(&mut *tx)
    .await?;
    let trips: Vec<(i64, i64)> = sqlx::query_as("SELECT id, route_id FROM trips ORDER BY id")
        .fetch_all(&mut *tx)
        .await?;

    if trips.is_empty() {
        log::warn!(
            "No trips exist, keeping {} rows of {LEGACY_STOPS_TABLE} until there are trips to migrate them to",
            legacy.len()
        );
        return Ok(MigrationOutcome::RetainedForSafety);
    }

    let visits = fan_out(&legacy, &trips);
    if visits.is_empty() {
        log::warn!(
            "None of the {} rows of {LEGACY_STOPS_TABLE} belong to a route with trips, keeping the table",
            legacy.len()
        );
        return Ok(MigrationOutcome::RetainedForSafety);
    }

    let style = indicatif::ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {human_pos:>7}/{human_len:7} {msg}",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
    let mut created = 0;
    for visit in visits
        .iter()
        .progress_with_style(style)
        .with_message("Create stop visits.")
        .with_finish(indicatif::ProgressFinish::AndLeave)
    {
        sqlx::query(
            "INSERT INTO trip_stops (trip_id, stop_id, sequence, arrival_time, departure_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(visit.trip_id)
        .bind(visit.stop_id)
        .bind(visit.sequence)
        .bind(&visit.arrival_time)
        .bind(&visit.departure_time)
        .execute(&mut *tx)
        .await?;
        created += 1;
    }
    tx.commit().await?;

    log::info!("Migrated {} legacy rows into {created} stop visits", legacy.len());
    drop_legacy_table(store).await;
    Ok(MigrationOutcome::Migrated(created))
}

/// Joins legacy rows with trips on route id: every row becomes one visit per trip of its route.
/// Blank or missing legacy times are synthesized from the sequence.
fn fan_out(legacy: &[LegacyRouteStop], trips: &[(i64, i64)]) -> Vec<StopVisit> {
    let mut trips_by_route: HashMap<i64, Vec<i64>> = HashMap::new();
    for (trip_id, route_id) in trips {
        trips_by_route.entry(*route_id).or_default().push(*trip_id);
    }

    let mut visits = vec![];
    for row in legacy {
        let Some(trip_ids) = trips_by_route.get(&row.route_id) else {
            continue;
        };
        for trip_id in trip_ids {
            let mut arrival_time = row.arrival_time.clone().unwrap_or_default();
            let mut departure_time = row.departure_time.clone().unwrap_or_default();
            timing::fill_missing(row.sequence, &mut arrival_time, &mut departure_time);
            visits.push(StopVisit {
                id: 0,
                trip_id: *trip_id,
                stop_id: row.stop_id,
                sequence: row.sequence,
                arrival_time,
                departure_time,
            });
        }
    }
    visits
}

/// The data is already safe at this point, so a failure is only worth a warning.
async fn drop_legacy_table(store: &Store) {
    if let Err(err) = store.drop_table(LEGACY_STOPS_TABLE).await {
        log::warn!("Failed to drop {LEGACY_STOPS_TABLE}: {err}");
    }
}
