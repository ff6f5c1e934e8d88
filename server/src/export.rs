use std::io::{Cursor, Write};

use futures::TryStreamExt;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{EngineError, EngineResult};
use crate::store::Store;

/// The only service the bundle defines. Trips without a service id run on it.
pub const DAILY_SERVICE_ID: &str = "DAILY";

const DEFAULT_TIME: &str = "08:00:00";
const DEFAULT_ROUTE_TYPE: i64 = 3;
const CALENDAR_START: &str = "20250101";
const CALENDAR_END: &str = "20261231";

const AGENCY: &str = "agency.txt";
const STOPS: &str = "stops.txt";
const ROUTES: &str = "routes.txt";
const TRIPS: &str = "trips.txt";
const STOP_TIMES: &str = "stop_times.txt";
const SHAPES: &str = "shapes.txt";
const CALENDAR: &str = "calendar.txt";

struct Table {
    file_name: &'static str,
    header: &'static [&'static str],
    rows: Vec<Vec<String>>,
}

impl Table {
    fn new(file_name: &'static str, header: &'static [&'static str]) -> Self {
        Self {
            file_name,
            header,
            rows: vec![],
        }
    }

    fn to_csv(&self) -> anyhow::Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer.write_record(self.header)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        Ok(writer.into_inner().map_err(|err| err.into_error())?)
    }
}

/// Builds a GTFS zip of the whole dataset. Reads without a transaction, so a concurrent edit may
/// show up in some tables and not in others. Any table that fails aborts the whole export.
pub async fn export_bundle(store: &Store) -> EngineResult<Vec<u8>> {
    let agencies = store.agencies().await.map_err(failed(AGENCY))?;
    if agencies.is_empty() {
        return Err(EngineError::ValidationFailed(
            "No agencies found. At least one agency is required for GTFS export.".to_string(),
        ));
    }

    let mut agency = Table::new(
        AGENCY,
        &["agency_id", "agency_name", "agency_url", "agency_timezone", "agency_lang"],
    );
    for a in agencies {
        agency.rows.push(vec![
            a.id.to_string(),
            a.name,
            a.url,
            a.timezone,
            "en".to_string(),
        ]);
    }

    let mut stops = Table::new(
        STOPS,
        &["stop_id", "stop_name", "stop_lat", "stop_lon", "location_type"],
    );
    for s in store.stops().await.map_err(failed(STOPS))? {
        stops.rows.push(vec![
            s.id.to_string(),
            s.name,
            format_coordinate(s.lat),
            format_coordinate(s.lon),
            "0".to_string(),
        ]);
    }

    let mut routes = Table::new(
        ROUTES,
        &[
            "route_id",
            "agency_id",
            "route_short_name",
            "route_long_name",
            "route_type",
            "route_color",
        ],
    );
    for r in store.routes().await.map_err(failed(ROUTES))? {
        routes.rows.push(vec![
            r.id.to_string(),
            r.agency_id.to_string(),
            r.short_name,
            r.long_name,
            r.route_type.unwrap_or(DEFAULT_ROUTE_TYPE).to_string(),
            r.color,
        ]);
    }

    let mut trips = Table::new(
        TRIPS,
        &["route_id", "service_id", "trip_id", "trip_headsign", "shape_id"],
    );
    for t in store.trips().await.map_err(failed(TRIPS))? {
        let service_id = if t.service_id.is_empty() {
            DAILY_SERVICE_ID.to_string()
        } else {
            t.service_id
        };
        trips.rows.push(vec![
            t.route_id.to_string(),
            service_id,
            t.id.to_string(),
            t.headsign,
            t.shape_id,
        ]);
    }

    let mut stop_times = Table::new(
        STOP_TIMES,
        &["trip_id", "arrival_time", "departure_time", "stop_id", "stop_sequence"],
    );
    let mut visits = store.stream_stop_visits();
    while let Some(v) = visits.try_next().await.map_err(failed(STOP_TIMES))? {
        stop_times.rows.push(vec![
            v.trip_id.to_string(),
            or_default_time(v.arrival_time),
            or_default_time(v.departure_time),
            v.stop_id.to_string(),
            v.sequence.to_string(),
        ]);
    }
    drop(visits);

    let mut shapes = Table::new(
        SHAPES,
        &["shape_id", "shape_pt_lat", "shape_pt_lon", "shape_pt_sequence"],
    );
    let mut points = store.stream_shape_points();
    while let Some(p) = points.try_next().await.map_err(failed(SHAPES))? {
        shapes.rows.push(vec![
            p.shape_id,
            format_coordinate(p.lat),
            format_coordinate(p.lon),
            p.sequence.to_string(),
        ]);
    }
    drop(points);

    let mut calendar = Table::new(
        CALENDAR,
        &[
            "service_id",
            "monday",
            "tuesday",
            "wednesday",
            "thursday",
            "friday",
            "saturday",
            "sunday",
            "start_date",
            "end_date",
        ],
    );
    let mut daily = vec![DAILY_SERVICE_ID.to_string()];
    daily.extend(std::iter::repeat("1".to_string()).take(7));
    daily.push(CALENDAR_START.to_string());
    daily.push(CALENDAR_END.to_string());
    calendar.rows.push(daily);

    let tables = [agency, stops, routes, trips, stop_times, shapes, calendar];
    for table in &tables {
        log::debug!("{}: {} rows", table.file_name, table.rows.len());
    }
    write_archive(&tables)
}

fn write_archive(tables: &[Table]) -> EngineResult<Vec<u8>> {
    // A fixed timestamp keeps two exports of the same data byte-identical.
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for table in tables {
        let write_table = |zip: &mut ZipWriter<Cursor<Vec<u8>>>| -> anyhow::Result<()> {
            let contents = table.to_csv()?;
            zip.start_file(table.file_name, options)?;
            zip.write_all(&contents)?;
            Ok(())
        };
        write_table(&mut zip).map_err(|err| EngineError::Export {
            table: table.file_name,
            reason: format!("{err:#}"),
        })?;
    }

    let buffer = zip.finish().map_err(|err| EngineError::Export {
        table: "archive",
        reason: err.to_string(),
    })?;
    Ok(buffer.into_inner())
}

fn failed<E: std::fmt::Display>(table: &'static str) -> impl FnOnce(E) -> EngineError {
    move |err| EngineError::Export {
        table,
        reason: err.to_string(),
    }
}

fn or_default_time(time: String) -> String {
    if time.is_empty() {
        DEFAULT_TIME.to_string()
    } else {
        time
    }
}

fn format_coordinate(value: f64) -> String {
    format!("{value:.6}")
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use zip::ZipArchive;

    use super::*;
    use crate::integrity;
    use crate::models::{NewAgency, NewRoute, NewTrip, ShapePoint};

    struct Seeded {
        store: Store,
        trip_id: i64,
        stop_id: i64,
    }

    async fn seed() -> Seeded {
        let store = Store::in_memory().await;
        store.create_schema().await.unwrap();
        let agency_id = store
            .create_agency(&NewAgency {
                name: "Test Agency",
                url: "http://example.com",
                timezone: "UTC",
            })
            .await
            .unwrap();
        let stop_id = store.create_stop("Test Stop", 10.0, 20.0).await.unwrap();
        let route_id = store
            .create_route(&NewRoute {
                agency_id,
                short_name: "T1",
                long_name: "Test Route",
                color: "0044AA",
                route_type: None,
            })
            .await
            .unwrap();
        let trip_id = store
            .create_trip(&NewTrip {
                route_id,
                service_id: "",
                headsign: "Downtown",
                shape_id: "t1",
            })
            .await
            .unwrap();
        // Bypasses the engine so the visit has no times on file.
        sqlx::query("INSERT INTO trip_stops (trip_id, stop_id, sequence) VALUES (?, ?, 1)")
            .bind(trip_id)
            .bind(stop_id)
            .execute(store.pool())
            .await
            .unwrap();
        Seeded {
            store,
            trip_id,
            stop_id,
        }
    }

    fn point(sequence: i64, lat: f64) -> ShapePoint {
        ShapePoint {
            id: 0,
            shape_id: String::new(),
            lat,
            lon: 20.0,
            sequence,
        }
    }

    fn read_table(bytes: &[u8], name: &str) -> Vec<Vec<String>> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut contents = String::new();
        archive
            .by_name(name)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(contents.as_bytes())
            .records()
            .map(|record| record.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[tokio::test]
    async fn bundle_contains_every_table() {
        let Seeded { store, .. } = seed().await;
        let bytes = export_bundle(&store).await.unwrap();

        let archive = ZipArchive::new(Cursor::new(&bytes)).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        for expected in [AGENCY, STOPS, ROUTES, TRIPS, STOP_TIMES, SHAPES, CALENDAR] {
            assert!(names.contains(&expected), "missing {expected}");
        }

        let agency = read_table(&bytes, AGENCY);
        assert_eq!(agency[0][1], "agency_name");
        assert_eq!(agency[1][1], "Test Agency");
        assert_eq!(agency[1][4], "en");
    }

    #[tokio::test]
    async fn rows_get_their_documented_defaults() {
        let Seeded {
            store,
            trip_id,
            stop_id,
        } = seed().await;
        let bytes = export_bundle(&store).await.unwrap();

        let stops = read_table(&bytes, STOPS);
        assert_eq!(stops[1][0], stop_id.to_string());
        assert_eq!(stops[1][1..], ["Test Stop", "10.000000", "20.000000", "0"]);

        let routes = read_table(&bytes, ROUTES);
        assert_eq!(routes[0][4], "route_type");
        assert_eq!(routes[1][4], "3");
        assert_eq!(routes[1][5], "0044AA");

        let trips = read_table(&bytes, TRIPS);
        assert_eq!(trips[1][1], "DAILY");
        assert_eq!(trips[1][2], trip_id.to_string());
        assert_eq!(trips[1][4], "t1");

        let stop_times = read_table(&bytes, STOP_TIMES);
        assert_eq!(
            stop_times[0],
            vec!["trip_id", "arrival_time", "departure_time", "stop_id", "stop_sequence"]
        );
        assert_eq!(stop_times[1][1], "08:00:00");
        assert_eq!(stop_times[1][2], "08:00:00");

        let calendar = read_table(&bytes, CALENDAR);
        assert_eq!(calendar.len(), 2);
        assert_eq!(
            calendar[1].join(","),
            "DAILY,1,1,1,1,1,1,1,20250101,20261231"
        );
    }

    #[tokio::test]
    async fn shapes_are_ordered_by_name_then_sequence() {
        let Seeded { store, .. } = seed().await;
        integrity::replace_shape(&store, "t1", vec![point(2, 1.2), point(0, 1.0), point(1, 1.1)])
            .await
            .unwrap();
        integrity::replace_shape(&store, "a0", vec![point(5, 5.0)])
            .await
            .unwrap();

        let bytes = export_bundle(&store).await.unwrap();
        let shapes: Vec<String> = read_table(&bytes, SHAPES)
            .iter()
            .skip(1)
            .map(|row| format!("{}:{}", row[0], row[3]))
            .collect();
        assert_eq!(shapes, vec!["a0:5", "t1:0", "t1:1", "t1:2"]);
    }

    #[tokio::test]
    async fn exporting_twice_gives_identical_bytes() {
        let Seeded { store, .. } = seed().await;
        let first = export_bundle(&store).await.unwrap();
        let second = export_bundle(&store).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn no_agencies_is_a_validation_failure() {
        let store = Store::in_memory().await;
        store.create_schema().await.unwrap();
        store.create_stop("Lonely", 1.0, 2.0).await.unwrap();
        assert!(matches!(
            export_bundle(&store).await,
            Err(EngineError::ValidationFailed(_))
        ));
    }

    #[tokio::test]
    async fn missing_table_is_named_in_the_error() {
        let Seeded { store, .. } = seed().await;
        sqlx::query("DROP TABLE shape_points")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            export_bundle(&store).await,
            Err(EngineError::Export { table: SHAPES, .. })
        ));
    }

    #[tokio::test]
    async fn routing_tools_can_read_the_bundle() {
        let Seeded {
            store,
            trip_id,
            stop_id,
        } = seed().await;
        integrity::replace_shape(&store, "t1", vec![point(0, 10.0), point(1, 10.5)])
            .await
            .unwrap();
        let bytes = export_bundle(&store).await.unwrap();

        let gtfs = gtfs_structures::Gtfs::from_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(gtfs.agencies.len(), 1);
        assert_eq!(gtfs.agencies[0].name, "Test Agency");
        assert!(gtfs.stops.contains_key(&stop_id.to_string()));
        assert!(gtfs.calendar.contains_key(DAILY_SERVICE_ID));
        let trip = &gtfs.trips[&trip_id.to_string()];
        assert_eq!(trip.service_id, DAILY_SERVICE_ID);
        assert_eq!(trip.stop_times.len(), 1);
        assert_eq!(gtfs.shapes["t1"].len(), 2);
    }
}
