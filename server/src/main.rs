mod config;
mod error;
mod export;
mod integrity;
mod migration;
mod models;
mod store;
mod timing;

use std::{io::Write, path::Path, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::error::EngineError;
use crate::models::{NewAgency, NewRoute, NewTrip, ShapePoint, StopVisit};
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(version, about = "Edits a transit dataset and exports it as a GTFS bundle")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Move legacy route-level stop assignments onto trips. Also runs before every other command.
    Migrate,
    CreateAgency {
        name: String,
        url: String,
        timezone: String,
    },
    #[command(allow_negative_numbers = true)]
    CreateStop { name: String, lat: f64, lon: f64 },
    CreateRoute {
        agency_id: i64,
        short_name: String,
        #[arg(long, default_value = "")]
        long_name: String,
        #[arg(long, default_value = "")]
        color: String,
        /// GTFS route_type, exported as 3 (bus) when omitted.
        #[arg(long)]
        route_type: Option<i64>,
    },
    CreateTrip {
        route_id: i64,
        #[arg(long, default_value = "")]
        service_id: String,
        #[arg(long, default_value = "")]
        headsign: String,
        #[arg(long, default_value = "")]
        shape_id: String,
    },
    /// Write all tables into a GTFS zip.
    Export {
        #[arg(long, default_value = "gtfs_export.zip")]
        output: PathBuf,
    },
    DeleteAgency { id: i64 },
    DeleteRoute { id: i64 },
    DeleteTrip { id: i64 },
    DeleteStop { id: i64 },
    /// Print the visits of a trip in sequence order.
    TripStops { trip_id: i64 },
    /// Replace all visits of a trip with the JSON array in `file`.
    ReplaceStopVisits { trip_id: i64, file: PathBuf },
    AddStopVisit {
        trip_id: i64,
        stop_id: i64,
        sequence: i64,
        #[arg(long, default_value = "")]
        arrival: String,
        #[arg(long, default_value = "")]
        departure: String,
    },
    /// Make a stop part of exactly these routes.
    AssignStop { stop_id: i64, route_ids: Vec<i64> },
    StopRoutes { stop_id: i64 },
    /// Replace all points of a shape with the JSON array in `file`.
    ReplaceShape { shape_id: String, file: PathBuf },
    DeleteShape { shape_id: String },
    Shape { shape_id: String },
    Shapes,
    Activity {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = simple_logger::SimpleLogger::new()
        .with_level(cli.config.log_level)
        .env()
        .init()
    {
        eprintln!("Failed to initialize logging: {err}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            match err.downcast_ref::<EngineError>() {
                Some(engine_err) if engine_err.is_rejection() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = Store::connect(&cli.config).await?;
    let outcome = migration::run_legacy_migration(&store)
        .await
        .context("Legacy migration failed")?;
    store.create_schema().await?;

    match cli.command {
        Command::Migrate => {
            log::info!("Migration outcome: {outcome:?}");
        }
        Command::CreateAgency {
            name,
            url,
            timezone,
        } => {
            let id = store
                .create_agency(&NewAgency {
                    name: &name,
                    url: &url,
                    timezone: &timezone,
                })
                .await?;
            store
                .record_activity("CREATE_AGENCY", &format!("Created agency: {name}"))
                .await;
            println!("{id}");
        }
        Command::CreateStop { name, lat, lon } => {
            let id = store.create_stop(&name, lat, lon).await?;
            store
                .record_activity("CREATE_STOP", &format!("Created stop: {name}"))
                .await;
            println!("{id}");
        }
        Command::CreateRoute {
            agency_id,
            short_name,
            long_name,
            color,
            route_type,
        } => {
            let id = store
                .create_route(&NewRoute {
                    agency_id,
                    short_name: &short_name,
                    long_name: &long_name,
                    color: &color,
                    route_type,
                })
                .await?;
            store
                .record_activity("CREATE_ROUTE", &format!("Created route: {short_name}"))
                .await;
            println!("{id}");
        }
        Command::CreateTrip {
            route_id,
            service_id,
            headsign,
            shape_id,
        } => {
            let id = store
                .create_trip(&NewTrip {
                    route_id,
                    service_id: &service_id,
                    headsign: &headsign,
                    shape_id: &shape_id,
                })
                .await?;
            store
                .record_activity("CREATE_TRIP", &format!("Created trip on route ID: {route_id}"))
                .await;
            println!("{id}");
        }
        Command::Export { output } => {
            let bundle = export::export_bundle(&store).await?;
            log::info!("Writing GTFS bundle to {:?}", output);
            let mut file = std::fs::File::create(&output)?;
            file.write_all(&bundle)?;
            store
                .record_activity("EXPORT_GTFS", "Exported GTFS zip bundle")
                .await;
        }
        Command::DeleteAgency { id } => {
            let summary = integrity::delete_agency(&store, id).await?;
            store
                .record_activity("DELETE_AGENCY", &describe_cascade("agency", id, &summary))
                .await;
        }
        Command::DeleteRoute { id } => {
            let summary = integrity::delete_route(&store, id).await?;
            store
                .record_activity("DELETE_ROUTE", &describe_cascade("route", id, &summary))
                .await;
        }
        Command::DeleteTrip { id } => {
            let summary = integrity::delete_trip(&store, id).await?;
            store
                .record_activity("DELETE_TRIP", &describe_cascade("trip", id, &summary))
                .await;
        }
        Command::DeleteStop { id } => {
            integrity::delete_stop(&store, id).await?;
            store
                .record_activity("DELETE_STOP", &format!("Deleted stop ID: {id}"))
                .await;
        }
        Command::TripStops { trip_id } => {
            if store.get_trip(trip_id).await?.is_none() {
                return Err(EngineError::not_found("trip", trip_id).into());
            }
            print_json(&store.trip_stop_visits(trip_id).await?)?;
        }
        Command::ReplaceStopVisits { trip_id, file } => {
            let visits: Vec<StopVisit> = read_json(&file)?;
            let count = integrity::replace_trip_stop_visits(&store, trip_id, visits).await?;
            store
                .record_activity(
                    "UPDATE_TRIP_STOPS",
                    &format!("Set {count} stops of trip ID: {trip_id}"),
                )
                .await;
        }
        Command::AddStopVisit {
            trip_id,
            stop_id,
            sequence,
            arrival,
            departure,
        } => {
            let visit = StopVisit {
                id: 0,
                trip_id,
                stop_id,
                sequence,
                arrival_time: arrival,
                departure_time: departure,
            };
            let id = integrity::add_stop_visit(&store, visit).await?;
            store
                .record_activity(
                    "UPDATE_TRIP_STOPS",
                    &format!("Added stop {stop_id} to trip ID: {trip_id}"),
                )
                .await;
            println!("{id}");
        }
        Command::AssignStop { stop_id, route_ids } => {
            integrity::assign_stop_to_routes(&store, stop_id, &route_ids).await?;
            store
                .record_activity(
                    "UPDATE_STOP_ROUTES",
                    &format!("Assigned stop ID: {stop_id} to routes {route_ids:?}"),
                )
                .await;
        }
        Command::StopRoutes { stop_id } => {
            print_json(&store.routes_serving_stop(stop_id).await?)?;
        }
        Command::ReplaceShape { shape_id, file } => {
            let points: Vec<ShapePoint> = read_json(&file)?;
            let count = integrity::replace_shape(&store, &shape_id, points).await?;
            store
                .record_activity(
                    "UPDATE_SHAPE",
                    &format!("Set {count} points of shape: {shape_id}"),
                )
                .await;
        }
        Command::DeleteShape { shape_id } => {
            integrity::delete_shape(&store, &shape_id).await?;
            store
                .record_activity("DELETE_SHAPE", &format!("Deleted shape: {shape_id}"))
                .await;
        }
        Command::Shape { shape_id } => {
            print_json(&store.shape_points(&shape_id).await?)?;
        }
        Command::Shapes => {
            print_json(&store.shape_ids().await?)?;
        }
        Command::Activity { limit } => {
            print_json(&store.recent_activity(limit).await?)?;
        }
    }
    Ok(())
}

fn describe_cascade(entity: &str, id: i64, summary: &integrity::CascadeSummary) -> String {
    format!(
        "Deleted {entity} ID: {id} ({} routes, {} trips, {} stop visits, {} shapes reclaimed)",
        summary.routes,
        summary.trips,
        summary.stop_visits,
        summary.reclaimed_shapes.len()
    )
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|err| EngineError::InvalidInput(format!("{path:?}: {err}")).into())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
