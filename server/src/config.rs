use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// SQLite connection string of the transit dataset.
    #[arg(
        long,
        global = true,
        env = "TRANSIT_DATABASE_URL",
        default_value = "sqlite://transit.db?mode=rwc"
    )]
    pub database_url: String,

    #[arg(long, global = true, env = "TRANSIT_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// One of error, warn, info, debug, trace. RUST_LOG takes precedence when set.
    #[arg(long, global = true, env = "TRANSIT_LOG_LEVEL", default_value = "info")]
    pub log_level: log::LevelFilter,
}
