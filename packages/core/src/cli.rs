use clap::Parser;

/// Fleet metrics service CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "fleet-metrics",
    version,
    about = "Configurable fleet metrics with scheduled recalculation"
)]
pub struct Cli {
    /// Database URL (overrides DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// HTTP port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// File used to elect the single scheduler process
    #[arg(long)]
    pub lock_path: Option<String>,

    /// Serve the API without running scheduled jobs
    #[arg(long)]
    pub no_scheduler: bool,
}
