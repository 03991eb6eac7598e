//! Binary entry point for geowatch.
//!
//! This binary provides the CLI interface for the geowatch tracking core.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use geowatch::cli::{
    self, FeedTarget, GeofenceUpdate, NewGeofenceArgs, OutputFormat, ReplaySummary,
};
use geowatch::config::GeowatchConfig;
use geowatch::models::{GeofenceId, GroupId, UserId};
use geowatch::observability::{self, InitOptions};
use geowatch::services::{DEFAULT_FEED_LIMIT, Tracker};
use std::path::PathBuf;
use std::process::ExitCode;

/// Geowatch - geofence transitions and live location for family groups.
#[derive(Parser)]
#[command(name = "geowatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "GEOWATCH_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Ingest NDJSON samples from stdin until EOF or ctrl-c.
    Serve,

    /// Ingest an NDJSON file in order and print a summary.
    Replay {
        /// File with one sample per line.
        file: PathBuf,

        /// Output format: table or json.
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show recent activity, newest first.
    Feed {
        /// Feed of one user.
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        user: Option<String>,

        /// Feed of a whole group.
        #[arg(long)]
        group: Option<String>,

        /// Maximum number of events.
        #[arg(short, long, default_value_t = DEFAULT_FEED_LIMIT)]
        limit: usize,

        /// Output format: table or json.
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show live sessions of a group.
    Session {
        /// Group to show.
        #[arg(long)]
        group: String,

        /// Only this user.
        #[arg(long)]
        user: Option<String>,

        /// Output format: table or json.
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Manage geofences.
    Geofence {
        /// Geofence subcommand.
        #[command(subcommand)]
        action: GeofenceAction,
    },
}

/// Geofence subcommands.
#[derive(Subcommand)]
enum GeofenceAction {
    /// Create a geofence.
    Add {
        /// Owning group.
        #[arg(long)]
        group: String,

        /// Display name.
        #[arg(long)]
        name: String,

        /// Center latitude in degrees.
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Center longitude in degrees.
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Radius in meters (10 to 50000).
        #[arg(long)]
        radius: u32,

        /// Kind: safe, restricted or notify.
        #[arg(long, default_value = "notify")]
        kind: String,

        /// Explicit identifier.
        #[arg(long)]
        id: Option<String>,

        /// Creating member.
        #[arg(long)]
        created_by: Option<String>,
    },

    /// Change fields of a geofence.
    Update {
        /// Geofence identifier.
        id: String,

        /// New display name.
        #[arg(long)]
        name: Option<String>,

        /// New center latitude.
        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,

        /// New center longitude.
        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,

        /// New radius in meters.
        #[arg(long)]
        radius: Option<u32>,

        /// New kind.
        #[arg(long)]
        kind: Option<String>,
    },

    /// Stop evaluating a geofence.
    Deactivate {
        /// Geofence identifier.
        id: String,
    },

    /// Resume evaluating a geofence.
    Activate {
        /// Geofence identifier.
        id: String,
    },

    /// List the geofences of a group.
    List {
        /// Group to list.
        #[arg(long)]
        group: String,

        /// Output format: table or json.
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

/// Main entry point.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match GeowatchConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };
    if let Some(data_dir) = cli.data_dir.clone() {
        config = config.with_data_dir(data_dir);
    }

    let expose_metrics = matches!(cli.command, Commands::Serve);
    let _observability = match observability::init(
        &config.logging,
        &config.metrics,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: expose_metrics,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
async fn run_command(command: Commands, config: GeowatchConfig) -> geowatch::Result<()> {
    let tracker = Tracker::open(config)?;

    match command {
        Commands::Serve => {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let queued = cli::cmd_serve(&tracker, stdin).await?;
            eprintln!("Processed {queued} sample(s)");
        },

        Commands::Replay { file, format } => {
            let summary = cli::cmd_replay(&tracker, &file).await?;
            print_summary(&summary, OutputFormat::parse(&format))?;
        },

        Commands::Feed {
            user,
            group,
            limit,
            format,
        } => {
            let target = match (user, group) {
                (Some(user), _) => FeedTarget::User(UserId::new(user)),
                (None, Some(group)) => FeedTarget::Group(GroupId::new(group)),
                (None, None) => {
                    return Err(geowatch::Error::InvalidInput(
                        "either --user or --group is required".to_string(),
                    ));
                },
            };
            cli::cmd_feed(&tracker, &target, limit, OutputFormat::parse(&format)).await?;
        },

        Commands::Session {
            group,
            user,
            format,
        } => {
            let user = user.map(UserId::new);
            cli::cmd_session(
                &tracker,
                &GroupId::new(group),
                user.as_ref(),
                chrono::Utc::now(),
                OutputFormat::parse(&format),
            )
            .await?;
        },

        Commands::Geofence { action } => run_geofence(&tracker, action).await?,
    }
    Ok(())
}

async fn run_geofence(tracker: &Tracker, action: GeofenceAction) -> geowatch::Result<()> {
    match action {
        GeofenceAction::Add {
            group,
            name,
            lat,
            lon,
            radius,
            kind,
            id,
            created_by,
        } => {
            let args = NewGeofenceArgs {
                group: GroupId::new(group),
                name,
                latitude: lat,
                longitude: lon,
                radius_m: radius,
                kind,
                id,
                created_by,
            };
            cli::cmd_geofence_add(tracker, args).await?;
        },
        GeofenceAction::Update {
            id,
            name,
            lat,
            lon,
            radius,
            kind,
        } => {
            let update = GeofenceUpdate {
                name,
                latitude: lat,
                longitude: lon,
                radius_m: radius,
                kind,
            };
            cli::cmd_geofence_update(tracker, &GeofenceId::new(id), update).await?;
        },
        GeofenceAction::Deactivate { id } => {
            cli::cmd_geofence_set_active(tracker, &GeofenceId::new(id), false).await?;
        },
        GeofenceAction::Activate { id } => {
            cli::cmd_geofence_set_active(tracker, &GeofenceId::new(id), true).await?;
        },
        GeofenceAction::List { group, format } => {
            cli::cmd_geofence_list(tracker, &GroupId::new(group), OutputFormat::parse(&format))
                .await?;
        },
    }
    Ok(())
}

fn print_summary(summary: &ReplaySummary, format: OutputFormat) -> geowatch::Result<()> {
    if format == OutputFormat::Json {
        let json =
            serde_json::to_string_pretty(summary).map_err(|e| geowatch::Error::OperationFailed {
                operation: "serialize_summary".to_string(),
                cause: e.to_string(),
            })?;
        println!("{json}");
        return Ok(());
    }
    println!("Lines:       {}", summary.lines);
    println!("Accepted:    {}", summary.accepted);
    println!("Degraded:    {}", summary.degraded);
    println!("Stale:       {}", summary.stale);
    println!("Rejected:    {}", summary.rejected);
    println!("Malformed:   {}", summary.malformed);
    println!("Failed:      {}", summary.failed);
    println!("Transitions: {}", summary.transitions);
    println!("New events:  {}", summary.events);
    Ok(())
}
