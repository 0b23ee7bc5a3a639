#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions, clippy::similar_names)]

use clap::{Parser, Subcommand};
use dataport::{CONFIG, tokio, tracing};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

mod config;
mod serve;

pub(crate) use config::CONFIG_BIN;
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate the database
    Migrate {},
    /// Run the HTTP API and the workflow workers - The database must be migrated first
    Serve {},
    /// Re-apply the restricted marker to collections that were renamed in the BI tool
    SyncCollectionMarkers {},
    /// Remove bindings whose warehouse table no longer exists
    SyncMissingDatasources {},
    /// Print the version of the server
    Version {},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_file(CONFIG.debug.extended_logs)
        .with_line_number(CONFIG.debug.extended_logs)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match cli.command {
        Some(Commands::Migrate {}) => {
            print_info();
            migrate().await?;
        }
        Some(Commands::Serve {}) => {
            print_info();
            serve_and_maybe_migrate().await?;
        }
        Some(Commands::SyncCollectionMarkers {}) => {
            serve::sync_collection_markers().await?;
        }
        Some(Commands::SyncMissingDatasources {}) => {
            serve::sync_missing_datasources().await?;
        }
        Some(Commands::Version {}) => {
            println!("{VERSION}");
        }
        None => {
            if CONFIG_BIN.debug.auto_serve {
                print_info();
                serve_and_maybe_migrate().await?;
            } else {
                // Error out if no subcommand is provided.
                eprintln!("No subcommand provided. Use --help for more information.");
                anyhow::bail!("No subcommand provided");
            }
        }
    }

    Ok(())
}

async fn serve_and_maybe_migrate() -> anyhow::Result<()> {
    if CONFIG_BIN.debug.migrate_before_serve {
        migrate().await?;
    }
    let bind_addr = CONFIG.bind_addr();
    tracing::info!("Starting server on {bind_addr}...");
    serve::serve_default(bind_addr).await
}

async fn migrate() -> anyhow::Result<()> {
    println!("Migrating database...");
    let write_pool = dataport::implementations::postgres::get_writer_pool(
        dataport::implementations::postgres::pool_options(1),
    )
    .await?;

    // Migrations are embedded in the binary
    dataport::implementations::postgres::migrate(&write_pool).await?;
    println!("Database migration complete.");
    Ok(())
}

fn print_info() {
    let console_span = r"
 ___   __  _____  __  ___  ___  ___  _____
|   \ /  \|_   _|/  \| _ \/ _ \| _ \|_   _|
| |) | () | | | | () |  _/ (_) |   /  | |
|___/ \__/  |_|  \__/|_|  \___/|_|_\  |_|
";
    let console_span = format!("{console_span}\nDataport Version: {VERSION}\n");
    println!("{console_span}");
    tracing::info!("Dataport Version: {VERSION}");
}
