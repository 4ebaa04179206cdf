//! Corundum operator CLI.
//!
//! ```bash
//! # Initialize a replica's data file
//! corundum format --cluster 1 --replica 0 --replica-count 3 ./0.corundum
//!
//! # Start the replica
//! corundum start --addresses 127.0.0.1:3000,127.0.0.1:3001,127.0.0.1:3002 \
//!     --replica 0 ./0.corundum
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Exit codes beyond success: unrecoverable corruption, and a restart
/// request because the cluster moved to a release this binary lacks.
pub const EXIT_CORRUPT: i32 = 3;
pub const EXIT_RELEASE_MISMATCH: i32 = 4;

/// Corundum — a strongly consistent replicated transactional core.
#[derive(Parser)]
#[command(name = "corundum")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data file for one replica.
    Format {
        /// Cluster id shared by every replica.
        #[arg(long)]
        cluster: u128,

        /// This replica's index.
        #[arg(long)]
        replica: u8,

        /// Number of active replicas.
        #[arg(long)]
        replica_count: u8,

        /// Number of standby replicas.
        #[arg(long, default_value_t = 0)]
        standby_count: u8,

        /// Path of the data file to create.
        path: String,
    },

    /// Open a data file and run the replica.
    Start {
        /// Comma-separated addresses of every cluster member, in
        /// replica-id order.
        #[arg(long, value_delimiter = ',')]
        addresses: Vec<String>,

        /// This replica's index into the address list.
        #[arg(long)]
        replica: u8,

        /// Path of the data file.
        path: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Format {
            cluster,
            replica,
            replica_count,
            standby_count,
            path,
        } => commands::format::run(cluster, replica, replica_count, standby_count, &path),
        Commands::Start {
            addresses,
            replica,
            path,
        } => commands::start::run(&addresses, replica, &path),
    }
}
