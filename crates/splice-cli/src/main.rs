//! Splice stop metadata tool
//!
//! Assembles method fixtures into packed stop tables and bytecode index
//! maps, runs reference-map finalization over recorded frame states, and
//! validates raw map encodings.

mod commands;
mod fixture;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "splice")]
#[command(about = "Template JIT stop metadata toolkit", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a method fixture and print its stops
    Assemble {
        /// Fixture file (TOML)
        fixture: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Color output: auto, always, never
        #[arg(long, default_value = "auto")]
        color: String,
    },

    /// Validate a raw bytecode index map and print its traversal
    CheckMap {
        /// Flattened (bci, stop count) pairs
        #[arg(num_args = 0..)]
        pairs: Vec<u32>,
        /// Stops preceding the first entry
        #[arg(long, default_value_t = 0)]
        first: u32,
        /// Color output: auto, always, never
        #[arg(long, default_value = "auto")]
        color: String,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SPLICE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Assemble {
            fixture,
            format,
            color,
        } => commands::assemble::execute(commands::assemble::AssembleArgs {
            fixture,
            format,
            color,
        }),

        Commands::CheckMap {
            pairs,
            first,
            color,
        } => commands::check_map::execute(pairs, first, &color),
    }
}
