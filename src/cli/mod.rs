use anyhow::Result;
use clap::{Parser, Subcommand};

mod config;
mod library;
mod reduce;

/// pqpgen - Consolidated PQP Library Generation
#[derive(Parser)]
#[command(name = "pqpgen")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbosity level (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a consolidated assay library from per-run PSM/peak tables
    Library(library::LibraryArgs),

    /// Reduce a PQP library store to a stratified anchor set
    Reduce(reduce::ReduceArgs),
}

impl Cli {
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }
}

pub fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
}

pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Library(args) => library::run(args),
        Commands::Reduce(args) => reduce::run(args),
    }
}
