use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use log::info;

use pqpgen::reduce::{reduce, ReduceConfig};

/// Arguments of the `reduce` subcommand.
#[derive(Debug, Args)]
pub struct ReduceArgs {
    /// Input PQP library store
    #[arg(long = "in", value_name = "FILE")]
    input: PathBuf,

    /// Output PQP library store (omit together with --in-place)
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Reduce the input store in place instead of writing a new one
    #[arg(long)]
    in_place: bool,

    /// Number of bins to fill along the gradient
    #[arg(long, default_value_t = 10)]
    bins: usize,

    /// Number of peptides to sample per bin
    #[arg(long, default_value_t = 5)]
    peptides: usize,
}

pub fn run(args: ReduceArgs) -> Result<()> {
    let config = ReduceConfig {
        input: args.input,
        output: args.out,
        in_place: args.in_place,
        bins: args.bins,
        peptides_per_bin: args.peptides,
    };

    let summary = reduce(&config).context("library reduction failed")?;

    info!("Reduction complete!");
    info!(
        "  Anchors: {} kept from {} candidates across {} bins",
        summary.anchors, summary.candidates, summary.bins
    );
    info!("  Precursors removed: {}", summary.precursors_removed);

    Ok(())
}
