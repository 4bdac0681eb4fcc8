//! pqpgen command-line entry point.
//!
//! ## Usage
//!
//! ```bash
//! # Build a consolidated assay library from per-run tables
//! pqpgen library runA.psms.tsv runA.peaks.tsv runB.psms.tsv runB.peaks.tsv --out library.tsv
//!
//! # Reduce an assembled PQP store to a stratified anchor set
//! pqpgen reduce --in library.pqp --out reduced.pqp --bins 10 --peptides 5
//! ```

use anyhow::Result;
use clap::Parser;

mod cli;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    cli::init_logging(cli.verbosity());
    cli::dispatch(cli)
}
