use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use log::info;

use pqpgen::calibrate::SmoothingFraction;
use pqpgen::consensus::ConsensusMode;
use pqpgen::fdr::{Pi0Lambda, DEFAULT_MIN_FDR_ENTITIES};
use pqpgen::library::{generate, AxisOptions, LibraryConfig};

use super::config::Config;

/// Arguments of the `library` subcommand.
#[derive(Debug, Args)]
pub struct LibraryArgs {
    /// Input PSM/peak tables (*.psms.tsv with matching *.peaks.tsv)
    #[arg(value_name = "INFILES", required = true)]
    infiles: Vec<PathBuf>,

    /// Output assay library TSV
    #[arg(long, value_name = "FILE")]
    out: PathBuf,

    /// Load tuning settings from a TOML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Whether to perform RT calibration
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    rt_calibration: bool,

    /// Optional external RT reference file (e.g. iRT coordinates)
    #[arg(long, value_name = "FILE")]
    rt_reference: Option<PathBuf>,

    /// Where to write the chosen RT reference run coordinates
    #[arg(long, value_name = "FILE", default_value = "pqpgen_rt_reference_run.tsv")]
    rt_reference_run_path: PathBuf,

    /// Optional tag to filter candidate RT reference runs
    #[arg(long, value_name = "TAG")]
    rt_filter: Option<String>,

    /// Whether to perform IM calibration
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    im_calibration: bool,

    /// Optional external IM reference file
    #[arg(long, value_name = "FILE")]
    im_reference: Option<PathBuf>,

    /// Where to write the chosen IM reference run coordinates
    #[arg(long, value_name = "FILE", default_value = "pqpgen_im_reference_run.tsv")]
    im_reference_run_path: PathBuf,

    /// Optional tag to filter candidate IM reference runs
    #[arg(long, value_name = "TAG")]
    im_filter: Option<String>,

    /// PSM FDR threshold (default: 0.01)
    #[arg(long, value_name = "FDR")]
    psm_fdr_threshold: Option<f64>,

    /// Peptide FDR threshold (default: 0.01)
    #[arg(long, value_name = "FDR")]
    peptide_fdr_threshold: Option<f64>,

    /// Protein FDR threshold (default: 0.01)
    #[arg(long, value_name = "FDR")]
    protein_fdr_threshold: Option<f64>,

    /// Fraction of data points for RT lowess regression; 0 selects
    /// cross-validation (default: 0.05)
    #[arg(long, value_name = "FRAC")]
    rt_lowess_fraction: Option<f64>,

    /// PSM FDR threshold used for RT alignment (default: 0.001)
    #[arg(long, value_name = "FDR")]
    rt_psm_fdr_threshold: Option<f64>,

    /// Fraction of data points for IM lowess regression; 0 selects
    /// cross-validation (default: 0.05)
    #[arg(long, value_name = "FRAC")]
    im_lowess_fraction: Option<f64>,

    /// PSM FDR threshold used for IM alignment (default: 0.001)
    #[arg(long, value_name = "FDR")]
    im_psm_fdr_threshold: Option<f64>,

    /// pi0 lambda as START,END,STEP; use V,0,0 for a fixed pi0 value
    #[arg(long, num_args = 3, value_delimiter = ',', default_values_t = [0.1, 0.5, 0.05])]
    pi0_lambda: Vec<f64>,

    /// Minimum peptides required for successful alignment (default: 5)
    #[arg(long, value_name = "N")]
    min_peptides: Option<usize>,

    /// Minimum entities for FDR estimation at any level (default: 20)
    #[arg(long, value_name = "N")]
    min_fdr_entities: Option<usize>,

    /// Use only proteotypic, unique, non-shared peptides
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    proteotypic: bool,

    /// Generate consensus instead of best-replicate spectra
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    consensus: bool,

    /// Do not reassess or filter by FDR; trust upstream decisions
    #[arg(long)]
    nofdr: bool,

    /// Output JSON generation summary
    #[arg(long, value_name = "FILE", default_value = "pqpgen_library_summary.json")]
    summary: PathBuf,
}

pub fn run(args: LibraryArgs) -> Result<()> {
    let file_config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let tuning = &file_config.library;

    let pi0_lambda = Pi0Lambda::from_triple(
        args.pi0_lambda[0],
        args.pi0_lambda[1],
        args.pi0_lambda[2],
    )?;
    let rt_fraction = SmoothingFraction::from_cli(
        args.rt_lowess_fraction
            .or(tuning.rt_lowess_fraction)
            .unwrap_or(0.05),
    )?;
    let im_fraction = SmoothingFraction::from_cli(
        args.im_lowess_fraction
            .or(tuning.im_lowess_fraction)
            .unwrap_or(0.05),
    )?;

    let config = LibraryConfig {
        infiles: args.infiles,
        outfile: args.out,
        rt: AxisOptions {
            calibrate: args.rt_calibration,
            reference: args.rt_reference,
            reference_run_path: args.rt_reference_run_path,
            filter: args.rt_filter,
            lowess_fraction: rt_fraction,
            alignment_fdr_threshold: args
                .rt_psm_fdr_threshold
                .or(tuning.rt_psm_fdr_threshold)
                .unwrap_or(0.001),
        },
        im: AxisOptions {
            calibrate: args.im_calibration,
            reference: args.im_reference,
            reference_run_path: args.im_reference_run_path,
            filter: args.im_filter,
            lowess_fraction: im_fraction,
            alignment_fdr_threshold: args
                .im_psm_fdr_threshold
                .or(tuning.im_psm_fdr_threshold)
                .unwrap_or(0.001),
        },
        psm_fdr_threshold: args
            .psm_fdr_threshold
            .or(tuning.psm_fdr_threshold)
            .unwrap_or(0.01),
        peptide_fdr_threshold: args
            .peptide_fdr_threshold
            .or(tuning.peptide_fdr_threshold)
            .unwrap_or(0.01),
        protein_fdr_threshold: args
            .protein_fdr_threshold
            .or(tuning.protein_fdr_threshold)
            .unwrap_or(0.01),
        pi0_lambda,
        min_peptides: args.min_peptides.or(tuning.min_peptides).unwrap_or(5),
        min_fdr_entities: args
            .min_fdr_entities
            .or(tuning.min_fdr_entities)
            .unwrap_or(DEFAULT_MIN_FDR_ENTITIES),
        proteotypic: args.proteotypic,
        mode: if args.consensus {
            ConsensusMode::Consensus
        } else {
            ConsensusMode::BestReplicate
        },
        nofdr: args.nofdr,
        summary_path: Some(args.summary),
    };

    let summary = generate(&config).context("library generation failed")?;

    info!("Library generation complete!");
    info!("  Runs: {} loaded, {} dropped", summary.runs_loaded, summary.runs_dropped.len());
    info!(
        "  PSMs: {} loaded, {} accepted",
        summary.psms_loaded, summary.psms_accepted
    );
    if let Some(reference) = &summary.rt_reference {
        info!("  RT reference: {}", reference);
    }
    if let Some(reference) = &summary.im_reference {
        info!("  IM reference: {}", reference);
    }
    info!(
        "  Entries: {} ({} fragment rows)",
        summary.entries, summary.rows_written
    );

    Ok(())
}
