//! The library generation pipeline.
//!
//! Orchestrates the batch-sequential stages: ingest all runs, assess FDR
//! globally, resolve the calibration reference per axis, fit and apply the
//! per-run axis mappings, merge across runs, filter at the protein level
//! and write the final assay library. Each stage fully consumes its input
//! before the next runs; per-run calibration failures drop that run with a
//! surfaced warning while the pipeline continues.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::Utc;
use log::{info, warn};
use serde::Serialize;

use crate::calibrate::{Axis, AxisCalibration, CalibrationError, SmoothingFraction};
use crate::consensus::{self, CalibratedPsm, CandidateEntry, ConsensusMode, FragmentPeak};
use crate::fdr::{FdrError, FdrEstimator, FdrLevel, Pi0Lambda, StoreyPi0};
use crate::ingest::{self, IngestError, RunTable};
use crate::reference::{self, AnchorTable, ReferenceError, ReferenceKind, ReferenceSelection};
use crate::writer::{self, WriterError};

/// Errors raised by the library pipeline.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    /// Mutually inconsistent options; raised before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Input table error.
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// FDR estimation error.
    #[error(transparent)]
    Fdr(#[from] FdrError),

    /// Calibration setup error.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// Reference resolution error.
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// Output error.
    #[error(transparent)]
    Writer(#[from] WriterError),

    /// Nothing survived the pipeline; no output is written.
    #[error("empty library: {0}")]
    Empty(String),
}

/// Per-axis calibration options.
#[derive(Debug, Clone)]
pub struct AxisOptions {
    /// Whether to calibrate this axis at all.
    pub calibrate: bool,
    /// Optional external reference coordinate file.
    pub reference: Option<PathBuf>,
    /// Where to persist the chosen reference coordinates.
    pub reference_run_path: PathBuf,
    /// Optional substring filter for candidate reference runs.
    pub filter: Option<String>,
    /// Lowess bandwidth selection.
    pub lowess_fraction: SmoothingFraction,
    /// Stricter PSM FDR threshold for alignment anchors.
    pub alignment_fdr_threshold: f64,
}

/// Full configuration of one `library` invocation.
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    /// Input PSM/peak tables.
    pub infiles: Vec<PathBuf>,
    /// Output assay library TSV.
    pub outfile: PathBuf,
    /// RT calibration options.
    pub rt: AxisOptions,
    /// IM calibration options.
    pub im: AxisOptions,
    /// PSM-level FDR threshold for library inclusion.
    pub psm_fdr_threshold: f64,
    /// Peptide-level FDR threshold.
    pub peptide_fdr_threshold: f64,
    /// Protein-level FDR threshold.
    pub protein_fdr_threshold: f64,
    /// pi0 lambda parameterization.
    pub pi0_lambda: Pi0Lambda,
    /// Minimum shared peptides for a successful calibration (also the
    /// reference-run quality gate).
    pub min_peptides: usize,
    /// Minimum entity count for FDR estimation at any level.
    pub min_fdr_entities: usize,
    /// Keep only peptides mapping to exactly one protein.
    pub proteotypic: bool,
    /// Replicate merge strategy.
    pub mode: ConsensusMode,
    /// Trust upstream FDR filtering and skip re-assessment.
    pub nofdr: bool,
    /// Optional JSON generation summary path.
    pub summary_path: Option<PathBuf>,
}

impl LibraryConfig {
    /// Fail fast on inconsistent options, before any I/O.
    pub fn validate(&self) -> Result<(), LibraryError> {
        if self.infiles.is_empty() {
            return Err(LibraryError::Configuration(
                "at least one input table is required".to_string(),
            ));
        }
        for (name, value) in [
            ("psm_fdr_threshold", self.psm_fdr_threshold),
            ("peptide_fdr_threshold", self.peptide_fdr_threshold),
            ("protein_fdr_threshold", self.protein_fdr_threshold),
            ("rt alignment threshold", self.rt.alignment_fdr_threshold),
            ("im alignment threshold", self.im.alignment_fdr_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(LibraryError::Configuration(format!(
                    "{name} must lie in (0, 1], got {value}"
                )));
            }
        }
        if self.min_peptides < 2 {
            return Err(LibraryError::Configuration(format!(
                "min_peptides must be at least 2, got {}",
                self.min_peptides
            )));
        }
        if self.min_fdr_entities == 0 {
            return Err(LibraryError::Configuration(
                "min_fdr_entities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Machine-readable outcome of one `library` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct LibrarySummary {
    /// RFC 3339 generation timestamp.
    pub generated_at: String,
    /// Runs loaded from the input tables.
    pub runs_loaded: usize,
    /// Runs dropped because calibration failed.
    pub runs_dropped: Vec<String>,
    /// Total PSM records loaded.
    pub psms_loaded: usize,
    /// PSMs surviving PSM- and peptide-level filtering.
    pub psms_accepted: usize,
    /// Estimated PSM-level null proportion (absent with `--nofdr`).
    pub psm_pi0: Option<f64>,
    /// RT reference provenance (run id or `external:<path>`).
    pub rt_reference: Option<String>,
    /// IM reference provenance.
    pub im_reference: Option<String>,
    /// Candidate entries after merging and filtering.
    pub entries: usize,
    /// Fragment rows written to the library TSV.
    pub rows_written: usize,
}

/// Per-entity FDR decisions carried between stages.
struct LevelDecisions {
    /// Keyed acceptance (peptide sequence or protein accession).
    accept: HashMap<String, bool>,
}

impl LevelDecisions {
    fn accepts(&self, key: &str) -> bool {
        self.accept.get(key).copied().unwrap_or(false)
    }
}

/// Run the full library generation pipeline.
pub fn generate(config: &LibraryConfig) -> Result<LibrarySummary, LibraryError> {
    config.validate()?;

    let runs = ingest::load_runs(&config.infiles)?;
    let psms_loaded: usize = runs.iter().map(|r| r.psms.len()).sum();
    info!(
        "loaded {} runs with {} PSMs",
        runs.len(),
        psms_loaded
    );

    let estimator = FdrEstimator::new(config.pi0_lambda)
        .with_pi0(Box::new(StoreyPi0))
        .with_min_entities(config.min_fdr_entities);

    // Global PSM-level q-values; index-aligned with the flattened run
    // tables. The alignment thresholds reuse these q-values with their
    // own stricter cutoffs.
    let flat: Vec<(usize, usize)> = runs
        .iter()
        .enumerate()
        .flat_map(|(ri, run)| (0..run.psms.len()).map(move |pi| (ri, pi)))
        .collect();
    let peps: Vec<f64> = flat.iter().map(|&(ri, pi)| runs[ri].psms[pi].pep).collect();
    let decoys: Vec<bool> = flat
        .iter()
        .map(|&(ri, pi)| runs[ri].psms[pi].decoy)
        .collect();

    let (psm_accept, rt_anchor_accept, im_anchor_accept, psm_pi0) = if config.nofdr {
        info!("FDR re-assessment disabled; trusting upstream decisions");
        let accept: Vec<bool> = decoys.iter().map(|d| !d).collect();
        let rt_ok: Vec<bool> = flat
            .iter()
            .map(|&(ri, pi)| {
                !runs[ri].psms[pi].decoy
                    && runs[ri].psms[pi].pep <= config.rt.alignment_fdr_threshold
            })
            .collect();
        let im_ok: Vec<bool> = flat
            .iter()
            .map(|&(ri, pi)| {
                !runs[ri].psms[pi].decoy
                    && runs[ri].psms[pi].pep <= config.im.alignment_fdr_threshold
            })
            .collect();
        (accept, rt_ok, im_ok, None)
    } else {
        let assessment =
            estimator.assess(FdrLevel::Psm, config.psm_fdr_threshold, &peps, &decoys)?;
        info!(
            "PSM level: {} of {} accepted at q <= {} (pi0 = {:.3}, estimated FDP = {:.4})",
            assessment.passing,
            peps.len(),
            config.psm_fdr_threshold,
            assessment.pi0,
            assessment.global_fdp
        );
        let rt_ok: Vec<bool> = assessment
            .qvalues
            .iter()
            .zip(&decoys)
            .map(|(q, d)| !d && *q <= config.rt.alignment_fdr_threshold)
            .collect();
        let im_ok: Vec<bool> = assessment
            .qvalues
            .iter()
            .zip(&decoys)
            .map(|(q, d)| !d && *q <= config.im.alignment_fdr_threshold)
            .collect();
        (assessment.accept, rt_ok, im_ok, Some(assessment.pi0))
    };

    // Peptide-level decisions over the best PSM per peptide.
    let peptide_decisions = assess_grouped(
        &estimator,
        FdrLevel::Peptide,
        config.peptide_fdr_threshold,
        config.nofdr,
        runs.iter()
            .flat_map(|run| run.psms.iter())
            .map(|psm| (psm.modified_peptide.clone(), psm.pep, psm.decoy)),
    )?;

    // Protein-level decisions over the best PSM per protein.
    let protein_decisions = assess_grouped(
        &estimator,
        FdrLevel::Protein,
        config.protein_fdr_threshold,
        config.nofdr,
        runs.iter()
            .flat_map(|run| run.psms.iter())
            .map(|psm| (psm.protein_id.clone(), psm.pep, psm.decoy)),
    )?;

    // Anchor tables feed both reference selection and per-run fitting.
    let rt_anchors = build_anchor_tables(&runs, &flat, &rt_anchor_accept, Axis::RetentionTime);
    let im_anchors = build_anchor_tables(&runs, &flat, &im_anchor_accept, Axis::IonMobility);

    let rt_selection = resolve_reference(&config.rt, Axis::RetentionTime, &rt_anchors, config)?;
    let im_selection = resolve_reference(&config.im, Axis::IonMobility, &im_anchors, config)?;

    // Fit one mapping per run and enabled axis; a run that cannot be
    // calibrated on an enabled axis is excluded from the library.
    let mut rt_models: HashMap<String, AxisCalibration> = HashMap::new();
    let mut im_models: HashMap<String, AxisCalibration> = HashMap::new();
    let mut dropped: BTreeSet<String> = BTreeSet::new();

    for run in &runs {
        if let Some(selection) = rt_selection.as_ref().filter(|s| s.is_enabled()) {
            match fit_run(run, &rt_anchors, selection, config) {
                Ok(model) => {
                    rt_models.insert(run.run_id.clone(), model);
                }
                Err(CalibrationError::InsufficientData {
                    required, observed, ..
                }) => {
                    warn!(
                        "run {} dropped: {} RT anchors shared with the reference, {} required",
                        run.run_id, observed, required
                    );
                    dropped.insert(run.run_id.clone());
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(selection) = im_selection.as_ref().filter(|s| s.is_enabled()) {
            match fit_run(run, &im_anchors, selection, config) {
                Ok(model) => {
                    im_models.insert(run.run_id.clone(), model);
                }
                Err(CalibrationError::InsufficientData {
                    required, observed, ..
                }) => {
                    warn!(
                        "run {} dropped: {} IM anchors shared with the reference, {} required",
                        run.run_id, observed, required
                    );
                    dropped.insert(run.run_id.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Apply the mappings and collect the surviving calibrated PSMs, each
    // carrying its own scan's fragment evidence.
    let peak_lookup = build_peak_lookup(&runs);
    let mut calibrated: Vec<CalibratedPsm> = Vec::new();
    let mut psms_accepted = 0usize;
    for (flat_idx, &(ri, pi)) in flat.iter().enumerate() {
        let run = &runs[ri];
        if dropped.contains(&run.run_id) {
            continue;
        }
        let psm = &run.psms[pi];
        if !psm_accept[flat_idx] || !peptide_decisions.accepts(&psm.modified_peptide) {
            continue;
        }
        psms_accepted += 1;

        let retention_time = match rt_models.get(&run.run_id) {
            Some(model) => model.predict(psm.retention_time),
            None => psm.retention_time,
        };
        let ion_mobility = psm.ion_mobility.map(|im| match im_models.get(&run.run_id) {
            Some(model) => model.predict(im),
            None => im,
        });
        let peaks = peak_lookup
            .get(&(
                run.run_id.as_str(),
                psm.scan_id,
                psm.modified_peptide.as_str(),
                psm.precursor_charge,
            ))
            .cloned()
            .unwrap_or_default();

        calibrated.push(CalibratedPsm {
            run_id: run.run_id.clone(),
            modified_peptide: psm.modified_peptide.clone(),
            precursor_charge: psm.precursor_charge,
            precursor_mz: psm.precursor_mz,
            retention_time,
            ion_mobility,
            protein_id: psm.protein_id.clone(),
            pep: psm.pep,
            peaks,
        });
    }

    if calibrated.is_empty() {
        return Err(LibraryError::Empty(
            "no PSMs survived FDR filtering and calibration".to_string(),
        ));
    }

    let mut entries = consensus::build_entries(config.mode, calibrated);
    info!("merged into {} candidate entries", entries.len());

    // Protein-level FDR: keep only passing proteins inside each entry.
    entries.retain_mut(|entry| {
        entry.proteins = entry
            .proteins
            .iter()
            .filter(|p| protein_decisions.accepts(p))
            .cloned()
            .collect();
        !entry.proteins.is_empty()
    });

    if config.proteotypic {
        let before = entries.len();
        apply_proteotypic_filter(&mut entries);
        info!(
            "proteotypic filter: {} of {} entries retained",
            entries.len(),
            before
        );
    }

    if entries.is_empty() {
        return Err(LibraryError::Empty(
            "no entries survived protein-level filtering".to_string(),
        ));
    }

    let rows_written = writer::write_library(&config.outfile, &entries)?;
    info!(
        "library written to {} ({} entries, {} rows)",
        config.outfile.display(),
        entries.len(),
        rows_written
    );

    let summary = LibrarySummary {
        generated_at: Utc::now().to_rfc3339(),
        runs_loaded: runs.len(),
        runs_dropped: dropped.into_iter().collect(),
        psms_loaded,
        psms_accepted,
        psm_pi0,
        rt_reference: rt_selection.as_ref().and_then(describe_reference),
        im_reference: im_selection.as_ref().and_then(describe_reference),
        entries: entries.len(),
        rows_written,
    };
    if let Some(path) = &config.summary_path {
        writer::write_json(path, &summary)?;
    }
    Ok(summary)
}

/// Group entities by key, keep the best PEP per key, and assess the level.
fn assess_grouped(
    estimator: &FdrEstimator,
    level: FdrLevel,
    threshold: f64,
    nofdr: bool,
    entities: impl Iterator<Item = (String, f64, bool)>,
) -> Result<LevelDecisions, LibraryError> {
    let mut best: BTreeMap<String, (f64, bool)> = BTreeMap::new();
    for (key, pep, decoy) in entities {
        let slot = best.entry(key).or_insert((f64::INFINITY, decoy));
        if pep < slot.0 {
            *slot = (pep, decoy);
        }
    }

    if nofdr {
        let accept = best
            .into_iter()
            .map(|(key, (_, decoy))| (key, !decoy))
            .collect();
        return Ok(LevelDecisions { accept });
    }

    let keys: Vec<&String> = best.keys().collect();
    let peps: Vec<f64> = best.values().map(|(pep, _)| *pep).collect();
    let decoys: Vec<bool> = best.values().map(|(_, decoy)| *decoy).collect();
    let assessment = estimator.assess(level, threshold, &peps, &decoys)?;
    info!(
        "{} level: {} of {} accepted at q <= {} (pi0 = {:.3})",
        level,
        assessment.passing,
        keys.len(),
        threshold,
        assessment.pi0
    );

    let accept = keys
        .into_iter()
        .cloned()
        .zip(assessment.accept)
        .collect();
    Ok(LevelDecisions { accept })
}

/// Per-run anchor table: the best-scoring axis value of every peptide
/// whose PSM passes the alignment threshold.
fn build_anchor_tables(
    runs: &[RunTable],
    flat: &[(usize, usize)],
    accept: &[bool],
    axis: Axis,
) -> Vec<AnchorTable> {
    let mut best: Vec<BTreeMap<String, (f64, f64)>> = vec![BTreeMap::new(); runs.len()];
    for (flat_idx, &(ri, pi)) in flat.iter().enumerate() {
        if !accept[flat_idx] {
            continue;
        }
        let psm = &runs[ri].psms[pi];
        let value = match axis {
            Axis::RetentionTime => Some(psm.retention_time),
            Axis::IonMobility => psm.ion_mobility,
        };
        let Some(value) = value else { continue };
        let slot = best[ri]
            .entry(psm.modified_peptide.clone())
            .or_insert((f64::INFINITY, value));
        if psm.pep < slot.0 {
            *slot = (psm.pep, value);
        }
    }

    runs.iter()
        .zip(best)
        .map(|(run, coords)| AnchorTable {
            run_id: run.run_id.clone(),
            coords: coords.into_iter().map(|(k, (_, v))| (k, v)).collect(),
        })
        .collect()
}

/// Resolve the reference for one axis and persist its coordinates when
/// calibration is attempted. Returns `None` when the axis is switched off
/// in the configuration.
fn resolve_reference(
    options: &AxisOptions,
    axis: Axis,
    anchors: &[AnchorTable],
    config: &LibraryConfig,
) -> Result<Option<ReferenceSelection>, LibraryError> {
    if !options.calibrate {
        info!("{axis} calibration switched off");
        return Ok(None);
    }
    let selection = reference::select_reference(
        axis,
        anchors,
        options.reference.as_deref(),
        options.filter.as_deref(),
        config.min_peptides,
    )?;
    if selection.is_enabled() {
        writer::write_reference_coordinates(
            &options.reference_run_path,
            axis,
            &selection.coords,
        )?;
        info!(
            "{} reference coordinates written to {}",
            axis,
            options.reference_run_path.display()
        );
    }
    Ok(Some(selection))
}

/// Fit one run's mapping against the reference coordinates.
fn fit_run(
    run: &RunTable,
    anchors: &[AnchorTable],
    selection: &ReferenceSelection,
    config: &LibraryConfig,
) -> Result<AxisCalibration, CalibrationError> {
    let empty = BTreeMap::new();
    let coords = anchors
        .iter()
        .find(|a| a.run_id == run.run_id)
        .map(|a| &a.coords)
        .unwrap_or(&empty);

    let pairs: Vec<(f64, f64)> = coords
        .iter()
        .filter_map(|(peptide, native)| {
            selection
                .coords
                .get(peptide)
                .map(|reference| (*native, *reference))
        })
        .collect();

    let fraction = match selection.axis {
        Axis::RetentionTime => config.rt.lowess_fraction,
        Axis::IonMobility => config.im.lowess_fraction,
    };
    AxisCalibration::fit(
        &run.run_id,
        selection.axis,
        &pairs,
        fraction,
        config.min_peptides,
    )
}

/// Fragment evidence keyed by (run, scan, peptide, charge).
type PeakLookup<'a> = HashMap<(&'a str, i64, &'a str, i32), Vec<FragmentPeak>>;

fn build_peak_lookup(runs: &[RunTable]) -> PeakLookup<'_> {
    let mut lookup: PeakLookup<'_> = HashMap::new();
    for run in runs {
        for peak in &run.peaks {
            lookup
                .entry((
                    run.run_id.as_str(),
                    peak.scan_id,
                    peak.modified_peptide.as_str(),
                    peak.precursor_charge,
                ))
                .or_default()
                .push(FragmentPeak {
                    fragment_type: peak.fragment_type.clone(),
                    fragment_ordinal: peak.fragment_ordinal,
                    fragment_charge: peak.fragment_charge,
                    neutral_loss: peak.neutral_loss,
                    product_mz: peak.product_mz,
                    intensity: peak.intensity,
                });
        }
    }
    lookup
}

/// Drop entries whose peptide sequence maps to more than one protein in
/// the combined set.
fn apply_proteotypic_filter(entries: &mut Vec<CandidateEntry>) {
    let mut sequence_proteins: HashMap<String, BTreeSet<String>> = HashMap::new();
    for entry in entries.iter() {
        sequence_proteins
            .entry(writer::strip_modifications(&entry.modified_peptide))
            .or_default()
            .extend(entry.proteins.iter().cloned());
    }
    entries.retain(|entry| {
        let sequence = writer::strip_modifications(&entry.modified_peptide);
        sequence_proteins
            .get(&sequence)
            .map_or(false, |proteins| proteins.len() == 1)
    });
}

fn describe_reference(selection: &ReferenceSelection) -> Option<String> {
    match &selection.kind {
        ReferenceKind::Run(run_id) => Some(run_id.clone()),
        ReferenceKind::External(path) => Some(format!("external:{}", path.display())),
        ReferenceKind::Disabled => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::CandidateEntry;
    use std::collections::BTreeSet;

    fn entry(peptide: &str, proteins: &[&str]) -> CandidateEntry {
        CandidateEntry {
            modified_peptide: peptide.to_string(),
            precursor_charge: 2,
            precursor_mz: 500.0,
            retention_time: 10.0,
            ion_mobility: None,
            pep: 0.01,
            proteins: proteins.iter().map(|p| p.to_string()).collect(),
            runs: 1,
            peaks: Vec::new(),
        }
    }

    #[test]
    fn test_proteotypic_filter_drops_shared_sequences() {
        // The same stripped sequence maps to P1 via one entry and P2 via
        // a modified variant; both must go.
        let mut entries = vec![
            entry("PEPTIDE", &["P1"]),
            entry("PEPT(UniMod:21)IDE", &["P2"]),
            entry("UNIQUEPEP", &["P3"]),
        ];
        apply_proteotypic_filter(&mut entries);
        let peptides: BTreeSet<String> =
            entries.iter().map(|e| e.modified_peptide.clone()).collect();
        assert_eq!(peptides, BTreeSet::from(["UNIQUEPEP".to_string()]));
    }

    #[test]
    fn test_proteotypic_filter_drops_multi_protein_entries() {
        let mut entries = vec![entry("PEPTIDE", &["P1", "P2"])];
        apply_proteotypic_filter(&mut entries);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_config_validation_rejects_bad_thresholds() {
        let config = test_config();
        assert!(config.validate().is_ok());

        let mut bad = test_config();
        bad.psm_fdr_threshold = 0.0;
        assert!(matches!(
            bad.validate(),
            Err(LibraryError::Configuration(_))
        ));

        let mut bad = test_config();
        bad.infiles.clear();
        assert!(bad.validate().is_err());

        let mut bad = test_config();
        bad.min_peptides = 1;
        assert!(bad.validate().is_err());
    }

    fn test_config() -> LibraryConfig {
        LibraryConfig {
            infiles: vec![PathBuf::from("run.psms.tsv")],
            outfile: PathBuf::from("library.tsv"),
            rt: AxisOptions {
                calibrate: true,
                reference: None,
                reference_run_path: PathBuf::from("rt_reference_run.tsv"),
                filter: None,
                lowess_fraction: SmoothingFraction::Fixed(0.05),
                alignment_fdr_threshold: 0.001,
            },
            im: AxisOptions {
                calibrate: false,
                reference: None,
                reference_run_path: PathBuf::from("im_reference_run.tsv"),
                filter: None,
                lowess_fraction: SmoothingFraction::Fixed(0.05),
                alignment_fdr_threshold: 0.001,
            },
            psm_fdr_threshold: 0.01,
            peptide_fdr_threshold: 0.01,
            protein_fdr_threshold: 0.01,
            pi0_lambda: Pi0Lambda::Fixed(1.0),
            min_peptides: 5,
            min_fdr_entities: crate::fdr::DEFAULT_MIN_FDR_ENTITIES,
            proteotypic: true,
            mode: ConsensusMode::Consensus,
            nofdr: false,
            summary_path: None,
        }
    }
}
