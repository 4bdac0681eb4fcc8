//! Per-run PSM and peak table ingestion.
//!
//! The conversion front-end (out of scope here) emits one `<run>.psms.tsv`
//! and one `<run>.peaks.tsv` per acquisition run. This module pairs those
//! files by basename, parses them, and enforces the ingestion contract
//! before any record enters the pipeline.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Suffix identifying a PSM table.
pub const PSM_SUFFIX: &str = ".psms.tsv";
/// Suffix identifying a peak table.
pub const PEAK_SUFFIX: &str = ".peaks.tsv";

/// Errors returned when input tables cannot be read or violate the
/// ingestion contract.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// I/O error while opening an input table.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Malformed TSV content.
    #[error("failed to parse {path}: {source}")]
    Csv {
        /// Offending file.
        path: PathBuf,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Input file is neither a PSM nor a peak table.
    #[error("unrecognized input file (expected *{PSM_SUFFIX} or *{PEAK_SUFFIX}): {0}")]
    UnrecognizedInput(PathBuf),

    /// A peak table was supplied without its PSM table.
    #[error("peak table without a matching PSM table: {0}")]
    UnpairedPeakTable(PathBuf),

    /// A PSM table contained no records.
    #[error("run {0} contains no PSM records")]
    EmptyRun(String),

    /// Contract violation with a human-readable message.
    #[error("ingest contract violation: {0}")]
    ContractViolation(String),
}

impl IngestError {
    fn violation(message: impl Into<String>) -> Self {
        Self::ContractViolation(message.into())
    }
}

/// One peptide-spectrum match as emitted by the conversion front-end.
///
/// Records are immutable once loaded; calibration produces derived records
/// instead of rewriting these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsmRecord {
    /// Acquisition run identifier.
    pub run_id: String,
    /// Spectrum key within the run.
    pub scan_id: i64,
    /// Peptide sequence with modifications, e.g. `PEPT(UniMod:21)IDE`.
    pub modified_peptide: String,
    /// Precursor charge state.
    pub precursor_charge: i32,
    /// Precursor m/z.
    pub precursor_mz: f64,
    /// Native retention time in seconds.
    pub retention_time: f64,
    /// Native ion mobility, when acquired.
    #[serde(default)]
    pub ion_mobility: Option<f64>,
    /// Protein accession this PSM maps to.
    pub protein_id: String,
    /// Decoy flag from the search engine.
    pub decoy: bool,
    /// Posterior error probability of the identification.
    pub pep: f64,
}

/// One annotated fragment-ion peak, keyed to its PSM by scan, peptide and
/// charge within the owning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakRecord {
    /// Spectrum key within the run.
    pub scan_id: i64,
    /// Peptide sequence with modifications.
    pub modified_peptide: String,
    /// Precursor charge state.
    pub precursor_charge: i32,
    /// Fragment ion series (b, y, ...).
    pub fragment_type: String,
    /// Position within the fragment series.
    pub fragment_ordinal: u32,
    /// Fragment charge state.
    pub fragment_charge: i32,
    /// Whether the fragment carries a neutral loss.
    #[serde(default)]
    pub neutral_loss: bool,
    /// Fragment m/z.
    pub product_mz: f64,
    /// Fragment intensity.
    pub intensity: f64,
}

/// One run's PSM and peak tables.
#[derive(Debug, Clone)]
pub struct RunTable {
    /// Run identifier (shared by every record in the table).
    pub run_id: String,
    /// PSM records, in file order.
    pub psms: Vec<PsmRecord>,
    /// Peak records, in file order.
    pub peaks: Vec<PeakRecord>,
}

impl RunTable {
    /// Validate the ingestion contract for this run.
    ///
    /// Invariants:
    /// - every PSM carries this run's identifier, a finite RT, a PEP in
    ///   [0, 1] and a positive charge;
    /// - every peak references a PSM present in the table;
    /// - intensities are finite and non-negative.
    pub fn validate_contract(&self) -> Result<(), IngestError> {
        if self.psms.is_empty() {
            return Err(IngestError::EmptyRun(self.run_id.clone()));
        }

        let mut keys: HashSet<(i64, &str, i32)> = HashSet::with_capacity(self.psms.len());
        for psm in &self.psms {
            if psm.run_id != self.run_id {
                return Err(IngestError::violation(format!(
                    "run {}: PSM carries foreign run_id {}",
                    self.run_id, psm.run_id
                )));
            }
            if !psm.retention_time.is_finite() {
                return Err(IngestError::violation(format!(
                    "run {}: scan {} has non-finite retention time",
                    self.run_id, psm.scan_id
                )));
            }
            if let Some(im) = psm.ion_mobility {
                if !im.is_finite() {
                    return Err(IngestError::violation(format!(
                        "run {}: scan {} has non-finite ion mobility",
                        self.run_id, psm.scan_id
                    )));
                }
            }
            if !(0.0..=1.0).contains(&psm.pep) {
                return Err(IngestError::violation(format!(
                    "run {}: scan {} has PEP {} outside [0, 1]",
                    self.run_id, psm.scan_id, psm.pep
                )));
            }
            if psm.precursor_charge < 1 {
                return Err(IngestError::violation(format!(
                    "run {}: scan {} has non-positive charge {}",
                    self.run_id, psm.scan_id, psm.precursor_charge
                )));
            }
            keys.insert((psm.scan_id, psm.modified_peptide.as_str(), psm.precursor_charge));
        }

        for peak in &self.peaks {
            let key = (peak.scan_id, peak.modified_peptide.as_str(), peak.precursor_charge);
            if !keys.contains(&key) {
                return Err(IngestError::violation(format!(
                    "run {}: peak references unknown PSM (scan {}, {} +{})",
                    self.run_id, peak.scan_id, peak.modified_peptide, peak.precursor_charge
                )));
            }
            if !peak.intensity.is_finite() || peak.intensity < 0.0 {
                return Err(IngestError::violation(format!(
                    "run {}: peak for scan {} has invalid intensity {}",
                    self.run_id, peak.scan_id, peak.intensity
                )));
            }
        }

        Ok(())
    }

    /// Number of distinct target (non-decoy) peptides in this run.
    pub fn target_peptide_count(&self) -> usize {
        self.psms
            .iter()
            .filter(|p| !p.decoy)
            .map(|p| p.modified_peptide.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Load and validate all run tables from a mixed list of PSM/peak files.
///
/// Files are paired by basename: `runA.psms.tsv` + `runA.peaks.tsv` form one
/// run. A missing peak table yields a run without fragment evidence; a peak
/// table without its PSM table is an error. Runs are returned sorted by
/// run identifier so downstream stages are deterministic.
pub fn load_runs(infiles: &[PathBuf]) -> Result<Vec<RunTable>, IngestError> {
    let mut psm_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut peak_paths: BTreeMap<String, PathBuf> = BTreeMap::new();

    for path in infiles {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(stem) = name.strip_suffix(PSM_SUFFIX) {
            psm_paths.insert(stem.to_string(), path.clone());
        } else if let Some(stem) = name.strip_suffix(PEAK_SUFFIX) {
            peak_paths.insert(stem.to_string(), path.clone());
        } else {
            return Err(IngestError::UnrecognizedInput(path.clone()));
        }
    }

    for (stem, path) in &peak_paths {
        if !psm_paths.contains_key(stem) {
            return Err(IngestError::UnpairedPeakTable(path.clone()));
        }
    }

    let mut runs = Vec::with_capacity(psm_paths.len());
    for (stem, psm_path) in &psm_paths {
        let psms: Vec<PsmRecord> = read_table(psm_path)?;
        let peaks: Vec<PeakRecord> = match peak_paths.get(stem) {
            Some(path) => read_table(path)?,
            None => Vec::new(),
        };

        let run_id = psms
            .first()
            .map(|p| p.run_id.clone())
            .unwrap_or_else(|| stem.clone());
        let run = RunTable { run_id, psms, peaks };
        run.validate_contract()?;
        runs.push(run);
    }

    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    Ok(runs)
}

fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, IngestError> {
    let file = std::fs::File::open(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_reader(std::io::BufReader::new(file));

    let mut records = Vec::new();
    for record in reader.deserialize() {
        let record: T = record.map_err(|source| IngestError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn psm(run: &str, scan: i64, peptide: &str, rt: f64, pep: f64, decoy: bool) -> PsmRecord {
        PsmRecord {
            run_id: run.to_string(),
            scan_id: scan,
            modified_peptide: peptide.to_string(),
            precursor_charge: 2,
            precursor_mz: 500.0,
            retention_time: rt,
            ion_mobility: None,
            protein_id: "P1".to_string(),
            decoy,
            pep,
        }
    }

    #[test]
    fn test_contract_accepts_valid_run() {
        let run = RunTable {
            run_id: "run1".to_string(),
            psms: vec![psm("run1", 1, "PEPTIDE", 10.0, 0.01, false)],
            peaks: vec![PeakRecord {
                scan_id: 1,
                modified_peptide: "PEPTIDE".to_string(),
                precursor_charge: 2,
                fragment_type: "y".to_string(),
                fragment_ordinal: 4,
                fragment_charge: 1,
                neutral_loss: false,
                product_mz: 480.0,
                intensity: 1000.0,
            }],
        };
        run.validate_contract().unwrap();
    }

    #[test]
    fn test_contract_rejects_orphan_peak() {
        let run = RunTable {
            run_id: "run1".to_string(),
            psms: vec![psm("run1", 1, "PEPTIDE", 10.0, 0.01, false)],
            peaks: vec![PeakRecord {
                scan_id: 99,
                modified_peptide: "PEPTIDE".to_string(),
                precursor_charge: 2,
                fragment_type: "y".to_string(),
                fragment_ordinal: 4,
                fragment_charge: 1,
                neutral_loss: false,
                product_mz: 480.0,
                intensity: 1000.0,
            }],
        };
        assert!(matches!(
            run.validate_contract(),
            Err(IngestError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_contract_rejects_non_finite_rt() {
        let run = RunTable {
            run_id: "run1".to_string(),
            psms: vec![psm("run1", 1, "PEPTIDE", f64::NAN, 0.01, false)],
            peaks: vec![],
        };
        assert!(run.validate_contract().is_err());
    }

    #[test]
    fn test_contract_rejects_empty_run() {
        let run = RunTable {
            run_id: "run1".to_string(),
            psms: vec![],
            peaks: vec![],
        };
        assert!(matches!(
            run.validate_contract(),
            Err(IngestError::EmptyRun(_))
        ));
    }

    #[test]
    fn test_target_peptide_count_ignores_decoys() {
        let run = RunTable {
            run_id: "run1".to_string(),
            psms: vec![
                psm("run1", 1, "PEPTIDE", 10.0, 0.01, false),
                psm("run1", 2, "PEPTIDE", 11.0, 0.02, false),
                psm("run1", 3, "EDITPEP", 12.0, 0.30, true),
            ],
            peaks: vec![],
        };
        assert_eq!(run.target_peptide_count(), 1);
    }

    #[test]
    fn test_load_runs_pairs_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let psm_path = dir.path().join("runA.psms.tsv");
        let mut f = std::fs::File::create(&psm_path).unwrap();
        writeln!(
            f,
            "run_id\tscan_id\tmodified_peptide\tprecursor_charge\tprecursor_mz\tretention_time\tion_mobility\tprotein_id\tdecoy\tpep"
        )
        .unwrap();
        writeln!(f, "runA\t1\tPEPTIDE\t2\t500.1\t12.5\t\tP1\tfalse\t0.001").unwrap();

        let peak_path = dir.path().join("runA.peaks.tsv");
        let mut f = std::fs::File::create(&peak_path).unwrap();
        writeln!(
            f,
            "scan_id\tmodified_peptide\tprecursor_charge\tfragment_type\tfragment_ordinal\tfragment_charge\tneutral_loss\tproduct_mz\tintensity"
        )
        .unwrap();
        writeln!(f, "1\tPEPTIDE\t2\ty\t4\t1\tfalse\t480.2\t1500.0").unwrap();

        let runs = load_runs(&[psm_path, peak_path]).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "runA");
        assert_eq!(runs[0].psms.len(), 1);
        assert_eq!(runs[0].peaks.len(), 1);
        assert_eq!(runs[0].psms[0].ion_mobility, None);
    }

    #[test]
    fn test_load_runs_rejects_unpaired_peaks() {
        let dir = tempfile::tempdir().unwrap();
        let peak_path = dir.path().join("runA.peaks.tsv");
        std::fs::write(&peak_path, "scan_id\n").unwrap();
        assert!(matches!(
            load_runs(&[peak_path]),
            Err(IngestError::UnpairedPeakTable(_))
        ));
    }

    #[test]
    fn test_load_runs_rejects_unknown_extension() {
        assert!(matches!(
            load_runs(&[PathBuf::from("something.csv")]),
            Err(IngestError::UnrecognizedInput(_))
        ));
    }
}
