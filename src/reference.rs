//! Selection of the calibration reference for each axis.
//!
//! The reference is either an externally supplied coordinate file (used
//! unmodified) or the run with the most FDR-surviving peptide anchors
//! among the candidates, subject to a minimum-peptide quality gate. When
//! no candidate clears the gate, calibration for that axis is disabled for
//! the whole invocation and the pipeline proceeds uncalibrated on it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::calibrate::Axis;

/// Errors raised while resolving the calibration reference.
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    /// I/O error while reading an external reference file.
    #[error("failed to read reference file {path}: {source}")]
    Io {
        /// Offending file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Malformed reference file content.
    #[error("failed to parse reference file {path}: {source}")]
    Csv {
        /// Offending file.
        path: PathBuf,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// Reference file lacks a required column.
    #[error("reference file {path} is missing column {column}")]
    MissingColumn {
        /// Offending file.
        path: PathBuf,
        /// Expected column name.
        column: String,
    },

    /// Reference file contains a non-numeric coordinate.
    #[error("reference file {path} contains non-numeric coordinate {value:?}")]
    InvalidValue {
        /// Offending file.
        path: PathBuf,
        /// Offending cell content.
        value: String,
    },

    /// Reference file contains no coordinates.
    #[error("reference file {0} contains no coordinates")]
    EmptyReference(PathBuf),
}

/// Per-run anchor coordinates for one axis: the best-scoring axis value of
/// every peptide passing the alignment FDR threshold.
#[derive(Debug, Clone)]
pub struct AnchorTable {
    /// Run identifier.
    pub run_id: String,
    /// Peptide (with modifications) to native axis value.
    pub coords: BTreeMap<String, f64>,
}

/// Where the reference coordinates came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceKind {
    /// External coordinate file, used unmodified.
    External(PathBuf),
    /// Selected acquisition run.
    Run(String),
    /// No candidate met the quality gate; the axis stays uncalibrated.
    Disabled,
}

/// Resolved calibration reference for one axis.
#[derive(Debug, Clone)]
pub struct ReferenceSelection {
    /// Axis this reference anchors.
    pub axis: Axis,
    /// Provenance of the coordinates.
    pub kind: ReferenceKind,
    /// Peptide (with modifications) to reference axis value.
    pub coords: BTreeMap<String, f64>,
}

impl ReferenceSelection {
    /// Whether calibration can proceed on this axis.
    pub fn is_enabled(&self) -> bool {
        self.kind != ReferenceKind::Disabled
    }
}

/// Resolve the calibration reference for `axis`.
///
/// An explicit `external` file always wins. Otherwise candidates are
/// restricted to runs whose identifier contains `filter` (when given) and
/// the run with the most surviving anchor peptides is chosen; ties prefer
/// the lexicographically smallest run identifier so selection is
/// deterministic. A best candidate below `min_peptides` disables the axis
/// with a surfaced warning.
pub fn select_reference(
    axis: Axis,
    candidates: &[AnchorTable],
    external: Option<&Path>,
    filter: Option<&str>,
    min_peptides: usize,
) -> Result<ReferenceSelection, ReferenceError> {
    if let Some(path) = external {
        let coords = read_reference_file(path, axis)?;
        info!(
            "{} reference: external file {} ({} coordinates)",
            axis,
            path.display(),
            coords.len()
        );
        return Ok(ReferenceSelection {
            axis,
            kind: ReferenceKind::External(path.to_path_buf()),
            coords,
        });
    }

    let eligible = candidates
        .iter()
        .filter(|c| filter.map_or(true, |tag| c.run_id.contains(tag)));

    let mut best: Option<&AnchorTable> = None;
    for candidate in eligible {
        let better = match best {
            None => true,
            Some(current) => {
                candidate.coords.len() > current.coords.len()
                    || (candidate.coords.len() == current.coords.len()
                        && candidate.run_id < current.run_id)
            }
        };
        if better {
            best = Some(candidate);
        }
    }

    match best {
        Some(run) if run.coords.len() >= min_peptides => {
            info!(
                "{} reference: run {} ({} anchor peptides)",
                axis,
                run.run_id,
                run.coords.len()
            );
            Ok(ReferenceSelection {
                axis,
                kind: ReferenceKind::Run(run.run_id.clone()),
                coords: run.coords.clone(),
            })
        }
        Some(run) => {
            warn!(
                "{} calibration disabled: best candidate {} has {} anchor peptides, {} required",
                axis,
                run.run_id,
                run.coords.len(),
                min_peptides
            );
            Ok(disabled(axis))
        }
        None => {
            warn!(
                "{} calibration disabled: no candidate run{}",
                axis,
                filter
                    .map(|tag| format!(" matches filter tag {tag:?}"))
                    .unwrap_or_else(|| " available".to_string())
            );
            Ok(disabled(axis))
        }
    }
}

fn disabled(axis: Axis) -> ReferenceSelection {
    ReferenceSelection {
        axis,
        kind: ReferenceKind::Disabled,
        coords: BTreeMap::new(),
    }
}

/// Read an external reference coordinate file: a TSV with a
/// `modified_peptide` column and one column named after the axis.
pub fn read_reference_file(path: &Path, axis: Axis) -> Result<BTreeMap<String, f64>, ReferenceError> {
    let file = std::fs::File::open(path).map_err(|source| ReferenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_reader(std::io::BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|source| ReferenceError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let peptide_col = headers
        .iter()
        .position(|h| h == "modified_peptide")
        .ok_or_else(|| ReferenceError::MissingColumn {
            path: path.to_path_buf(),
            column: "modified_peptide".to_string(),
        })?;
    let value_col = headers
        .iter()
        .position(|h| h == axis.column_name())
        .ok_or_else(|| ReferenceError::MissingColumn {
            path: path.to_path_buf(),
            column: axis.column_name().to_string(),
        })?;

    let mut coords = BTreeMap::new();
    for record in reader.records() {
        let record = record.map_err(|source| ReferenceError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let peptide = record.get(peptide_col).unwrap_or_default();
        let raw = record.get(value_col).unwrap_or_default();
        let value: f64 = raw.parse().map_err(|_| ReferenceError::InvalidValue {
            path: path.to_path_buf(),
            value: raw.to_string(),
        })?;
        coords.insert(peptide.to_string(), value);
    }

    if coords.is_empty() {
        return Err(ReferenceError::EmptyReference(path.to_path_buf()));
    }
    Ok(coords)
}
