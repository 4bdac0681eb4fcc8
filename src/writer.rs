//! Library and coordinate file output.
//!
//! All outputs are staged in a temporary file inside the destination
//! directory and persisted by rename, so a failure mid-write never leaves
//! a half-written file behind. The assay library is a long-format TSV
//! (one row per retained fragment) ordered by peptide, charge and
//! annotation; ordering is deterministic for identical inputs.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::calibrate::Axis;
use crate::consensus::CandidateEntry;

/// Errors raised while writing outputs.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    /// I/O error during staging.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TSV serialization error.
    #[error("TSV serialization error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to move the staged file into place.
    #[error("failed to persist output {path}: {message}")]
    Persist {
        /// Destination path.
        path: PathBuf,
        /// Underlying rename error.
        message: String,
    },

    /// Output path has no parent directory to stage in.
    #[error("output path has no parent directory: {0}")]
    NoParent(PathBuf),
}

/// One row of the assay library TSV.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LibraryRow {
    /// Precursor m/z.
    pub precursor_mz: f64,
    /// Fragment m/z.
    pub product_mz: f64,
    /// Fragment annotation, e.g. `y7^2`.
    pub annotation: String,
    /// Protein accessions, `;`-separated when the peptide is shared.
    pub protein_id: String,
    /// Unmodified peptide sequence.
    pub peptide_sequence: String,
    /// Peptide sequence with modifications.
    pub modified_peptide_sequence: String,
    /// Precursor charge state.
    pub precursor_charge: i32,
    /// Averaged or representative fragment intensity.
    pub library_intensity: f64,
    /// Calibrated retention time.
    pub normalized_retention_time: f64,
    /// Calibrated ion mobility, when available.
    pub precursor_ion_mobility: Option<f64>,
    /// Fragment ion series.
    pub fragment_type: String,
    /// Fragment charge state.
    pub fragment_charge: i32,
    /// Position within the fragment series.
    pub fragment_series_number: u32,
}

/// Strip modification annotations from a modified peptide sequence:
/// `PEPT(UniMod:21)IDE` and `PEPT[+80]IDE` both reduce to `PEPTIDE`.
pub fn strip_modifications(modified_peptide: &str) -> String {
    let mut stripped = String::with_capacity(modified_peptide.len());
    let mut depth = 0usize;
    for c in modified_peptide.chars() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c),
            _ => {}
        }
    }
    stripped
}

/// Write the assay library for `entries`, returning the number of rows.
///
/// Entries are expected in (peptide, charge) order as produced by the
/// consensus stage; entries without fragment evidence contribute no rows.
pub fn write_library(path: &Path, entries: &[CandidateEntry]) -> Result<usize, WriterError> {
    let mut rows = 0usize;
    stage(path, |file| {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
        for entry in entries {
            if entry.peaks.is_empty() {
                debug!(
                    "skipping {} +{}: no fragment evidence",
                    entry.modified_peptide, entry.precursor_charge
                );
                continue;
            }
            let protein_id = entry
                .proteins
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(";");
            for peak in &entry.peaks {
                writer.serialize(LibraryRow {
                    precursor_mz: entry.precursor_mz,
                    product_mz: peak.product_mz,
                    annotation: peak.annotation(),
                    protein_id: protein_id.clone(),
                    peptide_sequence: strip_modifications(&entry.modified_peptide),
                    modified_peptide_sequence: entry.modified_peptide.clone(),
                    precursor_charge: entry.precursor_charge,
                    library_intensity: peak.intensity,
                    normalized_retention_time: entry.retention_time,
                    precursor_ion_mobility: entry.ion_mobility,
                    fragment_type: peak.fragment_type.clone(),
                    fragment_charge: peak.fragment_charge,
                    fragment_series_number: peak.fragment_ordinal,
                })?;
                rows += 1;
            }
        }
        writer.flush()?;
        Ok(())
    })?;
    Ok(rows)
}

/// Persist reference-run coordinates for one axis as a two-column TSV.
pub fn write_reference_coordinates(
    path: &Path,
    axis: Axis,
    coords: &BTreeMap<String, f64>,
) -> Result<(), WriterError> {
    stage(path, |file| {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
        writer.write_record(["modified_peptide", axis.column_name()])?;
        for (peptide, value) in coords {
            writer.write_record([peptide.as_str(), value.to_string().as_str()])?;
        }
        writer.flush()?;
        Ok(())
    })
}

/// Write a JSON document (pretty-printed) through the staging path.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), WriterError> {
    stage(path, |file| {
        serde_json::to_writer_pretty(&mut *file, value)?;
        file.write_all(b"\n")?;
        Ok(())
    })
}

/// Run `fill` against a temp file in the destination directory, then move
/// it into place.
fn stage<F>(path: &Path, fill: F) -> Result<(), WriterError>
where
    F: FnOnce(&mut std::fs::File) -> Result<(), WriterError>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        Some(_) => PathBuf::from("."),
        None => return Err(WriterError::NoParent(path.to_path_buf())),
    };
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    fill(staged.as_file_mut())?;
    staged.flush()?;
    staged
        .persist(path)
        .map_err(|e| WriterError::Persist {
            path: path.to_path_buf(),
            message: e.error.to_string(),
        })?;
    Ok(())
}
