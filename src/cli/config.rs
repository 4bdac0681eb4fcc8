//! TOML configuration file support for power users.
//!
//! Instead of passing many CLI flags, users can specify tuning settings in
//! a config file:
//!
//! ```toml
//! # pqpgen.toml
//! [library]
//! psm_fdr_threshold = 0.01
//! peptide_fdr_threshold = 0.01
//! protein_fdr_threshold = 0.01
//! rt_lowess_fraction = 0.0
//! min_peptides = 10
//! ```
//!
//! Explicit CLI flags win over config-file values, which win over the
//! built-in defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure for pqpgen.toml files.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Library-generation tuning settings.
    #[serde(default)]
    pub library: LibraryTuning,
}

/// Tuning settings for the library command.
#[derive(Debug, Default, Deserialize)]
pub struct LibraryTuning {
    /// PSM FDR threshold for library inclusion.
    pub psm_fdr_threshold: Option<f64>,

    /// Peptide-level FDR threshold.
    pub peptide_fdr_threshold: Option<f64>,

    /// Protein-level FDR threshold.
    pub protein_fdr_threshold: Option<f64>,

    /// PSM FDR threshold used for RT alignment anchors.
    pub rt_psm_fdr_threshold: Option<f64>,

    /// PSM FDR threshold used for IM alignment anchors.
    pub im_psm_fdr_threshold: Option<f64>,

    /// Lowess fraction for RT calibration (0 = cross-validation).
    pub rt_lowess_fraction: Option<f64>,

    /// Lowess fraction for IM calibration (0 = cross-validation).
    pub im_lowess_fraction: Option<f64>,

    /// Minimum peptides required for successful alignment.
    pub min_peptides: Option<usize>,

    /// Minimum entity count for FDR estimation at any level.
    pub min_fdr_entities: Option<usize>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }
}
