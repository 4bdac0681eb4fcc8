//! # pqpgen - Consolidated PQP Library Generation
//!
//! `pqpgen` builds a consolidated peptide-spectral reference library from
//! multiple independent LC-MS/MS acquisition runs, each contributing
//! identified peptide-spectrum matches (PSMs) and fragment-ion peak
//! intensities, and reduces assembled PQP stores for targeted
//! re-acquisition workflows.
//!
//! ## Pipeline
//!
//! 1. **Ingest**: per-run PSM/peak TSV tables, paired by basename.
//! 2. **FDR control**: model-based q-values from posterior error
//!    probabilities at the PSM, peptide and protein levels, with an
//!    injectable pi0 estimation strategy.
//! 3. **Reference selection**: per axis (RT, IM), an explicit reference
//!    file or the run with the most FDR-surviving peptide anchors.
//! 4. **Calibration**: lowess regression mapping each run's native axis
//!    values onto the reference scale, with cross-validated bandwidth
//!    selection on request and flat extrapolation outside the fitted
//!    domain.
//! 5. **Consensus**: one entry per (peptide, charge), merged across runs
//!    or taken from the best replicate.
//! 6. **Assembly**: protein-level and proteotypic filtering, deterministic
//!    assay-library TSV output.
//! 7. **Reduction** (separate invocation): stratified RT sampling of an
//!    assembled PQP store with a referentially consistent deletion
//!    cascade.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pqpgen::reduce::{reduce, ReduceConfig};
//!
//! let config = ReduceConfig {
//!     input: "library.pqp".into(),
//!     output: Some("reduced.pqp".into()),
//!     in_place: false,
//!     bins: 10,
//!     peptides_per_bin: 5,
//! };
//! let summary = reduce(&config)?;
//! println!("kept {} anchors", summary.anchors);
//! # Ok::<(), pqpgen::reduce::ReduceError>(())
//! ```
//!
//! ## Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`ingest`]: input contract types and per-run table loading
//! - [`fdr`]: q-value computation and pi0 estimation
//! - [`reference`]: calibration reference selection
//! - [`calibrate`]: lowess axis calibration
//! - [`consensus`]: cross-run merging
//! - [`library`]: the end-to-end generation pipeline
//! - [`writer`]: deterministic TSV/JSON output with atomic staging
//! - [`reduce`]: PQP store reduction

// Documentation lints - enforce complete documentation for publication
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
// Allow some patterns common in scientific code
#![allow(clippy::too_many_arguments)]

pub mod calibrate;
pub mod consensus;
pub mod fdr;
pub mod ingest;
pub mod library;
pub mod reduce;
pub mod reference;
pub mod writer;

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::calibrate::{Axis, AxisCalibration, CalibrationError, SmoothingFraction};
    pub use crate::consensus::{
        CalibratedPsm, CandidateEntry, ConsensusMode, FragmentPeak,
    };
    pub use crate::fdr::{
        FdrAssessment, FdrError, FdrEstimator, FdrLevel, Pi0Estimator, Pi0Lambda, StoreyPi0,
    };
    pub use crate::ingest::{IngestError, PeakRecord, PsmRecord, RunTable};
    pub use crate::library::{
        generate, AxisOptions, LibraryConfig, LibraryError, LibrarySummary,
    };
    pub use crate::reduce::{reduce, ReduceConfig, ReduceError, ReduceSummary};
    pub use crate::reference::{
        AnchorTable, ReferenceError, ReferenceKind, ReferenceSelection,
    };
    pub use crate::writer::{LibraryRow, WriterError};
}
