//! Cross-run merging of calibrated PSMs into one candidate library entry
//! per (peptide, charge).
//!
//! Within a run, the best-PEP replicate represents each precursor. Across
//! runs, consensus mode takes the median of the calibrated coordinates and
//! averages fragment intensities per annotation; best-replicate mode keeps
//! the single best-scoring run's record. Ties on PEP break by higher
//! summed fragment intensity, then by run identifier, so the output is
//! deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Merge strategy for replicate measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusMode {
    /// Average evidence across contributing runs.
    Consensus,
    /// Keep the single best-scoring replicate.
    BestReplicate,
}

/// One annotated fragment peak attached to a calibrated PSM.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentPeak {
    /// Fragment ion series (b, y, ...).
    pub fragment_type: String,
    /// Position within the series.
    pub fragment_ordinal: u32,
    /// Fragment charge state.
    pub fragment_charge: i32,
    /// Whether the fragment carries a neutral loss.
    pub neutral_loss: bool,
    /// Fragment m/z.
    pub product_mz: f64,
    /// Fragment intensity.
    pub intensity: f64,
}

impl FragmentPeak {
    /// Annotation string, e.g. `y7^2` or `b4-NL^1`.
    pub fn annotation(&self) -> String {
        let loss = if self.neutral_loss { "-NL" } else { "" };
        format!(
            "{}{}{}^{}",
            self.fragment_type, self.fragment_ordinal, loss, self.fragment_charge
        )
    }

    fn key(&self) -> (String, u32, i32, bool) {
        (
            self.fragment_type.clone(),
            self.fragment_ordinal,
            self.fragment_charge,
            self.neutral_loss,
        )
    }
}

/// A PSM rewritten onto the reference RT/IM scales, carrying its fragment
/// evidence. Derived from the immutable input records.
#[derive(Debug, Clone)]
pub struct CalibratedPsm {
    /// Contributing run.
    pub run_id: String,
    /// Peptide sequence with modifications.
    pub modified_peptide: String,
    /// Precursor charge state.
    pub precursor_charge: i32,
    /// Precursor m/z.
    pub precursor_mz: f64,
    /// Calibrated retention time.
    pub retention_time: f64,
    /// Calibrated ion mobility, when acquired.
    pub ion_mobility: Option<f64>,
    /// Protein accession.
    pub protein_id: String,
    /// Posterior error probability.
    pub pep: f64,
    /// Fragment evidence.
    pub peaks: Vec<FragmentPeak>,
}

impl CalibratedPsm {
    fn summed_intensity(&self) -> f64 {
        self.peaks.iter().map(|p| p.intensity).sum()
    }
}

/// One candidate library entry prior to proteotypic and protein-level
/// filtering.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    /// Peptide sequence with modifications.
    pub modified_peptide: String,
    /// Precursor charge state.
    pub precursor_charge: i32,
    /// Precursor m/z (median across contributing runs).
    pub precursor_mz: f64,
    /// Calibrated retention time summary.
    pub retention_time: f64,
    /// Calibrated ion mobility summary, when any contributor carries one.
    pub ion_mobility: Option<f64>,
    /// Best PEP among contributors.
    pub pep: f64,
    /// Proteins this peptide maps to across runs.
    pub proteins: BTreeSet<String>,
    /// Number of contributing runs.
    pub runs: usize,
    /// Merged fragment peaks, sorted by annotation key.
    pub peaks: Vec<FragmentPeak>,
}

/// Merge calibrated PSMs into candidate entries, one per
/// (peptide, charge), ordered by peptide then charge.
pub fn build_entries(mode: ConsensusMode, psms: Vec<CalibratedPsm>) -> Vec<CandidateEntry> {
    let mut groups: BTreeMap<(String, i32), Vec<CalibratedPsm>> = BTreeMap::new();
    for psm in psms {
        groups
            .entry((psm.modified_peptide.clone(), psm.precursor_charge))
            .or_default()
            .push(psm);
    }

    groups
        .into_values()
        .map(|group| {
            let representatives = run_representatives(group);
            match mode {
                ConsensusMode::Consensus => consensus_entry(representatives),
                ConsensusMode::BestReplicate => best_replicate_entry(representatives),
            }
        })
        .collect()
}

/// Reduce a group to one replicate per run: lowest PEP, ties broken by
/// higher summed fragment intensity.
fn run_representatives(group: Vec<CalibratedPsm>) -> Vec<CalibratedPsm> {
    let mut by_run: BTreeMap<String, CalibratedPsm> = BTreeMap::new();
    for psm in group {
        match by_run.entry(psm.run_id.clone()) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(psm);
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                if replaces(&psm, slot.get()) {
                    slot.insert(psm);
                }
            }
        }
    }
    by_run.into_values().collect()
}

fn replaces(candidate: &CalibratedPsm, current: &CalibratedPsm) -> bool {
    match candidate.pep.total_cmp(&current.pep) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => candidate.summed_intensity() > current.summed_intensity(),
    }
}

fn consensus_entry(representatives: Vec<CalibratedPsm>) -> CandidateEntry {
    let runs = representatives.len();
    // A fragment must be seen in at least half of the contributing runs
    // (rounded up) to enter the consensus.
    let min_occurrence = (runs + 1) / 2;

    let rt = median(representatives.iter().map(|p| p.retention_time));
    let ims: Vec<f64> = representatives.iter().filter_map(|p| p.ion_mobility).collect();
    let im = if ims.is_empty() {
        None
    } else {
        Some(median(ims.iter().copied()))
    };
    let mz = median(representatives.iter().map(|p| p.precursor_mz));
    let pep = representatives
        .iter()
        .map(|p| p.pep)
        .fold(f64::INFINITY, f64::min);
    let proteins: BTreeSet<String> = representatives
        .iter()
        .map(|p| p.protein_id.clone())
        .collect();

    let mut merged: BTreeMap<(String, u32, i32, bool), Vec<&FragmentPeak>> = BTreeMap::new();
    for psm in &representatives {
        // Count each annotation once per run even if reported twice.
        let mut seen: HashMap<(String, u32, i32, bool), &FragmentPeak> = HashMap::new();
        for peak in &psm.peaks {
            seen.entry(peak.key()).or_insert(peak);
        }
        for (key, peak) in seen {
            merged.entry(key).or_default().push(peak);
        }
    }

    let peaks = merged
        .into_iter()
        .filter(|(_, observations)| observations.len() >= min_occurrence)
        .map(|((fragment_type, ordinal, charge, loss), observations)| {
            let n = observations.len() as f64;
            FragmentPeak {
                fragment_type,
                fragment_ordinal: ordinal,
                fragment_charge: charge,
                neutral_loss: loss,
                product_mz: observations.iter().map(|p| p.product_mz).sum::<f64>() / n,
                intensity: observations.iter().map(|p| p.intensity).sum::<f64>() / n,
            }
        })
        .collect();

    let first = &representatives[0];
    CandidateEntry {
        modified_peptide: first.modified_peptide.clone(),
        precursor_charge: first.precursor_charge,
        precursor_mz: mz,
        retention_time: rt,
        ion_mobility: im,
        pep,
        proteins,
        runs,
        peaks,
    }
}

fn best_replicate_entry(representatives: Vec<CalibratedPsm>) -> CandidateEntry {
    let runs = representatives.len();
    let proteins: BTreeSet<String> = representatives
        .iter()
        .map(|p| p.protein_id.clone())
        .collect();

    // run_representatives returns runs in identifier order, so keeping a
    // strictly-better winner makes the earliest run win remaining ties.
    let mut best = 0;
    for i in 1..representatives.len() {
        if replaces(&representatives[i], &representatives[best]) {
            best = i;
        }
    }
    let winner = &representatives[best];

    let mut peaks = winner.peaks.clone();
    peaks.sort_by(|a, b| a.key().cmp(&b.key()));

    CandidateEntry {
        modified_peptide: winner.modified_peptide.clone(),
        precursor_charge: winner.precursor_charge,
        precursor_mz: winner.precursor_mz,
        retention_time: winner.retention_time,
        ion_mobility: winner.ion_mobility,
        pep: winner.pep,
        proteins,
        runs,
        peaks,
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.collect();
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}
