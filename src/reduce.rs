//! Reduction of an assembled PQP library store to a small anchor set.
//!
//! Non-decoy precursors are binned along the RT gradient; each bin keeps
//! at most a fixed number of precursors (in stored order), and everything
//! else is cascade-deleted. The cascade is driven by an explicit schema
//! dependency graph walked children-first, so referential integrity does
//! not depend on a hardcoded statement sequence. The whole reduction runs
//! against a scratch copy that atomically replaces the destination only
//! after every cascade step, the integrity verification and the storage
//! reclaim succeed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rusqlite::Connection;
use serde::Serialize;

/// Errors raised during store reduction.
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Mutually inconsistent options; raised before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O error while copying or persisting the store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The input file is not a PQP library store.
    #[error("invalid library store: {0}")]
    InvalidStore(String),

    /// The cascade would leave orphaned rows; the transaction is rolled
    /// back and the original store is left untouched.
    #[error("referential integrity violation: {orphans} orphaned rows via {table}")]
    ReferentialIntegrity {
        /// Table the orphans were detected in.
        table: String,
        /// Orphaned row count.
        orphans: usize,
    },

    /// Failed to move the reduced store into place.
    #[error("failed to persist reduced store to {path}: {message}")]
    Persist {
        /// Destination path.
        path: PathBuf,
        /// Underlying rename error.
        message: String,
    },
}

/// Reduction parameters.
#[derive(Debug, Clone)]
pub struct ReduceConfig {
    /// Input PQP store.
    pub input: PathBuf,
    /// Output PQP store; mutually exclusive with `in_place`.
    pub output: Option<PathBuf>,
    /// Overwrite the input store instead of writing a new one.
    pub in_place: bool,
    /// Number of equal-width RT bins.
    pub bins: usize,
    /// Maximum precursors kept per bin.
    pub peptides_per_bin: usize,
}

impl ReduceConfig {
    /// Fail fast on inconsistent options, before any file is touched.
    pub fn validate(&self) -> Result<(), ReduceError> {
        if self.bins == 0 {
            return Err(ReduceError::Configuration(
                "reduction requires at least one RT bin".to_string(),
            ));
        }
        match (&self.output, self.in_place) {
            (Some(_), true) => Err(ReduceError::Configuration(
                "--out and --in-place are mutually exclusive".to_string(),
            )),
            (None, false) => Err(ReduceError::Configuration(
                "either --out or --in-place is required".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn destination(&self) -> &Path {
        match &self.output {
            Some(path) => path,
            None => &self.input,
        }
    }
}

/// Counters reported after a successful reduction.
#[derive(Debug, Clone, Serialize)]
pub struct ReduceSummary {
    /// Non-decoy precursors considered for anchoring.
    pub candidates: usize,
    /// Precursors retained as anchors.
    pub anchors: usize,
    /// Bin count used.
    pub bins: usize,
    /// Precursor rows removed (targets and decoys).
    pub precursors_removed: usize,
}

/// One parent-to-child relation in the PQP schema, realized by a mapping
/// table referencing both sides.
struct SchemaEdge {
    mapping: &'static str,
    parent: &'static str,
    parent_key: &'static str,
    child: &'static str,
    child_key: &'static str,
    /// Whether every parent row must be referenced by this mapping.
    parent_requires_reference: bool,
}

const SCHEMA_EDGES: &[SchemaEdge] = &[
    SchemaEdge {
        mapping: "TRANSITION_PRECURSOR_MAPPING",
        parent: "PRECURSOR",
        parent_key: "PRECURSOR_ID",
        child: "TRANSITION",
        child_key: "TRANSITION_ID",
        parent_requires_reference: false,
    },
    SchemaEdge {
        mapping: "PRECURSOR_PEPTIDE_MAPPING",
        parent: "PRECURSOR",
        parent_key: "PRECURSOR_ID",
        child: "PEPTIDE",
        child_key: "PEPTIDE_ID",
        parent_requires_reference: true,
    },
    SchemaEdge {
        mapping: "PEPTIDE_PROTEIN_MAPPING",
        parent: "PEPTIDE",
        parent_key: "PEPTIDE_ID",
        child: "PROTEIN",
        child_key: "PROTEIN_ID",
        parent_requires_reference: false,
    },
];

/// Root of the deletion cascade.
const CASCADE_ROOT: &str = "PRECURSOR";

/// Edges in cascade order: breadth-first from the root, so each entity's
/// referencing mapping rows are cleaned before the entity itself and
/// before anything further down the graph.
fn cascade_order() -> Vec<&'static SchemaEdge> {
    let mut order = Vec::with_capacity(SCHEMA_EDGES.len());
    let mut frontier = vec![CASCADE_ROOT];
    while let Some(parent) = frontier.pop() {
        for edge in SCHEMA_EDGES {
            if edge.parent == parent {
                order.push(edge);
                frontier.push(edge.child);
            }
        }
    }
    order
}

/// Tables the reducer requires in the store.
fn required_tables() -> Vec<&'static str> {
    let mut tables = vec![CASCADE_ROOT];
    for edge in SCHEMA_EDGES {
        tables.push(edge.mapping);
        tables.push(edge.child);
    }
    tables
}

/// Reduce `config.input` into its destination.
pub fn reduce(config: &ReduceConfig) -> Result<ReduceSummary, ReduceError> {
    config.validate()?;

    let destination = config.destination().to_path_buf();
    let stage_dir = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let scratch = tempfile::NamedTempFile::new_in(&stage_dir)?;
    std::fs::copy(&config.input, scratch.path())?;

    let mut connection = Connection::open(scratch.path())?;
    validate_schema(&connection)?;

    let candidates = load_candidates(&connection)?;
    let anchors = select_anchors(&candidates, config.bins, config.peptides_per_bin);
    info!(
        "selected {} anchors from {} candidates across {} bins",
        anchors.len(),
        candidates.len(),
        config.bins
    );

    let precursors_before: i64 =
        connection.query_row("SELECT COUNT(*) FROM PRECURSOR", [], |r| r.get(0))?;

    let tx = connection.transaction()?;
    tx.execute(
        "CREATE TEMP TABLE reduction_anchors (PRECURSOR_ID INTEGER PRIMARY KEY)",
        [],
    )?;
    {
        let mut insert = tx.prepare("INSERT INTO reduction_anchors (PRECURSOR_ID) VALUES (?1)")?;
        for id in &anchors {
            insert.execute([id])?;
        }
    }

    tx.execute(
        "DELETE FROM PRECURSOR WHERE ID NOT IN (SELECT PRECURSOR_ID FROM reduction_anchors)",
        [],
    )?;

    for edge in cascade_order() {
        let removed_mappings = tx.execute(
            &format!(
                "DELETE FROM {m} WHERE {pk} NOT IN (SELECT ID FROM {p})",
                m = edge.mapping,
                pk = edge.parent_key,
                p = edge.parent
            ),
            [],
        )?;
        let removed_children = tx.execute(
            &format!(
                "DELETE FROM {c} WHERE ID NOT IN (SELECT {ck} FROM {m})",
                c = edge.child,
                ck = edge.child_key,
                m = edge.mapping
            ),
            [],
        )?;
        debug!(
            "cascade {}: removed {} mapping rows, {} {} rows",
            edge.mapping, removed_mappings, removed_children, edge.child
        );
    }

    verify_integrity(&tx)?;
    tx.execute("DROP TABLE reduction_anchors", [])?;
    tx.commit()?;

    let precursors_after: i64 =
        connection.query_row("SELECT COUNT(*) FROM PRECURSOR", [], |r| r.get(0))?;

    // Reclaim the space freed by the cascade.
    connection.execute_batch("VACUUM;")?;
    drop(connection);

    scratch.persist(&destination).map_err(|e| ReduceError::Persist {
        path: destination.clone(),
        message: e.error.to_string(),
    })?;

    Ok(ReduceSummary {
        candidates: candidates.len(),
        anchors: anchors.len(),
        bins: config.bins,
        precursors_removed: (precursors_before - precursors_after) as usize,
    })
}

fn validate_schema(connection: &Connection) -> Result<(), ReduceError> {
    let mut statement =
        connection.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let present: HashSet<String> = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<_, _>>()?;

    for table in required_tables() {
        if !present.contains(table) {
            return Err(ReduceError::InvalidStore(format!(
                "missing table {table}"
            )));
        }
    }
    Ok(())
}

/// Non-decoy precursors with a library RT, in stored order.
fn load_candidates(connection: &Connection) -> Result<Vec<(i64, f64)>, ReduceError> {
    let mut statement = connection.prepare(
        "SELECT ID, LIBRARY_RT FROM PRECURSOR WHERE DECOY = 0 ORDER BY ROWID",
    )?;
    let rows = statement.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, Option<f64>>(1)?))
    })?;

    let mut candidates = Vec::new();
    for row in rows {
        let (id, rt) = row?;
        match rt {
            Some(rt) if rt.is_finite() => candidates.push((id, rt)),
            _ => debug!("precursor {id} has no usable LIBRARY_RT; not an anchor candidate"),
        }
    }
    Ok(candidates)
}

/// Partition the RT range into `bins` equal-width, left-closed bins (the
/// last bin also closed on the right) and keep at most `per_bin`
/// precursors per bin, in stored order.
pub(crate) fn select_anchors(
    candidates: &[(i64, f64)],
    bins: usize,
    per_bin: usize,
) -> Vec<i64> {
    if candidates.is_empty() || per_bin == 0 {
        return Vec::new();
    }

    let (min, max) = candidates.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY),
        |(lo, hi), &(_, rt)| (lo.min(rt), hi.max(rt)),
    );
    let width = (max - min) / bins as f64;

    let mut counts = vec![0usize; bins];
    let mut anchors = Vec::new();
    for &(id, rt) in candidates {
        let bin = bin_index(rt, min, width, bins);
        if counts[bin] < per_bin {
            counts[bin] += 1;
            anchors.push(id);
        }
    }
    anchors
}

/// Bin of `rt` under the half-open partition; the maximum value lands in
/// the final bin.
pub(crate) fn bin_index(rt: f64, min: f64, width: f64, bins: usize) -> usize {
    if width <= 0.0 {
        return 0;
    }
    (((rt - min) / width) as usize).min(bins - 1)
}

/// Anti-join verification over every schema edge: no mapping row may
/// reference a missing row on either side, and no retained entity row may
/// be left unreferenced.
fn verify_integrity(connection: &Connection) -> Result<(), ReduceError> {
    for edge in SCHEMA_EDGES {
        let mut checks = vec![
            (
                edge.mapping,
                format!(
                    "SELECT COUNT(*) FROM {m} M LEFT JOIN {p} P ON M.{pk} = P.ID WHERE P.ID IS NULL",
                    m = edge.mapping,
                    p = edge.parent,
                    pk = edge.parent_key
                ),
            ),
            (
                edge.mapping,
                format!(
                    "SELECT COUNT(*) FROM {m} M LEFT JOIN {c} C ON M.{ck} = C.ID WHERE C.ID IS NULL",
                    m = edge.mapping,
                    c = edge.child,
                    ck = edge.child_key
                ),
            ),
            (
                edge.child,
                format!(
                    "SELECT COUNT(*) FROM {c} C LEFT JOIN {m} M ON C.ID = M.{ck} WHERE M.{ck} IS NULL",
                    c = edge.child,
                    m = edge.mapping,
                    ck = edge.child_key
                ),
            ),
        ];
        if edge.parent_requires_reference {
            checks.push((
                edge.parent,
                format!(
                    "SELECT COUNT(*) FROM {p} P LEFT JOIN {m} M ON P.ID = M.{pk} WHERE M.{pk} IS NULL",
                    p = edge.parent,
                    m = edge.mapping,
                    pk = edge.parent_key
                ),
            ));
        }

        for (table, sql) in checks {
            let orphans: i64 = connection.query_row(&sql, [], |row| row.get(0))?;
            if orphans > 0 {
                return Err(ReduceError::ReferentialIntegrity {
                    table: table.to_string(),
                    orphans: orphans as usize,
                });
            }
        }
    }
    Ok(())
}
