//! End-to-end tests for PQP store reduction: anchor stratification,
//! cascade-delete referential integrity, idempotence and atomicity.

use std::path::Path;

use rusqlite::Connection;

use pqpgen::reduce::{reduce, ReduceConfig, ReduceError};

// ============================================================================
// Helper Functions
// ============================================================================

/// Build a PQP store with `targets` non-decoy precursors (RT = index) and
/// `decoys` decoy precursors. One peptide per precursor, one protein per
/// five peptides, three transitions per precursor.
fn create_store(path: &Path, targets: usize, decoys: usize) {
    let connection = Connection::open(path).unwrap();
    connection
        .execute_batch(
            "
            CREATE TABLE PROTEIN (ID INTEGER PRIMARY KEY, PROTEIN_ACCESSION TEXT, DECOY INT);
            CREATE TABLE PEPTIDE (ID INTEGER PRIMARY KEY, MODIFIED_SEQUENCE TEXT, DECOY INT);
            CREATE TABLE PEPTIDE_PROTEIN_MAPPING (PEPTIDE_ID INT, PROTEIN_ID INT);
            CREATE TABLE PRECURSOR (ID INTEGER PRIMARY KEY, PRECURSOR_MZ REAL, CHARGE INT, LIBRARY_RT REAL, DECOY INT);
            CREATE TABLE PRECURSOR_PEPTIDE_MAPPING (PRECURSOR_ID INT, PEPTIDE_ID INT);
            CREATE TABLE TRANSITION (ID INTEGER PRIMARY KEY, PRODUCT_MZ REAL, CHARGE INT, TYPE TEXT, ORDINAL INT, DECOY INT);
            CREATE TABLE TRANSITION_PRECURSOR_MAPPING (TRANSITION_ID INT, PRECURSOR_ID INT);
            ",
        )
        .unwrap();

    let total = targets + decoys;
    let mut transition_id = 0i64;
    for i in 0..total {
        let id = i as i64;
        let decoy = i >= targets;
        let protein_id = (i / 5) as i64;

        connection
            .execute(
                "INSERT OR IGNORE INTO PROTEIN (ID, PROTEIN_ACCESSION, DECOY) VALUES (?1, ?2, ?3)",
                rusqlite::params![protein_id, format!("P{protein_id:04}"), decoy as i64],
            )
            .unwrap();
        connection
            .execute(
                "INSERT INTO PEPTIDE (ID, MODIFIED_SEQUENCE, DECOY) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, format!("PEPTIDE{i:04}"), decoy as i64],
            )
            .unwrap();
        connection
            .execute(
                "INSERT INTO PEPTIDE_PROTEIN_MAPPING (PEPTIDE_ID, PROTEIN_ID) VALUES (?1, ?2)",
                rusqlite::params![id, protein_id],
            )
            .unwrap();
        connection
            .execute(
                "INSERT INTO PRECURSOR (ID, PRECURSOR_MZ, CHARGE, LIBRARY_RT, DECOY) VALUES (?1, ?2, 2, ?3, ?4)",
                rusqlite::params![id, 400.0 + i as f64, i as f64, decoy as i64],
            )
            .unwrap();
        connection
            .execute(
                "INSERT INTO PRECURSOR_PEPTIDE_MAPPING (PRECURSOR_ID, PEPTIDE_ID) VALUES (?1, ?2)",
                rusqlite::params![id, id],
            )
            .unwrap();
        for ordinal in 3..6 {
            connection
                .execute(
                    "INSERT INTO TRANSITION (ID, PRODUCT_MZ, CHARGE, TYPE, ORDINAL, DECOY) VALUES (?1, ?2, 1, 'y', ?3, ?4)",
                    rusqlite::params![transition_id, 100.0 * ordinal as f64, ordinal, decoy as i64],
                )
                .unwrap();
            connection
                .execute(
                    "INSERT INTO TRANSITION_PRECURSOR_MAPPING (TRANSITION_ID, PRECURSOR_ID) VALUES (?1, ?2)",
                    rusqlite::params![transition_id, id],
                )
                .unwrap();
            transition_id += 1;
        }
    }
}

fn count(connection: &Connection, sql: &str) -> i64 {
    connection.query_row(sql, [], |row| row.get(0)).unwrap()
}

/// Anti-join queries over every relation; all must come back empty.
fn assert_no_orphans(connection: &Connection) {
    let checks = [
        "SELECT COUNT(*) FROM TRANSITION_PRECURSOR_MAPPING M LEFT JOIN PRECURSOR P ON M.PRECURSOR_ID = P.ID WHERE P.ID IS NULL",
        "SELECT COUNT(*) FROM TRANSITION_PRECURSOR_MAPPING M LEFT JOIN TRANSITION T ON M.TRANSITION_ID = T.ID WHERE T.ID IS NULL",
        "SELECT COUNT(*) FROM TRANSITION T LEFT JOIN TRANSITION_PRECURSOR_MAPPING M ON T.ID = M.TRANSITION_ID WHERE M.TRANSITION_ID IS NULL",
        "SELECT COUNT(*) FROM PRECURSOR_PEPTIDE_MAPPING M LEFT JOIN PRECURSOR P ON M.PRECURSOR_ID = P.ID WHERE P.ID IS NULL",
        "SELECT COUNT(*) FROM PRECURSOR_PEPTIDE_MAPPING M LEFT JOIN PEPTIDE P ON M.PEPTIDE_ID = P.ID WHERE P.ID IS NULL",
        "SELECT COUNT(*) FROM PEPTIDE P LEFT JOIN PRECURSOR_PEPTIDE_MAPPING M ON P.ID = M.PEPTIDE_ID WHERE M.PEPTIDE_ID IS NULL",
        "SELECT COUNT(*) FROM PRECURSOR P LEFT JOIN PRECURSOR_PEPTIDE_MAPPING M ON P.ID = M.PRECURSOR_ID WHERE M.PRECURSOR_ID IS NULL",
        "SELECT COUNT(*) FROM PEPTIDE_PROTEIN_MAPPING M LEFT JOIN PEPTIDE P ON M.PEPTIDE_ID = P.ID WHERE P.ID IS NULL",
        "SELECT COUNT(*) FROM PEPTIDE_PROTEIN_MAPPING M LEFT JOIN PROTEIN P ON M.PROTEIN_ID = P.ID WHERE P.ID IS NULL",
        "SELECT COUNT(*) FROM PROTEIN P LEFT JOIN PEPTIDE_PROTEIN_MAPPING M ON P.ID = M.PROTEIN_ID WHERE M.PROTEIN_ID IS NULL",
    ];
    for sql in checks {
        assert_eq!(count(connection, sql), 0, "orphans via: {sql}");
    }
}

fn precursor_ids(connection: &Connection) -> Vec<i64> {
    let mut statement = connection
        .prepare("SELECT ID FROM PRECURSOR ORDER BY ID")
        .unwrap();
    statement
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<Vec<i64>, _>>()
        .unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_uniform_store_reduces_to_five_per_bin() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("library.pqp");
    let output = dir.path().join("reduced.pqp");
    create_store(&input, 100, 10);

    let summary = reduce(&ReduceConfig {
        input: input.clone(),
        output: Some(output.clone()),
        in_place: false,
        bins: 10,
        peptides_per_bin: 5,
    })
    .unwrap();

    assert_eq!(summary.candidates, 100);
    assert_eq!(summary.anchors, 50);

    let connection = Connection::open(&output).unwrap();
    assert_eq!(count(&connection, "SELECT COUNT(*) FROM PRECURSOR"), 50);
    assert_eq!(count(&connection, "SELECT COUNT(*) FROM TRANSITION"), 150);
    assert_eq!(count(&connection, "SELECT COUNT(*) FROM PEPTIDE"), 50);
    // Decoy precursors are never anchors.
    assert_eq!(
        count(&connection, "SELECT COUNT(*) FROM PRECURSOR WHERE DECOY = 1"),
        0
    );
    assert_no_orphans(&connection);

    // The input store is untouched.
    let original = Connection::open(&input).unwrap();
    assert_eq!(count(&original, "SELECT COUNT(*) FROM PRECURSOR"), 110);
}

#[test]
fn test_kept_precursors_respect_bin_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("library.pqp");
    let output = dir.path().join("reduced.pqp");
    create_store(&input, 100, 0);

    let bins = 10usize;
    let per_bin = 5usize;
    reduce(&ReduceConfig {
        input,
        output: Some(output.clone()),
        in_place: false,
        bins,
        peptides_per_bin: per_bin,
    })
    .unwrap();

    // Candidates spanned RT [0, 99]; recompute the partition and check
    // every kept precursor lands under its bin's cap.
    let connection = Connection::open(&output).unwrap();
    let mut statement = connection
        .prepare("SELECT LIBRARY_RT FROM PRECURSOR ORDER BY ROWID")
        .unwrap();
    let rts: Vec<f64> = statement
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let (min, max) = (0.0f64, 99.0f64);
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for rt in &rts {
        assert!((min..=max).contains(rt));
        let bin = (((rt - min) / width) as usize).min(bins - 1);
        counts[bin] += 1;
    }
    for (bin, bin_count) in counts.iter().enumerate() {
        assert!(
            *bin_count <= per_bin,
            "bin {bin} holds {bin_count} > {per_bin} precursors"
        );
    }
    assert!(rts.len() <= bins * per_bin);
}

#[test]
fn test_reduction_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("library.pqp");
    let once = dir.path().join("once.pqp");
    let twice = dir.path().join("twice.pqp");
    create_store(&input, 100, 10);

    reduce(&ReduceConfig {
        input,
        output: Some(once.clone()),
        in_place: false,
        bins: 10,
        peptides_per_bin: 5,
    })
    .unwrap();
    reduce(&ReduceConfig {
        input: once.clone(),
        output: Some(twice.clone()),
        in_place: false,
        bins: 10,
        peptides_per_bin: 5,
    })
    .unwrap();

    let first = Connection::open(&once).unwrap();
    let second = Connection::open(&twice).unwrap();
    assert_eq!(precursor_ids(&first), precursor_ids(&second));
    assert_eq!(
        count(&first, "SELECT COUNT(*) FROM TRANSITION"),
        count(&second, "SELECT COUNT(*) FROM TRANSITION")
    );
}

#[test]
fn test_in_place_reduction() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("library.pqp");
    create_store(&input, 40, 5);

    let summary = reduce(&ReduceConfig {
        input: input.clone(),
        output: None,
        in_place: true,
        bins: 4,
        peptides_per_bin: 3,
    })
    .unwrap();
    assert_eq!(summary.anchors, 12);

    let connection = Connection::open(&input).unwrap();
    assert_eq!(count(&connection, "SELECT COUNT(*) FROM PRECURSOR"), 12);
    assert_no_orphans(&connection);
}

#[test]
fn test_sparse_bins_contribute_fewer_anchors() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("library.pqp");
    let output = dir.path().join("reduced.pqp");
    // Only three precursors; most of the ten bins stay empty.
    create_store(&input, 3, 0);

    let summary = reduce(&ReduceConfig {
        input,
        output: Some(output.clone()),
        in_place: false,
        bins: 10,
        peptides_per_bin: 5,
    })
    .unwrap();
    // Empty bins are not an error; everything fits.
    assert_eq!(summary.anchors, 3);

    let connection = Connection::open(&output).unwrap();
    assert_no_orphans(&connection);
}

#[test]
fn test_invalid_store_leaves_input_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.pqp");
    let output = dir.path().join("reduced.pqp");
    let connection = Connection::open(&input).unwrap();
    connection
        .execute_batch("CREATE TABLE PRECURSOR (ID INTEGER PRIMARY KEY, LIBRARY_RT REAL, DECOY INT);")
        .unwrap();
    drop(connection);

    let before = std::fs::read(&input).unwrap();
    let result = reduce(&ReduceConfig {
        input: input.clone(),
        output: Some(output.clone()),
        in_place: false,
        bins: 10,
        peptides_per_bin: 5,
    });
    assert!(matches!(result, Err(ReduceError::InvalidStore(_))));
    assert!(!output.exists());
    assert_eq!(std::fs::read(&input).unwrap(), before);
}

#[test]
fn test_zero_bins_fails_before_any_io() {
    let dir = tempfile::tempdir().unwrap();
    let missing_input = dir.path().join("does_not_exist.pqp");
    let result = reduce(&ReduceConfig {
        input: missing_input,
        output: Some(dir.path().join("out.pqp")),
        in_place: false,
        bins: 0,
        peptides_per_bin: 5,
    });
    // Configuration is rejected before the (missing) input is opened.
    assert!(matches!(result, Err(ReduceError::Configuration(_))));
}

// ============================================================================
// Property-based tests
// ============================================================================

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// For all store sizes, bin counts and per-bin caps: the output
        /// precursor count is bounded by bins * per_bin and the cascade
        /// leaves no orphans.
        #[test]
        fn reduction_respects_anchor_bound(
            targets in 0usize..150,
            decoys in 0usize..20,
            bins in 1usize..16,
            per_bin in 0usize..8,
        ) {
            let dir = tempfile::tempdir().unwrap();
            let input = dir.path().join("library.pqp");
            let output = dir.path().join("reduced.pqp");
            create_store(&input, targets, decoys);

            let summary = reduce(&ReduceConfig {
                input,
                output: Some(output.clone()),
                in_place: false,
                bins,
                peptides_per_bin: per_bin,
            })
            .unwrap();

            prop_assert!(summary.anchors <= bins * per_bin);
            prop_assert!(summary.anchors <= targets);

            let connection = Connection::open(&output).unwrap();
            prop_assert_eq!(
                count(&connection, "SELECT COUNT(*) FROM PRECURSOR"),
                summary.anchors as i64
            );
            assert_no_orphans(&connection);
        }
    }
}
