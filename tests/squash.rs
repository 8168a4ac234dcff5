//! Tests for group mode: squashing ordered changeset files into their net
//! effect, serializing the net result, and surfacing invalid sequences.

mod common;

use std::path::PathBuf;

use common::{bis_briefcase, capture};
use ec_changeset::{
    Briefcase, ChangeAccumulator, ChangedInstance, ChangesetReader, Error, InstanceAdaptor,
    ReaderOptions, RecordOp,
};

const ELEMENT_ID: i64 = 0x20000000004;

/// Capture each SQL batch as its own changeset file, in order.
fn changeset_files(briefcase: &Briefcase, dir: &std::path::Path, batches: &[String]) -> Vec<PathBuf> {
    batches
        .iter()
        .enumerate()
        .map(|(i, sql)| {
            let path = dir.join(format!("{i:02}.changeset"));
            capture(briefcase, sql).write_to_file(&path, false, false).unwrap();
            path
        })
        .collect()
}

fn unify_reader(briefcase: &Briefcase, reader: ChangesetReader) -> Vec<ChangedInstance> {
    let mut adaptor = InstanceAdaptor::new(reader, briefcase.mapper());
    let mut accumulator = ChangeAccumulator::in_memory();
    while adaptor.step() {
        accumulator.append_from(&adaptor).unwrap();
    }
    let mut instances = accumulator.instances().unwrap();
    instances.sort_by_key(|i| (i.instance_id.clone(), format!("{:?}", i.meta.stage)));
    instances
}

#[test]
fn insert_update_delete_squashes_to_nothing() {
    let briefcase = bis_briefcase();
    let dir = tempfile::tempdir().unwrap();
    let paths = changeset_files(
        &briefcase,
        dir.path(),
        &[
            format!(
                "INSERT INTO bis_Element VALUES ({ELEMENT_ID}, 2, 'code', NULL);
                 INSERT INTO bis_GeometricElement2d VALUES ({ELEMENT_ID}, 2, 0.0, 0.0);
                 INSERT INTO bis_GeometricElement2d_Overflow VALUES ({ELEMENT_ID}, 'first');"
            ),
            format!(
                "UPDATE bis_GeometricElement2d_Overflow SET s = 'updated property' \
                 WHERE ElementId = {ELEMENT_ID}"
            ),
            format!(
                "DELETE FROM bis_GeometricElement2d_Overflow WHERE ElementId = {ELEMENT_ID};
                 DELETE FROM bis_GeometricElement2d WHERE ElementId = {ELEMENT_ID};
                 DELETE FROM bis_Element WHERE Id = {ELEMENT_ID};"
            ),
        ],
    );

    let reader =
        ChangesetReader::open_group(&paths, &briefcase, &ReaderOptions::default()).unwrap();

    // The row never existed from the group's perspective.
    assert!(reader.records().is_empty());
    assert!(reader.dropped_rows().is_empty());
    assert!(unify_reader(&briefcase, reader).is_empty());
}

#[test]
fn insert_then_update_squashes_to_single_insert() {
    let briefcase = bis_briefcase();
    let dir = tempfile::tempdir().unwrap();
    let paths = changeset_files(
        &briefcase,
        dir.path(),
        &[
            format!(
                "INSERT INTO bis_GeometricElement2d_Overflow VALUES ({ELEMENT_ID}, 'first')"
            ),
            format!(
                "UPDATE bis_GeometricElement2d_Overflow SET s = 'updated property' \
                 WHERE ElementId = {ELEMENT_ID}"
            ),
        ],
    );

    let reader =
        ChangesetReader::open_group(&paths, &briefcase, &ReaderOptions::default()).unwrap();

    assert_eq!(reader.records().len(), 1);
    let record = &reader.records()[0];
    assert_eq!(record.op(), RecordOp::Insert);
    // The insert's payload is the update's new value.
    assert_eq!(
        record.new_values().unwrap()[1],
        ec_changeset::Value::Text("updated property".into())
    );
}

#[test]
fn group_round_trip_preserves_unified_instances() {
    let briefcase = bis_briefcase();
    let dir = tempfile::tempdir().unwrap();
    let paths = changeset_files(
        &briefcase,
        dir.path(),
        &[
            format!(
                "INSERT INTO bis_Element VALUES ({ELEMENT_ID}, 2, 'code', NULL);
                 INSERT INTO bis_GeometricElement2d VALUES ({ELEMENT_ID}, 2, 1.0, 2.0);"
            ),
            format!(
                "UPDATE bis_Element SET CodeValue = 'renamed' WHERE Id = {ELEMENT_ID};
                 INSERT INTO bis_Element VALUES (9, 1, 'other', NULL);"
            ),
        ],
    );

    let options = ReaderOptions::default();
    let direct = ChangesetReader::open_group(&paths, &briefcase, &options).unwrap();
    let expected = unify_reader(&briefcase, direct);

    // Squash, serialize, reopen: the unified instance set is unchanged.
    let squashed = ChangesetReader::open_group(&paths, &briefcase, &options).unwrap();
    let net_path = dir.path().join("net.changeset");
    squashed.write_to_file(&net_path, false, false).unwrap();

    let reopened = ChangesetReader::open_file(&net_path, &briefcase, &options).unwrap();
    let actual = unify_reader(&briefcase, reopened);

    assert_eq!(expected.len(), 2);
    assert_eq!(expected, actual);
}

#[test]
fn write_to_file_refuses_existing_target() {
    let briefcase = bis_briefcase();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cs.changeset");

    let reader = capture(
        &briefcase,
        "INSERT INTO bis_Element VALUES (1, 1, 'a', NULL)",
    );
    reader.write_to_file(&path, false, false).unwrap();

    let err = reader.write_to_file(&path, false, false).unwrap_err();
    match err {
        Error::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::AlreadyExists),
        other => panic!("expected Io error, got {other:?}"),
    }

    // Overwrite opts back in.
    reader.write_to_file(&path, false, true).unwrap();
}

#[test]
fn double_insert_across_files_is_dropped_with_warning() {
    let dir = tempfile::tempdir().unwrap();

    let first = bis_briefcase();
    let path_a = dir.path().join("a.changeset");
    capture(&first, "INSERT INTO bis_Element VALUES (7, 1, 'a', NULL)")
        .write_to_file(&path_a, false, false)
        .unwrap();

    // A second briefcase produces a conflicting insert of the same row.
    let second = bis_briefcase();
    let path_b = dir.path().join("b.changeset");
    capture(&second, "INSERT INTO bis_Element VALUES (7, 1, 'b', NULL)")
        .write_to_file(&path_b, false, false)
        .unwrap();

    let reader = ChangesetReader::open_group(
        &[path_a, path_b],
        &first,
        &ReaderOptions::default(),
    )
    .unwrap();

    // The offending row is dropped and surfaced; the squash itself succeeds.
    assert!(reader.records().is_empty());
    assert_eq!(reader.dropped_rows().len(), 1);
    let dropped = &reader.dropped_rows()[0];
    assert_eq!(dropped.table, "bis_Element");
    assert_eq!(dropped.earlier, RecordOp::Insert);
    assert_eq!(dropped.later, RecordOp::Insert);
}

#[test]
fn schema_mismatch_is_detected_and_can_be_overridden() {
    let briefcase = bis_briefcase();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("old.changeset");
    capture(&briefcase, "INSERT INTO bis_Element VALUES (1, 1, 'a', NULL)")
        .write_to_file(&path, false, false)
        .unwrap();

    // Simulate a schema upgrade after the changeset was recorded.
    let mut briefcase = briefcase;
    briefcase
        .connection()
        .execute(
            "UPDATE ec_Meta SET Val = 5 WHERE Name = 'schemaGeneration'",
            [],
        )
        .unwrap();
    briefcase.reload_schema().unwrap();

    let err =
        ChangesetReader::open_file(&path, &briefcase, &ReaderOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        Error::SchemaMismatch {
            changeset: 1,
            briefcase: 5
        }
    ));

    // The intentional escape hatch for inspecting historical changesets.
    let reader = ChangesetReader::open_file(
        &path,
        &briefcase,
        &ReaderOptions {
            disable_schema_check: true,
        },
    )
    .unwrap();
    assert_eq!(reader.records().len(), 1);
}
