//! Tests for revert/reinstate: history is never rewritten, reverting always
//! appends a new forward changeset, and reverting again past the first
//! revert restores the reverted content.

mod common;

use common::{bis_briefcase, capture_and_push};
use ec_changeset::{
    Briefcase, ChangesetReader, ChangesetType, ClassId, Error, ReaderOptions, RevertOptions,
    Timeline, revert_and_push_changes,
};

fn timeline() -> (tempfile::TempDir, Timeline) {
    let dir = tempfile::tempdir().unwrap();
    let timeline = Timeline::new(dir.path().join("timeline")).unwrap();
    (dir, timeline)
}

fn code_value(briefcase: &Briefcase, id: i64) -> Option<String> {
    briefcase
        .connection()
        .query_row(
            "SELECT CodeValue FROM bis_Element WHERE Id = ?1",
            [id],
            |row| row.get(0),
        )
        .ok()
}

/// Apply every timeline changeset the target has not seen yet.
fn sync(target: &mut Briefcase, timeline: &Timeline) {
    let from = target.tip_index();
    for descriptor in timeline.descriptors() {
        if descriptor.index <= from {
            continue;
        }
        let reader = ChangesetReader::open_file(
            &timeline.path_for(descriptor),
            target,
            &ReaderOptions::default(),
        )
        .unwrap();
        target.apply_changeset(&reader, descriptor).unwrap();
    }
}

#[test]
fn revert_then_reinstate_restores_observable_state() {
    let mut briefcase = bis_briefcase();
    let (_guard, mut timeline) = timeline();

    capture_and_push(
        &briefcase,
        &mut timeline,
        "INSERT INTO bis_Element VALUES (1, 1, 'A', NULL)",
        ChangesetType::Regular,
        "insert element",
    );
    capture_and_push(
        &briefcase,
        &mut timeline,
        "UPDATE bis_Element SET CodeValue = 'B' WHERE Id = 1",
        ChangesetType::Regular,
        "rename element",
    );
    assert_eq!(code_value(&briefcase, 1), Some("B".to_string()));

    // Revert the rename: a new forward changeset appears at index 3.
    let descriptor = revert_and_push_changes(
        &mut briefcase,
        &mut timeline,
        &RevertOptions {
            to_index: 1,
            ..RevertOptions::default()
        },
    )
    .unwrap();
    assert_eq!(descriptor.index, 3);
    assert_eq!(timeline.tip(), 3);
    assert_eq!(code_value(&briefcase, 1), Some("A".to_string()));

    // Reinstate = revert again to an index after the original revert point.
    let descriptor = revert_and_push_changes(
        &mut briefcase,
        &mut timeline,
        &RevertOptions {
            to_index: 2,
            ..RevertOptions::default()
        },
    )
    .unwrap();
    assert_eq!(descriptor.index, 4);
    assert_eq!(code_value(&briefcase, 1), Some("B".to_string()));

    // And reverting the reinstate composes the same way.
    revert_and_push_changes(
        &mut briefcase,
        &mut timeline,
        &RevertOptions {
            to_index: 3,
            ..RevertOptions::default()
        },
    )
    .unwrap();
    assert_eq!(code_value(&briefcase, 1), Some("A".to_string()));
}

#[test]
fn revert_of_insert_removes_the_element_and_reinstate_restores_it() {
    let mut briefcase = bis_briefcase();
    let (_guard, mut timeline) = timeline();

    capture_and_push(
        &briefcase,
        &mut timeline,
        "INSERT INTO bis_Element VALUES (1, 1, 'A', 'label')",
        ChangesetType::Regular,
        "insert element",
    );

    revert_and_push_changes(
        &mut briefcase,
        &mut timeline,
        &RevertOptions::default(),
    )
    .unwrap();
    assert_eq!(code_value(&briefcase, 1), None);

    revert_and_push_changes(
        &mut briefcase,
        &mut timeline,
        &RevertOptions {
            to_index: 1,
            ..RevertOptions::default()
        },
    )
    .unwrap();
    assert_eq!(code_value(&briefcase, 1), Some("A".to_string()));
}

#[test]
fn revert_with_empty_range_errors() {
    let mut briefcase = bis_briefcase();
    let (_guard, mut timeline) = timeline();

    let err = revert_and_push_changes(
        &mut briefcase,
        &mut timeline,
        &RevertOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::EmptyRevertRange { to_index: 0, tip: 0 }
    ));
}

#[test]
fn skip_schema_changes_reverts_data_but_keeps_upgraded_schema() {
    let mut briefcase = bis_briefcase();
    let (_guard, mut timeline) = timeline();

    capture_and_push(
        &briefcase,
        &mut timeline,
        "INSERT INTO bis_Element VALUES (1, 1, 'A', NULL)",
        ChangesetType::Regular,
        "insert element",
    );
    capture_and_push(
        &briefcase,
        &mut timeline,
        "INSERT INTO ec_ClassDef VALUES (3, 'Test:Extra', 1);
         UPDATE ec_Meta SET Val = 2 WHERE Name = 'schemaGeneration';",
        ChangesetType::Schema,
        "schema upgrade",
    );
    briefcase.reload_schema().unwrap();
    capture_and_push(
        &briefcase,
        &mut timeline,
        "UPDATE bis_Element SET CodeValue = 'B' WHERE Id = 1",
        ChangesetType::Regular,
        "rename element",
    );

    revert_and_push_changes(
        &mut briefcase,
        &mut timeline,
        &RevertOptions {
            to_index: 0,
            skip_schema_changes: true,
            ..RevertOptions::default()
        },
    )
    .unwrap();

    // Data-level changes in the range are undone.
    assert_eq!(code_value(&briefcase, 1), None);
    // The upgraded schema's class set is untouched.
    assert!(briefcase.mapper().class_id_of("Test:Extra").is_some());
    assert_eq!(briefcase.schema_generation(), 2);
}

#[test]
fn class_deletion_syncs_and_reverts_without_dangling_hierarchy_entries() {
    let setup = "CREATE TABLE test_Widget (Id INTEGER PRIMARY KEY, Name TEXT)";
    let mut author = bis_briefcase();
    author.connection().execute_batch(setup).unwrap();
    let mut peer = bis_briefcase();
    peer.connection().execute_batch(setup).unwrap();

    let (_guard, mut timeline) = timeline();

    // A schema changeset introduces the class on the author and syncs to
    // the peer.
    capture_and_push(
        &author,
        &mut timeline,
        "INSERT INTO ec_ClassDef VALUES (3, 'Test:Widget', NULL);
         INSERT INTO ec_ClassMap VALUES (5, 3, 'test_Widget', 0, NULL, 3, 0);
         UPDATE ec_Meta SET Val = 2 WHERE Name = 'schemaGeneration';",
        ChangesetType::Schema,
        "add widget class",
    );
    author.reload_schema().unwrap();
    sync(&mut peer, &timeline);
    assert!(author.mapper().hierarchy_contains(ClassId(3)));
    assert!(peer.mapper().hierarchy_contains(ClassId(3)));

    // Deleting the class purges the hierarchy cache on both sides.
    capture_and_push(
        &author,
        &mut timeline,
        "DELETE FROM ec_ClassDef WHERE Id = 3;
         DELETE FROM ec_ClassMap WHERE ClassId = 3;
         UPDATE ec_Meta SET Val = 3 WHERE Name = 'schemaGeneration';",
        ChangesetType::Schema,
        "delete widget class",
    );
    author.reload_schema().unwrap();
    sync(&mut peer, &timeline);
    assert!(!author.mapper().hierarchy_contains(ClassId(3)));
    assert!(!peer.mapper().hierarchy_contains(ClassId(3)));

    // Reverting the deletion restores the entry consistently on re-sync.
    revert_and_push_changes(
        &mut author,
        &mut timeline,
        &RevertOptions {
            to_index: 1,
            ..RevertOptions::default()
        },
    )
    .unwrap();
    sync(&mut peer, &timeline);

    assert!(author.mapper().hierarchy_contains(ClassId(3)));
    assert!(peer.mapper().hierarchy_contains(ClassId(3)));
    assert_eq!(author.schema_generation(), 2);
    assert_eq!(peer.schema_generation(), 2);
    assert_eq!(
        author.mapper().class_id_of("Test:Widget"),
        peer.mapper().class_id_of("Test:Widget")
    );
}
