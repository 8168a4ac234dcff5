//! Tests for instance reconstruction and cross-table unification:
//!
//! - A multi-table insert unifies into one instance per stage
//! - In-memory and external-storage caches produce identical output
//! - Corrupted root-class markers degrade gracefully
//! - Class and operation filters

mod common;

use common::{bis_briefcase, capture};
use ec_changeset::{
    ChangeAccumulator, ChangedInstance, ChangesetReader, InstanceAdaptor, InstanceCache,
    ReaderOptions, RecordOp, ResolvedClass, SqliteCache, Stage, Value,
};

/// Drive an adaptor to exhaustion through an accumulator and return the
/// unified set.
fn unify<C: InstanceCache>(
    mut adaptor: InstanceAdaptor<'_>,
    mut accumulator: ChangeAccumulator<C>,
) -> Vec<ChangedInstance> {
    while adaptor.step() {
        accumulator.append_from(&adaptor).unwrap();
    }
    let mut instances = accumulator.instances().unwrap();
    instances.sort_by_key(|i| (i.instance_id.clone(), i.meta.stage == Stage::New));
    accumulator.dispose().unwrap();
    instances
}

const ELEMENT_ID: i64 = 0x20000000004;

#[test]
fn multi_table_insert_unifies_into_one_instance_per_stage() {
    let briefcase = bis_briefcase();
    let reader = capture(
        &briefcase,
        &format!(
            "INSERT INTO bis_Element VALUES ({ELEMENT_ID}, 2, 'code', 'label');
             INSERT INTO bis_GeometricElement2d VALUES ({ELEMENT_ID}, 2, 1.5, 2.5);"
        ),
    );

    let adaptor = InstanceAdaptor::new(reader, briefcase.mapper());
    let instances = unify(adaptor, ChangeAccumulator::in_memory());

    assert_eq!(instances.len(), 1);
    let instance = &instances[0];
    assert_eq!(instance.instance_id, "0x20000000004");
    assert_eq!(instance.meta.stage, Stage::New);
    assert_eq!(instance.meta.op, RecordOp::Insert);
    assert_eq!(instance.meta.class_full_name, "BisCore:GeometricElement2d");
    assert_eq!(instance.meta.tables.len(), 2);
    assert!(instance.meta.tables.contains(&"bis_Element".to_string()));
    assert!(
        instance
            .meta
            .tables
            .contains(&"bis_GeometricElement2d".to_string())
    );
    assert_eq!(instance.meta.change_indexes.len(), 2);

    // Properties from both tables land in one bag.
    assert_eq!(
        instance.properties.get("CodeValue"),
        Some(&Value::Text("code".into()))
    );
    assert_eq!(instance.properties.get("Origin_X"), Some(&Value::Real(1.5)));
}

#[test]
fn update_unifies_into_old_and_new_views() {
    let briefcase = bis_briefcase();
    briefcase
        .connection()
        .execute_batch(&format!(
            "INSERT INTO bis_Element VALUES ({ELEMENT_ID}, 2, 'before', NULL);
             INSERT INTO bis_GeometricElement2d VALUES ({ELEMENT_ID}, 2, 0.0, 0.0);"
        ))
        .unwrap();

    let reader = capture(
        &briefcase,
        &format!(
            "UPDATE bis_Element SET CodeValue = 'after' WHERE Id = {ELEMENT_ID};
             UPDATE bis_GeometricElement2d SET Origin_X = 9.0 WHERE ElementId = {ELEMENT_ID};"
        ),
    );

    let adaptor = InstanceAdaptor::new(reader, briefcase.mapper());
    let instances = unify(adaptor, ChangeAccumulator::in_memory());

    assert_eq!(instances.len(), 2);
    let old = &instances[0];
    let new = &instances[1];
    assert_eq!(old.meta.stage, Stage::Old);
    assert_eq!(new.meta.stage, Stage::New);
    assert_eq!(
        old.properties.get("CodeValue"),
        Some(&Value::Text("before".into()))
    );
    assert_eq!(
        new.properties.get("CodeValue"),
        Some(&Value::Text("after".into()))
    );
    assert_eq!(old.meta.tables.len(), 2);
    assert_eq!(new.meta.tables.len(), 2);
}

#[test]
fn memory_and_sqlite_caches_produce_identical_instances() {
    let briefcase = bis_briefcase();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.changeset");

    capture(
        &briefcase,
        &format!(
            "INSERT INTO bis_Element VALUES ({ELEMENT_ID}, 2, 'code', NULL);
             INSERT INTO bis_GeometricElement2d VALUES ({ELEMENT_ID}, 2, 1.0, 2.0);
             INSERT INTO bis_GeometricElement2d_Overflow VALUES ({ELEMENT_ID}, 'spill');
             INSERT INTO bis_Element VALUES (7, 1, 'plain', NULL);"
        ),
    )
    .write_to_file(&path, false, false)
    .unwrap();

    let options = ReaderOptions::default();
    let reader = ChangesetReader::open_file(&path, &briefcase, &options).unwrap();
    let adaptor = InstanceAdaptor::new(reader, briefcase.mapper());
    let via_memory = unify(adaptor, ChangeAccumulator::in_memory());

    let reader = ChangesetReader::open_file(&path, &briefcase, &options).unwrap();
    let adaptor = InstanceAdaptor::new(reader, briefcase.mapper());
    let cache = SqliteCache::new(&briefcase).unwrap();
    let via_sqlite = unify(adaptor, ChangeAccumulator::new(cache));

    assert_eq!(via_memory.len(), 2);
    assert_eq!(via_memory, via_sqlite);
}

#[test]
fn corrupted_root_marker_degrades_to_fallback() {
    let mut briefcase = bis_briefcase();
    briefcase
        .connection()
        .execute_batch(
            "INSERT INTO bis_GeometricElement2d_Overflow VALUES (5, 'original')",
        )
        .unwrap();

    let reader = capture(
        &briefcase,
        "UPDATE bis_GeometricElement2d_Overflow SET s = 'changed' WHERE ElementId = 5",
    );

    // Null out the root-class marker after capture, simulating the observed
    // metadata corruption.
    briefcase
        .connection()
        .execute(
            "UPDATE ec_ClassMap SET ExclusiveRootClassId = NULL \
             WHERE TableName = 'bis_GeometricElement2d_Overflow'",
            [],
        )
        .unwrap();
    briefcase.reload_schema().unwrap();

    let mut adaptor = InstanceAdaptor::new(reader, briefcase.mapper());
    assert!(adaptor.step());
    let fragments = adaptor.fragments();
    assert_eq!(fragments.len(), 2);
    for fragment in fragments {
        // Identity, operation and provenance survive; the class is only a
        // fallback and the table's properties are omitted.
        assert_eq!(fragment.instance_id, "0x5");
        assert_eq!(fragment.meta.op, RecordOp::Update);
        assert_eq!(fragment.class.class_id(), None);
        assert_eq!(
            fragment.class.fallback_class_id(),
            briefcase.mapper().class_id_of("BisCore:GeometricElement2d")
        );
        assert_eq!(fragment.meta.class_full_name, "BisCore:GeometricElement2d");
        assert!(fragment.properties.is_empty());
    }
    // The degraded rows never abort the scan.
    assert!(!adaptor.step());
}

#[test]
fn accept_class_includes_subclasses() {
    let briefcase = bis_briefcase();
    let reader = capture(
        &briefcase,
        &format!(
            "INSERT INTO bis_Element VALUES (1, 1, 'base', NULL);
             INSERT INTO bis_Element VALUES ({ELEMENT_ID}, 2, 'derived', NULL);"
        ),
    );
    let adaptor = InstanceAdaptor::new(reader, briefcase.mapper())
        .accept_class("BisCore:Element")
        .unwrap();
    let all = unify(adaptor, ChangeAccumulator::in_memory());
    assert_eq!(all.len(), 2);

    // Deletes carry the full old row, class id included.
    let reader = capture(&briefcase, "DELETE FROM bis_Element");
    let adaptor = InstanceAdaptor::new(reader, briefcase.mapper())
        .accept_class("BisCore:GeometricElement2d")
        .unwrap();
    let derived_only = unify(adaptor, ChangeAccumulator::in_memory());
    assert_eq!(derived_only.len(), 1);
    assert_eq!(
        derived_only[0].class,
        ResolvedClass::Known(
            briefcase
                .mapper()
                .class_id_of("BisCore:GeometricElement2d")
                .unwrap()
        )
    );
}

#[test]
fn accept_op_restricts_to_one_operation_kind() {
    let briefcase = bis_briefcase();
    briefcase
        .connection()
        .execute_batch("INSERT INTO bis_Element VALUES (1, 1, 'a', NULL)")
        .unwrap();

    let reader = capture(
        &briefcase,
        "INSERT INTO bis_Element VALUES (2, 1, 'b', NULL);
         DELETE FROM bis_Element WHERE Id = 1;",
    );
    let adaptor = InstanceAdaptor::new(reader, briefcase.mapper()).accept_op(RecordOp::Delete);
    let instances = unify(adaptor, ChangeAccumulator::in_memory());

    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "0x1");
    assert_eq!(instances[0].meta.op, RecordOp::Delete);
    assert_eq!(instances[0].meta.stage, Stage::Old);
}
