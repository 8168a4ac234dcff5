//! Shared fixtures for the integration tests: a briefcase carrying a small
//! vertically partitioned class hierarchy, and helpers for capturing local
//! edits as changesets.

use ec_changeset::{
    Briefcase, ChangesetDescriptor, ChangesetReader, ChangesetType, Timeline,
};

/// A briefcase with two classes partitioned across three physical tables:
///
/// - `BisCore:Element` (id 1) → `bis_Element`
/// - `BisCore:GeometricElement2d` (id 2, derives from 1) →
///   `bis_Element` + `bis_GeometricElement2d` + an overflow table holding
///   the spillover column `s`.
pub fn bis_briefcase() -> Briefcase {
    let mut briefcase = Briefcase::open_in_memory().unwrap();
    briefcase
        .connection()
        .execute_batch(
            "CREATE TABLE bis_Element (
                 Id INTEGER PRIMARY KEY,
                 ECClassId INTEGER,
                 CodeValue TEXT,
                 UserLabel TEXT
             );
             CREATE TABLE bis_GeometricElement2d (
                 ElementId INTEGER PRIMARY KEY,
                 ECClassId INTEGER,
                 Origin_X REAL,
                 Origin_Y REAL
             );
             CREATE TABLE bis_GeometricElement2d_Overflow (
                 ElementId INTEGER PRIMARY KEY,
                 s TEXT
             );
             INSERT INTO ec_ClassDef VALUES (1, 'BisCore:Element', NULL);
             INSERT INTO ec_ClassDef VALUES (2, 'BisCore:GeometricElement2d', 1);
             INSERT INTO ec_ClassMap VALUES (1, 1, 'bis_Element', 0, 'ECClassId', NULL, 0);
             INSERT INTO ec_ClassMap VALUES (2, 2, 'bis_Element', 1, 'ECClassId', NULL, 0);
             INSERT INTO ec_ClassMap VALUES (3, 2, 'bis_GeometricElement2d', 0, 'ECClassId', NULL, 1);
             INSERT INTO ec_ClassMap VALUES (4, 2, 'bis_GeometricElement2d_Overflow', 2, NULL, 2, 2);",
        )
        .unwrap();
    briefcase.reload_schema().unwrap();
    briefcase
}

/// Execute `sql` under change tracking and return the captured changeset.
pub fn capture(briefcase: &Briefcase, sql: &str) -> ChangesetReader {
    let mut tracker = briefcase.begin_tracking().unwrap();
    briefcase.connection().execute_batch(sql).unwrap();
    ChangesetReader::open_local_changes(&mut tracker).unwrap()
}

/// Execute `sql` under change tracking, push the captured changeset to the
/// timeline and advance the briefcase's tip.
#[allow(dead_code)]
pub fn capture_and_push(
    briefcase: &Briefcase,
    timeline: &mut Timeline,
    sql: &str,
    kind: ChangesetType,
    description: &str,
) -> ChangesetDescriptor {
    let reader = capture(briefcase, sql);
    let descriptor = timeline.push(&reader, kind, description).unwrap();
    briefcase.record_pushed(&descriptor);
    descriptor
}
