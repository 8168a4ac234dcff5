//! The local, writable copy of the database that exchanges changesets with
//! a shared timeline.
//!
//! A [`Briefcase`] owns its connection, its [`SchemaMapper`] (no process
//! global registries), its position on the timeline and its health-stat
//! collection. All components operating against the same briefcase are
//! mutually exclusive; nothing here is thread-safe.

use std::cell::Cell;
use std::path::Path;
use std::time::Instant;

use hashbrown::HashMap;
use rusqlite::Connection;
use rusqlite::session::Session;

use crate::encoding::Value;
use crate::errors::Result;
use crate::health::{HealthStat, HealthTracker, StatementStat};
use crate::parser::{ChangeRecord, RecordOp};
use crate::reader::ChangesetReader;
use crate::schema::{ClassId, SchemaMapper};
use crate::timeline::{ChangesetDescriptor, ChangesetType};

/// A local briefcase connection.
pub struct Briefcase {
    conn: Connection,
    mapper: SchemaMapper,
    tip_index: Cell<u64>,
    scratch_seq: Cell<u64>,
    health: HealthTracker,
}

impl Briefcase {
    /// Open an in-memory briefcase, bootstrapping the `ec_*` meta tables.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Sqlite`] on connection or bootstrap failure.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open (or create) a briefcase file, bootstrapping the `ec_*` meta
    /// tables.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Sqlite`] on connection or bootstrap failure.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        bootstrap_meta_tables(&conn)?;
        let mapper = SchemaMapper::load(&conn)?;
        Ok(Self {
            conn,
            mapper,
            tip_index: Cell::new(0),
            scratch_seq: Cell::new(0),
            health: HealthTracker::default(),
        })
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The schema mapper loaded from this briefcase's meta tables.
    #[must_use]
    pub fn mapper(&self) -> &SchemaMapper {
        &self.mapper
    }

    /// Reload the schema mapper after out-of-band schema edits.
    ///
    /// # Errors
    ///
    /// [`crate::Error::Sqlite`] when the meta tables cannot be read.
    pub fn reload_schema(&mut self) -> Result<()> {
        self.mapper = SchemaMapper::load(&self.conn)?;
        Ok(())
    }

    /// The schema generation this briefcase currently carries.
    #[must_use]
    pub fn schema_generation(&self) -> u32 {
        self.mapper.generation()
    }

    /// Index of the newest changeset this briefcase has applied or pushed.
    #[must_use]
    pub fn tip_index(&self) -> u64 {
        self.tip_index.get()
    }

    /// Start capturing local changes. Edits made through
    /// [`connection`](Self::connection) while the tracker lives are
    /// recorded, committed or not, and can be turned into a changeset via
    /// [`ChangesetReader::open_local_changes`].
    ///
    /// # Errors
    ///
    /// [`crate::Error::Sqlite`] when the session cannot be created.
    pub fn begin_tracking(&self) -> Result<ChangeTracker<'_>> {
        let mut session = Session::new(&self.conn)?;
        session.attach::<&str>(None)?;
        Ok(ChangeTracker {
            session,
            generation: self.mapper.generation(),
        })
    }

    /// Note that local changes were pushed as `descriptor` without
    /// re-applying them.
    pub fn record_pushed(&self, descriptor: &ChangesetDescriptor) {
        self.tip_index.set(descriptor.index);
    }

    /// Apply a changeset pulled from the timeline in one transaction.
    ///
    /// All-or-nothing: any failure rolls the transaction back and leaves
    /// the briefcase untouched. When the changeset touches the `ec_*` meta
    /// tables (or is schema-kind), the schema mapper is reloaded from the
    /// live tables and validated before commit; classes that disappeared
    /// are purged from the hierarchy cache, and a dangling reference fails
    /// the commit with [`crate::Error::ReferentialIntegrity`].
    ///
    /// # Errors
    ///
    /// [`crate::Error::Sqlite`] on statement failure,
    /// [`crate::Error::ReferentialIntegrity`] on a dangling class
    /// reference.
    pub fn apply_changeset(
        &mut self,
        reader: &ChangesetReader,
        descriptor: &ChangesetDescriptor,
    ) -> Result<()> {
        let track = self.health.enabled;
        let started = Instant::now();
        let mut per_statement = Vec::new();
        let (mut inserted, mut updated, mut deleted) = (0u64, 0u64, 0u64);
        let mut total_scans = 0u64;

        let tx = self.conn.unchecked_transaction()?;
        let mut layouts: HashMap<String, Vec<String>> = HashMap::new();

        for record in reader.records() {
            let table = &record.table().name;
            if !layouts.contains_key(table) {
                layouts.insert(table.clone(), table_columns(&tx, table)?);
            }
            let columns = &layouts[table];
            let Some((sql, params)) = build_statement(record, columns) else {
                continue;
            };

            let scans = if track {
                count_full_scans(&tx, &sql, &params)?
            } else {
                0
            };
            let stmt_started = Instant::now();
            let rows = tx.execute(&sql, rusqlite::params_from_iter(params.iter()))? as u64;
            match record.op() {
                RecordOp::Insert => inserted += rows,
                RecordOp::Update => updated += rows,
                RecordOp::Delete => deleted += rows,
            }
            total_scans += scans;
            if track {
                per_statement.push(StatementStat {
                    sql_statement: sql,
                    db_operation: record.op().sql_verb().to_string(),
                    row_count: rows,
                    elapsed_ms: stmt_started.elapsed().as_secs_f64() * 1000.0,
                    full_table_scans: scans,
                });
            }
        }

        let touches_meta = descriptor.kind != ChangesetType::Regular
            || reader
                .records()
                .iter()
                .any(|r| r.table().name.starts_with("ec_"));

        if touches_meta {
            let new_mapper = SchemaMapper::load(&tx)?;
            new_mapper.validate_integrity()?;
            let removed: Vec<ClassId> = self
                .mapper
                .class_ids()
                .filter(|id| new_mapper.class(*id).is_none())
                .collect();
            for id in removed {
                tracing::debug!(class = %id, "purging deleted class from hierarchy cache");
                self.mapper.purge_class(id);
            }
            tx.commit()?;
            self.mapper = new_mapper;
        } else {
            tx.commit()?;
        }

        self.tip_index.set(descriptor.index);
        if track {
            self.health.stats.push(HealthStat {
                changeset_id: descriptor.id.clone(),
                uncompressed_size_bytes: descriptor.uncompressed_size,
                inserted_rows: inserted,
                updated_rows: updated,
                deleted_rows: deleted,
                total_elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
                total_full_table_scans: total_scans,
                per_statement_stats: per_statement,
            });
        }
        Ok(())
    }

    /// Start collecting one [`HealthStat`] per applied changeset.
    pub fn enable_changeset_stat_tracking(&mut self) {
        self.health.enabled = true;
    }

    /// Stop collecting health stats.
    pub fn disable_changeset_stat_tracking(&mut self) {
        self.health.enabled = false;
    }

    /// Health stats collected over this briefcase's lifetime.
    #[must_use]
    pub fn changeset_health_stats(&self) -> &[HealthStat] {
        &self.health.stats
    }

    /// Discard collected health stats.
    pub fn clear_changeset_health_stats(&mut self) {
        self.health.stats.clear();
    }

    /// Sequence for naming unifier scratch tables on this connection.
    pub(crate) fn next_scratch_id(&self) -> u64 {
        let id = self.scratch_seq.get();
        self.scratch_seq.set(id + 1);
        id
    }
}

/// Uncommitted-local-change capture over a briefcase's connection.
pub struct ChangeTracker<'b> {
    session: Session<'b>,
    generation: u32,
}

impl ChangeTracker<'_> {
    /// Schema generation the briefcase carried when tracking started.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The raw changeset payload of everything recorded so far.
    pub(crate) fn changeset_bytes(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.session.changeset_strm(&mut buf)?;
        Ok(buf)
    }
}

/// Create the `ec_*` meta tables if they do not exist yet.
pub(crate) fn bootstrap_meta_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ec_ClassDef (
             Id INTEGER PRIMARY KEY,
             Name TEXT NOT NULL UNIQUE,
             BaseClassId INTEGER
         );
         CREATE TABLE IF NOT EXISTS ec_ClassMap (
             Id INTEGER PRIMARY KEY,
             ClassId INTEGER NOT NULL,
             TableName TEXT NOT NULL,
             Role INTEGER NOT NULL,
             ClassIdColumn TEXT,
             ExclusiveRootClassId INTEGER,
             Ordinal INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS ec_PropertyMap (
             Id INTEGER PRIMARY KEY,
             ClassId INTEGER NOT NULL,
             TableName TEXT NOT NULL,
             ColumnName TEXT NOT NULL,
             PropertyName TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS ec_Meta (
             Name TEXT PRIMARY KEY,
             Val INTEGER NOT NULL
         );
         INSERT OR IGNORE INTO ec_Meta (Name, Val) VALUES ('schemaGeneration', 1);",
    )
}

/// Column names of a table, in declaration order.
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

fn to_sql_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null | Value::Undefined => rusqlite::types::Value::Null,
        Value::Integer(v) => rusqlite::types::Value::Integer(*v),
        Value::Real(v) => rusqlite::types::Value::Real(*v),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
    }
}

/// Build the SQL statement applying one record, or `None` when the record
/// carries nothing applicable (e.g. an Update whose columns are all
/// undefined, or a table the briefcase does not have).
fn build_statement(
    record: &ChangeRecord,
    columns: &[String],
) -> Option<(String, Vec<rusqlite::types::Value>)> {
    if columns.is_empty() {
        tracing::warn!(table = %record.table().name, "skipping record for unknown table");
        return None;
    }
    let table = record.table();
    let pk_flags = &table.pk_flags;

    match record.op() {
        RecordOp::Insert => {
            let values = record.new_values()?;
            let mut names = Vec::new();
            let mut params = Vec::new();
            for (i, value) in values.iter().enumerate() {
                if value.is_undefined() {
                    continue;
                }
                names.push(columns.get(i)?.as_str());
                params.push(to_sql_value(value));
            }
            let placeholders: Vec<String> =
                (1..=params.len()).map(|n| format!("?{n}")).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table.name,
                names.join(", "),
                placeholders.join(", ")
            );
            Some((sql, params))
        }
        RecordOp::Update => {
            let old = record.old_values()?;
            let new = record.new_values()?;
            let mut sets = Vec::new();
            let mut params = Vec::new();
            for (i, value) in new.iter().enumerate() {
                if value.is_undefined() {
                    continue;
                }
                params.push(to_sql_value(value));
                sets.push(format!("{} = ?{}", columns.get(i)?, params.len()));
            }
            if sets.is_empty() {
                return None;
            }
            let mut conditions = Vec::new();
            for (i, flag) in pk_flags.iter().enumerate() {
                if *flag > 0 {
                    params.push(to_sql_value(old.get(i)?));
                    conditions.push(format!("{} = ?{}", columns.get(i)?, params.len()));
                }
            }
            let sql = format!(
                "UPDATE {} SET {} WHERE {}",
                table.name,
                sets.join(", "),
                conditions.join(" AND ")
            );
            Some((sql, params))
        }
        RecordOp::Delete => {
            let old = record.old_values()?;
            let mut conditions = Vec::new();
            let mut params = Vec::new();
            for (i, flag) in pk_flags.iter().enumerate() {
                if *flag > 0 {
                    params.push(to_sql_value(old.get(i)?));
                    conditions.push(format!("{} = ?{}", columns.get(i)?, params.len()));
                }
            }
            let sql = format!("DELETE FROM {} WHERE {}", table.name, conditions.join(" AND "));
            Some((sql, params))
        }
    }
}

/// Count the full table scans in a statement's query plan.
fn count_full_scans(
    conn: &Connection,
    sql: &str,
    params: &[rusqlite::types::Value],
) -> Result<u64> {
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
    let detail_column = stmt.column_count().saturating_sub(1);
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        row.get::<_, String>(detail_column)
    })?;
    let mut scans = 0;
    for detail in rows {
        if detail?.starts_with("SCAN") {
            scans += 1;
        }
    }
    Ok(scans)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_descriptor(index: u64) -> ChangesetDescriptor {
        ChangesetDescriptor {
            index,
            id: format!("cs{index}"),
            parent_id: String::new(),
            description: String::new(),
            push_date: 0,
            kind: ChangesetType::Regular,
            size: 0,
            uncompressed_size: 0,
        }
    }

    fn briefcase_with_table() -> Briefcase {
        let briefcase = Briefcase::open_in_memory().unwrap();
        briefcase
            .connection()
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, s TEXT)")
            .unwrap();
        briefcase
    }

    fn local_changes(briefcase: &Briefcase, sql: &str) -> ChangesetReader {
        let mut tracker = briefcase.begin_tracking().unwrap();
        briefcase.connection().execute_batch(sql).unwrap();
        ChangesetReader::open_local_changes(&mut tracker).unwrap()
    }

    #[test]
    fn test_tracked_edits_produce_records() {
        let briefcase = briefcase_with_table();
        let reader = local_changes(
            &briefcase,
            "INSERT INTO t VALUES (1, 'a'); UPDATE t SET s = 'b' WHERE id = 1;",
        );
        // The session consolidates insert+update on the same row.
        assert_eq!(reader.records().len(), 1);
        assert_eq!(reader.records()[0].op(), RecordOp::Insert);
    }

    #[test]
    fn test_apply_changeset_replays_rows() {
        let source = briefcase_with_table();
        let reader = local_changes(&source, "INSERT INTO t VALUES (1, 'a'), (2, 'b')");

        let mut target = briefcase_with_table();
        target.apply_changeset(&reader, &data_descriptor(1)).unwrap();

        let count: i64 = target
            .connection()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(target.tip_index(), 1);
    }

    #[test]
    fn test_apply_collects_health_stats_when_enabled() {
        let source = briefcase_with_table();
        let reader = local_changes(&source, "INSERT INTO t VALUES (1, 'a')");

        let mut target = briefcase_with_table();
        target.enable_changeset_stat_tracking();
        target.apply_changeset(&reader, &data_descriptor(1)).unwrap();

        let stats = target.changeset_health_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].inserted_rows, 1);
        assert_eq!(stats[0].per_statement_stats.len(), 1);
        assert_eq!(stats[0].per_statement_stats[0].db_operation, "INSERT");

        target.clear_changeset_health_stats();
        assert!(target.changeset_health_stats().is_empty());
    }

    #[test]
    fn test_stats_not_collected_when_disabled() {
        let source = briefcase_with_table();
        let reader = local_changes(&source, "INSERT INTO t VALUES (1, 'a')");

        let mut target = briefcase_with_table();
        target.apply_changeset(&reader, &data_descriptor(1)).unwrap();
        assert!(target.changeset_health_stats().is_empty());
    }

    #[test]
    fn test_schema_generation_travels_inside_changesets() {
        let source = Briefcase::open_in_memory().unwrap();
        let reader = local_changes(
            &source,
            "UPDATE ec_Meta SET Val = 2 WHERE Name = 'schemaGeneration'",
        );

        let mut target = Briefcase::open_in_memory().unwrap();
        let mut descriptor = data_descriptor(1);
        descriptor.kind = ChangesetType::Schema;
        target.apply_changeset(&reader, &descriptor).unwrap();
        assert_eq!(target.schema_generation(), 2);
    }

    #[test]
    fn test_dangling_class_reference_fails_apply() {
        let mut source = Briefcase::open_in_memory().unwrap();
        source
            .connection()
            .execute_batch(
                "CREATE TABLE x (Id INTEGER PRIMARY KEY);
                 INSERT INTO ec_ClassDef VALUES (1, 'S:X', NULL);
                 INSERT INTO ec_ClassMap VALUES (1, 1, 'x', 0, NULL, 1, 0);",
            )
            .unwrap();
        source.reload_schema().unwrap();

        // Capture a schema change deleting the class but leaving its
        // mapping row dangling.
        let reader = local_changes(&source, "DELETE FROM ec_ClassDef WHERE Id = 1");

        let mut target = Briefcase::open_in_memory().unwrap();
        target
            .connection()
            .execute_batch(
                "CREATE TABLE x (Id INTEGER PRIMARY KEY);
                 INSERT INTO ec_ClassDef VALUES (1, 'S:X', NULL);
                 INSERT INTO ec_ClassMap VALUES (1, 1, 'x', 0, NULL, 1, 0);",
            )
            .unwrap();
        target.reload_schema().unwrap();

        let mut descriptor = data_descriptor(1);
        descriptor.kind = ChangesetType::Schema;
        let err = target.apply_changeset(&reader, &descriptor).unwrap_err();
        assert!(matches!(err, crate::Error::ReferentialIntegrity { .. }));

        // Rolled back: the class definition is still there.
        let count: i64 = target
            .connection()
            .query_row("SELECT COUNT(*) FROM ec_ClassDef", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
