//! Schema mapping between logical classes and physical tables.
//!
//! A logical class is vertically partitioned across an ordered list of
//! physical tables: a [`TableRole::Primary`] table, zero or more inherited
//! [`TableRole::Base`] tables, and optionally a [`TableRole::Overflow`]
//! table holding spillover columns once the class outgrows one table's
//! column budget. [`SchemaMapper`] holds those mappings together with the
//! per-table column layouts and the class-hierarchy cache, and is loaded
//! from the `ec_*` meta tables of the owning connection; there are no
//! process-wide registries.

use core::fmt;

use hashbrown::HashMap;
use indexmap::IndexMap;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Identifier of a logical class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClassId(pub i64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// The role a physical table plays in a class's partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableRole {
    /// The table introduced by the class itself.
    Primary,
    /// A table inherited from a base class.
    Base,
    /// A spillover table for classes exceeding the column budget.
    Overflow,
}

impl TableRole {
    fn from_meta(value: i64) -> TableRole {
        match value {
            1 => TableRole::Base,
            2 => TableRole::Overflow,
            _ => TableRole::Primary,
        }
    }
}

/// One physical table's contribution to a class mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    /// Physical table name.
    pub table: String,
    /// Role of the table in the partitioning.
    pub role: TableRole,
    /// Column carrying the authoritative class id, if the table has one.
    pub class_id_column: Option<String>,
    /// The single class a dedicated table serves, if any.
    pub exclusive_root_class: Option<ClassId>,
}

/// A logical class definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Class identifier.
    pub id: ClassId,
    /// Full name, `Schema:Class`.
    pub full_name: String,
    /// Base class, if the class derives from one.
    pub base: Option<ClassId>,
    /// Ordered table mappings covering the class's properties.
    pub mappings: Vec<TableMapping>,
}

/// Column layout of a physical table, read from the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    /// Table name.
    pub name: String,
    /// Column names in declaration order.
    pub columns: Vec<String>,
    /// Indices of primary key columns.
    pub pk_columns: Vec<usize>,
}

impl TableLayout {
    /// Index of a column by name.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Outcome of resolving the class of a change in one physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassResolution {
    /// The class id is authoritative (class-id column or exclusive root).
    Resolved(ClassId),
    /// The root-class marker is missing; this is the best last-known class
    /// recorded in the table's metadata. Properties of the table cannot be
    /// trusted and must be omitted.
    Fallback(ClassId),
    /// The table takes no part in any class mapping.
    Unmapped,
}

/// Queryable schema metadata owned by a connection.
#[derive(Debug, Clone, Default)]
pub struct SchemaMapper {
    classes: IndexMap<ClassId, ClassDef>,
    by_name: HashMap<String, ClassId>,
    layouts: IndexMap<String, TableLayout>,
    /// Classes whose mappings touch each table, in mapping order.
    table_classes: HashMap<String, Vec<ClassId>>,
    class_id_columns: HashMap<String, String>,
    property_overrides: HashMap<(ClassId, String, String), String>,
    /// Class-hierarchy cache: class id to its subclasses, self included.
    hierarchy: HashMap<ClassId, Vec<ClassId>>,
    /// Mapping rows whose class no longer exists.
    orphans: Vec<ClassId>,
    generation: u32,
}

impl SchemaMapper {
    /// Load the mapper from the connection's `ec_*` meta tables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sqlite`] when the meta tables cannot be read.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut mapper = SchemaMapper::default();

        let mut stmt = conn.prepare("SELECT Id, Name, BaseClassId FROM ec_ClassDef ORDER BY Id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;
        for row in rows {
            let (id, name, base) = row?;
            let id = ClassId(id);
            mapper.by_name.insert(name.clone(), id);
            mapper.classes.insert(
                id,
                ClassDef {
                    id,
                    full_name: name,
                    base: base.map(ClassId),
                    mappings: Vec::new(),
                },
            );
        }

        let mut stmt = conn.prepare(
            "SELECT ClassId, TableName, Role, ClassIdColumn, ExclusiveRootClassId \
             FROM ec_ClassMap ORDER BY ClassId, Ordinal",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;
        for row in rows {
            let (class_id, table, role, class_id_column, root) = row?;
            let class_id = ClassId(class_id);
            let mapping = TableMapping {
                table: table.clone(),
                role: TableRole::from_meta(role),
                class_id_column: class_id_column.clone(),
                exclusive_root_class: root.map(ClassId),
            };
            if let Some(col) = class_id_column {
                mapper.class_id_columns.entry(table.clone()).or_insert(col);
            }
            match mapper.classes.get_mut(&class_id) {
                Some(class) => {
                    let owners = mapper.table_classes.entry(table).or_default();
                    if !owners.contains(&class_id) {
                        owners.push(class_id);
                    }
                    class.mappings.push(mapping);
                }
                None => mapper.orphans.push(class_id),
            }
        }

        let mut stmt = conn.prepare(
            "SELECT ClassId, TableName, ColumnName, PropertyName FROM ec_PropertyMap",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        for row in rows {
            let (class_id, table, column, property) = row?;
            mapper
                .property_overrides
                .insert((ClassId(class_id), table, column), property);
        }

        mapper.generation = conn
            .query_row(
                "SELECT Val FROM ec_Meta WHERE Name = 'schemaGeneration'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| u32::try_from(v).unwrap_or(0))
            .unwrap_or(1);

        let tables: Vec<String> = mapper.table_classes.keys().cloned().collect();
        for table in tables {
            let layout = load_layout(conn, &table)?;
            mapper.layouts.insert(table, layout);
        }

        mapper.rebuild_hierarchy();
        Ok(mapper)
    }

    /// Schema generation the meta tables currently record.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Definition of a class by id.
    #[must_use]
    pub fn class(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.get(&id)
    }

    /// Id of a class by full name.
    #[must_use]
    pub fn class_id_of(&self, full_name: &str) -> Option<ClassId> {
        self.by_name.get(full_name).copied()
    }

    /// Full name of a class by id.
    #[must_use]
    pub fn class_full_name(&self, id: ClassId) -> Option<&str> {
        self.classes.get(&id).map(|c| c.full_name.as_str())
    }

    /// Column layout of a physical table, if the table is mapped.
    #[must_use]
    pub fn layout(&self, table: &str) -> Option<&TableLayout> {
        self.layouts.get(table)
    }

    /// The class-id column of a table, if any of its mappings declare one.
    #[must_use]
    pub fn class_id_column(&self, table: &str) -> Option<&str> {
        self.class_id_columns.get(table).map(String::as_str)
    }

    /// Resolve the class a change in `table` belongs to.
    ///
    /// `explicit` is the non-null value of the table's class-id column, when
    /// present. Resolution never fails: a missing root marker degrades to
    /// [`ClassResolution::Fallback`] with the best last-known class recorded
    /// for the table.
    #[must_use]
    pub fn resolve_class(&self, table: &str, explicit: Option<ClassId>) -> ClassResolution {
        let Some(owners) = self.table_classes.get(table) else {
            return ClassResolution::Unmapped;
        };

        if let Some(id) = explicit
            && self.classes.contains_key(&id)
        {
            return ClassResolution::Resolved(id);
        }

        let mut roots: Vec<ClassId> = Vec::new();
        for owner in owners {
            if let Some(class) = self.classes.get(owner) {
                for mapping in class.mappings.iter().filter(|m| m.table == table) {
                    if let Some(root) = mapping.exclusive_root_class
                        && !roots.contains(&root)
                    {
                        roots.push(root);
                    }
                }
            }
        }
        if let [root] = roots.as_slice()
            && self.classes.contains_key(root)
        {
            return ClassResolution::Resolved(*root);
        }

        let Some(first_owner) = owners.first() else {
            return ClassResolution::Unmapped;
        };
        if self.class_id_columns.contains_key(table) {
            // The table's metadata is intact; the record simply did not
            // carry the class-id column (unchanged columns of an update).
            // The table's root class is authoritative, if imprecise.
            ClassResolution::Resolved(*first_owner)
        } else {
            ClassResolution::Fallback(*first_owner)
        }
    }

    /// Logical property name for a column of a table, per class. Columns
    /// without an explicit mapping keep their column name.
    #[must_use]
    pub fn property_name(&self, class: ClassId, table: &str, column: &str) -> String {
        self.property_overrides
            .get(&(class, table.to_string(), column.to_string()))
            .cloned()
            .unwrap_or_else(|| column.to_string())
    }

    /// Whether `sub` is `ancestor` or derives from it.
    #[must_use]
    pub fn is_subclass_of(&self, sub: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(sub);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.classes.get(&id).and_then(|c| c.base);
        }
        false
    }

    /// Subclasses of a class (self included), from the hierarchy cache.
    #[must_use]
    pub fn subclasses_of(&self, id: ClassId) -> Option<&[ClassId]> {
        self.hierarchy.get(&id).map(Vec::as_slice)
    }

    /// Whether the hierarchy cache still holds an entry for `id`.
    #[must_use]
    pub fn hierarchy_contains(&self, id: ClassId) -> bool {
        self.hierarchy.contains_key(&id)
    }

    /// Remove a class from the hierarchy cache, both its own entry and its
    /// membership in ancestor entries.
    pub fn purge_class(&mut self, id: ClassId) {
        self.hierarchy.remove(&id);
        for subclasses in self.hierarchy.values_mut() {
            subclasses.retain(|c| *c != id);
        }
    }

    /// Rebuild the hierarchy cache from the live class set.
    pub fn rebuild_hierarchy(&mut self) {
        self.hierarchy.clear();
        for id in self.classes.keys() {
            self.hierarchy.insert(*id, Vec::new());
        }
        let ids: Vec<ClassId> = self.classes.keys().copied().collect();
        for id in ids {
            let mut current = Some(id);
            while let Some(ancestor) = current {
                if let Some(subclasses) = self.hierarchy.get_mut(&ancestor) {
                    subclasses.push(id);
                }
                current = self.classes.get(&ancestor).and_then(|c| c.base);
            }
        }
    }

    /// Verify that nothing references a class that no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReferentialIntegrity`] naming the first dangling
    /// class id found.
    pub fn validate_integrity(&self) -> Result<()> {
        if let Some(orphan) = self.orphans.first() {
            return Err(Error::ReferentialIntegrity { class_id: *orphan });
        }
        for class in self.classes.values() {
            if let Some(base) = class.base
                && !self.classes.contains_key(&base)
            {
                return Err(Error::ReferentialIntegrity { class_id: base });
            }
            for mapping in &class.mappings {
                if let Some(root) = mapping.exclusive_root_class
                    && !self.classes.contains_key(&root)
                {
                    return Err(Error::ReferentialIntegrity { class_id: root });
                }
            }
        }
        Ok(())
    }

    /// Ids of all known classes.
    pub fn class_ids(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.classes.keys().copied()
    }
}

/// Read a table's column layout from the connection.
fn load_layout(conn: &Connection, table: &str) -> Result<TableLayout> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?))
    })?;

    let mut columns = Vec::new();
    let mut pk_ordinals: Vec<(usize, i64)> = Vec::new();
    for row in rows {
        let (name, pk) = row?;
        if pk > 0 {
            pk_ordinals.push((columns.len(), pk));
        }
        columns.push(name);
    }
    pk_ordinals.sort_by_key(|(_, ord)| *ord);

    Ok(TableLayout {
        name: table.to_string(),
        columns,
        pk_columns: pk_ordinals.into_iter().map(|(idx, _)| idx).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::briefcase::bootstrap_meta_tables;

    fn fixture_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap_meta_tables(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE bis_Element (Id INTEGER PRIMARY KEY, ECClassId INTEGER, CodeValue TEXT);
             CREATE TABLE bis_GeometricElement2d (ElementId INTEGER PRIMARY KEY, ECClassId INTEGER, Origin_X REAL);
             CREATE TABLE bis_GeometricElement2d_Overflow (ElementId INTEGER PRIMARY KEY, s TEXT);
             INSERT INTO ec_ClassDef VALUES (1, 'BisCore:Element', NULL);
             INSERT INTO ec_ClassDef VALUES (2, 'BisCore:GeometricElement2d', 1);
             INSERT INTO ec_ClassMap VALUES (1, 1, 'bis_Element', 0, 'ECClassId', NULL, 0);
             INSERT INTO ec_ClassMap VALUES (2, 2, 'bis_Element', 1, 'ECClassId', NULL, 0);
             INSERT INTO ec_ClassMap VALUES (3, 2, 'bis_GeometricElement2d', 0, 'ECClassId', NULL, 1);
             INSERT INTO ec_ClassMap VALUES (4, 2, 'bis_GeometricElement2d_Overflow', 2, NULL, 2, 2);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_load_classes_and_layouts() {
        let mapper = SchemaMapper::load(&fixture_conn()).unwrap();

        assert_eq!(mapper.class_id_of("BisCore:Element"), Some(ClassId(1)));
        assert_eq!(
            mapper.class_full_name(ClassId(2)),
            Some("BisCore:GeometricElement2d")
        );
        let layout = mapper.layout("bis_Element").unwrap();
        assert_eq!(layout.columns, vec!["Id", "ECClassId", "CodeValue"]);
        assert_eq!(layout.pk_columns, vec![0]);
        assert_eq!(mapper.generation(), 1);
    }

    #[test]
    fn test_resolve_from_class_id_column() {
        let mapper = SchemaMapper::load(&fixture_conn()).unwrap();
        assert_eq!(
            mapper.resolve_class("bis_Element", Some(ClassId(2))),
            ClassResolution::Resolved(ClassId(2))
        );
    }

    #[test]
    fn test_resolve_from_exclusive_root() {
        let mapper = SchemaMapper::load(&fixture_conn()).unwrap();
        assert_eq!(
            mapper.resolve_class("bis_GeometricElement2d_Overflow", None),
            ClassResolution::Resolved(ClassId(2))
        );
    }

    #[test]
    fn test_resolve_falls_back_when_root_marker_missing() {
        let conn = fixture_conn();
        conn.execute(
            "UPDATE ec_ClassMap SET ExclusiveRootClassId = NULL \
             WHERE TableName = 'bis_GeometricElement2d_Overflow'",
            [],
        )
        .unwrap();
        let mapper = SchemaMapper::load(&conn).unwrap();
        assert_eq!(
            mapper.resolve_class("bis_GeometricElement2d_Overflow", None),
            ClassResolution::Fallback(ClassId(2))
        );
    }

    #[test]
    fn test_resolve_without_record_value_uses_table_root() {
        // An update record does not carry unchanged columns, so the class-id
        // value may be absent while the metadata is perfectly intact.
        let mapper = SchemaMapper::load(&fixture_conn()).unwrap();
        assert_eq!(
            mapper.resolve_class("bis_Element", None),
            ClassResolution::Resolved(ClassId(1))
        );
    }

    #[test]
    fn test_resolve_unmapped_table() {
        let mapper = SchemaMapper::load(&fixture_conn()).unwrap();
        assert_eq!(
            mapper.resolve_class("ec_Meta", None),
            ClassResolution::Unmapped
        );
    }

    #[test]
    fn test_hierarchy_cache() {
        let mapper = SchemaMapper::load(&fixture_conn()).unwrap();
        assert!(mapper.is_subclass_of(ClassId(2), ClassId(1)));
        assert!(!mapper.is_subclass_of(ClassId(1), ClassId(2)));
        let subclasses = mapper.subclasses_of(ClassId(1)).unwrap();
        assert!(subclasses.contains(&ClassId(1)));
        assert!(subclasses.contains(&ClassId(2)));
    }

    #[test]
    fn test_purge_class() {
        let mut mapper = SchemaMapper::load(&fixture_conn()).unwrap();
        mapper.purge_class(ClassId(2));
        assert!(!mapper.hierarchy_contains(ClassId(2)));
        assert!(!mapper.subclasses_of(ClassId(1)).unwrap().contains(&ClassId(2)));
    }

    #[test]
    fn test_dangling_mapping_fails_validation() {
        let conn = fixture_conn();
        conn.execute("DELETE FROM ec_ClassDef WHERE Id = 2", []).unwrap();
        let mapper = SchemaMapper::load(&conn).unwrap();
        assert!(matches!(
            mapper.validate_integrity(),
            Err(Error::ReferentialIntegrity { class_id: ClassId(2) })
        ));
    }
}
