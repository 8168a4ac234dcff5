//! Reconstruction of logical instance changes from raw table changes.
//!
//! [`InstanceAdaptor`] pulls one [`ChangeRecord`] from its reader per
//! [`step`](InstanceAdaptor::step) and, using the [`SchemaMapper`], emits
//! that record's instance *fragments*: a change affecting exactly one
//! physical table for exactly one instance. An Update record yields two
//! fragments, an Old-stage view built from the old values and a New-stage
//! view built from the new values. Fragments of the same logical change
//! that are split across tables by vertical partitioning are merged later
//! by the accumulator, not here.

use indexmap::IndexMap;

use crate::encoding::Value;
use crate::errors::{Error, Result};
use crate::instance::{
    ChangedInstance, InstanceMeta, ResolvedClass, Stage, instance_id_from_value,
};
use crate::parser::{ChangeRecord, RecordOp};
use crate::reader::ChangesetReader;
use crate::schema::{ClassId, ClassResolution, SchemaMapper};

/// Adaptor from raw change records to instance fragments.
pub struct InstanceAdaptor<'m> {
    reader: ChangesetReader,
    mapper: &'m SchemaMapper,
    accept_class: Option<ClassId>,
    accept_op: Option<RecordOp>,
    current: Vec<ChangedInstance>,
}

impl<'m> InstanceAdaptor<'m> {
    /// Create an adaptor over a reader, using the given schema mapper.
    #[must_use]
    pub fn new(reader: ChangesetReader, mapper: &'m SchemaMapper) -> Self {
        Self {
            reader,
            mapper,
            accept_class: None,
            accept_op: None,
            current: Vec::new(),
        }
    }

    /// Restrict output to instances of exactly this class and its
    /// subclasses. Default accepts all classes.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownClass`] when the mapper does not know the name.
    pub fn accept_class(mut self, class_full_name: &str) -> Result<Self> {
        let id = self
            .mapper
            .class_id_of(class_full_name)
            .ok_or_else(|| Error::UnknownClass(class_full_name.to_string()))?;
        self.accept_class = Some(id);
        Ok(self)
    }

    /// Restrict output to one operation kind. Default accepts all.
    #[must_use]
    pub fn accept_op(mut self, op: RecordOp) -> Self {
        self.accept_op = Some(op);
        self
    }

    /// Advance the underlying reader by one record and rebuild the current
    /// fragment set. Returns `false` at end of stream; a `true` step may
    /// still carry zero fragments when the record is filtered out or its
    /// table takes no part in any class mapping.
    pub fn step(&mut self) -> bool {
        self.current.clear();
        if !self.reader.step() {
            return false;
        }
        if let Some(record) = self.reader.record() {
            self.current = build_fragments(
                record,
                self.mapper,
                self.accept_class,
                self.accept_op,
            );
        }
        true
    }

    /// Fragments produced by the current step (0 to 2 entries).
    #[must_use]
    pub fn fragments(&self) -> &[ChangedInstance] {
        &self.current
    }

    /// Operation of the current record, regardless of filtering.
    #[must_use]
    pub fn op(&self) -> Option<RecordOp> {
        self.reader.op()
    }

    /// The New-stage view of the current step, present for Insert and
    /// Update records.
    #[must_use]
    pub fn inserted(&self) -> Option<&ChangedInstance> {
        self.current.iter().find(|f| f.meta.stage == Stage::New)
    }

    /// The Old-stage view of the current step, present for Update and
    /// Delete records.
    #[must_use]
    pub fn deleted(&self) -> Option<&ChangedInstance> {
        self.current.iter().find(|f| f.meta.stage == Stage::Old)
    }

    /// The underlying reader.
    #[must_use]
    pub fn reader(&self) -> &ChangesetReader {
        &self.reader
    }

    /// Consume the adaptor, returning the underlying reader.
    #[must_use]
    pub fn into_reader(self) -> ChangesetReader {
        self.reader
    }
}

fn build_fragments(
    record: &ChangeRecord,
    mapper: &SchemaMapper,
    accept_class: Option<ClassId>,
    accept_op: Option<RecordOp>,
) -> Vec<ChangedInstance> {
    if let Some(filter) = accept_op
        && record.op() != filter
    {
        return Vec::new();
    }

    let table = record.table();
    let explicit = explicit_class_id(record, mapper);
    let class = match mapper.resolve_class(&table.name, explicit) {
        ClassResolution::Resolved(id) => ResolvedClass::Known(id),
        ClassResolution::Fallback(id) => {
            tracing::warn!(
                table = %table.name,
                fallback = %id,
                "class id unresolvable, degrading to last-known class and omitting properties"
            );
            ResolvedClass::Fallback(id)
        }
        ClassResolution::Unmapped => return Vec::new(),
    };

    if let Some(target) = accept_class
        && !mapper.is_subclass_of(class.id(), target)
    {
        return Vec::new();
    }

    let class_full_name = mapper
        .class_full_name(class.id())
        .unwrap_or_default()
        .to_string();

    // The primary key always lives on the side that describes an existing
    // row: new values for Insert, old values for Update and Delete.
    let id_values = match record.op() {
        RecordOp::Insert => record.new_values(),
        RecordOp::Update | RecordOp::Delete => record.old_values(),
    };
    let Some(pk_index) = table.pk_indices().first().copied() else {
        return Vec::new();
    };
    let Some(instance_id) = id_values
        .and_then(|values| values.get(pk_index))
        .map(instance_id_from_value)
    else {
        return Vec::new();
    };

    let stages: Vec<(Stage, Option<&[Value]>)> = match record.op() {
        RecordOp::Insert => vec![(Stage::New, record.new_values())],
        RecordOp::Delete => vec![(Stage::Old, record.old_values())],
        RecordOp::Update => vec![
            (Stage::Old, record.old_values()),
            (Stage::New, record.new_values()),
        ],
    };

    stages
        .into_iter()
        .filter_map(|(stage, values)| {
            let values = values?;
            let properties = match class {
                ResolvedClass::Known(id) => stage_properties(record, mapper, id, values),
                // Without the root-class marker the column-to-property
                // mapping cannot be trusted; omit the table's properties.
                ResolvedClass::Fallback(_) => IndexMap::new(),
            };
            Some(ChangedInstance {
                instance_id: instance_id.clone(),
                class,
                properties,
                meta: InstanceMeta {
                    tables: vec![table.name.clone()],
                    op: record.op(),
                    class_full_name: class_full_name.clone(),
                    change_indexes: vec![record.sequence_index()],
                    stage,
                },
            })
        })
        .collect()
}

/// Non-null value of the table's class-id column, when the table has one.
fn explicit_class_id(record: &ChangeRecord, mapper: &SchemaMapper) -> Option<ClassId> {
    let table = record.table();
    let column = mapper.class_id_column(&table.name)?;
    let index = mapper.layout(&table.name)?.column_index(column)?;
    let value = [record.new_values(), record.old_values()]
        .into_iter()
        .flatten()
        .filter_map(|values| values.get(index))
        .find(|v| !v.is_undefined() && !v.is_null())?;
    value.as_integer().map(ClassId)
}

/// Build the property bag for one stage of a record.
fn stage_properties(
    record: &ChangeRecord,
    mapper: &SchemaMapper,
    class: ClassId,
    values: &[Value],
) -> IndexMap<String, Value> {
    let table = record.table();
    let Some(layout) = mapper.layout(&table.name) else {
        return IndexMap::new();
    };
    let class_id_column = mapper.class_id_column(&table.name);

    let mut properties = IndexMap::new();
    for (index, column) in layout.columns.iter().enumerate() {
        if table.pk_flags.get(index).copied().unwrap_or(0) > 0 {
            continue;
        }
        if Some(column.as_str()) == class_id_column {
            continue;
        }
        let Some(value) = values.get(index) else {
            continue;
        };
        if value.is_undefined() {
            continue;
        }
        properties.insert(
            mapper.property_name(class, &table.name, column),
            value.clone(),
        );
    }
    properties
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rusqlite::Connection;

    use super::*;
    use crate::briefcase::bootstrap_meta_tables;
    use crate::parser::TableSchema;

    fn fixture_mapper() -> SchemaMapper {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap_meta_tables(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE bis_Element (Id INTEGER PRIMARY KEY, ECClassId INTEGER, CodeValue TEXT);
             CREATE TABLE bis_Element_Overflow (ElementId INTEGER PRIMARY KEY, s TEXT);
             INSERT INTO ec_ClassDef VALUES (1, 'BisCore:Element', NULL);
             INSERT INTO ec_ClassMap VALUES (1, 1, 'bis_Element', 0, 'ECClassId', NULL, 0);
             INSERT INTO ec_ClassMap VALUES (2, 1, 'bis_Element_Overflow', 2, NULL, 1, 1);",
        )
        .unwrap();
        SchemaMapper::load(&conn).unwrap()
    }

    fn element_schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new("bis_Element".into(), 3, vec![1, 0, 0]))
    }

    fn insert_record(seq: usize) -> ChangeRecord {
        ChangeRecord {
            table: element_schema(),
            op: RecordOp::Insert,
            indirect: false,
            old_values: None,
            new_values: Some(vec![
                Value::Integer(0x20000000004),
                Value::Integer(1),
                Value::Text("code".into()),
            ]),
            sequence_index: seq,
        }
    }

    fn update_record(seq: usize) -> ChangeRecord {
        ChangeRecord {
            table: element_schema(),
            op: RecordOp::Update,
            indirect: false,
            old_values: Some(vec![
                Value::Integer(0x20000000004),
                Value::Undefined,
                Value::Text("before".into()),
            ]),
            new_values: Some(vec![
                Value::Undefined,
                Value::Undefined,
                Value::Text("after".into()),
            ]),
            sequence_index: seq,
        }
    }

    fn adaptor_over<'m>(
        records: Vec<ChangeRecord>,
        mapper: &'m SchemaMapper,
    ) -> InstanceAdaptor<'m> {
        let reader = ChangesetReader::from_parts(records, false, 1, Vec::new(), Vec::new());
        InstanceAdaptor::new(reader, mapper)
    }

    #[test]
    fn test_insert_yields_one_new_stage_fragment() {
        let mapper = fixture_mapper();
        let mut adaptor = adaptor_over(vec![insert_record(0)], &mapper);

        assert!(adaptor.step());
        let fragments = adaptor.fragments();
        assert_eq!(fragments.len(), 1);
        let fragment = &fragments[0];
        assert_eq!(fragment.instance_id, "0x20000000004");
        assert_eq!(fragment.class, ResolvedClass::Known(ClassId(1)));
        assert_eq!(fragment.meta.stage, Stage::New);
        assert_eq!(fragment.meta.class_full_name, "BisCore:Element");
        assert_eq!(fragment.meta.tables, vec!["bis_Element".to_string()]);
        assert_eq!(fragment.meta.change_indexes, vec![0]);
        assert_eq!(
            fragment.properties.get("CodeValue"),
            Some(&Value::Text("code".into()))
        );
        // The id and class-id columns never appear as properties.
        assert!(!fragment.properties.contains_key("Id"));
        assert!(!fragment.properties.contains_key("ECClassId"));

        assert!(!adaptor.step());
        assert!(adaptor.fragments().is_empty());
    }

    #[test]
    fn test_update_yields_old_and_new_stage_views() {
        let mapper = fixture_mapper();
        let mut adaptor = adaptor_over(vec![update_record(0)], &mapper);

        assert!(adaptor.step());
        let fragments = adaptor.fragments();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].meta.stage, Stage::Old);
        assert_eq!(fragments[1].meta.stage, Stage::New);
        assert_eq!(fragments[0].instance_id, fragments[1].instance_id);
        assert_eq!(
            fragments[0].properties.get("CodeValue"),
            Some(&Value::Text("before".into()))
        );
        assert_eq!(
            fragments[1].properties.get("CodeValue"),
            Some(&Value::Text("after".into()))
        );
        assert_eq!(adaptor.op(), Some(RecordOp::Update));
        assert_eq!(adaptor.deleted(), Some(&fragments[0]));
        assert_eq!(adaptor.inserted(), Some(&fragments[1]));
    }

    #[test]
    fn test_insert_has_no_deleted_view() {
        let mapper = fixture_mapper();
        let mut adaptor = adaptor_over(vec![insert_record(0)], &mapper);

        assert!(adaptor.step());
        assert_eq!(adaptor.op(), Some(RecordOp::Insert));
        assert!(adaptor.inserted().is_some());
        assert!(adaptor.deleted().is_none());
    }

    #[test]
    fn test_accept_op_filters_records() {
        let mapper = fixture_mapper();
        let mut adaptor =
            adaptor_over(vec![insert_record(0), update_record(1)], &mapper)
                .accept_op(RecordOp::Update);

        assert!(adaptor.step());
        assert!(adaptor.fragments().is_empty());
        assert!(adaptor.step());
        assert_eq!(adaptor.fragments().len(), 2);
    }

    #[test]
    fn test_unmapped_table_yields_no_fragments() {
        let mapper = fixture_mapper();
        let record = ChangeRecord {
            table: Arc::new(TableSchema::new("sqlite_stat1".into(), 1, vec![1])),
            op: RecordOp::Insert,
            indirect: false,
            old_values: None,
            new_values: Some(vec![Value::Integer(1)]),
            sequence_index: 0,
        };
        let mut adaptor = adaptor_over(vec![record], &mapper);
        assert!(adaptor.step());
        assert!(adaptor.fragments().is_empty());
    }

    #[test]
    fn test_unknown_accept_class_errors() {
        let mapper = fixture_mapper();
        let result = adaptor_over(Vec::new(), &mapper).accept_class("No:Such");
        assert!(matches!(result, Err(Error::UnknownClass(_))));
    }
}
