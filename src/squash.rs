//! Squashing an ordered sequence of changesets into their net effect.
//!
//! [`GroupSet`] consumes per-row operations in timeline order and keeps the
//! net operation per `(table, primary key)` under the composition algebra
//! below (left operand earlier in time):
//!
//! | earlier \ later | Insert  | Update | Delete |
//! |-----------------|---------|--------|--------|
//! | Insert          | invalid | Insert | cancel |
//! | Update          | invalid | Update | Delete |
//! | Delete          | Update  | invalid | invalid |
//!
//! A cancelled row disappears from the net result entirely. Invalid
//! combinations drop the offending row with a surfaced warning instead of
//! aborting the squash, since upstream guarantees normally prevent them.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::encoding::Value;
use crate::parser::{ChangeRecord, RecordOp, TableSchema};

/// Trait for inverting a change into the change that undoes it.
pub trait Reverse {
    /// The inverse of this change.
    type Output;

    /// Returns the inverse of this change.
    fn reverse(self) -> Self::Output;
}

/// The net operation for one row after squashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetChange {
    /// The row exists only after the range.
    Insert {
        /// Full row values after the range.
        new: Vec<Value>,
    },
    /// The row exists on both sides with different values.
    Update {
        /// Values before the range (changed columns defined).
        old: Vec<Value>,
        /// Values after the range (changed columns defined).
        new: Vec<Value>,
    },
    /// The row exists only before the range.
    Delete {
        /// Full row values before the range.
        old: Vec<Value>,
    },
}

impl NetChange {
    /// The record-level operation kind of this net change.
    #[must_use]
    pub fn op(&self) -> RecordOp {
        match self {
            NetChange::Insert { .. } => RecordOp::Insert,
            NetChange::Update { .. } => RecordOp::Update,
            NetChange::Delete { .. } => RecordOp::Delete,
        }
    }

    fn from_record(record: &ChangeRecord) -> NetChange {
        match record.op() {
            RecordOp::Insert => NetChange::Insert {
                new: record.new_values().unwrap_or_default().to_vec(),
            },
            RecordOp::Update => NetChange::Update {
                old: record.old_values().unwrap_or_default().to_vec(),
                new: record.new_values().unwrap_or_default().to_vec(),
            },
            RecordOp::Delete => NetChange::Delete {
                old: record.old_values().unwrap_or_default().to_vec(),
            },
        }
    }

    /// The side of the change that carries the row's primary key.
    fn keying_values(&self) -> &[Value] {
        match self {
            NetChange::Insert { new } => new,
            NetChange::Update { old, .. } | NetChange::Delete { old } => old,
        }
    }

    /// The net change that undoes this one. Takes the table schema because
    /// an update's new image leaves primary-key columns undefined, so the
    /// inverse must rebuild both images around the key rather than swap
    /// them wholesale.
    #[must_use]
    pub fn reverse_with(self, table: &TableSchema) -> NetChange {
        match self {
            NetChange::Insert { new } => NetChange::Delete { old: new },
            NetChange::Delete { old } => NetChange::Insert { new: old },
            NetChange::Update { old, new } => {
                let (old, new) = crate::parser::invert_update_images(&table.pk_flags, &old, &new);
                NetChange::Update { old, new }
            }
        }
    }
}

/// Per column, take the first side when defined, else the second.
fn prefer(primary: &[Value], secondary: &[Value]) -> Vec<Value> {
    let len = primary.len().max(secondary.len());
    (0..len)
        .map(|i| {
            let first = primary.get(i).unwrap_or(&Value::Undefined);
            if first.is_undefined() {
                secondary.get(i).cloned().unwrap_or(Value::Undefined)
            } else {
                first.clone()
            }
        })
        .collect()
}

/// Compose two operations on the same row, earlier first.
///
/// `Ok(None)` means the row cancels out entirely. `Err` carries the pair of
/// operation kinds of an invalid combination.
fn compose(earlier: NetChange, later: NetChange) -> Result<Option<NetChange>, (RecordOp, RecordOp)> {
    match (earlier, later) {
        (NetChange::Insert { new }, NetChange::Update { new: n2, .. }) => {
            Ok(Some(NetChange::Insert {
                new: prefer(&n2, &new),
            }))
        }
        (NetChange::Insert { .. }, NetChange::Delete { .. }) => Ok(None),
        (NetChange::Update { old, new }, NetChange::Update { old: o2, new: n2 }) => {
            Ok(Some(NetChange::Update {
                old: prefer(&old, &o2),
                new: prefer(&n2, &new),
            }))
        }
        (NetChange::Update { old, .. }, NetChange::Delete { old: d }) => {
            Ok(Some(NetChange::Delete {
                old: prefer(&old, &d),
            }))
        }
        (NetChange::Delete { old }, NetChange::Insert { new }) => {
            // Row resurrected: the group's net view is an update from the
            // pre-delete image to the re-inserted one.
            Ok(Some(NetChange::Update { old, new }))
        }
        (earlier, later) => Err((earlier.op(), later.op())),
    }
}

/// One row dropped from the net result because its operation sequence was
/// invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSequence {
    /// Table of the offending row.
    pub table: String,
    /// Primary key of the offending row.
    pub primary_key: Vec<Value>,
    /// Operation already held for the row.
    pub earlier: RecordOp,
    /// Operation that arrived on top of it.
    pub later: RecordOp,
}

struct TableGroup {
    schema: Arc<TableSchema>,
    rows: IndexMap<Vec<Value>, NetChange>,
}

/// The net effect of an ordered sequence of change records.
#[derive(Default)]
pub struct GroupSet {
    tables: IndexMap<String, TableGroup>,
    dropped: Vec<InvalidSequence>,
}

impl GroupSet {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one record into the net result. Records must arrive in timeline
    /// order; grouping is order-sensitive.
    pub fn push_record(&mut self, record: &ChangeRecord) {
        let group = self
            .tables
            .entry(record.table().name.clone())
            .or_insert_with(|| TableGroup {
                schema: Arc::clone(&record.table),
                rows: IndexMap::new(),
            });

        let net = NetChange::from_record(record);
        let key = record.primary_key();

        match group.rows.shift_remove_full(&key) {
            None => {
                group.rows.insert(key, net);
            }
            Some((original_index, _key, existing)) => {
                match compose(existing, net) {
                    Ok(Some(combined)) => {
                        // An Insert absorbed into an Update may have moved the
                        // primary key; re-key and evict any row it collides
                        // with, keeping the original position.
                        let new_key = group.schema.extract_pk(combined.keying_values());
                        group.rows.shift_remove(&new_key);
                        let index = original_index.min(group.rows.len());
                        group.rows.shift_insert(index, new_key, combined);
                    }
                    Ok(None) => {
                        // Insert + Delete: the row never existed from the
                        // group's perspective.
                    }
                    Err((earlier, later)) => {
                        tracing::warn!(
                            table = %record.table().name,
                            ?key,
                            earlier = earlier.sql_verb(),
                            later = later.sql_verb(),
                            "invalid operation sequence, dropping row from net result"
                        );
                        self.dropped.push(InvalidSequence {
                            table: record.table().name.clone(),
                            primary_key: key,
                            earlier,
                            later,
                        });
                    }
                }
            }
        }
    }

    /// Number of rows in the net result.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.values().map(|g| g.rows.len()).sum()
    }

    /// Whether the net result is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|g| g.rows.is_empty())
    }

    /// Rows dropped because of invalid operation sequences.
    #[must_use]
    pub fn dropped_rows(&self) -> &[InvalidSequence] {
        &self.dropped
    }

    /// Flatten the net result back into a record stream, re-sequenced from
    /// zero, tables in first-touch order.
    #[must_use]
    pub fn into_records(self) -> (Vec<ChangeRecord>, Vec<InvalidSequence>) {
        let mut records = Vec::new();
        let mut sequence = 0;

        for group in self.tables.into_values() {
            for (_key, net) in group.rows {
                let (op, old_values, new_values) = match net {
                    NetChange::Insert { new } => (RecordOp::Insert, None, Some(new)),
                    NetChange::Update { old, new } => (RecordOp::Update, Some(old), Some(new)),
                    NetChange::Delete { old } => (RecordOp::Delete, Some(old), None),
                };
                records.push(ChangeRecord {
                    table: Arc::clone(&group.schema),
                    op,
                    indirect: false,
                    old_values,
                    new_values,
                    sequence_index: sequence,
                });
                sequence += 1;
            }
        }

        (records, self.dropped)
    }
}

impl Reverse for GroupSet {
    type Output = GroupSet;

    fn reverse(self) -> GroupSet {
        GroupSet {
            tables: self
                .tables
                .into_iter()
                .map(|(name, group)| {
                    let TableGroup { schema, rows } = group;
                    let rows = rows
                        .into_iter()
                        .map(|(pk, net)| (pk, net.reverse_with(&schema)))
                        .collect();
                    (name, TableGroup { schema, rows })
                })
                .collect(),
            dropped: self.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new("t".into(), 2, vec![1, 0]))
    }

    fn insert(schema: &Arc<TableSchema>, seq: usize, id: i64, s: &str) -> ChangeRecord {
        ChangeRecord {
            table: Arc::clone(schema),
            op: RecordOp::Insert,
            indirect: false,
            old_values: None,
            new_values: Some(vec![Value::Integer(id), Value::Text(s.into())]),
            sequence_index: seq,
        }
    }

    fn update(schema: &Arc<TableSchema>, seq: usize, id: i64, from: &str, to: &str) -> ChangeRecord {
        ChangeRecord {
            table: Arc::clone(schema),
            op: RecordOp::Update,
            indirect: false,
            old_values: Some(vec![Value::Integer(id), Value::Text(from.into())]),
            new_values: Some(vec![Value::Undefined, Value::Text(to.into())]),
            sequence_index: seq,
        }
    }

    fn delete(schema: &Arc<TableSchema>, seq: usize, id: i64, s: &str) -> ChangeRecord {
        ChangeRecord {
            table: Arc::clone(schema),
            op: RecordOp::Delete,
            indirect: false,
            old_values: Some(vec![Value::Integer(id), Value::Text(s.into())]),
            new_values: None,
            sequence_index: seq,
        }
    }

    #[test]
    fn test_insert_update_delete_cancels() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&insert(&schema, 0, 1, "a"));
        group.push_record(&update(&schema, 1, 1, "a", "updated property"));
        group.push_record(&delete(&schema, 2, 1, "updated property"));

        assert!(group.is_empty());
        assert!(group.dropped_rows().is_empty());
    }

    #[test]
    fn test_insert_then_update_squashes_to_insert() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&insert(&schema, 0, 1, "a"));
        group.push_record(&update(&schema, 1, 1, "a", "b"));

        let (records, dropped) = group.into_records();
        assert!(dropped.is_empty());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op(), RecordOp::Insert);
        assert_eq!(
            records[0].new_values().unwrap(),
            &[Value::Integer(1), Value::Text("b".into())]
        );
    }

    #[test]
    fn test_update_update_merges_ends() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&update(&schema, 0, 1, "a", "b"));
        group.push_record(&update(&schema, 1, 1, "b", "c"));

        let (records, _) = group.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op(), RecordOp::Update);
        assert_eq!(records[0].old_values().unwrap()[1], Value::Text("a".into()));
        assert_eq!(records[0].new_values().unwrap()[1], Value::Text("c".into()));
    }

    #[test]
    fn test_update_then_delete_keeps_first_old() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&update(&schema, 0, 1, "a", "b"));
        group.push_record(&delete(&schema, 1, 1, "b"));

        let (records, _) = group.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op(), RecordOp::Delete);
        assert_eq!(records[0].old_values().unwrap()[1], Value::Text("a".into()));
    }

    #[test]
    fn test_delete_then_insert_resurrects_as_update() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&delete(&schema, 0, 1, "a"));
        group.push_record(&insert(&schema, 1, 1, "b"));

        let (records, _) = group.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].op(), RecordOp::Update);
        assert_eq!(records[0].old_values().unwrap()[1], Value::Text("a".into()));
        assert_eq!(records[0].new_values().unwrap()[1], Value::Text("b".into()));
    }

    #[test]
    fn test_double_insert_drops_row_with_warning() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&insert(&schema, 0, 1, "a"));
        group.push_record(&insert(&schema, 1, 1, "b"));

        assert!(group.is_empty());
        assert_eq!(group.dropped_rows().len(), 1);
        let dropped = &group.dropped_rows()[0];
        assert_eq!(dropped.earlier, RecordOp::Insert);
        assert_eq!(dropped.later, RecordOp::Insert);
        assert_eq!(dropped.primary_key, vec![Value::Integer(1)]);
    }

    #[test]
    fn test_delete_then_update_drops_row() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&delete(&schema, 0, 1, "a"));
        group.push_record(&update(&schema, 1, 1, "a", "b"));

        assert!(group.is_empty());
        assert_eq!(group.dropped_rows().len(), 1);
    }

    #[test]
    fn test_unrelated_rows_keep_their_own_net() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&insert(&schema, 0, 1, "a"));
        group.push_record(&insert(&schema, 1, 2, "b"));
        group.push_record(&delete(&schema, 2, 1, "a"));

        let (records, _) = group.into_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].primary_key(), vec![Value::Integer(2)]);
    }

    #[test]
    fn test_reverse_net_changes() {
        let schema = schema();
        let reversed = NetChange::Insert {
            new: vec![Value::Integer(1), Value::Text("a".into())],
        }
        .reverse_with(&schema);
        assert_eq!(
            reversed,
            NetChange::Delete {
                old: vec![Value::Integer(1), Value::Text("a".into())]
            }
        );

        // The update's new image has no key; the inverse rebuilds both
        // images around it.
        let reversed = NetChange::Update {
            old: vec![Value::Integer(1), Value::Text("a".into())],
            new: vec![Value::Undefined, Value::Text("b".into())],
        }
        .reverse_with(&schema);
        assert_eq!(
            reversed,
            NetChange::Update {
                old: vec![Value::Integer(1), Value::Text("b".into())],
                new: vec![Value::Undefined, Value::Text("a".into())],
            }
        );
    }

    #[test]
    fn test_reverse_group_inverts_every_row() {
        let schema = schema();
        let mut group = GroupSet::new();
        group.push_record(&insert(&schema, 0, 1, "a"));
        group.push_record(&update(&schema, 1, 2, "x", "y"));

        let (records, _) = group.reverse().into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op(), RecordOp::Delete);
        assert_eq!(records[1].op(), RecordOp::Update);
        assert_eq!(records[1].old_values().unwrap()[1], Value::Text("y".into()));
    }
}
