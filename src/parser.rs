//! Parser and serializer for the changeset binary format.
//!
//! The format consists of one or more table sections:
//!
//! ```text
//! Table Header:
//! ├── Marker: 'T' (0x54)
//! ├── Column count (1 byte)
//! ├── PK flags (1 byte per column: ordinal in the composite PK, 0 = not PK)
//! └── Table name (null-terminated UTF-8)
//!
//! Change Records (repeated):
//! ├── Operation code: INSERT=0x12, DELETE=0x09, UPDATE=0x17
//! ├── Indirect flag (1 byte)
//! └── Values (encoded per operation type)
//! ```
//!
//! Parsing turns the whole payload into a sequential [`ChangeRecord`] stream
//! in file order; [`encode_records`] is the exact inverse for a record
//! sequence whose tables are contiguous.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::encoding::constants::{markers, op_codes};
use crate::encoding::{Value, decode_value, encode_value};

/// Errors that can occur during parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Unexpected end of input.
    #[error("Unexpected end of input at position {0}")]
    UnexpectedEof(usize),

    /// Invalid table marker (expected 'T').
    #[error("Invalid table marker 0x{0:02x} at position {1}")]
    InvalidTableMarker(u8, usize),

    /// A patchset table marker; patchsets carry no old values and cannot be
    /// unified or inverted.
    #[error("Patchset data is not supported (marker at position {0})")]
    PatchsetNotSupported(usize),

    /// Invalid operation code.
    #[error("Invalid operation code 0x{0:02x} at position {1}")]
    InvalidOpCode(u8, usize),

    /// Invalid UTF-8 in table name.
    #[error("Invalid UTF-8 in table name at position {0}")]
    InvalidTableName(usize),

    /// Failed to decode a value.
    #[error("Failed to decode value at position {0}")]
    InvalidValue(usize),

    /// Table name not null-terminated.
    #[error("Table name not null-terminated")]
    UnterminatedTableName,

    /// Invalid changeset file envelope.
    #[error("Invalid changeset file envelope: {0}")]
    InvalidEnvelope(&'static str),
}

/// The kind of row operation a change record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordOp {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl RecordOp {
    /// Format-level operation code.
    #[must_use]
    pub(crate) fn op_code(self) -> u8 {
        match self {
            RecordOp::Insert => op_codes::INSERT,
            RecordOp::Update => op_codes::UPDATE,
            RecordOp::Delete => op_codes::DELETE,
        }
    }

    /// SQL verb, for diagnostics and health stats.
    #[must_use]
    pub fn sql_verb(self) -> &'static str {
        match self {
            RecordOp::Insert => "INSERT",
            RecordOp::Update => "UPDATE",
            RecordOp::Delete => "DELETE",
        }
    }
}

/// A table schema parsed from binary changeset data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSchema {
    /// The table name.
    pub name: String,
    /// Number of columns.
    pub column_count: usize,
    /// Primary key flags, raw bytes from the changeset.
    ///
    /// Each byte is the 1-based ordinal position in the composite PK, or 0
    /// if the column is not part of the primary key.
    pub pk_flags: Vec<u8>,
}

impl TableSchema {
    /// Create a new table schema.
    #[must_use]
    pub fn new(name: String, column_count: usize, pk_flags: Vec<u8>) -> Self {
        debug_assert_eq!(pk_flags.len(), column_count);
        Self {
            name,
            column_count,
            pk_flags,
        }
    }

    /// Get the indices of primary key columns, in PK order.
    #[must_use]
    pub fn pk_indices(&self) -> Vec<usize> {
        let mut pk_cols: Vec<(usize, u8)> = self
            .pk_flags
            .iter()
            .enumerate()
            .filter_map(|(i, &ord)| if ord > 0 { Some((i, ord)) } else { None })
            .collect();
        pk_cols.sort_by_key(|(_, ordinal)| *ordinal);
        pk_cols.into_iter().map(|(idx, _)| idx).collect()
    }

    /// Extract the primary key values from a full row, in PK order.
    #[must_use]
    pub fn extract_pk(&self, values: &[Value]) -> Vec<Value> {
        self.pk_indices()
            .into_iter()
            .map(|i| values.get(i).cloned().unwrap_or(Value::Undefined))
            .collect()
    }
}

/// One raw per-table change, in file order. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub(crate) table: Arc<TableSchema>,
    pub(crate) op: RecordOp,
    pub(crate) indirect: bool,
    pub(crate) old_values: Option<Vec<Value>>,
    pub(crate) new_values: Option<Vec<Value>>,
    pub(crate) sequence_index: usize,
}

impl ChangeRecord {
    /// The schema of the table this record changes.
    #[must_use]
    pub fn table(&self) -> &TableSchema {
        &self.table
    }

    /// The operation kind.
    #[must_use]
    pub fn op(&self) -> RecordOp {
        self.op
    }

    /// Whether the change was made indirectly (trigger or foreign key action).
    #[must_use]
    pub fn indirect(&self) -> bool {
        self.indirect
    }

    /// Pre-change column values; present for Update and Delete.
    #[must_use]
    pub fn old_values(&self) -> Option<&[Value]> {
        self.old_values.as_deref()
    }

    /// Post-change column values; present for Insert and Update.
    #[must_use]
    pub fn new_values(&self) -> Option<&[Value]> {
        self.new_values.as_deref()
    }

    /// Position of this record in its source stream.
    #[must_use]
    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    /// The primary key of the changed row, taken from the side that always
    /// carries it (old values for Update/Delete, new values for Insert).
    #[must_use]
    pub fn primary_key(&self) -> Vec<Value> {
        let values = match self.op {
            RecordOp::Insert => self.new_values.as_deref(),
            RecordOp::Update | RecordOp::Delete => self.old_values.as_deref(),
        };
        values
            .map(|v| self.table.extract_pk(v))
            .unwrap_or_default()
    }

    /// The record-wise inverse: Insert and Delete swap payload roles, Update
    /// exchanges its old and new images while keeping the primary key on the
    /// old side (an update's new image leaves key columns undefined, so a
    /// plain swap would lose the key).
    #[must_use]
    pub fn inverted(&self) -> ChangeRecord {
        let (op, old_values, new_values) = match self.op {
            RecordOp::Insert => (RecordOp::Delete, self.new_values.clone(), None),
            RecordOp::Delete => (RecordOp::Insert, None, self.old_values.clone()),
            RecordOp::Update => {
                let (old, new) = invert_update_images(
                    &self.table.pk_flags,
                    self.old_values.as_deref().unwrap_or_default(),
                    self.new_values.as_deref().unwrap_or_default(),
                );
                (RecordOp::Update, Some(old), Some(new))
            }
        };
        ChangeRecord {
            table: Arc::clone(&self.table),
            op,
            indirect: self.indirect,
            old_values,
            new_values,
            sequence_index: self.sequence_index,
        }
    }
}

/// Build the old and new images of an inverted update.
///
/// The old image keeps the primary key and takes the remaining values from
/// the original new image; the new image is the original old image with
/// primary-key columns left undefined, matching `sqlite3changeset_invert`.
pub(crate) fn invert_update_images(
    pk_flags: &[u8],
    old: &[Value],
    new: &[Value],
) -> (Vec<Value>, Vec<Value>) {
    let count = old.len().max(new.len());
    let mut inverted_old = Vec::with_capacity(count);
    let mut inverted_new = Vec::with_capacity(count);
    for i in 0..count {
        if pk_flags.get(i).copied().unwrap_or(0) > 0 {
            inverted_old.push(old.get(i).cloned().unwrap_or(Value::Undefined));
            inverted_new.push(Value::Undefined);
        } else {
            inverted_old.push(new.get(i).cloned().unwrap_or(Value::Undefined));
            inverted_new.push(old.get(i).cloned().unwrap_or(Value::Undefined));
        }
    }
    (inverted_old, inverted_new)
}

/// Parse a raw changeset payload into a record stream.
///
/// `base_sequence` is the sequence index assigned to the first record; group
/// sources pass a running offset so indexes stay unique across files.
///
/// # Errors
///
/// Returns a [`ParseError`] if the data is malformed.
pub(crate) fn parse_changeset(
    data: &[u8],
    base_sequence: usize,
) -> Result<Vec<ChangeRecord>, ParseError> {
    let mut records = Vec::new();
    let mut pos = 0;
    let mut sequence = base_sequence;

    while pos < data.len() {
        let (schema, header_len) = parse_table_header(&data[pos..], pos)?;
        pos += header_len;
        let schema = Arc::new(schema);

        while pos < data.len() {
            let byte = data[pos];
            if byte == markers::CHANGESET || byte == markers::PATCHSET {
                break;
            }
            let (record, op_len) = parse_operation(&data[pos..], pos, &schema, sequence)?;
            records.push(record);
            sequence += 1;
            pos += op_len;
        }
    }

    Ok(records)
}

/// Parse a table header and return the schema.
fn parse_table_header(data: &[u8], base_pos: usize) -> Result<(TableSchema, usize), ParseError> {
    let mut pos = 0;

    if data.is_empty() {
        return Err(ParseError::UnexpectedEof(base_pos));
    }
    match data[pos] {
        markers::CHANGESET => {}
        markers::PATCHSET => return Err(ParseError::PatchsetNotSupported(base_pos)),
        b => return Err(ParseError::InvalidTableMarker(b, base_pos + pos)),
    }
    pos += 1;

    if pos >= data.len() {
        return Err(ParseError::UnexpectedEof(base_pos + pos));
    }
    let column_count = data[pos] as usize;
    pos += 1;

    if pos + column_count > data.len() {
        return Err(ParseError::UnexpectedEof(base_pos + pos));
    }
    let pk_flags: Vec<u8> = data[pos..pos + column_count].to_vec();
    pos += column_count;

    let name_start = pos;
    while pos < data.len() && data[pos] != 0 {
        pos += 1;
    }
    if pos >= data.len() {
        return Err(ParseError::UnterminatedTableName);
    }
    let name = String::from_utf8(data[name_start..pos].to_vec())
        .map_err(|_| ParseError::InvalidTableName(base_pos + name_start))?;
    pos += 1;

    Ok((TableSchema::new(name, column_count, pk_flags), pos))
}

/// Parse one change entry.
fn parse_operation(
    data: &[u8],
    base_pos: usize,
    schema: &Arc<TableSchema>,
    sequence_index: usize,
) -> Result<(ChangeRecord, usize), ParseError> {
    if data.len() < 2 {
        return Err(ParseError::UnexpectedEof(base_pos));
    }
    let op_code = data[0];
    let indirect = data[1] != 0;
    let mut pos = 2;

    let (op, old_values, new_values) = match op_code {
        op_codes::INSERT => {
            let (values, len) = parse_values(&data[pos..], base_pos + pos, schema.column_count)?;
            pos += len;
            (RecordOp::Insert, None, Some(values))
        }
        op_codes::DELETE => {
            let (values, len) = parse_values(&data[pos..], base_pos + pos, schema.column_count)?;
            pos += len;
            (RecordOp::Delete, Some(values), None)
        }
        op_codes::UPDATE => {
            let (old, old_len) = parse_values(&data[pos..], base_pos + pos, schema.column_count)?;
            pos += old_len;
            let (new, new_len) = parse_values(&data[pos..], base_pos + pos, schema.column_count)?;
            pos += new_len;
            (RecordOp::Update, Some(old), Some(new))
        }
        _ => return Err(ParseError::InvalidOpCode(op_code, base_pos)),
    };

    Ok((
        ChangeRecord {
            table: Arc::clone(schema),
            op,
            indirect,
            old_values,
            new_values,
            sequence_index,
        },
        pos,
    ))
}

/// Parse a sequence of values.
fn parse_values(
    data: &[u8],
    base_pos: usize,
    count: usize,
) -> Result<(Vec<Value>, usize), ParseError> {
    let mut values = Vec::with_capacity(count);
    let mut pos = 0;

    for _ in 0..count {
        let (value, value_len) =
            decode_value(&data[pos..]).ok_or(ParseError::InvalidValue(base_pos + pos))?;
        values.push(value);
        pos += value_len;
    }

    Ok((values, pos))
}

/// Serialize a record stream back into the binary payload.
///
/// A table header is written whenever the table changes from the previous
/// record, so a stream whose tables are contiguous serializes with one
/// header per table.
#[must_use]
pub(crate) fn encode_records(records: &[ChangeRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut current_table: Option<&TableSchema> = None;

    for record in records {
        if current_table != Some(record.table()) {
            write_table_header(&mut out, record.table());
            current_table = Some(record.table());
        }

        out.push(record.op.op_code());
        out.push(u8::from(record.indirect));
        match record.op {
            RecordOp::Insert => {
                for value in record.new_values.as_deref().unwrap_or_default() {
                    encode_value(&mut out, value);
                }
            }
            RecordOp::Delete => {
                for value in record.old_values.as_deref().unwrap_or_default() {
                    encode_value(&mut out, value);
                }
            }
            RecordOp::Update => {
                for value in record.old_values.as_deref().unwrap_or_default() {
                    encode_value(&mut out, value);
                }
                for value in record.new_values.as_deref().unwrap_or_default() {
                    encode_value(&mut out, value);
                }
            }
        }
    }

    out
}

/// Write a table header to the output buffer.
fn write_table_header(out: &mut Vec<u8>, table: &TableSchema) {
    out.push(markers::CHANGESET);
    out.push(u8::try_from(table.column_count).unwrap_or(u8::MAX));
    out.extend(&table.pk_flags);
    out.extend(table.name.as_bytes());
    out.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_insert_bytes() -> Vec<u8> {
        // 'T', 2 columns, pk_flags [1, 0], table name "t\0"
        let mut data = vec![b'T', 2, 1, 0, b't', 0];
        data.push(op_codes::INSERT);
        data.push(0);
        data.push(0x01);
        data.extend(&1i64.to_be_bytes());
        data.push(0x03);
        data.push(1);
        data.push(b'a');
        data
    }

    #[test]
    fn test_parse_empty() {
        let records = parse_changeset(&[], 0).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_table_header() {
        let data = [b'T', 2, 1, 0, b't', 0];
        let (schema, len) = parse_table_header(&data, 0).unwrap();

        assert_eq!(schema.column_count, 2);
        assert_eq!(schema.pk_flags, vec![1, 0]);
        assert_eq!(schema.name, "t");
        assert_eq!(len, 6);
    }

    #[test]
    fn test_parse_insert() {
        let records = parse_changeset(&sample_insert_bytes(), 0).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.op(), RecordOp::Insert);
        assert_eq!(record.table().name, "t");
        assert_eq!(
            record.new_values().unwrap(),
            &[Value::Integer(1), Value::Text("a".into())]
        );
        assert!(record.old_values().is_none());
        assert_eq!(record.primary_key(), vec![Value::Integer(1)]);
    }

    #[test]
    fn test_parse_update_has_both_sides() {
        let mut data = vec![b'T', 2, 1, 0, b't', 0];
        data.push(op_codes::UPDATE);
        data.push(0);
        // Old: integer 1, text "a"
        data.push(0x01);
        data.extend(&1i64.to_be_bytes());
        data.push(0x03);
        data.push(1);
        data.push(b'a');
        // New: undefined pk, text "b"
        data.push(0x00);
        data.push(0x03);
        data.push(1);
        data.push(b'b');

        let records = parse_changeset(&data, 7).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.op(), RecordOp::Update);
        assert_eq!(record.sequence_index(), 7);
        assert_eq!(record.old_values().unwrap()[1], Value::Text("a".into()));
        assert_eq!(record.new_values().unwrap()[1], Value::Text("b".into()));
        assert_eq!(record.primary_key(), vec![Value::Integer(1)]);
    }

    #[test]
    fn test_patchset_marker_rejected() {
        let data = vec![b'P', 1, 1, b't', 0];
        let err = parse_changeset(&data, 0).unwrap_err();
        assert_eq!(err, ParseError::PatchsetNotSupported(0));
    }

    #[test]
    fn test_invalid_marker_rejected() {
        let err = parse_changeset(&[0x42], 0).unwrap_err();
        assert_eq!(err, ParseError::InvalidTableMarker(0x42, 0));
    }

    #[test]
    fn test_truncated_value_rejected() {
        let mut data = vec![b'T', 1, 1, b't', 0];
        data.push(op_codes::INSERT);
        data.push(0);
        data.push(0x01); // integer marker with no payload
        assert!(matches!(
            parse_changeset(&data, 0),
            Err(ParseError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_encode_roundtrip() {
        let data = sample_insert_bytes();
        let records = parse_changeset(&data, 0).unwrap();
        let encoded = encode_records(&records);
        assert_eq!(encoded, data);
    }

    #[test]
    fn test_inverted_record() {
        let records = parse_changeset(&sample_insert_bytes(), 0).unwrap();
        let inverse = records[0].inverted();
        assert_eq!(inverse.op(), RecordOp::Delete);
        assert_eq!(
            inverse.old_values().unwrap(),
            records[0].new_values().unwrap()
        );
        assert!(inverse.new_values().is_none());
    }

    #[test]
    fn test_inverted_update_keeps_key_on_old_side() {
        let schema = Arc::new(TableSchema::new("t".into(), 2, vec![1, 0]));
        let record = ChangeRecord {
            table: schema,
            op: RecordOp::Update,
            indirect: false,
            old_values: Some(vec![Value::Integer(1), Value::Text("a".into())]),
            new_values: Some(vec![Value::Undefined, Value::Text("b".into())]),
            sequence_index: 0,
        };

        let inverse = record.inverted();
        assert_eq!(
            inverse.old_values().unwrap(),
            &[Value::Integer(1), Value::Text("b".into())]
        );
        assert_eq!(
            inverse.new_values().unwrap(),
            &[Value::Undefined, Value::Text("a".into())]
        );
        assert_eq!(inverse.primary_key(), vec![Value::Integer(1)]);
        // Inverting twice yields the original record.
        assert_eq!(inverse.inverted(), record);
    }
}
