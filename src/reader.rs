//! Sequential reader over raw changeset sources.
//!
//! A [`ChangesetReader`] is opened over a single changeset file, the
//! briefcase's uncommitted local changes, or an ordered group of files. It
//! yields one [`ChangeRecord`] per [`step`](ChangesetReader::step) in file
//! order; in group mode the caller-supplied file order is the timeline
//! order and the reader exposes the squashed net content of the whole
//! group.
//!
//! On disk a changeset is the raw binary payload behind a small fixed
//! envelope carrying the metadata that does not live in the payload
//! grammar: a schema-changes flag and the schema generation the changeset
//! was recorded against.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::briefcase::{Briefcase, ChangeTracker};
use crate::encoding::Value;
use crate::errors::{Error, Result};
use crate::parser::{self, ChangeRecord, ParseError, RecordOp};
use crate::squash::{GroupSet, InvalidSequence};

const MAGIC: [u8; 4] = *b"ECCS";
const FORMAT_VERSION: u8 = 1;
const FLAG_SCHEMA_CHANGES: u8 = 0x01;
const ENVELOPE_LEN: usize = 10;

/// Options controlling how changeset sources are opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    /// Skip the schema-generation compatibility check. Intentional escape
    /// hatch for tooling that inspects historical changesets against a
    /// newer schema.
    pub disable_schema_check: bool,
}

/// Sequential reader over one or more changeset sources.
#[derive(Debug)]
pub struct ChangesetReader {
    records: Vec<ChangeRecord>,
    current: Option<usize>,
    next: usize,
    contains_schema_changes: bool,
    schema_generation: u32,
    dropped: Vec<InvalidSequence>,
    /// Source file handles, held exclusively for the reader's lifetime.
    _sources: Vec<File>,
}

impl ChangesetReader {
    /// Open a single changeset file against a briefcase.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] when the file cannot be read, [`Error::CorruptChangeset`]
    /// on grammar violations, [`Error::SchemaMismatch`] when the recorded
    /// schema generation differs from the briefcase's (unless disabled).
    pub fn open_file(
        path: &Path,
        briefcase: &Briefcase,
        options: &ReaderOptions,
    ) -> Result<Self> {
        let (file, flags, generation, payload) = read_changeset_file(path)?;
        check_generation(generation, briefcase, options)?;
        let records = parser::parse_changeset(&payload, 0)?;
        Ok(Self::from_parts(
            records,
            flags & FLAG_SCHEMA_CHANGES != 0,
            generation,
            Vec::new(),
            vec![file],
        ))
    }

    /// Open the briefcase's uncommitted local changes captured by a
    /// [`ChangeTracker`].
    ///
    /// # Errors
    ///
    /// [`Error::Sqlite`] when the session cannot produce its changeset,
    /// [`Error::CorruptChangeset`] on grammar violations.
    pub fn open_local_changes(tracker: &mut ChangeTracker<'_>) -> Result<Self> {
        let generation = tracker.generation();
        let payload = tracker.changeset_bytes()?;
        let records = parser::parse_changeset(&payload, 0)?;
        Ok(Self::from_parts(records, false, generation, Vec::new(), Vec::new()))
    }

    /// Open an ordered group of changeset files and squash them into their
    /// net content. Grouping is order-sensitive: files are processed
    /// strictly in the caller-supplied order as one logical timeline slice.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ChangesetReader::open_file`], applied per
    /// file.
    pub fn open_group(
        paths: &[PathBuf],
        briefcase: &Briefcase,
        options: &ReaderOptions,
    ) -> Result<Self> {
        let mut group = GroupSet::new();
        let mut sources = Vec::with_capacity(paths.len());
        let mut contains_schema_changes = false;
        let mut generation = briefcase.schema_generation();
        let mut sequence = 0;

        for path in paths {
            let (file, flags, file_generation, payload) = read_changeset_file(path)?;
            check_generation(file_generation, briefcase, options)?;
            contains_schema_changes |= flags & FLAG_SCHEMA_CHANGES != 0;
            generation = file_generation;
            let records = parser::parse_changeset(&payload, sequence)?;
            sequence += records.len();
            for record in &records {
                group.push_record(record);
            }
            sources.push(file);
        }

        let (records, dropped) = group.into_records();
        Ok(Self::from_parts(
            records,
            contains_schema_changes,
            generation,
            dropped,
            sources,
        ))
    }

    pub(crate) fn from_parts(
        records: Vec<ChangeRecord>,
        contains_schema_changes: bool,
        schema_generation: u32,
        dropped: Vec<InvalidSequence>,
        sources: Vec<File>,
    ) -> Self {
        Self {
            records,
            current: None,
            next: 0,
            contains_schema_changes,
            schema_generation,
            dropped,
            _sources: sources,
        }
    }

    /// Advance to the next record. Returns `false` at end of stream and
    /// keeps returning `false` on further calls.
    pub fn step(&mut self) -> bool {
        if self.next < self.records.len() {
            self.current = Some(self.next);
            self.next += 1;
            true
        } else {
            self.current = None;
            false
        }
    }

    /// The record the last successful [`step`](Self::step) moved onto.
    #[must_use]
    pub fn record(&self) -> Option<&ChangeRecord> {
        self.current.and_then(|i| self.records.get(i))
    }

    /// Table name of the current record.
    #[must_use]
    pub fn table_name(&self) -> Option<&str> {
        self.record().map(|r| r.table().name.as_str())
    }

    /// Operation of the current record.
    #[must_use]
    pub fn op(&self) -> Option<RecordOp> {
        self.record().map(ChangeRecord::op)
    }

    /// Indirect-change flag of the current record.
    #[must_use]
    pub fn indirect(&self) -> Option<bool> {
        self.record().map(ChangeRecord::indirect)
    }

    /// Pre-change value of a column of the current record.
    #[must_use]
    pub fn old_value(&self, column: usize) -> Option<&Value> {
        self.record().and_then(|r| r.old_values()?.get(column))
    }

    /// Post-change value of a column of the current record.
    #[must_use]
    pub fn new_value(&self, column: usize) -> Option<&Value> {
        self.record().and_then(|r| r.new_values()?.get(column))
    }

    /// The full record stream, in order.
    #[must_use]
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Whether the source was flagged as containing schema-kind changes.
    #[must_use]
    pub fn contains_schema_changes(&self) -> bool {
        self.contains_schema_changes
    }

    /// Schema generation the source was recorded against.
    #[must_use]
    pub fn schema_generation(&self) -> u32 {
        self.schema_generation
    }

    /// Rows a group squash dropped because of invalid operation sequences.
    #[must_use]
    pub fn dropped_rows(&self) -> &[InvalidSequence] {
        &self.dropped
    }

    /// A reader over the record-wise inverse of this reader's content:
    /// Insert and Delete swap payload roles, Update exchanges its images
    /// while keeping the primary key on the old side.
    #[must_use]
    pub fn inverted(&self) -> ChangesetReader {
        Self::from_parts(
            self.records.iter().map(ChangeRecord::inverted).collect(),
            self.contains_schema_changes,
            self.schema_generation,
            Vec::new(),
            Vec::new(),
        )
    }

    /// Re-stamp the generation the content is considered recorded against.
    /// Used when pushing an inverse changeset, which is recorded against
    /// the generation live at push time, not the group sources'.
    pub(crate) fn with_schema_generation(mut self, generation: u32) -> Self {
        self.schema_generation = generation;
        self
    }

    /// The raw binary payload of the reader's current logical content (net
    /// content in group mode).
    #[must_use]
    pub(crate) fn payload(&self) -> Vec<u8> {
        parser::encode_records(&self.records)
    }

    /// Serialize the reader's current logical content into a changeset file.
    ///
    /// The schema-changes flag is stored as envelope metadata as supplied by
    /// the caller; it is not re-derived from content.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if the target exists and `overwrite` is false, or on
    /// any other file-system failure.
    pub fn write_to_file(
        &self,
        path: &Path,
        contains_schema_changes: bool,
        overwrite: bool,
    ) -> Result<()> {
        let mut file = if overwrite {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?
        } else {
            OpenOptions::new().write(true).create_new(true).open(path)?
        };

        let mut out = Vec::with_capacity(ENVELOPE_LEN);
        out.extend(MAGIC);
        out.push(FORMAT_VERSION);
        out.push(if contains_schema_changes {
            FLAG_SCHEMA_CHANGES
        } else {
            0
        });
        out.extend(self.schema_generation.to_be_bytes());
        out.extend(self.payload());

        file.write_all(&out)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Open a changeset file and split it into envelope fields and payload.
fn read_changeset_file(path: &Path) -> Result<(File, u8, u32, Vec<u8>)> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    let _ = file.read_to_end(&mut bytes)?;

    if bytes.len() < ENVELOPE_LEN {
        return Err(ParseError::InvalidEnvelope("file shorter than envelope").into());
    }
    if bytes[..4] != MAGIC {
        return Err(ParseError::InvalidEnvelope("bad magic").into());
    }
    if bytes[4] != FORMAT_VERSION {
        return Err(ParseError::InvalidEnvelope("unsupported format version").into());
    }
    let flags = bytes[5];
    let generation = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let payload = bytes[ENVELOPE_LEN..].to_vec();
    Ok((file, flags, generation, payload))
}

fn check_generation(
    generation: u32,
    briefcase: &Briefcase,
    options: &ReaderOptions,
) -> Result<()> {
    if !options.disable_schema_check && generation != briefcase.schema_generation() {
        return Err(Error::SchemaMismatch {
            changeset: generation,
            briefcase: briefcase.schema_generation(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::constants::op_codes;

    fn sample_records() -> Vec<ChangeRecord> {
        let mut data = vec![b'T', 2, 1, 0, b't', 0];
        data.push(op_codes::INSERT);
        data.push(0);
        data.push(0x01);
        data.extend(&1i64.to_be_bytes());
        data.push(0x03);
        data.push(1);
        data.push(b'a');
        parser::parse_changeset(&data, 0).unwrap()
    }

    #[test]
    fn test_step_is_idempotent_after_exhaustion() {
        let mut reader =
            ChangesetReader::from_parts(sample_records(), false, 1, Vec::new(), Vec::new());

        assert!(reader.step());
        assert_eq!(reader.table_name(), Some("t"));
        assert_eq!(reader.op(), Some(RecordOp::Insert));
        assert_eq!(reader.new_value(0), Some(&Value::Integer(1)));
        assert_eq!(reader.old_value(0), None);

        assert!(!reader.step());
        assert!(reader.record().is_none());
        assert!(!reader.step());
        assert!(!reader.step());
    }

    #[test]
    fn test_inverted_reader_swaps_roles() {
        let reader =
            ChangesetReader::from_parts(sample_records(), false, 3, Vec::new(), Vec::new());
        let mut inverse = reader.inverted();
        assert_eq!(inverse.schema_generation(), 3);
        assert!(inverse.step());
        assert_eq!(inverse.op(), Some(RecordOp::Delete));
        assert_eq!(inverse.old_value(1), Some(&Value::Text("a".into())));
    }

    #[test]
    fn test_payload_roundtrips_through_parser() {
        let reader =
            ChangesetReader::from_parts(sample_records(), false, 1, Vec::new(), Vec::new());
        let payload = reader.payload();
        let records = parser::parse_changeset(&payload, 0).unwrap();
        assert_eq!(records, *reader.records());
    }
}
