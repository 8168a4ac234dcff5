//! Local append-only store of changeset files.
//!
//! The network hub that negotiates locks and transfers changeset files is
//! an external collaborator; [`Timeline`] is its minimal local stand-in:
//! an ordered list of [`ChangesetDescriptor`]s backed by files in one
//! directory, with index 1 as the first changeset and 0 meaning "before
//! the first changeset".

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{Error, Result};
use crate::reader::ChangesetReader;

/// The kind of content a changeset carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetType {
    /// Data-level changes only.
    Regular,
    /// Schema-level changes (class and mapping definitions).
    Schema,
    /// Schema synchronization bookkeeping.
    SchemaSync,
}

/// Metadata describing one changeset on the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetDescriptor {
    /// Position on the timeline, starting at 1.
    pub index: u64,
    /// Content-derived changeset id.
    pub id: String,
    /// Id of the preceding changeset, empty for the first.
    pub parent_id: String,
    /// Free-form description.
    pub description: String,
    /// Push time, unix seconds.
    pub push_date: u64,
    /// Content kind.
    pub kind: ChangesetType,
    /// File size on disk, envelope included.
    pub size: u64,
    /// Size of the raw payload.
    pub uncompressed_size: u64,
}

/// A slice of the timeline: `[first, end)` when `end` is present, else
/// `[first, tip]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangesetRange {
    /// First index in the range.
    pub first: u64,
    /// Exclusive upper bound, or `None` for "to tip".
    pub end: Option<u64>,
}

impl ChangesetRange {
    /// A range from `first` to the tip.
    #[must_use]
    pub fn to_tip(first: u64) -> Self {
        Self { first, end: None }
    }

    /// A half-open range `[first, end)`.
    #[must_use]
    pub fn bounded(first: u64, end: u64) -> Self {
        Self {
            first,
            end: Some(end),
        }
    }

    fn contains(&self, index: u64) -> bool {
        index >= self.first && self.end.is_none_or(|end| index < end)
    }
}

/// The local changeset store.
pub struct Timeline {
    dir: PathBuf,
    descriptors: Vec<ChangesetDescriptor>,
}

impl Timeline {
    /// Create a timeline storing its files under `dir`.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] when the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            descriptors: Vec::new(),
        })
    }

    /// Index of the newest changeset, 0 when the timeline is empty.
    #[must_use]
    pub fn tip(&self) -> u64 {
        self.descriptors.last().map_or(0, |d| d.index)
    }

    /// All descriptors, oldest first.
    #[must_use]
    pub fn descriptors(&self) -> &[ChangesetDescriptor] {
        &self.descriptors
    }

    /// Descriptor at a timeline index.
    #[must_use]
    pub fn descriptor(&self, index: u64) -> Option<&ChangesetDescriptor> {
        self.descriptors.iter().find(|d| d.index == index)
    }

    /// Descriptors within a range, oldest first.
    #[must_use]
    pub fn descriptors_in(&self, range: &ChangesetRange) -> Vec<&ChangesetDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| range.contains(d.index))
            .collect()
    }

    /// Path of the file backing a descriptor.
    #[must_use]
    pub fn path_for(&self, descriptor: &ChangesetDescriptor) -> PathBuf {
        self.dir.join(format!("{:06}.changeset", descriptor.index))
    }

    /// Append a reader's current logical content as the next changeset.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] when the file cannot be written.
    pub fn push(
        &mut self,
        reader: &ChangesetReader,
        kind: ChangesetType,
        description: &str,
    ) -> Result<ChangesetDescriptor> {
        let index = self.tip() + 1;
        let path = self.dir.join(format!("{index:06}.changeset"));
        reader.write_to_file(&path, kind != ChangesetType::Regular, false)?;

        let payload = reader.payload();
        let parent_id = self.descriptors.last().map(|d| d.id.clone()).unwrap_or_default();
        let descriptor = ChangesetDescriptor {
            index,
            id: changeset_id(&parent_id, &payload),
            parent_id,
            description: description.to_string(),
            push_date: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?
                .as_secs(),
            kind,
            size: std::fs::metadata(&path)?.len(),
            uncompressed_size: payload.len() as u64,
        };
        self.descriptors.push(descriptor.clone());
        Ok(descriptor)
    }

    /// Remove the newest changeset after a failed apply, deleting its file.
    pub(crate) fn retract_tip(&mut self) {
        if let Some(descriptor) = self.descriptors.pop() {
            let path = self.path_for(&descriptor);
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %err, "failed to remove retracted changeset file");
            }
        }
    }

    /// The directory the timeline stores its files in.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// The hash-combine step of the session extension, reused to derive
/// content-addressed changeset ids.
const fn hash_append(h: u32, add: u32) -> u32 {
    (h << 3) ^ h ^ add
}

fn hash_blob(mut h: u32, data: &[u8]) -> u32 {
    let mut i = 0;
    while i < data.len() {
        h = hash_append(h, data[i] as u32);
        i += 1;
    }
    h
}

fn changeset_id(parent_id: &str, payload: &[u8]) -> String {
    let lo = hash_blob(hash_blob(0, parent_id.as_bytes()), payload);
    let hi = hash_blob(hash_blob(!lo, payload), parent_id.as_bytes());
    format!("{hi:08x}{lo:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_contains() {
        let range = ChangesetRange::bounded(2, 4);
        assert!(!range.contains(1));
        assert!(range.contains(2));
        assert!(range.contains(3));
        assert!(!range.contains(4));

        let open = ChangesetRange::to_tip(3);
        assert!(!open.contains(2));
        assert!(open.contains(100));
    }

    #[test]
    fn test_changeset_id_is_content_addressed() {
        let a = changeset_id("", b"payload");
        let b = changeset_id("", b"payload");
        let c = changeset_id("", b"other");
        let chained = changeset_id(&a, b"payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, chained);
        assert_eq!(a.len(), 16);
    }
}
