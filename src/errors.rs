//! Submodule defining the errors used across the crate.

use crate::parser::ParseError;
use crate::schema::ClassId;

/// Errors that can occur while reading, unifying, squashing or applying
/// changesets.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The changeset was recorded against a different schema generation than
    /// the one the target briefcase currently carries. Callers that inspect
    /// historical changesets on purpose can disable the check via
    /// [`crate::ReaderOptions`].
    #[error(
        "changeset recorded against schema generation {changeset} but the briefcase is at generation {briefcase}"
    )]
    SchemaMismatch {
        /// Generation recorded in the changeset file.
        changeset: u32,
        /// Generation of the target briefcase.
        briefcase: u32,
    },

    /// The changeset bytes violate the binary grammar. Fatal for that source.
    #[error("corrupt changeset: {0}")]
    CorruptChangeset(#[from] ParseError),

    /// An operation sequence that the schema-mapping rules declare impossible,
    /// e.g. the same property arriving from two different physical tables for
    /// one instance.
    #[error("invalid change sequence for {scope}: {detail}")]
    InvalidOperationSequence {
        /// What the conflicting sequence was observed on (instance or row).
        scope: String,
        /// Description of the conflict.
        detail: String,
    },

    /// File-system failure while opening or writing changeset files.
    #[error("i/o failure on changeset file: {0}")]
    Io(#[from] std::io::Error),

    /// The external-storage cache failed to allocate or spill. Fatal for the
    /// accumulator instance that owns the cache.
    #[error("external-storage cache failure: {0}")]
    CacheBackend(String),

    /// The class-hierarchy cache would reference a class that no longer
    /// exists after applying a changeset. The enclosing commit is refused.
    #[error("class-hierarchy cache references missing class {class_id}")]
    ReferentialIntegrity {
        /// The dangling class id.
        class_id: ClassId,
    },

    /// Connection-level storage failure.
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A class full name the schema mapper does not know.
    #[error("unknown class {0}")]
    UnknownClass(String),

    /// A revert target at or past the timeline tip.
    #[error("nothing to revert: target index {to_index} is not before the tip {tip}")]
    EmptyRevertRange {
        /// Requested revert target index.
        to_index: u64,
        /// Current timeline tip index.
        tip: u64,
    },
}

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
