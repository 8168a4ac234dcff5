//! Changeset engine for a structured, schema-versioned, multi-user
//! database.
//!
//! The crate reads low-level row-change records from the standard binary
//! changeset format, reconstructs them into logical schema-aware instance
//! changes, unifies fragments of the same logical change that are
//! physically split across tables by vertical partitioning, squashes
//! ordered changeset sequences into a single net change, and uses the
//! squash/invert algebra to revert or reinstate a changeset range by
//! appending new forward changesets; history is never rewritten.
//!
//! # Pipeline
//!
//! ```text
//! raw bytes
//!   └─ ChangesetReader        one ChangeRecord per step, file order
//!        └─ InstanceAdaptor   per-table instance fragments (SchemaMapper)
//!             └─ ChangeAccumulator   unified ChangedInstance views
//! ```
//!
//! Independently, a reader opened in group mode squashes an ordered file
//! sequence via [`GroupSet`], and [`revert_and_push_changes`] builds on
//! that to undo a timeline range.
//!
//! # Example
//!
//! ```no_run
//! use ec_changeset::{
//!     Briefcase, ChangeAccumulator, ChangesetReader, InstanceAdaptor,
//! };
//!
//! # fn main() -> ec_changeset::Result<()> {
//! let briefcase = Briefcase::open_in_memory()?;
//! let mut tracker = briefcase.begin_tracking()?;
//! // ... edit through briefcase.connection() ...
//! let reader = ChangesetReader::open_local_changes(&mut tracker)?;
//!
//! let mut adaptor = InstanceAdaptor::new(reader, briefcase.mapper());
//! let mut accumulator = ChangeAccumulator::in_memory();
//! while adaptor.step() {
//!     accumulator.append_from(&adaptor)?;
//! }
//! for instance in accumulator.instances()? {
//!     println!("{} {:?}", instance.instance_id, instance.meta.op);
//! }
//! # Ok(())
//! # }
//! ```

pub mod adaptor;
pub mod briefcase;
pub(crate) mod encoding;
pub mod errors;
pub mod health;
pub mod instance;
pub mod parser;
pub mod reader;
pub mod revert;
pub mod schema;
pub mod squash;
pub mod timeline;
pub mod unifier;

pub use adaptor::InstanceAdaptor;
pub use briefcase::{Briefcase, ChangeTracker};
pub use encoding::Value;
pub use errors::{Error, Result};
pub use health::{HealthStat, StatementStat};
pub use instance::{ChangedInstance, InstanceKey, InstanceMeta, ResolvedClass, Stage};
pub use parser::{ChangeRecord, ParseError, RecordOp, TableSchema};
pub use reader::{ChangesetReader, ReaderOptions};
pub use revert::{RevertOptions, revert_and_push_changes};
pub use schema::{
    ClassDef, ClassId, ClassResolution, SchemaMapper, TableLayout, TableMapping, TableRole,
};
pub use squash::{GroupSet, InvalidSequence, NetChange, Reverse};
pub use timeline::{ChangesetDescriptor, ChangesetRange, ChangesetType, Timeline};
pub use unifier::{ChangeAccumulator, InstanceCache, MemoryCache, SqliteCache};
