//! Reverting a trailing range of the timeline without rewriting history.
//!
//! [`revert_and_push_changes`] squashes the changesets after the target
//! index into their net effect, inverts every surviving net record, applies
//! the inverse to the briefcase and appends it as a brand-new forward
//! changeset at the tip, like `git revert`, never like `git reset`.
//! Reinstating is not a separate operation: reverting again to an index
//! after the original revert point restores the previously reverted
//! content by the same inversion algebra.

use std::path::PathBuf;

use crate::briefcase::Briefcase;
use crate::errors::{Error, Result};
use crate::reader::{ChangesetReader, ReaderOptions};
use crate::timeline::{ChangesetDescriptor, ChangesetRange, ChangesetType, Timeline};

/// Options for [`revert_and_push_changes`].
#[derive(Debug, Clone, Default)]
pub struct RevertOptions {
    /// Timeline index to revert to: every changeset after it is undone.
    pub to_index: u64,
    /// Description of the pushed changeset; a default is derived from the
    /// range when absent.
    pub description: Option<String>,
    /// Exclude schema-kind changesets from the reverted range, reverting
    /// only data-level changes.
    pub skip_schema_changes: bool,
}

/// Revert the changesets in `(to_index, tip]` and push the inverse as a new
/// forward changeset.
///
/// # Errors
///
/// [`Error::EmptyRevertRange`] when there is nothing after `to_index`;
/// otherwise the failure modes of group opening, applying and pushing. On
/// an apply failure the pushed file is retracted, leaving both the
/// briefcase and the timeline as they were.
pub fn revert_and_push_changes(
    briefcase: &mut Briefcase,
    timeline: &mut Timeline,
    options: &RevertOptions,
) -> Result<ChangesetDescriptor> {
    let tip = timeline.tip();
    if options.to_index >= tip {
        return Err(Error::EmptyRevertRange {
            to_index: options.to_index,
            tip,
        });
    }

    let range = ChangesetRange::to_tip(options.to_index + 1);
    let selected: Vec<&ChangesetDescriptor> = timeline
        .descriptors_in(&range)
        .into_iter()
        .filter(|d| !(options.skip_schema_changes && d.kind != ChangesetType::Regular))
        .collect();
    if selected.is_empty() {
        return Err(Error::EmptyRevertRange {
            to_index: options.to_index,
            tip,
        });
    }

    tracing::debug!(
        from = options.to_index + 1,
        to = tip,
        changesets = selected.len(),
        skip_schema_changes = options.skip_schema_changes,
        "reverting timeline range"
    );

    let paths: Vec<PathBuf> = selected.iter().map(|d| timeline.path_for(d)).collect();
    // The files in the range were recorded against older schema
    // generations by construction; the group is opened without the
    // generation check.
    let group = ChangesetReader::open_group(
        &paths,
        briefcase,
        &ReaderOptions {
            disable_schema_check: true,
        },
    )?;
    let inverse = group
        .inverted()
        .with_schema_generation(briefcase.schema_generation());

    let description = options.description.clone().unwrap_or_else(|| {
        format!("Reverted changesets {}..{}", options.to_index + 1, tip)
    });
    let descriptor = timeline.push(&inverse, ChangesetType::Regular, &description)?;

    match briefcase.apply_changeset(&inverse, &descriptor) {
        Ok(()) => Ok(descriptor),
        Err(err) => {
            timeline.retract_tip();
            Err(err)
        }
    }
}
