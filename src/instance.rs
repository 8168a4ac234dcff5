//! Logical instance-level change views.
//!
//! A [`ChangedInstance`] is one physical table's contribution to a logical
//! instance's change (a *fragment*) until the accumulator unifies fragments
//! sharing the same `(instance id, stage)` key into a complete view.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::encoding::Value;
use crate::parser::RecordOp;
use crate::schema::ClassId;

/// Which side of a change a view describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Pre-change values (Update and Delete).
    Old,
    /// Post-change values (Insert and Update).
    New,
}

/// The class of an instance, or the best-effort substitute when the schema
/// metadata is corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedClass {
    /// Authoritative class id.
    Known(ClassId),
    /// The root-class marker was missing; this is the last-known class
    /// recorded for the contributing table. Property values of that table
    /// are omitted from the instance.
    Fallback(ClassId),
}

impl ResolvedClass {
    /// The authoritative class id, when one was resolved.
    #[must_use]
    pub fn class_id(&self) -> Option<ClassId> {
        match self {
            ResolvedClass::Known(id) => Some(*id),
            ResolvedClass::Fallback(_) => None,
        }
    }

    /// The fallback class id, when resolution degraded.
    #[must_use]
    pub fn fallback_class_id(&self) -> Option<ClassId> {
        match self {
            ResolvedClass::Known(_) => None,
            ResolvedClass::Fallback(id) => Some(*id),
        }
    }

    /// The id regardless of how it was obtained.
    #[must_use]
    pub fn id(&self) -> ClassId {
        match self {
            ResolvedClass::Known(id) | ResolvedClass::Fallback(id) => *id,
        }
    }
}

/// Provenance and classification of an instance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMeta {
    /// Physical tables that contributed to this view, in merge order.
    pub tables: Vec<String>,
    /// The most specific operation seen across contributions.
    pub op: RecordOp,
    /// Full name of the (resolved or fallback) class.
    pub class_full_name: String,
    /// Sequence indexes of the contributing change records.
    pub change_indexes: Vec<usize>,
    /// Which side of the change this view describes.
    pub stage: Stage,
}

/// Key under which fragments of the same logical change unify.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Logical instance id.
    pub instance_id: String,
    /// Change side.
    pub stage: Stage,
}

/// A logical, schema-aware view of one instance's change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedInstance {
    /// Logical instance id.
    pub instance_id: String,
    /// Class, resolved or degraded.
    pub class: ResolvedClass,
    /// Property bag; each property comes from exactly one physical table.
    pub properties: IndexMap<String, Value>,
    /// Provenance metadata.
    pub meta: InstanceMeta,
}

impl ChangedInstance {
    /// The unification key of this fragment.
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            instance_id: self.instance_id.clone(),
            stage: self.meta.stage,
        }
    }
}

/// Format a primary-key value as a logical instance id.
#[must_use]
pub(crate) fn instance_id_from_value(value: &Value) -> String {
    match value {
        Value::Integer(v) => format!("0x{v:x}"),
        Value::Text(s) => s.clone(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_formats_integers_as_hex() {
        assert_eq!(
            instance_id_from_value(&Value::Integer(0x20000000004)),
            "0x20000000004"
        );
        assert_eq!(instance_id_from_value(&Value::Text("key".into())), "key");
    }

    #[test]
    fn test_resolved_class_sides() {
        let known = ResolvedClass::Known(ClassId(7));
        assert_eq!(known.class_id(), Some(ClassId(7)));
        assert_eq!(known.fallback_class_id(), None);

        let fallback = ResolvedClass::Fallback(ClassId(9));
        assert_eq!(fallback.class_id(), None);
        assert_eq!(fallback.fallback_class_id(), Some(ClassId(9)));
        assert_eq!(fallback.id(), ClassId(9));
    }
}
