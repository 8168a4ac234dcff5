//! Cross-step unification of instance fragments.
//!
//! [`ChangeAccumulator`] consumes one full pass of adaptor output and merges
//! fragments sharing the same `(instance id, stage)` key into complete
//! instance-level change views. The working set lives behind the
//! [`InstanceCache`] trait, with an in-memory implementation for
//! small-to-moderate changesets and a connection-backed spill
//! implementation that trades per-merge latency for bounded memory. Both
//! must produce identical final output for the same input.

use crate::adaptor::InstanceAdaptor;
use crate::errors::{Error, Result};
use crate::instance::{ChangedInstance, InstanceKey, ResolvedClass};
use crate::parser::RecordOp;

mod memory;
mod spill;

pub use memory::MemoryCache;
pub use spill::SqliteCache;

/// Working-set storage for in-progress unification.
///
/// A cache is a scoped resource: acquiring one may allocate scratch storage
/// that must be deterministically released via [`dispose`](Self::dispose)
/// (with `Drop` as a backstop), even on early exit or error.
pub trait InstanceCache {
    /// Look up the merged view under a key.
    fn get(&mut self, key: &InstanceKey) -> Result<Option<ChangedInstance>>;

    /// Store (or replace) the merged view under a key.
    fn put(&mut self, key: &InstanceKey, instance: &ChangedInstance) -> Result<()>;

    /// The final merged set, in first-seen order.
    fn instances(&mut self) -> Result<Vec<ChangedInstance>>;

    /// Release any scratch storage the cache allocated.
    fn dispose(&mut self) -> Result<()>;
}

/// Unifier of partial instance views across adaptor steps.
pub struct ChangeAccumulator<C: InstanceCache> {
    cache: C,
}

impl ChangeAccumulator<MemoryCache> {
    /// An accumulator over the in-memory cache.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryCache::new())
    }
}

impl<C: InstanceCache> ChangeAccumulator<C> {
    /// An accumulator over the given cache.
    #[must_use]
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    /// Merge the adaptor's current fragments into the working set. Drive
    /// the adaptor with `step()` and call this once per step until the
    /// adaptor is exhausted.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidOperationSequence`] when the same property arrives
    /// from two different physical tables for one instance (a
    /// schema-mapping invariant violation); cache backend failures as
    /// reported by the cache.
    pub fn append_from(&mut self, adaptor: &InstanceAdaptor<'_>) -> Result<()> {
        for fragment in adaptor.fragments() {
            self.merge(fragment)?;
        }
        Ok(())
    }

    fn merge(&mut self, fragment: &ChangedInstance) -> Result<()> {
        let key = fragment.key();
        let Some(mut existing) = self.cache.get(&key)? else {
            return self.cache.put(&key, fragment);
        };

        for (property, value) in &fragment.properties {
            if existing.properties.contains_key(property) {
                return Err(Error::InvalidOperationSequence {
                    scope: format!("instance {}", fragment.instance_id),
                    detail: format!(
                        "property {property} written from both {:?} and {}",
                        existing.meta.tables,
                        fragment.meta.tables.first().map_or("?", String::as_str),
                    ),
                });
            }
            existing.properties.insert(property.clone(), value.clone());
        }

        existing.meta.tables.extend(fragment.meta.tables.iter().cloned());
        existing
            .meta
            .change_indexes
            .extend(fragment.meta.change_indexes.iter().copied());

        // Keep the most specific operation: an instance whose row in any
        // table was inserted or deleted is an Insert/Delete even when other
        // tables only saw an Update.
        if existing.meta.op == RecordOp::Update && fragment.meta.op != RecordOp::Update {
            existing.meta.op = fragment.meta.op;
        }

        // An authoritative class id wins over a degraded fallback.
        if matches!(existing.class, ResolvedClass::Fallback(_))
            && matches!(fragment.class, ResolvedClass::Known(_))
        {
            existing.class = fragment.class;
            existing.meta.class_full_name = fragment.meta.class_full_name.clone();
        }

        self.cache.put(&key, &existing)
    }

    /// The final merged instance set, once the source adaptor has been
    /// driven to exhaustion. The sequence is finite and restartable: the
    /// accumulator retains the set until disposed.
    ///
    /// # Errors
    ///
    /// Cache backend failures as reported by the cache.
    pub fn instances(&mut self) -> Result<Vec<ChangedInstance>> {
        self.cache.instances()
    }

    /// Release the cache's scratch storage.
    ///
    /// # Errors
    ///
    /// Cache backend failures as reported by the cache.
    pub fn dispose(&mut self) -> Result<()> {
        self.cache.dispose()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::encoding::Value;
    use crate::instance::{InstanceMeta, Stage};
    use crate::schema::ClassId;

    fn fragment(
        instance_id: &str,
        stage: Stage,
        table: &str,
        op: RecordOp,
        index: usize,
        properties: &[(&str, &str)],
    ) -> ChangedInstance {
        let mut bag = IndexMap::new();
        for (name, value) in properties {
            bag.insert((*name).to_string(), Value::Text((*value).to_string()));
        }
        ChangedInstance {
            instance_id: instance_id.to_string(),
            class: ResolvedClass::Known(ClassId(1)),
            properties: bag,
            meta: InstanceMeta {
                tables: vec![table.to_string()],
                op,
                class_full_name: "BisCore:Element".to_string(),
                change_indexes: vec![index],
                stage,
            },
        }
    }

    #[test]
    fn test_fragments_merge_by_instance_and_stage() {
        let mut accumulator = ChangeAccumulator::in_memory();
        let a = fragment("0x1", Stage::New, "bis_Element", RecordOp::Insert, 0, &[("a", "1")]);
        let b = fragment(
            "0x1",
            Stage::New,
            "bis_GeometricElement2d",
            RecordOp::Insert,
            1,
            &[("b", "2")],
        );
        accumulator.merge(&a).unwrap();
        accumulator.merge(&b).unwrap();

        let instances = accumulator.instances().unwrap();
        assert_eq!(instances.len(), 1);
        let merged = &instances[0];
        assert_eq!(merged.properties.len(), 2);
        assert_eq!(
            merged.meta.tables,
            vec!["bis_Element".to_string(), "bis_GeometricElement2d".to_string()]
        );
        assert_eq!(merged.meta.change_indexes, vec![0, 1]);
    }

    #[test]
    fn test_stages_do_not_merge_with_each_other() {
        let mut accumulator = ChangeAccumulator::in_memory();
        let old = fragment("0x1", Stage::Old, "bis_Element", RecordOp::Update, 0, &[("a", "x")]);
        let new = fragment("0x1", Stage::New, "bis_Element", RecordOp::Update, 0, &[("a", "y")]);
        accumulator.merge(&old).unwrap();
        accumulator.merge(&new).unwrap();

        assert_eq!(accumulator.instances().unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_property_from_two_tables_errors() {
        let mut accumulator = ChangeAccumulator::in_memory();
        let a = fragment("0x1", Stage::New, "bis_Element", RecordOp::Insert, 0, &[("a", "1")]);
        let b = fragment("0x1", Stage::New, "bis_Other", RecordOp::Insert, 1, &[("a", "2")]);
        accumulator.merge(&a).unwrap();
        let err = accumulator.merge(&b).unwrap_err();
        assert!(matches!(err, Error::InvalidOperationSequence { .. }));
    }

    #[test]
    fn test_most_specific_op_wins() {
        let mut accumulator = ChangeAccumulator::in_memory();
        let update = fragment("0x1", Stage::New, "bis_A", RecordOp::Update, 0, &[("a", "1")]);
        let insert = fragment("0x1", Stage::New, "bis_B", RecordOp::Insert, 1, &[("b", "2")]);
        accumulator.merge(&update).unwrap();
        accumulator.merge(&insert).unwrap();

        let instances = accumulator.instances().unwrap();
        assert_eq!(instances[0].meta.op, RecordOp::Insert);
    }

    #[test]
    fn test_known_class_replaces_fallback() {
        let mut accumulator = ChangeAccumulator::in_memory();
        let mut degraded = fragment("0x1", Stage::New, "bis_A_Overflow", RecordOp::Insert, 0, &[]);
        degraded.class = ResolvedClass::Fallback(ClassId(1));
        let known = fragment("0x1", Stage::New, "bis_A", RecordOp::Insert, 1, &[("a", "1")]);
        accumulator.merge(&degraded).unwrap();
        accumulator.merge(&known).unwrap();

        let instances = accumulator.instances().unwrap();
        assert_eq!(instances[0].class, ResolvedClass::Known(ClassId(1)));
    }

    #[test]
    fn test_instances_is_restartable() {
        let mut accumulator = ChangeAccumulator::in_memory();
        let a = fragment("0x1", Stage::New, "bis_A", RecordOp::Insert, 0, &[("a", "1")]);
        accumulator.merge(&a).unwrap();

        let first = accumulator.instances().unwrap();
        let second = accumulator.instances().unwrap();
        assert_eq!(first, second);
    }
}
