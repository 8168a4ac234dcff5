//! Process-local working set for the accumulator.

use indexmap::IndexMap;

use crate::errors::Result;
use crate::instance::{ChangedInstance, InstanceKey};
use crate::unifier::InstanceCache;

/// In-memory cache keyed by `(instance id, stage)`.
///
/// Appropriate for small-to-moderate changesets; memory grows unbounded
/// with changeset size.
#[derive(Debug, Default)]
pub struct MemoryCache {
    map: IndexMap<InstanceKey, ChangedInstance>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceCache for MemoryCache {
    fn get(&mut self, key: &InstanceKey) -> Result<Option<ChangedInstance>> {
        Ok(self.map.get(key).cloned())
    }

    fn put(&mut self, key: &InstanceKey, instance: &ChangedInstance) -> Result<()> {
        self.map.insert(key.clone(), instance.clone());
        Ok(())
    }

    fn instances(&mut self) -> Result<Vec<ChangedInstance>> {
        Ok(self.map.values().cloned().collect())
    }

    fn dispose(&mut self) -> Result<()> {
        self.map.clear();
        Ok(())
    }
}
