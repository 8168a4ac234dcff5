//! Connection-backed working set for the accumulator.

use crate::briefcase::Briefcase;
use crate::errors::{Error, Result};
use crate::instance::{ChangedInstance, InstanceKey, Stage};
use crate::unifier::InstanceCache;

/// External-storage cache that spills the working set into a scratch TEMP
/// table owned by the target briefcase's connection, trading per-merge
/// latency for bounded memory.
///
/// The scratch table is released on [`dispose`](InstanceCache::dispose);
/// `Drop` is the backstop for early exits. Backend failures surface as
/// [`Error::CacheBackend`] and are fatal for the owning accumulator.
pub struct SqliteCache<'b> {
    briefcase: &'b Briefcase,
    table: String,
    disposed: bool,
}

fn stage_key(stage: Stage) -> i64 {
    match stage {
        Stage::Old => 0,
        Stage::New => 1,
    }
}

fn backend_err(err: impl core::fmt::Display) -> Error {
    Error::CacheBackend(err.to_string())
}

impl<'b> SqliteCache<'b> {
    /// Allocate a scratch table on the briefcase's connection.
    ///
    /// # Errors
    ///
    /// [`Error::CacheBackend`] when the scratch table cannot be created.
    pub fn new(briefcase: &'b Briefcase) -> Result<Self> {
        let table = format!("ec_unifier_scratch_{}", briefcase.next_scratch_id());
        briefcase
            .connection()
            .execute_batch(&format!(
                "CREATE TEMP TABLE {table} (
                     InstanceId TEXT NOT NULL,
                     Stage INTEGER NOT NULL,
                     Body TEXT NOT NULL,
                     PRIMARY KEY (InstanceId, Stage)
                 )"
            ))
            .map_err(backend_err)?;
        Ok(Self {
            briefcase,
            table,
            disposed: false,
        })
    }
}

impl InstanceCache for SqliteCache<'_> {
    fn get(&mut self, key: &InstanceKey) -> Result<Option<ChangedInstance>> {
        let mut stmt = self
            .briefcase
            .connection()
            .prepare(&format!(
                "SELECT Body FROM {} WHERE InstanceId = ?1 AND Stage = ?2",
                self.table
            ))
            .map_err(backend_err)?;
        let body: Option<String> = stmt
            .query_row(
                rusqlite::params![key.instance_id, stage_key(key.stage)],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(backend_err(other)),
            })?;
        body.map(|body| serde_json::from_str(&body).map_err(backend_err))
            .transpose()
    }

    fn put(&mut self, key: &InstanceKey, instance: &ChangedInstance) -> Result<()> {
        let body = serde_json::to_string(instance).map_err(backend_err)?;
        // Upsert rather than INSERT OR REPLACE: replacing would assign a new
        // rowid and lose the first-seen order `instances` promises.
        let _ = self
            .briefcase
            .connection()
            .execute(
                &format!(
                    "INSERT INTO {} (InstanceId, Stage, Body) VALUES (?1, ?2, ?3) \
                     ON CONFLICT (InstanceId, Stage) DO UPDATE SET Body = excluded.Body",
                    self.table
                ),
                rusqlite::params![key.instance_id, stage_key(key.stage), body],
            )
            .map_err(backend_err)?;
        Ok(())
    }

    fn instances(&mut self) -> Result<Vec<ChangedInstance>> {
        let mut stmt = self
            .briefcase
            .connection()
            .prepare(&format!("SELECT Body FROM {} ORDER BY rowid", self.table))
            .map_err(backend_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(backend_err)?;

        let mut instances = Vec::new();
        for body in rows {
            let body = body.map_err(backend_err)?;
            instances.push(serde_json::from_str(&body).map_err(backend_err)?);
        }
        Ok(instances)
    }

    fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.briefcase
            .connection()
            .execute_batch(&format!("DROP TABLE IF EXISTS temp.{}", self.table))
            .map_err(backend_err)?;
        self.disposed = true;
        Ok(())
    }
}

impl Drop for SqliteCache<'_> {
    fn drop(&mut self) {
        if !self.disposed
            && let Err(err) = self.dispose()
        {
            tracing::warn!(table = %self.table, %err, "failed to drop unifier scratch table");
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::encoding::Value;
    use crate::instance::{InstanceMeta, ResolvedClass};
    use crate::parser::RecordOp;
    use crate::schema::ClassId;

    fn sample_instance() -> ChangedInstance {
        let mut properties = IndexMap::new();
        properties.insert("CodeValue".to_string(), Value::Text("code".into()));
        ChangedInstance {
            instance_id: "0x1".to_string(),
            class: ResolvedClass::Known(ClassId(1)),
            properties,
            meta: InstanceMeta {
                tables: vec!["bis_Element".to_string()],
                op: RecordOp::Insert,
                class_full_name: "BisCore:Element".to_string(),
                change_indexes: vec![0],
                stage: Stage::New,
            },
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let briefcase = Briefcase::open_in_memory().unwrap();
        let mut cache = SqliteCache::new(&briefcase).unwrap();

        let instance = sample_instance();
        let key = instance.key();
        assert!(cache.get(&key).unwrap().is_none());

        cache.put(&key, &instance).unwrap();
        assert_eq!(cache.get(&key).unwrap(), Some(instance));

        cache.dispose().unwrap();
    }

    #[test]
    fn test_dispose_releases_scratch_table() {
        let briefcase = Briefcase::open_in_memory().unwrap();
        let table = {
            let mut cache = SqliteCache::new(&briefcase).unwrap();
            cache.put(&sample_instance().key(), &sample_instance()).unwrap();
            let table = cache.table.clone();
            cache.dispose().unwrap();
            table
        };
        let count: i64 = briefcase
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = ?1",
                [&table],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_drop_is_a_backstop() {
        let briefcase = Briefcase::open_in_memory().unwrap();
        let table = {
            let cache = SqliteCache::new(&briefcase).unwrap();
            cache.table.clone()
        };
        let count: i64 = briefcase
            .connection()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE name = ?1",
                [&table],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }
}
