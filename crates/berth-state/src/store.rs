//! StateStore — redb-backed persistence for jobs and stack assignments.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(STACKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job.
    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        let key = job.table_key();
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "job stored");
        Ok(())
    }

    pub fn get_job(&self, key: &str) -> StateResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: Job =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// List jobs matching the query, ordered by process type then instance.
    pub fn list_jobs(&self, query: &JobQuery) -> StateResult<Vec<Job>> {
        let prefix = query.key_prefix();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let job: Job =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(job);
            }
        }
        // Key order groups versions before process types for app-wide
        // queries; callers expect process-type order.
        results.sort_by(|a, b| {
            (a.process_type.as_str(), a.instance, a.version.as_str())
                .cmp(&(b.process_type.as_str(), b.instance, b.version.as_str()))
        });
        Ok(results)
    }

    /// Delete a job. Returns true if it existed.
    pub fn delete_job(&self, job: &Job) -> StateResult<bool> {
        let key = job.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "job deleted");
        Ok(existed)
    }

    // ── Stacks ─────────────────────────────────────────────────────

    pub fn put_stack(&self, record: &StackRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STACKS).map_err(map_err!(Table))?;
            table
                .insert(record.app_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app_id = %record.app_id, stack = %record.stack_name, "stack assigned");
        Ok(())
    }

    pub fn get_stack(&self, app_id: &str) -> StateResult<Option<StackRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STACKS).map_err(map_err!(Table))?;
        match table.get(app_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: StackRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Remove an app's stack assignment. Returns true if it existed.
    pub fn delete_stack(&self, app_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(STACKS).map_err(map_err!(Table))?;
            existed = table.remove(app_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%app_id, existed, "stack assignment removed");
        Ok(existed)
    }
}
