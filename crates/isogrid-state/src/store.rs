//! StateStore: redb-backed document persistence for IsoGrid.
//!
//! Provides typed CRUD operations over instances, isolation groups,
//! auto-isolation configurations, and the message outbox. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
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

type DocTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe instance store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(ISOLATIONS).map_err(map_err!(Table))?;
        txn.open_table(AUTO_ISOLATION_CONFIGS)
            .map_err(map_err!(Table))?;
        txn.open_table(OUTBOX).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic document access ────────────────────────────────────

    fn put_doc<T: Serialize>(&self, def: DocTable, key: &str, doc: &T) -> StateResult<()> {
        let value = serde_json::to_vec(doc).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_doc<T: DeserializeOwned>(&self, def: DocTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let doc: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    fn delete_doc(&self, def: DocTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Full scan, keeping documents that match `keep`.
    fn scan<T, F>(&self, def: DocTable, mut keep: F) -> StateResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&T) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let doc: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&doc) {
                results.push(doc);
            }
        }
        Ok(results)
    }

    /// Read-modify-write of one document inside a single write transaction.
    ///
    /// `mutate` returns `false` to leave the stored document untouched.
    /// Returns the resulting document, or `None` if the key is absent.
    fn modify_doc<T, F>(&self, def: DocTable, key: &str, mutate: F) -> StateResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            match current {
                Some(mut doc) => {
                    if mutate(&mut doc) {
                        let value = serde_json::to_vec(&doc).map_err(map_err!(Serialize))?;
                        table
                            .insert(key, value.as_slice())
                            .map_err(map_err!(Write))?;
                    }
                    Some(doc)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        instance.validate().map_err(StateError::Invariant)?;
        self.put_doc(INSTANCES, &instance.id, instance)?;
        debug!(instance_id = %instance.id, "instance stored");
        Ok(())
    }

    /// Get an instance by id.
    pub fn get_instance(&self, id: &str) -> StateResult<Option<Instance>> {
        self.get_doc(INSTANCES, id)
    }

    /// Get an instance by id, failing with `NotFound` if absent.
    pub fn require_instance(&self, id: &str) -> StateResult<Instance> {
        self.get_instance(id)?
            .ok_or_else(|| StateError::NotFound(format!("instance {id}")))
    }

    /// Atomically update one instance. Returns `None` if it does not exist.
    ///
    /// The update is rejected (and nothing written) if it would break the
    /// isolation-master invariant.
    pub fn update_instance<F>(&self, id: &str, f: F) -> StateResult<Option<Instance>>
    where
        F: FnOnce(&mut Instance),
    {
        let mut violation = None;
        let updated = self.modify_doc(INSTANCES, id, |instance: &mut Instance| {
            let before = instance.clone();
            f(instance);
            if let Err(e) = instance.validate() {
                violation = Some(e);
                *instance = before;
                return false;
            }
            instance.updated_at = epoch_secs();
            true
        })?;
        match violation {
            Some(e) => Err(StateError::Invariant(e)),
            None => Ok(updated),
        }
    }

    /// Delete an instance by id. Returns true if it existed.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete_doc(INSTANCES, id)?;
        debug!(instance_id = %id, existed, "instance deleted");
        Ok(existed)
    }

    /// List all instances.
    pub fn list_instances(&self) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, |_: &Instance| true)
    }

    /// Find an instance by its public short hash.
    pub fn find_instance_by_short_hash(&self, short_hash: &str) -> StateResult<Option<Instance>> {
        Ok(self
            .scan(INSTANCES, |i: &Instance| i.short_hash == short_hash)?
            .into_iter()
            .next())
    }

    /// Instances answering at the given elastic hostname.
    pub fn find_instances_by_hostname(&self, hostname: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, |i: &Instance| {
            i.elastic_hostname.eq_ignore_ascii_case(hostname)
        })
    }

    /// Every instance carrying the given isolation id, master included.
    pub fn list_isolation_members(&self, isolation_id: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, |i: &Instance| {
            i.isolated.as_deref() == Some(isolation_id)
        })
    }

    /// The unique instance flagged as master of the isolation group.
    pub fn find_isolation_master(&self, isolation_id: &str) -> StateResult<Option<Instance>> {
        let masters = self.scan(INSTANCES, |i: &Instance| i.is_master_of(isolation_id))?;
        if masters.len() > 1 {
            return Err(StateError::Invariant(format!(
                "isolation {isolation_id} has {} masters",
                masters.len()
            )));
        }
        Ok(masters.into_iter().next())
    }

    /// Master-pod instances built from `org/repo` (case-insensitive).
    pub fn find_master_instances_for_repo(&self, full_repo: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, |i: &Instance| {
            i.master_pod
                && i.repo
                    .as_deref()
                    .is_some_and(|r| r.eq_ignore_ascii_case(full_repo))
        })
    }

    /// Instances holding an edge to `target_id`.
    pub fn find_dependents(&self, target_id: &str) -> StateResult<Vec<Instance>> {
        self.scan(INSTANCES, |i: &Instance| i.depends_on(target_id))
    }

    // ── Isolation groups ───────────────────────────────────────────

    /// Insert or update an isolation group.
    pub fn put_isolation(&self, isolation: &IsolationGroup) -> StateResult<()> {
        self.put_doc(ISOLATIONS, &isolation.id, isolation)?;
        debug!(isolation_id = %isolation.id, state = %isolation.state, "isolation stored");
        Ok(())
    }

    /// Get an isolation group by id.
    pub fn get_isolation(&self, id: &str) -> StateResult<Option<IsolationGroup>> {
        self.get_doc(ISOLATIONS, id)
    }

    /// List all isolation groups.
    pub fn list_isolations(&self) -> StateResult<Vec<IsolationGroup>> {
        self.scan(ISOLATIONS, |_: &IsolationGroup| true)
    }

    /// Delete an isolation group. Returns true if it existed.
    pub fn delete_isolation(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete_doc(ISOLATIONS, id)?;
        debug!(isolation_id = %id, existed, "isolation deleted");
        Ok(existed)
    }

    /// Conditional update: apply `f` only if `condition` holds on the stored
    /// document, all within one write transaction.
    ///
    /// Returns the updated group, or `None` if it is absent or the condition
    /// did not hold (e.g. a concurrent caller already transitioned it).
    pub fn update_isolation_if<C, F>(
        &self,
        id: &str,
        condition: C,
        f: F,
    ) -> StateResult<Option<IsolationGroup>>
    where
        C: FnOnce(&IsolationGroup) -> bool,
        F: FnOnce(&mut IsolationGroup),
    {
        let mut applied = false;
        let result = self.modify_doc(ISOLATIONS, id, |isolation: &mut IsolationGroup| {
            if !condition(isolation) {
                return false;
            }
            f(isolation);
            isolation.updated_at = epoch_secs();
            applied = true;
            true
        })?;
        debug!(isolation_id = %id, applied, "conditional isolation update");
        Ok(result.filter(|_| applied))
    }

    // ── Auto-isolation configurations ──────────────────────────────

    /// Insert or update the configuration for its master instance.
    pub fn put_auto_isolation_config(&self, config: &AutoIsolationConfig) -> StateResult<()> {
        self.put_doc(AUTO_ISOLATION_CONFIGS, &config.instance_id, config)
    }

    /// Configuration attached to a master instance, if any.
    pub fn get_auto_isolation_config(
        &self,
        instance_id: &str,
    ) -> StateResult<Option<AutoIsolationConfig>> {
        self.get_doc(AUTO_ISOLATION_CONFIGS, instance_id)
    }

    /// Delete the configuration for a master instance.
    pub fn delete_auto_isolation_config(&self, instance_id: &str) -> StateResult<bool> {
        self.delete_doc(AUTO_ISOLATION_CONFIGS, instance_id)
    }

    // ── Outbox ─────────────────────────────────────────────────────

    /// Append a message to the outbox. Returns its sequence number.
    pub fn push_outbox<T: Serialize>(&self, message: &T) -> StateResult<u64> {
        let value = serde_json::to_vec(message).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut table = txn.open_table(OUTBOX).map_err(map_err!(Table))?;
            let last = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value());
            seq = last.map_or(1, |k| k + 1);
            table
                .insert(seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(seq)
    }

    /// Remove and return every queued message, oldest first.
    pub fn drain_outbox<T: DeserializeOwned>(&self) -> StateResult<Vec<T>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut messages = Vec::new();
        {
            let mut table = txn.open_table(OUTBOX).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let message: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                keys.push(key.value());
                messages.push(message);
            }
            for key in keys {
                table.remove(key).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(messages)
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
