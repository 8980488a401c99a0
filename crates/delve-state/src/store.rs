//! StateStore — redb-backed state persistence for Delve.
//!
//! Typed CRUD over players, instances, locks, tasks, scores and cards.
//! Claim and event operations live in [`crate::claims`] and
//! [`crate::events`]. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::StateResult;
use crate::tables::*;
use crate::types::*;

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
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

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in [PLAYERS, INSTANCES, CLAIMS, LOCKS, EVENTS, TASKS, SCORES, CARDS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(ACTIVE_CLAIMS).map_err(map_err!(Table))?;
        txn.open_table(RUN_INDEX).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    pub(crate) fn put_json<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub(crate) fn get_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (empty prefix scans everything).
    pub(crate) fn scan_json<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    pub(crate) fn remove_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Delete every record for which `doomed` returns true. Returns the count.
    pub(crate) fn purge<T, F>(&self, table: JsonTable, doomed: F) -> StateResult<usize>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in t.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let record: T = decode(value.value())?;
                if doomed(&record) {
                    keys.push(key.value().to_string());
                }
            }
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            count = keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(count)
    }

    // ── Players ────────────────────────────────────────────────────

    pub fn put_player(&self, player: &Player) -> StateResult<()> {
        self.put_json(PLAYERS, &player.name, player)
    }

    pub fn get_player(&self, name: &str) -> StateResult<Option<Player>> {
        self.get_json(PLAYERS, name)
    }

    pub fn list_players(&self) -> StateResult<Vec<Player>> {
        self.scan_json(PLAYERS, "")
    }

    /// Read-modify-write a player in one transaction. Returns `None` if the
    /// player does not exist.
    pub fn update_player<F>(&self, name: &str, f: F) -> StateResult<Option<Player>>
    where
        F: FnOnce(&mut Player),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(PLAYERS).map_err(map_err!(Table))?;
            let current: Option<Player> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(mut player) => {
                    f(&mut player);
                    let bytes = encode(&player)?;
                    table
                        .insert(name, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(player)
                }
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Instances ──────────────────────────────────────────────────

    pub fn put_instance(&self, instance: &DungeonInstance) -> StateResult<()> {
        let key = instance.table_key();
        self.put_json(INSTANCES, &key, instance)?;
        debug!(%key, state = ?instance.state, "instance stored");
        Ok(())
    }

    /// Get an instance by its `{name}/{address}` key.
    pub fn get_instance(&self, key: &str) -> StateResult<Option<DungeonInstance>> {
        self.get_json(INSTANCES, key)
    }

    pub fn list_instances(&self) -> StateResult<Vec<DungeonInstance>> {
        self.scan_json(INSTANCES, "")
    }

    /// All instances registered under `name`, whatever their address.
    pub fn instances_named(&self, name: &str) -> StateResult<Vec<DungeonInstance>> {
        self.scan_json(INSTANCES, &format!("{name}/"))
    }

    /// Delete an instance by key. Returns true if it existed.
    pub fn delete_instance(&self, key: &str) -> StateResult<bool> {
        let existed = self.remove_key(INSTANCES, key)?;
        debug!(%key, existed, "instance deleted");
        Ok(existed)
    }

    /// Conditionally update an instance inside a single write transaction.
    ///
    /// `f` sees the current record and returns whether to write it back.
    /// Returns the written record, or `None` when the instance is missing
    /// or `f` declined.
    pub fn update_instance<F>(&self, key: &str, f: F) -> StateResult<Option<DungeonInstance>>
    where
        F: FnOnce(&mut DungeonInstance) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: Option<DungeonInstance> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(mut instance) => {
                    if f(&mut instance) {
                        let bytes = encode(&instance)?;
                        table
                            .insert(key, bytes.as_slice())
                            .map_err(map_err!(Write))?;
                        Some(instance)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if written.is_some() {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(written)
    }

    /// Apply `f` only if the instance at `key` (name + address) is still in
    /// the `expected` state. `None` means another writer moved first.
    pub fn compare_and_swap_instance<F>(
        &self,
        key: &str,
        expected: InstanceStatus,
        f: F,
    ) -> StateResult<Option<DungeonInstance>>
    where
        F: FnOnce(&mut DungeonInstance),
    {
        self.update_instance(key, |instance| {
            if instance.state != expected {
                return false;
            }
            f(instance);
            true
        })
    }

    /// Delete the instance at `key` only if `still_matches` accepts the record
    /// as it stands inside the write transaction. Returns the deleted
    /// record, or `None` when it is missing or was declined.
    pub fn delete_instance_if<F>(&self, key: &str, still_matches: F) -> StateResult<Option<DungeonInstance>>
    where
        F: FnOnce(&DungeonInstance) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deleted = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: Option<DungeonInstance> = match table.get(key).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(instance) if still_matches(&instance) => {
                    table.remove(key).map_err(map_err!(Write))?;
                    Some(instance)
                }
                _ => None,
            }
        };
        if deleted.is_some() {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(%key, "instance deleted");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(deleted)
    }

    // ── Locks ──────────────────────────────────────────────────────

    pub fn put_lock(&self, lock: &Lock) -> StateResult<()> {
        self.put_json(LOCKS, &lock.table_key(), lock)
    }

    pub fn get_lock(&self, lock_type: &str, target: &str) -> StateResult<Option<Lock>> {
        self.get_json(LOCKS, &lock_key(lock_type, target))
    }

    pub fn delete_lock(&self, lock_type: &str, target: &str) -> StateResult<bool> {
        self.remove_key(LOCKS, &lock_key(lock_type, target))
    }

    pub fn list_locks(&self) -> StateResult<Vec<Lock>> {
        self.scan_json(LOCKS, "")
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn push_task(&self, task: &Task) -> StateResult<()> {
        self.put_json(TASKS, &task.id, task)?;
        debug!(server = %task.server, command = ?task.command, "task queued");
        Ok(())
    }

    /// All tasks in queue order.
    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        self.scan_json(TASKS, "")
    }

    pub fn tasks_for_server(&self, server: &str) -> StateResult<Vec<Task>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.server == server)
            .collect())
    }

    // ── Scores ─────────────────────────────────────────────────────

    pub fn get_score(&self, player: &str, key: &str) -> StateResult<Option<Score>> {
        self.get_json(SCORES, &format!("{player}:{key}"))
    }

    /// Add `delta` to a score (creating it at zero) and return the new value.
    pub fn add_score(&self, player: &str, key: &str, delta: i64, now: u64) -> StateResult<i64> {
        let table_key = format!("{player}:{key}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let value;
        {
            let mut table = txn.open_table(SCORES).map_err(map_err!(Table))?;
            let current: Option<Score> = match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let mut score = current.unwrap_or_else(|| Score {
                player: player.to_string(),
                key: key.to_string(),
                value: 0,
                updated_at: now,
            });
            score.value += delta;
            score.updated_at = now;
            value = score.value;
            let bytes = encode(&score)?;
            table
                .insert(table_key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(value)
    }

    // ── Cards ──────────────────────────────────────────────────────

    pub fn put_card(&self, card: &Card) -> StateResult<()> {
        self.put_json(CARDS, &card.table_key(), card)
    }

    pub fn cards_for_deck(&self, player: &str, deck_id: &str) -> StateResult<Vec<Card>> {
        self.scan_json(CARDS, &format!("{player}:{deck_id}:"))
    }

    pub fn delete_cards_for_deck(&self, player: &str, deck_id: &str) -> StateResult<usize> {
        self.purge(CARDS, |card: &Card| {
            card.player == player && card.deck_id == deck_id
        })
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Delete locks created before `cutoff`.
    pub fn purge_locks_before(&self, cutoff: u64) -> StateResult<usize> {
        self.purge(LOCKS, |lock: &Lock| lock.created_at < cutoff)
    }

    /// Delete tasks created before `cutoff`.
    pub fn purge_tasks_before(&self, cutoff: u64) -> StateResult<usize> {
        self.purge(TASKS, |task: &Task| task.created_at < cutoff)
    }
}
