//! Telemetry event persistence and run-metadata denormalization.

use std::collections::BTreeSet;

use redb::{ReadableDatabase, ReadableTable};

use crate::error::StateResult;
use crate::store::{StateStore, decode, encode};
use crate::tables::*;
use crate::types::*;

/// One page of run ids still waiting for a metadata merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunPage {
    pub run_ids: Vec<String>,
    /// Where the next page starts; `None` when the scan reached the end.
    pub cursor: Option<String>,
}

impl StateStore {
    pub fn put_event(&self, event: &EventRecord) -> StateResult<()> {
        self.put_json(EVENTS, &event.id, event)
    }

    pub fn get_event(&self, id: &str) -> StateResult<Option<EventRecord>> {
        self.get_json(EVENTS, id)
    }

    /// All events, oldest first.
    pub fn list_events(&self) -> StateResult<Vec<EventRecord>> {
        self.scan_json(EVENTS, "")
    }

    pub fn events_for_run(&self, run_id: &str) -> StateResult<Vec<EventRecord>> {
        Ok(self
            .list_events()?
            .into_iter()
            .filter(|e| e.run_id.as_deref() == Some(run_id))
            .collect())
    }

    /// Distinct run ids among events that carry one but have no `run-type`
    /// metadata yet. At most `limit` ids, in order of first appearance.
    pub fn run_ids_missing_run_type(&self, limit: usize) -> StateResult<Vec<String>> {
        Ok(self.run_ids_missing_run_type_after(None, limit)?.run_ids)
    }

    /// Like [`run_ids_missing_run_type`](Self::run_ids_missing_run_type) but
    /// only looks at events keyed after `after`. The returned cursor is the
    /// last event key scanned when the page filled up, or `None` once the
    /// table is exhausted.
    pub fn run_ids_missing_run_type_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> StateResult<RunPage> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut seen = BTreeSet::new();
        let mut page = RunPage::default();
        let mut last_key = None;
        for entry in table.iter().map_err(map_err!(Read))? {
            if page.run_ids.len() >= limit {
                page.cursor = last_key;
                break;
            }
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if after.is_some_and(|after| key <= after) {
                continue;
            }
            last_key = Some(key.to_string());
            let event: EventRecord = decode(value.value())?;
            let Some(run_id) = event.run_id else {
                continue;
            };
            if event.metadata.contains_key(meta::RUN_TYPE) {
                continue;
            }
            if seen.insert(run_id.clone()) {
                page.run_ids.push(run_id);
            }
        }
        Ok(page)
    }

    /// Merge `metadata` onto every event of `run_id` in one transaction.
    ///
    /// Existing keys are overwritten with the claim's value. Returns the
    /// number of events that actually changed, so a repeat merge returns 0.
    pub fn merge_run_metadata(&self, run_id: &str, metadata: &Metadata) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut changed = 0;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let mut updates = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let mut event: EventRecord = decode(value.value())?;
                if event.run_id.as_deref() != Some(run_id) {
                    continue;
                }
                let mut dirty = false;
                for (k, v) in metadata {
                    if event.metadata.get(k) != Some(v) {
                        event.metadata.insert(k.clone(), v.clone());
                        dirty = true;
                    }
                }
                if dirty {
                    updates.push((key.value().to_string(), encode(&event)?));
                }
            }
            for (key, bytes) in &updates {
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
            changed += updates.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(changed)
    }

    /// Delete events with one of `names` created before `cutoff`.
    pub fn purge_events_before(&self, names: &[&str], cutoff: u64) -> StateResult<usize> {
        self.purge(EVENTS, |event: &EventRecord| {
            event.created_at < cutoff && names.contains(&event.name.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, run_id: Option<&str>, created_at: u64) -> EventRecord {
        let mut new = NewEvent::named(name).player("alex");
        if let Some(run_id) = run_id {
            new = new.meta(meta::RUN_ID, run_id);
        }
        EventRecord::from_new(new, created_at)
    }

    #[test]
    fn missing_run_type_lists_distinct_ids() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_event(&event("player-died", Some("run-1"), 10)).unwrap();
        store.put_event(&event("player-died", Some("run-1"), 11)).unwrap();
        store.put_event(&event("player-seen", None, 12)).unwrap();
        let mut typed = event("game-won", Some("run-2"), 13);
        typed.metadata.insert(meta::RUN_TYPE.into(), "c".into());
        store.put_event(&typed).unwrap();

        assert_eq!(store.run_ids_missing_run_type(10).unwrap(), vec!["run-1".to_string()]);
    }

    #[test]
    fn missing_run_type_pages_past_the_cursor() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_event(&event("player-died", Some("run-1"), 10)).unwrap();
        store.put_event(&event("player-died", Some("run-2"), 11)).unwrap();
        store.put_event(&event("game-won", Some("run-3"), 12)).unwrap();

        let first = store.run_ids_missing_run_type_after(None, 2).unwrap();
        assert_eq!(first.run_ids, vec!["run-1".to_string(), "run-2".to_string()]);
        let cursor = first.cursor.expect("page filled up");

        let second = store.run_ids_missing_run_type_after(Some(&cursor), 2).unwrap();
        assert_eq!(second.run_ids, vec!["run-3".to_string()]);
        assert_eq!(second.cursor, None);
    }

    #[test]
    fn merge_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_event(&event("player-died", Some("run-1"), 10)).unwrap();
        store.put_event(&event("game-lost", Some("run-1"), 11)).unwrap();
        store.put_event(&event("game-lost", Some("run-9"), 12)).unwrap();

        let mut metadata = Metadata::new();
        metadata.insert(meta::RUN_TYPE.into(), "p".into());
        metadata.insert(meta::DECK_ID.into(), "#3".into());

        assert_eq!(store.merge_run_metadata("run-1", &metadata).unwrap(), 2);
        assert_eq!(store.merge_run_metadata("run-1", &metadata).unwrap(), 0);

        for e in store.events_for_run("run-1").unwrap() {
            assert_eq!(e.metadata.get(meta::RUN_TYPE).map(String::as_str), Some("p"));
        }
        let other = store.events_for_run("run-9").unwrap();
        assert!(!other[0].metadata.contains_key(meta::RUN_TYPE));
    }

    #[test]
    fn purge_only_named_old_events() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_event(&event("player-seen", None, 10)).unwrap();
        store.put_event(&event("server-online", None, 10)).unwrap();
        store.put_event(&event("game-won", None, 10)).unwrap();
        store.put_event(&event("player-seen", None, 5000)).unwrap();

        let purged = store
            .purge_events_before(&["player-seen", "server-online", "server-closing"], 1000)
            .unwrap();
        assert_eq!(purged, 2);
        assert_eq!(store.list_events().unwrap().len(), 2);
    }
}
