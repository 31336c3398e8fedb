//! In-memory record store
//!
//! A concurrency safe map of record id to [`Entry`] with pluggable secondary
//! indices. Every mutation reindexes the affected entry before the lock is
//! released. Change handlers run on the calling thread after the lock is
//! released so they may call back into the store.

pub mod indexers;

use crate::error::{CollectorError, Result};
use crate::records::Record;
use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use indexers::standard_indexers;

/// Identifies the event source that produced a record
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

impl SourceRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.version, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub last_update: DateTime<Utc>,
    pub source: SourceRef,
}

/// A stored record with its bookkeeping metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub metadata: Metadata,
    pub record: Record,
}

impl Entry {
    /// Entry with empty metadata, used to query indices
    pub fn exemplar(record: Record) -> Self {
        Self {
            metadata: Metadata {
                last_update: DateTime::<Utc>::default(),
                source: SourceRef::default(),
            },
            record,
        }
    }

    /// Entry matching everything produced by `source`, used with the source index
    pub fn source_exemplar(source: SourceRef) -> Self {
        Self {
            metadata: Metadata {
                last_update: DateTime::<Utc>::default(),
                source,
            },
            record: Record::Address(Default::default()),
        }
    }
}

/// Maps an entry to the index values it should be found under
pub type Indexer = fn(&Entry) -> Vec<String>;

type EntryHandler = Box<dyn Fn(&Entry) + Send + Sync>;
type ChangeHandler = Box<dyn Fn(&Entry, &Entry) + Send + Sync>;

/// Callbacks fired after a mutation is committed
#[derive(Default)]
pub struct EventHandlers {
    pub on_add: Option<EntryHandler>,
    pub on_change: Option<ChangeHandler>,
    pub on_delete: Option<EntryHandler>,
}

/// Result of [`RecordStore::patch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// No record existed, the patch was added as a new record
    Added,
    /// At least one attribute differed and was overwritten
    Changed,
    /// Every attribute already matched
    NoChange,
}

type KeySet = HashSet<String>;

#[derive(Default)]
struct StoreState {
    items: HashMap<String, Entry>,
    indices: HashMap<String, HashMap<String, KeySet>>,
}

/// Builder for [`RecordStore`]
#[derive(Default)]
pub struct StoreBuilder {
    indexers: HashMap<String, Indexer>,
    handlers: EventHandlers,
}

impl StoreBuilder {
    pub fn indexer(mut self, name: impl Into<String>, indexer: Indexer) -> Self {
        self.indexers.insert(name.into(), indexer);
        self
    }

    pub fn standard_indexers(mut self) -> Self {
        self.indexers.extend(standard_indexers());
        self
    }

    pub fn on_add(mut self, f: impl Fn(&Entry) + Send + Sync + 'static) -> Self {
        self.handlers.on_add = Some(Box::new(f));
        self
    }

    pub fn on_change(mut self, f: impl Fn(&Entry, &Entry) + Send + Sync + 'static) -> Self {
        self.handlers.on_change = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Entry) + Send + Sync + 'static) -> Self {
        self.handlers.on_delete = Some(Box::new(f));
        self
    }

    pub fn build(self) -> RecordStore {
        RecordStore {
            state: RwLock::new(StoreState::default()),
            indexers: self.indexers,
            handlers: self.handlers,
        }
    }
}

/// Indexed record store
pub struct RecordStore {
    state: RwLock<StoreState>,
    indexers: HashMap<String, Indexer>,
    handlers: EventHandlers,
}

impl Default for RecordStore {
    fn default() -> Self {
        StoreBuilder::default().standard_indexers().build()
    }
}

impl RecordStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// Add a new record. Returns false when a record with the same id exists.
    pub fn add(&self, record: Record, source: SourceRef) -> bool {
        let entry = {
            let mut state = self.state.write();
            let key = record.identity().to_string();
            if state.items.contains_key(&key) {
                return false;
            }
            let entry = Entry {
                metadata: Metadata {
                    last_update: Utc::now(),
                    source,
                },
                record,
            };
            self.reindex(&mut state, &key, None, &entry);
            state.items.insert(key, entry.clone());
            entry
        };

        if let Some(on_add) = &self.handlers.on_add {
            on_add(&entry);
        }
        true
    }

    /// Replace an existing record, keeping its source. Returns false when absent.
    pub fn update(&self, record: Record) -> bool {
        let (prev, next) = {
            let mut state = self.state.write();
            let key = record.identity().to_string();
            let Some(prev) = state.items.get(&key).cloned() else {
                return false;
            };
            let next = Entry {
                metadata: Metadata {
                    last_update: Utc::now(),
                    source: prev.metadata.source.clone(),
                },
                record,
            };
            self.reindex(&mut state, &key, Some(&prev), &next);
            state.items.insert(key, next.clone());
            (prev, next)
        };

        if let Some(on_change) = &self.handlers.on_change {
            on_change(&prev, &next);
        }
        true
    }

    /// Merge the attributes present on `record` into the stored record
    ///
    /// Only attributes that differ are overwritten. When nothing differs no
    /// change event fires. When no record exists the patch is added.
    pub fn patch(&self, record: Record, source: SourceRef) -> Result<PatchOutcome> {
        let key = record.identity().to_string();
        let (prev, next) = {
            let mut state = self.state.write();
            let Some(curr) = state.items.get(&key).cloned() else {
                let entry = Entry {
                    metadata: Metadata {
                        last_update: Utc::now(),
                        source,
                    },
                    record,
                };
                self.reindex(&mut state, &key, None, &entry);
                state.items.insert(key, entry.clone());
                drop(state);
                if let Some(on_add) = &self.handlers.on_add {
                    on_add(&entry);
                }
                return Ok(PatchOutcome::Added);
            };

            if curr.record.kind() != record.kind() {
                return Err(CollectorError::RecordTypeMismatch {
                    id: key,
                    stored: curr.record.kind().type_name(),
                    incoming: record.kind().type_name(),
                });
            }

            let Some(patched) = merge_attributes(&key, &curr.record, &record)? else {
                return Ok(PatchOutcome::NoChange);
            };

            let next = Entry {
                metadata: Metadata {
                    last_update: Utc::now(),
                    source: curr.metadata.source.clone(),
                },
                record: patched,
            };
            self.reindex(&mut state, &key, Some(&curr), &next);
            state.items.insert(key, next.clone());
            (curr, next)
        };

        if let Some(on_change) = &self.handlers.on_change {
            on_change(&prev, &next);
        }
        Ok(PatchOutcome::Changed)
    }

    pub fn get(&self, id: &str) -> Option<Entry> {
        self.state.read().items.get(id).cloned()
    }

    /// Remove a record, returning the removed entry
    pub fn delete(&self, id: &str) -> Option<Entry> {
        let prev = {
            let mut state = self.state.write();
            let prev = state.items.remove(id)?;
            self.unindex(&mut state, id, &prev);
            prev
        };

        if let Some(on_delete) = &self.handlers.on_delete {
            on_delete(&prev);
        }
        Some(prev)
    }

    pub fn list(&self) -> Vec<Entry> {
        self.state.read().items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically swap the full contents of the store and rebuild every index
    ///
    /// No change events fire.
    pub fn replace(&self, entries: Vec<Entry>) {
        let mut state = self.state.write();
        state.items = HashMap::with_capacity(entries.len());
        state.indices = HashMap::new();
        for entry in entries {
            let key = entry.record.identity().to_string();
            self.reindex(&mut state, &key, None, &entry);
            state.items.insert(key, entry);
        }
    }

    /// Entries sharing any index value with `exemplar` under the named index
    ///
    /// Results are ordered by record id. An unknown index yields nothing.
    pub fn index(&self, name: &str, exemplar: &Entry) -> Vec<Entry> {
        let Some(indexer) = self.indexers.get(name) else {
            return Vec::new();
        };
        let values = indexer(exemplar);

        let state = self.state.read();
        let Some(index) = state.indices.get(name) else {
            return Vec::new();
        };

        let mut keys: Vec<&String> = values
            .iter()
            .filter_map(|value| index.get(value))
            .flatten()
            .collect();
        keys.sort_unstable();
        keys.dedup();

        keys.into_iter()
            .filter_map(|key| state.items.get(key).cloned())
            .collect()
    }

    /// Distinct values currently present in the named index, sorted
    pub fn index_values(&self, name: &str) -> Vec<String> {
        let state = self.state.read();
        let mut values: Vec<String> = state
            .indices
            .get(name)
            .map(|index| index.keys().cloned().collect())
            .unwrap_or_default();
        values.sort_unstable();
        values
    }

    fn unindex(&self, state: &mut StoreState, key: &str, entry: &Entry) {
        for (name, indexer) in &self.indexers {
            let Some(index) = state.indices.get_mut(name) else {
                continue;
            };
            for value in indexer(entry) {
                if let Some(set) = index.get_mut(&value) {
                    set.remove(key);
                    if set.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn reindex(&self, state: &mut StoreState, key: &str, prev: Option<&Entry>, next: &Entry) {
        if let Some(prev) = prev {
            self.unindex(state, key, prev);
        }
        for (name, indexer) in &self.indexers {
            let index = state.indices.entry(name.clone()).or_default();
            for value in indexer(next) {
                index
                    .entry(value)
                    .or_insert_with(KeySet::new)
                    .insert(key.to_string());
            }
        }
    }
}

/// Overlay the attributes of `incoming` onto `current`
///
/// Returns `None` when every attribute of `incoming` already matches.
fn merge_attributes(id: &str, current: &Record, incoming: &Record) -> Result<Option<Record>> {
    let encode = |record: &Record| -> Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(record).map_err(|source| CollectorError::RecordEncoding {
            id: id.to_string(),
            source,
        })? {
            serde_json::Value::Object(attrs) => Ok(attrs),
            _ => Err(CollectorError::RecordShape { id: id.to_string() }),
        }
    };

    let mut attrs = encode(current)?;
    let mut changed = false;
    for (key, value) in encode(incoming)? {
        if attrs.get(&key) != Some(&value) {
            attrs.insert(key, value);
            changed = true;
        }
    }
    if !changed {
        return Ok(None);
    }

    serde_json::from_value(serde_json::Value::Object(attrs))
        .map(Some)
        .map_err(|source| CollectorError::RecordDecoding {
            id: id.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::indexers::*;
    use super::*;
    use crate::records::{ConnectorRecord, ProcessRecord, RouterRecord, SiteRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn site(id: &str, name: &str) -> Record {
        SiteRecord {
            id: id.to_string(),
            name: Some(name.to_string()),
            ..Default::default()
        }
        .into()
    }

    fn router(id: &str, parent: &str) -> Record {
        RouterRecord {
            id: id.to_string(),
            parent: Some(parent.to_string()),
            ..Default::default()
        }
        .into()
    }

    #[derive(Default)]
    struct Counts {
        added: AtomicUsize,
        changed: AtomicUsize,
        deleted: AtomicUsize,
    }

    fn counting_store() -> (RecordStore, Arc<Counts>) {
        let counts = Arc::new(Counts::default());
        let (a, c, d) = (counts.clone(), counts.clone(), counts.clone());
        let store = RecordStore::builder()
            .standard_indexers()
            .on_add(move |_| {
                a.added.fetch_add(1, Ordering::SeqCst);
            })
            .on_change(move |_, _| {
                c.changed.fetch_add(1, Ordering::SeqCst);
            })
            .on_delete(move |_| {
                d.deleted.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        (store, counts)
    }

    #[test]
    fn test_add_get_round_trip() {
        let store = RecordStore::default();
        let source = SourceRef::new("router-a", "1");
        let record = site("site-1", "east");

        assert!(store.add(record.clone(), source.clone()));
        let entry = store.get("site-1").unwrap();
        assert_eq!(entry.record, record);
        assert_eq!(entry.metadata.source, source);

        assert!(!store.add(site("site-1", "other"), SourceRef::default()));
        assert_eq!(store.get("site-1").unwrap().record, record);
    }

    #[test]
    fn test_update_requires_existing() {
        let (store, counts) = counting_store();
        assert!(!store.update(site("site-1", "east")));

        store.add(site("site-1", "east"), SourceRef::new("s", "1"));
        assert!(store.update(site("site-1", "west")));

        let entry = store.get("site-1").unwrap();
        assert_eq!(entry.record.name(), Some("west"));
        assert_eq!(entry.metadata.source.id, "s");
        assert_eq!(counts.changed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_patch_single_field() {
        let (store, counts) = counting_store();
        store.add(
            ProcessRecord {
                id: "p1".to_string(),
                name: Some("backend".to_string()),
                group: Some("backend-group".to_string()),
                source_host: Some("10.0.0.5".to_string()),
                ..Default::default()
            }
            .into(),
            SourceRef::default(),
        );

        let outcome = store
            .patch(
                ProcessRecord {
                    id: "p1".to_string(),
                    name: Some("backend-v2".to_string()),
                    ..Default::default()
                }
                .into(),
                SourceRef::default(),
            )
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Changed);

        let Record::Process(process) = store.get("p1").unwrap().record else {
            panic!("expected process record");
        };
        assert_eq!(process.name.as_deref(), Some("backend-v2"));
        assert_eq!(process.group.as_deref(), Some("backend-group"));
        assert_eq!(process.source_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(counts.changed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_patch_without_difference_is_silent() {
        let (store, counts) = counting_store();
        store.add(site("site-1", "east"), SourceRef::default());

        let outcome = store
            .patch(site("site-1", "east"), SourceRef::default())
            .unwrap();
        assert_eq!(outcome, PatchOutcome::NoChange);
        assert_eq!(counts.changed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_patch_adds_when_absent() {
        let (store, counts) = counting_store();
        let outcome = store
            .patch(site("site-1", "east"), SourceRef::new("s", "2"))
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Added);
        assert_eq!(counts.added.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("site-1").unwrap().metadata.source.version, "2");
    }

    #[test]
    fn test_patch_type_mismatch() {
        let store = RecordStore::default();
        store.add(site("x", "east"), SourceRef::default());
        let err = store
            .patch(router("x", "site-1"), SourceRef::default())
            .unwrap_err();
        assert!(matches!(err, CollectorError::RecordTypeMismatch { .. }));
    }

    #[test]
    fn test_delete_unindexes() {
        let (store, counts) = counting_store();
        store.add(router("r1", "site-1"), SourceRef::default());

        let exemplar = Entry::exemplar(router("", "site-1"));
        assert_eq!(store.index(TYPE_PARENT_INDEX, &exemplar).len(), 1);

        let removed = store.delete("r1").unwrap();
        assert_eq!(removed.record.identity(), "r1");
        assert!(store.delete("r1").is_none());
        assert!(store.index(TYPE_PARENT_INDEX, &exemplar).is_empty());
        assert!(store.index_values(TYPE_PARENT_INDEX).is_empty());
        assert_eq!(counts.deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_moves_index_values() {
        let store = RecordStore::default();
        store.add(router("r1", "site-1"), SourceRef::default());
        store.update(router("r1", "site-2"));

        let old = Entry::exemplar(router("", "site-1"));
        let new = Entry::exemplar(router("", "site-2"));
        assert!(store.index(TYPE_PARENT_INDEX, &old).is_empty());
        assert_eq!(store.index(TYPE_PARENT_INDEX, &new).len(), 1);
    }

    #[test]
    fn test_index_by_type_and_source() {
        let store = RecordStore::default();
        let a = SourceRef::new("a", "1");
        let b = SourceRef::new("b", "1");
        store.add(site("s1", "east"), a.clone());
        store.add(site("s2", "west"), b.clone());
        store.add(router("r1", "s1"), a.clone());

        let sites = store.index(TYPE_INDEX, &Entry::exemplar(site("", "")));
        let ids: Vec<_> = sites.iter().map(|e| e.record.identity()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let from_a = store.index(SOURCE_INDEX, &Entry::source_exemplar(a));
        assert_eq!(from_a.len(), 2);

        assert!(store.index("NoSuchIndex", &Entry::source_exemplar(b)).is_empty());
    }

    #[test]
    fn test_replace_rebuilds_indices() {
        let (store, counts) = counting_store();
        store.add(site("s1", "east"), SourceRef::default());

        let replacement = vec![Entry::exemplar(router("r1", "s9"))];
        store.replace(replacement);

        assert!(store.get("s1").is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.index_values(TYPE_PARENT_INDEX),
            vec!["flow/v1/RouterRecord/s9".to_string()]
        );
        assert_eq!(counts.deleted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handlers_may_reenter_store() {
        let store = Arc::new_cyclic(|weak: &std::sync::Weak<RecordStore>| {
            let weak = weak.clone();
            RecordStore::builder()
                .standard_indexers()
                .on_add(move |entry| {
                    if let (Some(store), Record::Connector(_)) = (weak.upgrade(), &entry.record) {
                        assert!(store.get(entry.record.identity()).is_some());
                        store.add(site("derived", "from-handler"), SourceRef::default());
                    }
                })
                .build()
        });

        store.add(
            ConnectorRecord {
                id: "c1".to_string(),
                ..Default::default()
            }
            .into(),
            SourceRef::default(),
        );
        assert!(store.get("derived").is_some());
    }

    #[test]
    fn test_concurrent_writers() {
        let store = Arc::new(RecordStore::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..250 {
                        store.add(router(&format!("r-{t}-{i}"), "site-1"), SourceRef::default());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 2000);
        let children = store.index(TYPE_PARENT_INDEX, &Entry::exemplar(router("", "site-1")));
        assert_eq!(children.len(), 2000);
    }
}
