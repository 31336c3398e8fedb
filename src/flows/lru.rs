//! Keyed cache ordered by recency of use

use indexmap::IndexMap;
use parking_lot::Mutex;

/// Map of flow id to state that remembers the order entries were last touched
///
/// With a non-zero `max_size` inserting past the bound evicts the least
/// recently touched entries. Evicted ids are handed back to the caller so the
/// matching records can be dropped without holding the cache lock.
pub struct KeyedLruCache<T> {
    entries: Mutex<IndexMap<String, T>>,
    max_size: usize,
}

impl<T: Clone> KeyedLruCache<T> {
    /// Create a new cache, `max_size` of 0 means unbounded
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            max_size,
        }
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.lock().get(id).cloned()
    }

    /// Insert or replace `state`, marking it most recently used
    pub fn push(&self, id: &str, state: T) -> Vec<String> {
        self.upsert(id, || state, |_| ()).1
    }

    /// Apply `f` to the entry for `id`, creating it with `init` when absent
    ///
    /// The entry becomes the most recently used one.
    pub fn upsert<R>(
        &self,
        id: &str,
        init: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> (R, Vec<String>) {
        let mut entries = self.entries.lock();
        let mut state = match entries.shift_remove(id) {
            Some(state) => state,
            None => init(),
        };
        let result = f(&mut state);
        entries.insert(id.to_string(), state);

        let mut evicted = Vec::new();
        if self.max_size > 0 {
            while entries.len() > self.max_size {
                match entries.shift_remove_index(0) {
                    Some((key, _)) => evicted.push(key),
                    None => break,
                }
            }
        }
        (result, evicted)
    }

    /// Apply `f` to an existing entry without changing its recency
    pub fn modify<R>(&self, id: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.entries.lock().get_mut(id).map(f)
    }

    pub fn pop(&self, id: &str) -> Option<T> {
        self.entries.lock().shift_remove(id)
    }

    /// Snapshot of every entry, most recently used first
    pub fn items(&self) -> Vec<T> {
        self.entries.lock().values().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
