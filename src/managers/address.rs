//! Address materialization
//!
//! Keeps exactly one [`AddressRecord`] for every (name, protocol) that at
//! least one listener or connector references.

use super::{ChangeEvent, Reactor};
use crate::identity::IdProvider;
use crate::records::{AddressRecord, Record};
use crate::store::indexers::ADDRESS_INDEX;
use crate::store::{Entry, RecordStore, SourceRef};
use ahash::{HashSet, HashSetExt};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub name: String,
    pub protocol: String,
}

impl AddressKey {
    /// Address referenced by a listener or connector
    pub fn of(record: &Record) -> Option<Self> {
        let (address, protocol) = match record {
            Record::Listener(r) => (r.address.as_ref()?, r.protocol.as_ref()?),
            Record::Connector(r) => (r.address.as_ref()?, r.protocol.as_ref()?),
            _ => return None,
        };
        Some(Self {
            name: address.clone(),
            protocol: protocol.clone(),
        })
    }
}

pub struct AddressManager {
    records: Arc<RecordStore>,
    idp: Arc<dyn IdProvider>,
    source: SourceRef,
    /// Keys whose address record is known to exist
    known: Mutex<HashSet<AddressKey>>,
    queue: mpsc::UnboundedSender<AddressKey>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<AddressKey>>>,
}

impl AddressManager {
    /// Create a new address manager writing records as `source`
    pub fn new(records: Arc<RecordStore>, idp: Arc<dyn IdProvider>, source: SourceRef) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            records,
            idp,
            source,
            known: Mutex::new(HashSet::new()),
            queue,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Bring the address record for `key` in line with the store
    ///
    /// Returns true when a record was added or deleted.
    pub fn reconcile(&self, key: &AddressKey) -> bool {
        let exemplar = Entry::exemplar(
            AddressRecord {
                name: key.name.clone(),
                protocol: key.protocol.clone(),
                ..Default::default()
            }
            .into(),
        );
        let matching = self.records.index(ADDRESS_INDEX, &exemplar);
        let referenced = matching
            .iter()
            .any(|e| matches!(e.record, Record::Listener(_) | Record::Connector(_)));

        if referenced {
            if self.known.lock().contains(key) {
                return false;
            }
            let exists = matching
                .iter()
                .any(|e| matches!(e.record, Record::Address(_)));
            self.known.lock().insert(key.clone());
            if exists {
                return false;
            }

            let id = self.idp.id("address", &[&key.name, &key.protocol]);
            tracing::info!(
                id = %id,
                name = %key.name,
                protocol = %key.protocol,
                "Adding address"
            );
            return self.records.add(
                AddressRecord {
                    id,
                    name: key.name.clone(),
                    protocol: key.protocol.clone(),
                    start: Utc::now(),
                }
                .into(),
                self.source.clone(),
            );
        }

        self.known.lock().remove(key);
        let mut deleted = false;
        for entry in matching {
            if matches!(entry.record, Record::Address(_)) && entry.metadata.source == self.source {
                tracing::info!(
                    id = entry.record.identity(),
                    name = %key.name,
                    protocol = %key.protocol,
                    "Deleting address with no listeners or connectors"
                );
                deleted |= self.records.delete(entry.record.identity()).is_some();
            }
        }
        deleted
    }

    /// Reconcile every queued key without waiting, returning how many ran
    ///
    /// Does nothing while [`AddressManager::run`] owns the queue.
    pub fn drain(&self) -> usize {
        let mut keys = HashSet::new();
        if let Some(receiver) = self.receiver.lock().as_mut() {
            while let Ok(key) = receiver.try_recv() {
                keys.insert(key);
            }
        }
        for key in &keys {
            self.reconcile(key);
        }
        keys.len()
    }

    /// Process queued keys until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            tracing::warn!("Address manager is already running");
            return;
        };

        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = receiver.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            // Collapse bursts for the same address into a single pass
            let mut keys = HashSet::new();
            keys.insert(key);
            while let Ok(key) = receiver.try_recv() {
                keys.insert(key);
            }
            for key in &keys {
                self.reconcile(key);
            }
        }
        tracing::debug!("Address manager stopped");
    }
}

impl AddressManager {
    fn enqueue(&self, key: AddressKey, id: &str) {
        if self.queue.send(key).is_err() {
            tracing::debug!(id = %id, "Address queue closed, dropping event");
        }
    }
}

impl Reactor for AddressManager {
    fn handle_change_event(&self, event: &ChangeEvent, _records: &RecordStore) {
        if let (ChangeEvent::Deleted(_), Record::Address(address)) = (event, event.record()) {
            // Removed behind our back, recreate it if still referenced
            let key = AddressKey {
                name: address.name.clone(),
                protocol: address.protocol.clone(),
            };
            self.known.lock().remove(&key);
            self.enqueue(key, event.id());
            return;
        }

        let keys = [
            AddressKey::of(event.record()),
            event.previous().and_then(AddressKey::of),
        ];
        for key in keys.into_iter().flatten() {
            self.enqueue(key, event.id());
        }
    }
}
