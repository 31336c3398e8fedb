//! Managers for records the collector derives from the topology
//!
//! Managers react to change events from the records store. Reacting only
//! queues work. Each manager drains its queue on its own task, re-reads the
//! current state of the store and graph, and then creates or deletes its
//! synthetic records. Repeating the work for the same input is a no-op.

pub mod address;
pub mod pairs;
pub mod process;

pub use address::AddressManager;
pub use pairs::{PairManager, ProcessPair};
pub use process::ProcessManager;

use crate::records::{Record, RecordKind};
use crate::store::RecordStore;

/// A committed mutation of the records store
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(Record),
    Updated { prev: Record, curr: Record },
    Deleted(Record),
}

impl ChangeEvent {
    /// The record as it is after the change, or as it was before a delete
    pub fn record(&self) -> &Record {
        match self {
            ChangeEvent::Added(record) | ChangeEvent::Deleted(record) => record,
            ChangeEvent::Updated { curr, .. } => curr,
        }
    }

    pub fn previous(&self) -> Option<&Record> {
        match self {
            ChangeEvent::Updated { prev, .. } => Some(prev),
            _ => None,
        }
    }

    pub fn id(&self) -> &str {
        self.record().identity()
    }

    pub fn kind(&self) -> RecordKind {
        self.record().kind()
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeEvent::Deleted(_))
    }
}

/// Responds to records store changes
///
/// Reactors run on the collector's work queue, one event at a time. They
/// should only read from the store and hand anything slow to their own task.
pub trait Reactor: Send + Sync {
    fn handle_change_event(&self, event: &ChangeEvent, records: &RecordStore);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ConnectorRecord;

    #[test]
    fn test_change_event_accessors() {
        let prev: Record = ConnectorRecord {
            id: "c1".to_string(),
            dest_host: Some("10.0.0.1".to_string()),
            ..Default::default()
        }
        .into();
        let curr: Record = ConnectorRecord {
            id: "c1".to_string(),
            dest_host: Some("10.0.0.2".to_string()),
            ..Default::default()
        }
        .into();

        let event = ChangeEvent::Updated {
            prev: prev.clone(),
            curr: curr.clone(),
        };
        assert_eq!(event.id(), "c1");
        assert_eq!(event.kind(), RecordKind::Connector);
        assert_eq!(event.record(), &curr);
        assert_eq!(event.previous(), Some(&prev));
        assert!(!event.is_delete());
        assert!(ChangeEvent::Deleted(prev).is_delete());
    }
}
