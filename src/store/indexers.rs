//! Standard secondary indices for record stores

use super::{Entry, Indexer};
use crate::records::Record;
use ahash::{HashMap, HashMapExt};

pub const SOURCE_INDEX: &str = "BySource";
pub const TYPE_INDEX: &str = "ByType";
pub const TYPE_PARENT_INDEX: &str = "ByTypeParent";
pub const TYPE_NAME_INDEX: &str = "ByTypeName";
pub const ADDRESS_INDEX: &str = "ByAddress";
pub const LIFECYCLE_STATUS_INDEX: &str = "ByLifecycleStatus";

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_TERMINATED: &str = "terminated";

/// `version/id` of the source that produced the entry
pub fn source_indexer(entry: &Entry) -> Vec<String> {
    vec![entry.metadata.source.to_string()]
}

pub fn type_indexer(entry: &Entry) -> Vec<String> {
    vec![entry.record.type_meta().to_string()]
}

/// `type/parent` for records that carry a parent reference
pub fn type_parent_indexer(entry: &Entry) -> Vec<String> {
    match entry.record.parent() {
        Some(parent) => vec![format!("{}/{}", entry.record.type_meta(), parent)],
        None => Vec::new(),
    }
}

/// `type/name` for records that carry a name
pub fn type_name_indexer(entry: &Entry) -> Vec<String> {
    match entry.record.name() {
        Some(name) => vec![format!("{}/{}", entry.record.type_meta(), name)],
        None => Vec::new(),
    }
}

/// `protocol:address` shared by listeners, connectors and address records
pub fn address_indexer(entry: &Entry) -> Vec<String> {
    let key = match &entry.record {
        Record::Listener(l) => l
            .address
            .as_deref()
            .map(|address| address_key(l.protocol.as_deref().unwrap_or_default(), address)),
        Record::Connector(c) => c
            .address
            .as_deref()
            .map(|address| address_key(c.protocol.as_deref().unwrap_or_default(), address)),
        Record::Address(a) => Some(address_key(&a.protocol, &a.name)),
        _ => None,
    };
    key.into_iter().collect()
}

pub fn lifecycle_status_indexer(entry: &Entry) -> Vec<String> {
    if entry.record.lifecycle().is_none() {
        return Vec::new();
    }
    let status = if entry.record.is_terminated() {
        STATUS_TERMINATED
    } else {
        STATUS_ACTIVE
    };
    vec![status.to_string()]
}

/// Index value used by [`address_indexer`]
pub fn address_key(protocol: &str, address: &str) -> String {
    format!("{protocol}:{address}")
}

/// The full set of indices used by the collector stores
pub fn standard_indexers() -> HashMap<String, Indexer> {
    let mut indexers: HashMap<String, Indexer> = HashMap::new();
    indexers.insert(SOURCE_INDEX.to_string(), source_indexer);
    indexers.insert(TYPE_INDEX.to_string(), type_indexer);
    indexers.insert(TYPE_PARENT_INDEX.to_string(), type_parent_indexer);
    indexers.insert(TYPE_NAME_INDEX.to_string(), type_name_indexer);
    indexers.insert(ADDRESS_INDEX.to_string(), address_indexer);
    indexers.insert(LIFECYCLE_STATUS_INDEX.to_string(), lifecycle_status_indexer);
    indexers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AddressRecord, ConnectorRecord, ListenerRecord, RouterRecord};
    use crate::store::SourceRef;

    #[test]
    fn test_source_indexer() {
        let mut entry = Entry::exemplar(AddressRecord::default().into());
        entry.metadata.source = SourceRef::new("router-1", "1");
        assert_eq!(source_indexer(&entry), vec!["1/router-1".to_string()]);
    }

    #[test]
    fn test_type_parent_indexer() {
        let entry = Entry::exemplar(
            RouterRecord {
                id: "r1".to_string(),
                parent: Some("site-1".to_string()),
                ..Default::default()
            }
            .into(),
        );
        assert_eq!(
            type_parent_indexer(&entry),
            vec!["flow/v1/RouterRecord/site-1".to_string()]
        );

        let orphan = Entry::exemplar(RouterRecord::default().into());
        assert!(type_parent_indexer(&orphan).is_empty());
    }

    #[test]
    fn test_address_indexer_shared_key() {
        let listener = Entry::exemplar(
            ListenerRecord {
                id: "l1".to_string(),
                address: Some("bingo".to_string()),
                protocol: Some("tcp".to_string()),
                ..Default::default()
            }
            .into(),
        );
        let connector = Entry::exemplar(
            ConnectorRecord {
                id: "c1".to_string(),
                address: Some("bingo".to_string()),
                protocol: Some("tcp".to_string()),
                ..Default::default()
            }
            .into(),
        );
        let address = Entry::exemplar(
            AddressRecord {
                id: "a1".to_string(),
                name: "bingo".to_string(),
                protocol: "tcp".to_string(),
                ..Default::default()
            }
            .into(),
        );

        assert_eq!(address_indexer(&listener), vec!["tcp:bingo".to_string()]);
        assert_eq!(address_indexer(&connector), address_indexer(&address));

        let no_address = Entry::exemplar(ConnectorRecord::default().into());
        assert!(address_indexer(&no_address).is_empty());
    }

    #[test]
    fn test_lifecycle_status_indexer() {
        let now = chrono::Utc::now();
        let active = Entry::exemplar(
            ConnectorRecord {
                id: "c1".to_string(),
                start_time: Some(now),
                ..Default::default()
            }
            .into(),
        );
        let terminated = Entry::exemplar(
            ConnectorRecord {
                id: "c2".to_string(),
                start_time: Some(now),
                end_time: Some(now),
                ..Default::default()
            }
            .into(),
        );
        assert_eq!(lifecycle_status_indexer(&active), vec![STATUS_ACTIVE]);
        assert_eq!(lifecycle_status_indexer(&terminated), vec![STATUS_TERMINATED]);

        let derived = Entry::exemplar(AddressRecord::default().into());
        assert!(lifecycle_status_indexer(&derived).is_empty());
    }
}
