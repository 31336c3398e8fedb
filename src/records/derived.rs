//! Records synthesized by the collector itself

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference to another record by id with its display name
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedReference {
    pub id: String,
    pub name: String,
}

/// A routing address observed on at least one listener or connector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub start: DateTime<Utc>,
}

/// A named group of processes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessGroupRecord {
    pub id: String,
    pub name: String,
    pub start: DateTime<Utc>,
}

/// A transport flow enriched with its resolved endpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub address: String,
    pub protocol: String,
    /// Host and port the connector forwards to
    #[serde(default)]
    pub connector_host: String,
    #[serde(default)]
    pub connector_port: String,
    pub listener: NamedReference,
    pub connector: NamedReference,
    pub source: NamedReference,
    pub source_site: NamedReference,
    #[serde(default)]
    pub source_router: NamedReference,
    pub source_group: NamedReference,
    pub dest: NamedReference,
    pub dest_site: NamedReference,
    #[serde(default)]
    pub dest_router: NamedReference,
    pub dest_group: NamedReference,
}

/// An application flow enriched through its parent connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub transport_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub address: String,
    pub protocol: String,
    pub method: String,
    pub result_class: String,
    pub listener: NamedReference,
    pub connector: NamedReference,
    pub source: NamedReference,
    pub source_site: NamedReference,
    #[serde(default)]
    pub source_router: NamedReference,
    pub dest: NamedReference,
    pub dest_site: NamedReference,
    #[serde(default)]
    pub dest_router: NamedReference,
}

/// Traffic observed between two sites for a protocol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SitePairRecord {
    pub id: String,
    pub source: String,
    pub dest: String,
    pub protocol: String,
    pub start: DateTime<Utc>,
}

/// Traffic observed between two process groups for a protocol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcGroupPairRecord {
    pub id: String,
    pub source: String,
    pub dest: String,
    pub protocol: String,
    pub start: DateTime<Utc>,
}

/// Traffic observed between two processes for a protocol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcPairRecord {
    pub id: String,
    pub source: String,
    pub dest: String,
    pub protocol: String,
    pub start: DateTime<Utc>,
}

/// A client host at a site that originates flows but has no known process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSourceRecord {
    pub id: String,
    pub site: String,
    pub host: String,
    pub start: DateTime<Utc>,
}
