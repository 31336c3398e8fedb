//! Record model shared by the stores, the graph and the managers
//!
//! Every record kind is a variant of the closed [`Record`] enum. Raw records
//! arrive from routers and controllers, derived records are produced by the
//! collector. Serialized records carry a `type` tag with the record type name.

mod derived;
mod vanflow;

pub use derived::*;
pub use vanflow::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// API version shared by every record type
pub const API_VERSION: &str = "flow/v1";

/// Type metadata attached to every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeMeta {
    pub api_version: &'static str,
    pub type_name: &'static str,
}

impl fmt::Display for TypeMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.type_name)
    }
}

/// Discriminant of [`Record`] without the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Site,
    Router,
    Link,
    RouterAccess,
    Listener,
    Connector,
    Process,
    TransportBiflow,
    AppBiflow,
    Address,
    ProcessGroup,
    Connection,
    Request,
    SitePair,
    ProcGroupPair,
    ProcPair,
    FlowSource,
}

impl RecordKind {
    pub const ALL: [RecordKind; 17] = [
        RecordKind::Site,
        RecordKind::Router,
        RecordKind::Link,
        RecordKind::RouterAccess,
        RecordKind::Listener,
        RecordKind::Connector,
        RecordKind::Process,
        RecordKind::TransportBiflow,
        RecordKind::AppBiflow,
        RecordKind::Address,
        RecordKind::ProcessGroup,
        RecordKind::Connection,
        RecordKind::Request,
        RecordKind::SitePair,
        RecordKind::ProcGroupPair,
        RecordKind::ProcPair,
        RecordKind::FlowSource,
    ];

    pub fn type_name(self) -> &'static str {
        match self {
            RecordKind::Site => "SiteRecord",
            RecordKind::Router => "RouterRecord",
            RecordKind::Link => "LinkRecord",
            RecordKind::RouterAccess => "RouterAccessRecord",
            RecordKind::Listener => "ListenerRecord",
            RecordKind::Connector => "ConnectorRecord",
            RecordKind::Process => "ProcessRecord",
            RecordKind::TransportBiflow => "TransportBiflowRecord",
            RecordKind::AppBiflow => "AppBiflowRecord",
            RecordKind::Address => "AddressRecord",
            RecordKind::ProcessGroup => "ProcessGroupRecord",
            RecordKind::Connection => "ConnectionRecord",
            RecordKind::Request => "RequestRecord",
            RecordKind::SitePair => "SitePairRecord",
            RecordKind::ProcGroupPair => "ProcGroupPairRecord",
            RecordKind::ProcPair => "ProcPairRecord",
            RecordKind::FlowSource => "FlowSourceRecord",
        }
    }

    pub fn type_meta(self) -> TypeMeta {
        TypeMeta {
            api_version: API_VERSION,
            type_name: self.type_name(),
        }
    }

    /// Biflow records go to the flows store, everything else to the records store
    pub fn is_flow(self) -> bool {
        matches!(self, RecordKind::TransportBiflow | RecordKind::AppBiflow)
    }
}

/// A vanflow record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Record {
    #[serde(rename = "SiteRecord")]
    Site(SiteRecord),
    #[serde(rename = "RouterRecord")]
    Router(RouterRecord),
    #[serde(rename = "LinkRecord")]
    Link(LinkRecord),
    #[serde(rename = "RouterAccessRecord")]
    RouterAccess(RouterAccessRecord),
    #[serde(rename = "ListenerRecord")]
    Listener(ListenerRecord),
    #[serde(rename = "ConnectorRecord")]
    Connector(ConnectorRecord),
    #[serde(rename = "ProcessRecord")]
    Process(ProcessRecord),
    #[serde(rename = "TransportBiflowRecord")]
    TransportBiflow(TransportBiflowRecord),
    #[serde(rename = "AppBiflowRecord")]
    AppBiflow(AppBiflowRecord),
    #[serde(rename = "AddressRecord")]
    Address(AddressRecord),
    #[serde(rename = "ProcessGroupRecord")]
    ProcessGroup(ProcessGroupRecord),
    #[serde(rename = "ConnectionRecord")]
    Connection(ConnectionRecord),
    #[serde(rename = "RequestRecord")]
    Request(RequestRecord),
    #[serde(rename = "SitePairRecord")]
    SitePair(SitePairRecord),
    #[serde(rename = "ProcGroupPairRecord")]
    ProcGroupPair(ProcGroupPairRecord),
    #[serde(rename = "ProcPairRecord")]
    ProcPair(ProcPairRecord),
    #[serde(rename = "FlowSourceRecord")]
    FlowSource(FlowSourceRecord),
}

impl Record {
    /// Stable identity of the record within a store
    pub fn identity(&self) -> &str {
        match self {
            Record::Site(r) => &r.id,
            Record::Router(r) => &r.id,
            Record::Link(r) => &r.id,
            Record::RouterAccess(r) => &r.id,
            Record::Listener(r) => &r.id,
            Record::Connector(r) => &r.id,
            Record::Process(r) => &r.id,
            Record::TransportBiflow(r) => &r.id,
            Record::AppBiflow(r) => &r.id,
            Record::Address(r) => &r.id,
            Record::ProcessGroup(r) => &r.id,
            Record::Connection(r) => &r.id,
            Record::Request(r) => &r.id,
            Record::SitePair(r) => &r.id,
            Record::ProcGroupPair(r) => &r.id,
            Record::ProcPair(r) => &r.id,
            Record::FlowSource(r) => &r.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Site(_) => RecordKind::Site,
            Record::Router(_) => RecordKind::Router,
            Record::Link(_) => RecordKind::Link,
            Record::RouterAccess(_) => RecordKind::RouterAccess,
            Record::Listener(_) => RecordKind::Listener,
            Record::Connector(_) => RecordKind::Connector,
            Record::Process(_) => RecordKind::Process,
            Record::TransportBiflow(_) => RecordKind::TransportBiflow,
            Record::AppBiflow(_) => RecordKind::AppBiflow,
            Record::Address(_) => RecordKind::Address,
            Record::ProcessGroup(_) => RecordKind::ProcessGroup,
            Record::Connection(_) => RecordKind::Connection,
            Record::Request(_) => RecordKind::Request,
            Record::SitePair(_) => RecordKind::SitePair,
            Record::ProcGroupPair(_) => RecordKind::ProcGroupPair,
            Record::ProcPair(_) => RecordKind::ProcPair,
            Record::FlowSource(_) => RecordKind::FlowSource,
        }
    }

    pub fn type_meta(&self) -> TypeMeta {
        self.kind().type_meta()
    }

    /// Parent reference for record kinds that have one
    pub fn parent(&self) -> Option<&str> {
        let parent = match self {
            Record::Router(r) => &r.parent,
            Record::Link(r) => &r.parent,
            Record::RouterAccess(r) => &r.parent,
            Record::Listener(r) => &r.parent,
            Record::Connector(r) => &r.parent,
            Record::Process(r) => &r.parent,
            Record::TransportBiflow(r) => &r.parent,
            Record::AppBiflow(r) => &r.parent,
            _ => return None,
        };
        parent.as_deref()
    }

    /// Display name for record kinds that have one
    pub fn name(&self) -> Option<&str> {
        match self {
            Record::Site(r) => r.name.as_deref(),
            Record::Router(r) => r.name.as_deref(),
            Record::Link(r) => r.name.as_deref(),
            Record::RouterAccess(r) => r.name.as_deref(),
            Record::Listener(r) => r.name.as_deref(),
            Record::Connector(r) => r.name.as_deref(),
            Record::Process(r) => r.name.as_deref(),
            Record::Address(r) => Some(&r.name),
            Record::ProcessGroup(r) => Some(&r.name),
            _ => None,
        }
    }

    /// Start and end times for record kinds that report a lifecycle
    pub fn lifecycle(&self) -> Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        match self {
            Record::Site(r) => Some((r.start_time, r.end_time)),
            Record::Router(r) => Some((r.start_time, r.end_time)),
            Record::Link(r) => Some((r.start_time, r.end_time)),
            Record::RouterAccess(r) => Some((r.start_time, r.end_time)),
            Record::Listener(r) => Some((r.start_time, r.end_time)),
            Record::Connector(r) => Some((r.start_time, r.end_time)),
            Record::Process(r) => Some((r.start_time, r.end_time)),
            Record::TransportBiflow(r) => Some((r.start_time, r.end_time)),
            Record::AppBiflow(r) => Some((r.start_time, r.end_time)),
            _ => None,
        }
    }

    /// True when the record reports an end time at or after its start time
    pub fn is_terminated(&self) -> bool {
        match self.lifecycle() {
            Some((start, end)) => is_terminated(start, end),
            None => false,
        }
    }
}

/// An end time at or after the start time marks a terminated lifecycle
pub fn is_terminated(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    match (start, end) {
        (Some(start), Some(end)) => end >= start,
        (None, Some(_)) => true,
        _ => false,
    }
}

macro_rules! impl_from_record {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Record {
                fn from(record: $ty) -> Self {
                    Record::$variant(record)
                }
            }
        )*
    };
}

impl_from_record! {
    Site => SiteRecord,
    Router => RouterRecord,
    Link => LinkRecord,
    RouterAccess => RouterAccessRecord,
    Listener => ListenerRecord,
    Connector => ConnectorRecord,
    Process => ProcessRecord,
    TransportBiflow => TransportBiflowRecord,
    AppBiflow => AppBiflowRecord,
    Address => AddressRecord,
    ProcessGroup => ProcessGroupRecord,
    Connection => ConnectionRecord,
    Request => RequestRecord,
    SitePair => SitePairRecord,
    ProcGroupPair => ProcGroupPairRecord,
    ProcPair => ProcPairRecord,
    FlowSource => FlowSourceRecord,
}
