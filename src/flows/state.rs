//! Per-flow correlation state and reconcile outcomes

use crate::metrics::{CollectorMetrics, LabelSet, TransportMetrics};
use crate::records::{is_terminated, AppBiflowRecord, ConnectionRecord, TransportBiflowRecord};
use chrono::{DateTime, Utc};

/// Why a flow could not be reconciled yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReconcileReason {
    Success,
    MissingRecord,
    MissingConnector,
    MissingSource,
    MissingDest,
    MissingTransport,
    UnreconciledTransport,
}

impl ReconcileReason {
    pub const PENDING: [ReconcileReason; 6] = [
        ReconcileReason::MissingRecord,
        ReconcileReason::MissingConnector,
        ReconcileReason::MissingSource,
        ReconcileReason::MissingDest,
        ReconcileReason::MissingTransport,
        ReconcileReason::UnreconciledTransport,
    ];

    /// Value of the `reason` label on the pending flows gauge
    pub fn as_label(self) -> &'static str {
        match self {
            ReconcileReason::Success => "success",
            ReconcileReason::MissingRecord => "record",
            ReconcileReason::MissingConnector => "connector",
            ReconcileReason::MissingSource => "source",
            ReconcileReason::MissingDest => "destination",
            ReconcileReason::MissingTransport => "transport",
            ReconcileReason::UnreconciledTransport => "transport_reconcile",
        }
    }
}

/// Result of one reconcile attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome<T> {
    Reconciled(T),
    Pending(ReconcileReason),
}

impl<T> ReconcileOutcome<T> {
    pub fn reason(&self) -> ReconcileReason {
        match self {
            ReconcileOutcome::Reconciled(_) => ReconcileReason::Success,
            ReconcileOutcome::Pending(reason) => *reason,
        }
    }
}

/// Correlation state of one transport flow
#[derive(Clone)]
pub struct TransportState {
    pub id: String,
    /// Set by every event while unreconciled, cleared by the reconcile pass
    pub dirty: bool,
    pub opened: bool,
    pub terminated: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Counter handles, present once the flow is reconciled
    pub metrics: Option<TransportMetrics>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl TransportState {
    /// Create a new unreconciled state
    pub fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            dirty: true,
            opened: false,
            terminated: false,
            bytes_sent: 0,
            bytes_received: 0,
            metrics: None,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn is_reconciled(&self) -> bool {
        self.metrics.is_some()
    }

    /// Fold the latest flow record into the counters
    ///
    /// Byte counters advance by the difference from the last observed totals.
    /// Returns true when this update is the one that terminated the flow.
    pub fn apply(&mut self, flow: &TransportBiflowRecord, now: DateTime<Utc>) -> bool {
        self.last_seen = now;
        let Some(metrics) = &self.metrics else {
            self.dirty = true;
            return false;
        };

        if !self.opened {
            metrics.opened.inc();
            self.opened = true;
        }

        let mut terminated_now = false;
        if !self.terminated && is_terminated(flow.start_time, flow.end_time) {
            self.terminated = true;
            terminated_now = true;
            metrics.closed.inc();
            if let Some(latency) = flow.latency {
                metrics.latency.observe(latency as f64 / 1_000_000.0);
            }
        }

        let sent = flow.octets.unwrap_or(0);
        let received = flow.octets_reverse.unwrap_or(0);
        let sent_inc = sent.saturating_sub(self.bytes_sent);
        let received_inc = received.saturating_sub(self.bytes_received);
        if sent_inc > 0 || received_inc > 0 {
            metrics.sent.inc_by(sent_inc);
            metrics.received.inc_by(received_inc);
            self.bytes_sent = self.bytes_sent.max(sent);
            self.bytes_received = self.bytes_received.max(received);
        }

        terminated_now
    }
}

/// Correlation state of one application flow
#[derive(Clone)]
pub struct AppState {
    pub id: String,
    pub transport_id: String,
    pub dirty: bool,
    pub terminated: bool,
    /// Labels of the parent connection, present once reconciled
    pub labels: Option<LabelSet>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AppState {
    /// Create a new unreconciled state
    pub fn new(id: &str, transport_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            transport_id: transport_id.to_string(),
            dirty: true,
            terminated: false,
            labels: None,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn is_reconciled(&self) -> bool {
        self.labels.is_some()
    }

    /// Count the request once it completes. Returns true on that transition.
    pub fn apply(
        &mut self,
        flow: &AppBiflowRecord,
        metrics: &CollectorMetrics,
        now: DateTime<Utc>,
    ) -> bool {
        self.last_seen = now;
        if let Some(parent) = &flow.parent {
            if self.transport_id.is_empty() {
                self.transport_id = parent.clone();
            }
        }
        let Some(labels) = &self.labels else {
            self.dirty = true;
            return false;
        };

        if self.terminated || !is_terminated(flow.start_time, flow.end_time) {
            return false;
        }
        self.terminated = true;
        metrics.record_request(
            labels,
            normalize_http_method(flow.method.as_deref()),
            normalize_http_response_class(flow.result.as_deref()),
        );
        true
    }
}

/// Metric labels for a reconciled connection
pub fn connection_labels(record: &ConnectionRecord) -> LabelSet {
    LabelSet {
        source_site_id: record.source_site.id.clone(),
        dest_site_id: record.dest_site.id.clone(),
        source_site_name: record.source_site.name.clone(),
        dest_site_name: record.dest_site.name.clone(),
        source_component_id: record.source_group.id.clone(),
        dest_component_id: record.dest_group.id.clone(),
        source_component_name: record.source_group.name.clone(),
        dest_component_name: record.dest_group.name.clone(),
        routing_key: record.address.clone(),
        protocol: record.protocol.clone(),
        source_process: record.source.name.clone(),
        dest_process: record.dest.name.clone(),
    }
}

const HTTP_METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE",
];

/// Canonical upper case HTTP method, or `unknown`
pub fn normalize_http_method(method: Option<&str>) -> &'static str {
    let Some(method) = method else {
        return "unknown";
    };
    HTTP_METHODS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(method))
        .copied()
        .unwrap_or("unknown")
}

/// Status code class such as `2xx`, or `unknown`
pub fn normalize_http_response_class(result: Option<&str>) -> &'static str {
    let Some(code) = result.and_then(|r| r.trim().parse::<i64>().ok()) else {
        return "unknown";
    };
    match code {
        i64::MIN..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}

/// Protocol label for application flows
pub fn normalize_app_protocol(protocol: Option<&str>) -> String {
    match protocol {
        None => "unknown".to_string(),
        Some(p) if p.eq_ignore_ascii_case("HTTP/2") || p.eq_ignore_ascii_case("HTTP/2.0") => {
            "http2".to_string()
        }
        Some(p) if p.to_ascii_uppercase().starts_with("HTTP/1") => "http1".to_string(),
        Some(p) => p.to_ascii_lowercase(),
    }
}
