//! Prometheus metrics published by the collector
//!
//! Every metric uses the `vanflow` namespace. Internal diagnostics live in the
//! `internal` subsystem. The registry is injected by the caller.

use crate::error::Result;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

const NAMESPACE: &str = "vanflow";
const INTERNAL: &str = "internal";

const FAST_BUCKETS: &[f64] = &[
    0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Label names shared by every connection metric
pub const FLOW_LABELS: [&str; 12] = [
    "source_site_id",
    "dest_site_id",
    "source_site_name",
    "dest_site_name",
    "source_component_id",
    "dest_component_id",
    "source_component_name",
    "dest_component_name",
    "routing_key",
    "protocol",
    "source_process_name",
    "dest_process_name",
];

/// Label values identifying a fully reconciled connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LabelSet {
    pub source_site_id: String,
    pub dest_site_id: String,
    pub source_site_name: String,
    pub dest_site_name: String,
    pub source_component_id: String,
    pub dest_component_id: String,
    pub source_component_name: String,
    pub dest_component_name: String,
    pub routing_key: String,
    pub protocol: String,
    pub source_process: String,
    pub dest_process: String,
}

impl LabelSet {
    /// Values in [`FLOW_LABELS`] order
    pub fn values(&self) -> [&str; 12] {
        [
            &self.source_site_id,
            &self.dest_site_id,
            &self.source_site_name,
            &self.dest_site_name,
            &self.source_component_id,
            &self.dest_component_id,
            &self.source_component_name,
            &self.dest_component_name,
            &self.routing_key,
            &self.protocol,
            &self.source_process,
            &self.dest_process,
        ]
    }

    fn values_with<'a>(&'a self, extra: &[&'a str]) -> Vec<&'a str> {
        let mut values = self.values().to_vec();
        values.extend_from_slice(extra);
        values
    }
}

/// Counter handles bound to one connection's labels
#[derive(Clone)]
pub struct TransportMetrics {
    pub opened: IntCounter,
    pub closed: IntCounter,
    pub sent: IntCounter,
    pub received: IntCounter,
    pub latency: Histogram,
}

/// All metrics published by the collector
#[derive(Clone)]
pub struct CollectorMetrics {
    pub connections_opened: IntCounterVec,
    pub connections_closed: IntCounterVec,
    pub sent_bytes: IntCounterVec,
    pub received_bytes: IntCounterVec,
    pub requests: IntCounterVec,

    /// Time spent handling a single flow record update
    pub flow_processing: HistogramVec,
    /// Time spent in periodic reconcile and housekeeping jobs
    pub collector_job: HistogramVec,
    /// Time to first byte difference between listener and connector sides
    pub latency: HistogramVec,
    /// Flows waiting to be reconciled, by reason
    pub pending_flows: GaugeVec,
    /// Events waiting on the collector work queue
    pub queue_depth: GaugeVec,
}

impl CollectorMetrics {
    /// Create every metric and register it with `registry`
    pub fn register(registry: &Registry) -> Result<Self> {
        let connections_opened = IntCounterVec::new(
            Opts::new(
                "connections_opened_total",
                "Number of connections opened through the application network",
            )
            .namespace(NAMESPACE),
            &FLOW_LABELS,
        )?;
        let connections_closed = IntCounterVec::new(
            Opts::new(
                "connections_closed_total",
                "Number of connections through the application network that have been closed",
            )
            .namespace(NAMESPACE),
            &FLOW_LABELS,
        )?;
        let sent_bytes = IntCounterVec::new(
            Opts::new(
                "sent_bytes_total",
                "Bytes sent through the application network from client to service",
            )
            .namespace(NAMESPACE),
            &FLOW_LABELS,
        )?;
        let received_bytes = IntCounterVec::new(
            Opts::new(
                "received_bytes_total",
                "Bytes sent back through the application network from service to client",
            )
            .namespace(NAMESPACE),
            &FLOW_LABELS,
        )?;

        let mut request_labels = FLOW_LABELS.to_vec();
        request_labels.extend(["method", "code"]);
        let requests = IntCounterVec::new(
            Opts::new(
                "requests_total",
                "Requests handled through the application network",
            )
            .namespace(NAMESPACE),
            &request_labels,
        )?;

        let flow_processing = HistogramVec::new(
            HistogramOpts::new(
                "flow_processing_seconds",
                "Time spent handling individual flow record updates",
            )
            .namespace(NAMESPACE)
            .subsystem(INTERNAL)
            .buckets(FAST_BUCKETS.to_vec()),
            &["type"],
        )?;
        let collector_job = HistogramVec::new(
            HistogramOpts::new(
                "collector_job_seconds",
                "Time spent in periodic jobs in the collector",
            )
            .namespace(NAMESPACE)
            .subsystem(INTERNAL)
            .buckets(FAST_BUCKETS.to_vec()),
            &["eventsource", "type"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "latency_seconds",
                "Difference in time to first byte between listener and connector sides",
            )
            .namespace(NAMESPACE)
            .subsystem(INTERNAL)
            .buckets(FAST_BUCKETS.to_vec()),
            &FLOW_LABELS,
        )?;
        let pending_flows = GaugeVec::new(
            Opts::new("pending_flows", "Flows waiting on reconciliation by reason")
                .namespace(NAMESPACE)
                .subsystem(INTERNAL),
            &["type", "reason", "eventsource"],
        )?;
        let queue_depth = GaugeVec::new(
            Opts::new("queue_depth", "Events waiting on the collector work queue")
                .namespace(NAMESPACE)
                .subsystem(INTERNAL),
            &["type"],
        )?;

        registry.register(Box::new(connections_opened.clone()))?;
        registry.register(Box::new(connections_closed.clone()))?;
        registry.register(Box::new(sent_bytes.clone()))?;
        registry.register(Box::new(received_bytes.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(flow_processing.clone()))?;
        registry.register(Box::new(collector_job.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(pending_flows.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            connections_opened,
            connections_closed,
            sent_bytes,
            received_bytes,
            requests,
            flow_processing,
            collector_job,
            latency,
            pending_flows,
            queue_depth,
        })
    }

    /// Bind the connection counters to a label set
    pub fn transport(&self, labels: &LabelSet) -> TransportMetrics {
        let values = labels.values();
        TransportMetrics {
            opened: self.connections_opened.with_label_values(&values),
            closed: self.connections_closed.with_label_values(&values),
            sent: self.sent_bytes.with_label_values(&values),
            received: self.received_bytes.with_label_values(&values),
            latency: self.latency.with_label_values(&values),
        }
    }

    /// Count one completed request
    pub fn record_request(&self, labels: &LabelSet, method: &str, code: &str) {
        self.requests
            .with_label_values(&labels.values_with(&[method, code]))
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    fn labels() -> LabelSet {
        LabelSet {
            source_site_id: "site-east".to_string(),
            dest_site_id: "site-west".to_string(),
            routing_key: "backend".to_string(),
            protocol: "tcp".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_and_encode() {
        let registry = Registry::new();
        let metrics = CollectorMetrics::register(&registry).unwrap();

        let transport = metrics.transport(&labels());
        transport.opened.inc();
        transport.sent.inc_by(10);
        metrics.record_request(&labels(), "GET", "2xx");

        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("vanflow_connections_opened_total"));
        assert!(text.contains("vanflow_sent_bytes_total"));
        assert!(text.contains("method=\"GET\""));
    }

    #[test]
    fn test_double_register_fails() {
        let registry = Registry::new();
        CollectorMetrics::register(&registry).unwrap();
        assert!(CollectorMetrics::register(&registry).is_err());
    }

    #[test]
    fn test_bound_handles_share_series() {
        let registry = Registry::new();
        let metrics = CollectorMetrics::register(&registry).unwrap();
        metrics.transport(&labels()).sent.inc_by(10);
        metrics.transport(&labels()).sent.inc_by(15);
        assert_eq!(
            metrics
                .sent_bytes
                .with_label_values(&labels().values())
                .get(),
            25
        );
    }
}
