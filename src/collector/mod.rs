//! Collector wiring
//!
//! Owns the records store and every component built on it. Store mutations
//! are turned into [`ChangeEvent`]s on an unbounded work queue, and a single
//! task hands each event to the reactors registered for its record kind, the
//! topology graph first.

use crate::config::{CollectorConfig, ConfigValidator};
use crate::error::Result;
use crate::flows::ConnectionManager;
use crate::graph::Graph;
use crate::identity::{IdProvider, StableIdentityProvider};
use crate::managers::{AddressManager, ChangeEvent, PairManager, ProcessManager, Reactor};
use crate::metrics::CollectorMetrics;
use crate::records::{Record, RecordKind, SiteRecord};
use crate::store::indexers::{LIFECYCLE_STATUS_INDEX, SOURCE_INDEX};
use crate::store::{Entry, PatchOutcome, RecordStore, SourceRef};
use crate::util::ticker;
use ahash::{HashMap, HashMapExt};
use chrono::Utc;
use parking_lot::Mutex;
use prometheus::{Gauge, Registry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One ingestion step, as read from an event source or a replay log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Ingest {
    /// Add the record, or overwrite the attributes it carries
    Update { source: SourceRef, record: Record },
    Delete { id: String },
    /// The source went away, drop everything it reported
    Forget { source: SourceRef },
}

impl Reactor for Graph {
    fn handle_change_event(&self, event: &ChangeEvent, _records: &RecordStore) {
        match event {
            ChangeEvent::Added(record) => self.index(record),
            ChangeEvent::Updated { curr, .. } => self.reindex(curr),
            ChangeEvent::Deleted(record) => self.unindex(record),
        }
    }
}

pub struct Collector {
    config: CollectorConfig,
    source: SourceRef,
    records: Arc<RecordStore>,
    graph: Arc<Graph>,
    metrics: CollectorMetrics,
    connections: Arc<ConnectionManager>,
    addresses: Arc<AddressManager>,
    processes: Arc<ProcessManager>,
    pairs: Arc<PairManager>,
    reactors: HashMap<RecordKind, Vec<Arc<dyn Reactor>>>,

    queue_depth: Gauge,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
    purge_tx: mpsc::UnboundedSender<SourceRef>,
    purges: Mutex<Option<mpsc::UnboundedReceiver<SourceRef>>>,
}

impl Collector {
    /// Create a new collector, registering its metrics with `registry`
    ///
    /// Fails when `config` does not validate, whichever way it was built.
    pub fn new(config: CollectorConfig, registry: &Registry) -> Result<Self> {
        ConfigValidator::validate(&config)?;
        let metrics = CollectorMetrics::register(registry)?;
        let source = config.collector.source_ref();
        let idp: Arc<dyn IdProvider> = Arc::new(StableIdentityProvider::new());

        let queue_depth = metrics.queue_depth.with_label_values(&["records"]);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let records = Arc::new(record_store(event_tx, queue_depth.clone()));
        let graph = Arc::new(Graph::new(records.clone()));

        let pairs = Arc::new(PairManager::new(
            records.clone(),
            graph.clone(),
            idp.clone(),
            source.clone(),
        ));
        let addresses = Arc::new(AddressManager::new(
            records.clone(),
            idp.clone(),
            source.clone(),
        ));
        let processes = Arc::new(ProcessManager::new(
            records.clone(),
            graph.clone(),
            idp.clone(),
            source.clone(),
        ));
        let connections = ConnectionManager::new(
            records.clone(),
            graph.clone(),
            idp,
            pairs.clone(),
            source.clone(),
            metrics.clone(),
            config.flows.clone(),
        );

        let graph_reactor: Arc<dyn Reactor> = graph.clone();
        let address_reactor: Arc<dyn Reactor> = addresses.clone();
        let process_reactor: Arc<dyn Reactor> = processes.clone();
        let connection_reactor: Arc<dyn Reactor> = connections.clone();

        let mut reactors: HashMap<RecordKind, Vec<Arc<dyn Reactor>>> = HashMap::new();
        for kind in RecordKind::ALL {
            let subscribed = match kind {
                RecordKind::Site | RecordKind::Router => {
                    vec![graph_reactor.clone(), connection_reactor.clone()]
                }
                RecordKind::Link | RecordKind::RouterAccess => vec![graph_reactor.clone()],
                RecordKind::Listener => vec![graph_reactor.clone(), address_reactor.clone()],
                RecordKind::Connector => vec![
                    graph_reactor.clone(),
                    address_reactor.clone(),
                    process_reactor.clone(),
                    connection_reactor.clone(),
                ],
                RecordKind::Process => vec![
                    graph_reactor.clone(),
                    process_reactor.clone(),
                    connection_reactor.clone(),
                ],
                RecordKind::Address => vec![graph_reactor.clone(), address_reactor.clone()],
                RecordKind::FlowSource => vec![process_reactor.clone()],
                RecordKind::ProcessGroup => vec![connection_reactor.clone()],
                RecordKind::TransportBiflow
                | RecordKind::AppBiflow
                | RecordKind::Connection
                | RecordKind::Request
                | RecordKind::SitePair
                | RecordKind::ProcGroupPair
                | RecordKind::ProcPair => Vec::new(),
            };
            if !subscribed.is_empty() {
                reactors.insert(kind, subscribed);
            }
        }

        let (purge_tx, purge_rx) = mpsc::unbounded_channel();
        tracing::info!(source = %source, "Collector initialized");

        Ok(Self {
            config,
            source,
            records,
            graph,
            metrics,
            connections,
            addresses,
            processes,
            pairs,
            reactors,
            queue_depth,
            events: Mutex::new(Some(event_rx)),
            purge_tx,
            purges: Mutex::new(Some(purge_rx)),
        })
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    /// Store holding raw biflow records
    pub fn flows(&self) -> &RecordStore {
        self.connections.flows()
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn addresses(&self) -> &Arc<AddressManager> {
        &self.addresses
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    pub fn pairs(&self) -> &Arc<PairManager> {
        &self.pairs
    }

    pub fn metrics(&self) -> &CollectorMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Store a record of this type belongs in
    pub fn route(&self, record: &Record) -> &RecordStore {
        match record {
            Record::TransportBiflow(_) | Record::AppBiflow(_) => self.connections.flows(),
            Record::Site(_)
            | Record::Router(_)
            | Record::Link(_)
            | Record::RouterAccess(_)
            | Record::Listener(_)
            | Record::Connector(_)
            | Record::Process(_)
            | Record::Address(_)
            | Record::ProcessGroup(_)
            | Record::Connection(_)
            | Record::Request(_)
            | Record::SitePair(_)
            | Record::ProcGroupPair(_)
            | Record::ProcPair(_)
            | Record::FlowSource(_) => &self.records,
        }
    }

    /// Apply a single ingestion step
    pub fn ingest(&self, event: Ingest) -> Result<Option<PatchOutcome>> {
        match event {
            Ingest::Update { source, record } => {
                let outcome = self.route(&record).patch(record, source)?;
                Ok(Some(outcome))
            }
            Ingest::Delete { id } => {
                // A reconciled flow shares its id with its connection or
                // request, deleting the flow removes both
                if self.flows().delete(&id).is_none() {
                    self.records.delete(&id);
                }
                Ok(None)
            }
            Ingest::Forget { source } => {
                self.forget_source(source);
                Ok(None)
            }
        }
    }

    /// Schedule removal of every record reported by `source`
    pub fn forget_source(&self, source: SourceRef) {
        if self.purge_tx.send(source).is_err() {
            tracing::warn!("Purge queue closed, source will not be forgotten");
        }
    }

    /// Delete every record and flow reported by `source`
    pub fn purge_source(&self, source: &SourceRef) -> usize {
        let exemplar = Entry::source_exemplar(source.clone());
        let mut purged = 0;
        for store in [self.records.as_ref(), self.flows()] {
            for entry in store.index(SOURCE_INDEX, &exemplar) {
                if store.delete(entry.record.identity()).is_some() {
                    purged += 1;
                }
            }
        }
        tracing::info!(source = %source, count = purged, "Purged records for forgotten source");
        purged
    }

    /// Delete records whose lifecycle has ended
    pub fn cleanup_terminated(&self) -> usize {
        let exemplar = Entry::exemplar(
            SiteRecord {
                end_time: Some(Utc::now()),
                ..Default::default()
            }
            .into(),
        );
        let terminated = self.records.index(LIFECYCLE_STATUS_INDEX, &exemplar);
        let mut removed = 0;
        for entry in terminated {
            if self.records.delete(entry.record.identity()).is_some() {
                tracing::debug!(
                    id = entry.record.identity(),
                    kind = entry.record.kind().type_name(),
                    "Removing terminated record"
                );
                removed += 1;
            }
        }
        removed
    }

    fn dispatch(&self, event: &ChangeEvent) {
        self.queue_depth.dec();
        if let Some(reactors) = self.reactors.get(&event.kind()) {
            for reactor in reactors {
                reactor.handle_change_event(event, &self.records);
            }
        }
    }

    /// Handle every queued change event and purge without waiting
    ///
    /// Returns the number of events dispatched. Does nothing while
    /// [`Collector::run`] owns the queues.
    pub fn drain_events(&self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            let sources: Vec<SourceRef> = match self.purges.lock().as_mut() {
                Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
                None => Vec::new(),
            };
            for source in sources {
                self.purge_source(&source);
                progressed = true;
            }

            let events: Vec<ChangeEvent> = match self.events.lock().as_mut() {
                Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
                None => Vec::new(),
            };
            for event in &events {
                self.dispatch(event);
            }
            handled += events.len();
            progressed |= !events.is_empty();

            if !progressed {
                return handled;
            }
        }
    }

    /// Bring every derived record up to date without background tasks
    ///
    /// Runs queued events, manager queues and one reconcile pass each, until
    /// nothing is left to do.
    pub fn settle(&self) {
        for _ in 0..8 {
            let mut handled = self.drain_events();
            handled += self.addresses.drain();
            self.processes.drain();
            self.connections.reconcile_transport_pass();
            self.connections.reconcile_app_pass();
            self.pairs.rescan();
            handled += self.drain_events();
            if handled == 0 {
                break;
            }
        }
    }

    async fn work_queue(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        mut purges: mpsc::UnboundedReceiver<SourceRef>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(source) = purges.recv() => {
                    self.purge_source(&source);
                }
                Some(event) = events.recv() => self.dispatch(&event),
            }
        }
        tracing::debug!("Work queue stopped");
    }

    async fn record_cleanup(self: Arc<Self>, cancel: CancellationToken) {
        let job_time = self
            .metrics
            .collector_job
            .with_label_values(&[&self.source.id, "record_cleanup"]);
        let mut cleanup = ticker(self.config.records.cleanup_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cleanup.tick() => {
                    let start = Instant::now();
                    let removed = self.cleanup_terminated();
                    job_time.observe(start.elapsed().as_secs_f64());
                    if removed > 0 {
                        tracing::info!(count = removed, "Removed terminated records");
                    }
                }
            }
        }
    }

    /// Run every background task until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let events = self.events.lock().take();
        let purges = self.purges.lock().take();
        let (Some(events), Some(purges)) = (events, purges) else {
            tracing::warn!("Collector is already running");
            return;
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().work_queue(events, purges, cancel.clone()));
        tasks.spawn(self.clone().record_cleanup(cancel.clone()));
        tasks.spawn(self.addresses.clone().run(cancel.clone()));
        tasks.spawn(self.processes.clone().run(
            self.config.processes.rebuild_interval(),
            self.metrics.collector_job.clone(),
            cancel.clone(),
        ));
        tasks.spawn(self.pairs.clone().run(
            self.config.pairs.rescan_interval(),
            self.metrics
                .collector_job
                .with_label_values(&[&self.source.id, "pair_rescan"]),
            cancel.clone(),
        ));
        tasks.spawn(self.connections.clone().run(cancel.clone()));
        tracing::info!(tasks = tasks.len(), "Collector running");

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!("Collector task failed: {}", e);
            }
        }
        tracing::info!("Collector shutdown complete");
    }

    /// Record count per record type across both stores
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.records.list().into_iter().chain(self.flows().list()) {
            *counts
                .entry(entry.record.kind().type_name().to_string())
                .or_insert(0) += 1;
        }
        counts
    }
}

/// Records store publishing every committed change to the work queue
fn record_store(events: mpsc::UnboundedSender<ChangeEvent>, depth: Gauge) -> RecordStore {
    let publish = move |event: ChangeEvent| {
        let id = event.id().to_string();
        if events.send(event).is_ok() {
            depth.inc();
        } else {
            tracing::debug!(id = %id, "Work queue closed, dropping change event");
        }
    };
    let on_add = publish.clone();
    let on_change = publish.clone();
    let on_delete = publish;

    RecordStore::builder()
        .standard_indexers()
        .on_add(move |entry| on_add(ChangeEvent::Added(entry.record.clone())))
        .on_change(move |prev, curr| {
            on_change(ChangeEvent::Updated {
                prev: prev.record.clone(),
                curr: curr.record.clone(),
            })
        })
        .on_delete(move |entry| on_delete(ChangeEvent::Deleted(entry.record.clone())))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectorError;
    use crate::records::{ConnectorRecord, ListenerRecord, RouterRecord};

    fn collector() -> Collector {
        Collector::new(CollectorConfig::default(), &Registry::new()).unwrap()
    }

    fn update(record: Record) -> Ingest {
        Ingest::Update {
            source: SourceRef::new("router-east", "1"),
            record,
        }
    }

    #[test]
    fn test_route_by_kind() {
        let collector = collector();
        let flow: Record = crate::records::TransportBiflowRecord {
            id: "f1".to_string(),
            ..Default::default()
        }
        .into();
        let site: Record = SiteRecord {
            id: "s1".to_string(),
            ..Default::default()
        }
        .into();

        assert!(std::ptr::eq(collector.route(&flow), collector.flows()));
        assert!(std::ptr::eq(
            collector.route(&site),
            collector.records().as_ref()
        ));
    }

    #[test]
    fn test_events_reach_graph() {
        let collector = collector();
        collector
            .ingest(update(
                SiteRecord {
                    id: "site-east".to_string(),
                    ..Default::default()
                }
                .into(),
            ))
            .unwrap();
        collector
            .ingest(update(
                RouterRecord {
                    id: "router-east".to_string(),
                    parent: Some("site-east".to_string()),
                    ..Default::default()
                }
                .into(),
            ))
            .unwrap();
        assert_eq!(collector.drain_events(), 2);

        let router = collector.graph().router("router-east");
        assert_eq!(router.parent().id(), Some("site-east"));
        assert_eq!(collector.queue_depth.get(), 0.0);
    }

    #[test]
    fn test_forget_source_purges() {
        let collector = collector();
        collector
            .ingest(update(
                ListenerRecord {
                    id: "l1".to_string(),
                    address: Some("backend".to_string()),
                    protocol: Some("tcp".to_string()),
                    ..Default::default()
                }
                .into(),
            ))
            .unwrap();
        collector
            .ingest(Ingest::Update {
                source: SourceRef::new("router-west", "1"),
                record: ConnectorRecord {
                    id: "c1".to_string(),
                    ..Default::default()
                }
                .into(),
            })
            .unwrap();
        collector.settle();
        assert!(collector.records().get("l1").is_some());

        collector
            .ingest(Ingest::Forget {
                source: SourceRef::new("router-east", "1"),
            })
            .unwrap();
        collector.settle();
        assert!(collector.records().get("l1").is_none());
        assert!(collector.records().get("c1").is_some());
    }

    #[test]
    fn test_cleanup_terminated() {
        let collector = collector();
        let now = Utc::now();
        collector
            .ingest(update(
                SiteRecord {
                    id: "gone".to_string(),
                    start_time: Some(now - chrono::Duration::minutes(5)),
                    end_time: Some(now),
                    ..Default::default()
                }
                .into(),
            ))
            .unwrap();
        collector
            .ingest(update(
                SiteRecord {
                    id: "alive".to_string(),
                    start_time: Some(now),
                    ..Default::default()
                }
                .into(),
            ))
            .unwrap();

        assert_eq!(collector.cleanup_terminated(), 1);
        assert!(collector.records().get("gone").is_none());
        assert!(collector.records().get("alive").is_some());
    }

    #[test]
    fn test_ingest_delete_falls_back_to_flows() {
        let collector = collector();
        collector
            .ingest(update(
                crate::records::TransportBiflowRecord {
                    id: "f1".to_string(),
                    ..Default::default()
                }
                .into(),
            ))
            .unwrap();
        assert!(collector.flows().get("f1").is_some());

        collector
            .ingest(Ingest::Delete {
                id: "f1".to_string(),
            })
            .unwrap();
        assert!(collector.flows().get("f1").is_none());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = CollectorConfig::default();
        config.pairs.rescan_interval = "0s".to_string();
        match Collector::new(config, &Registry::new()) {
            Err(CollectorError::ConfigValidation { errors }) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].path, "pairs.rescan_interval");
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("zero rescan interval accepted"),
        }
    }

    #[test]
    fn test_ingest_line_format() {
        let line = r#"{"op":"update","source":{"id":"router-east","version":"1"},"record":{"type":"SiteRecord","id":"s1","name":"east"}}"#;
        let event: Ingest = serde_json::from_str(line).unwrap();
        match event {
            Ingest::Update { source, record } => {
                assert_eq!(source.id, "router-east");
                assert_eq!(record.identity(), "s1");
                assert_eq!(record.kind(), RecordKind::Site);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
