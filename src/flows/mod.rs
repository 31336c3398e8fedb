//! Flow correlation engine
//!
//! Transport and application biflow records land in a private flows store.
//! Each event updates the flow's state in an LRU cache. Background reconcile
//! passes walk the topology graph to find both endpoints of every unresolved
//! flow, write the enriched [`ConnectionRecord`] or [`RequestRecord`] to the
//! records store, and bind the flow to its labeled metrics. From then on
//! events count directly into those metrics.

mod backoff;
mod lru;
mod state;

pub use backoff::ExponentialBackoff;
pub use lru::KeyedLruCache;
pub use state::{
    connection_labels, normalize_app_protocol, normalize_http_method,
    normalize_http_response_class, AppState, ReconcileOutcome, ReconcileReason, TransportState,
};

use crate::config::FlowsConfig;
use crate::graph::{site_host_id, Graph};
use crate::identity::IdProvider;
use crate::managers::pairs::{PairManager, ProcessPair};
use crate::metrics::{CollectorMetrics, LabelSet};
use crate::records::{
    AppBiflowRecord, ConnectionRecord, FlowSourceRecord, NamedReference, ProcessGroupRecord,
    Record, RecordKind, RequestRecord, TransportBiflowRecord,
};
use crate::managers::{ChangeEvent, Reactor};
use crate::store::indexers::{
    source_indexer, type_indexer, SOURCE_INDEX, TYPE_INDEX, TYPE_NAME_INDEX,
};
use crate::store::{Entry, RecordStore, SourceRef};
use crate::util::ticker;
use ahash::{HashMap, HashSet, HashSetExt};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Reasons a transport flow can be pending on
const TRANSPORT_REASONS: [ReconcileReason; 4] = [
    ReconcileReason::MissingRecord,
    ReconcileReason::MissingConnector,
    ReconcileReason::MissingSource,
    ReconcileReason::MissingDest,
];

/// Reasons an application flow can be pending on
const APP_REASONS: [ReconcileReason; 3] = [
    ReconcileReason::MissingRecord,
    ReconcileReason::MissingTransport,
    ReconcileReason::UnreconciledTransport,
];

/// A derived record together with the metric labels it resolved to
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled<R> {
    pub record: R,
    pub labels: LabelSet,
}

/// Statistics for one reconcile pass
#[derive(Debug, Default, Clone)]
pub struct PassSummary {
    /// Flows that saw events since the previous pass
    pub dirty: usize,
    pub reconciled: usize,
    pub pending: HashMap<ReconcileReason, usize>,
}

impl PassSummary {
    pub fn pending_for(&self, reason: ReconcileReason) -> usize {
        self.pending.get(&reason).copied().unwrap_or(0)
    }
}

/// Flows removed by an idle purge
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeSummary {
    pub terminated: usize,
    pub stale: usize,
}

#[derive(Debug, Clone)]
struct ConnectorAttributes {
    reference: NamedReference,
    address: String,
    protocol: String,
    host: String,
    port: String,
}

#[derive(Debug, Clone)]
struct ProcessAttributes {
    process: NamedReference,
    site: NamedReference,
    group: NamedReference,
}

#[derive(Default)]
struct AttributeCache {
    connectors: HashMap<String, ConnectorAttributes>,
    processes: HashMap<String, ProcessAttributes>,
    routers: HashMap<String, NamedReference>,
}

/// Correlates biflow records with the topology
pub struct ConnectionManager {
    flows: RecordStore,
    records: Arc<RecordStore>,
    graph: Arc<Graph>,
    idp: Arc<dyn IdProvider>,
    pairs: Arc<PairManager>,
    source: SourceRef,
    metrics: CollectorMetrics,
    config: FlowsConfig,

    transport_flows: KeyedLruCache<TransportState>,
    app_flows: KeyedLruCache<AppState>,
    attributes: Mutex<AttributeCache>,
    flow_sources: Mutex<HashSet<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager with its own flows store
    pub fn new(
        records: Arc<RecordStore>,
        graph: Arc<Graph>,
        idp: Arc<dyn IdProvider>,
        pairs: Arc<PairManager>,
        source: SourceRef,
        metrics: CollectorMetrics,
        config: FlowsConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|manager: &Weak<Self>| {
            let on_add = manager.clone();
            let on_change = manager.clone();
            let on_delete = manager.clone();
            let flows = RecordStore::builder()
                .indexer(TYPE_INDEX, type_indexer)
                .indexer(SOURCE_INDEX, source_indexer)
                .on_add(move |entry| {
                    if let Some(manager) = on_add.upgrade() {
                        manager.handle_entry(entry);
                    }
                })
                .on_change(move |_, entry| {
                    if let Some(manager) = on_change.upgrade() {
                        manager.handle_entry(entry);
                    }
                })
                .on_delete(move |entry| {
                    if let Some(manager) = on_delete.upgrade() {
                        manager.handle_delete(entry);
                    }
                })
                .build();

            let max_size = config.max_tracked_flows;
            Self {
                flows,
                records,
                graph,
                idp,
                pairs,
                source,
                metrics,
                config,
                transport_flows: KeyedLruCache::new(max_size),
                app_flows: KeyedLruCache::new(max_size),
                attributes: Mutex::new(AttributeCache::default()),
                flow_sources: Mutex::new(HashSet::new()),
            }
        })
    }

    /// Store that ingestion writes biflow records into
    pub fn flows(&self) -> &RecordStore {
        &self.flows
    }

    pub fn transport_state(&self, id: &str) -> Option<TransportState> {
        self.transport_flows.get(id)
    }

    pub fn app_state(&self, id: &str) -> Option<AppState> {
        self.app_flows.get(id)
    }

    /// Number of tracked (transport, application) flows
    pub fn tracked_flows(&self) -> (usize, usize) {
        (self.transport_flows.len(), self.app_flows.len())
    }

    fn handle_entry(&self, entry: &Entry) {
        let start = Instant::now();
        let kind = entry.record.kind();
        match &entry.record {
            Record::TransportBiflow(flow) => self.handle_transport_flow(flow),
            Record::AppBiflow(flow) => self.handle_app_flow(flow),
            _ => return,
        }
        self.metrics
            .flow_processing
            .with_label_values(&[&kind.type_meta().to_string()])
            .observe(start.elapsed().as_secs_f64());
    }

    fn handle_delete(&self, entry: &Entry) {
        match &entry.record {
            Record::TransportBiflow(flow) => {
                self.transport_flows.pop(&flow.id);
            }
            Record::AppBiflow(flow) => {
                self.app_flows.pop(&flow.id);
            }
            _ => return,
        }
        self.records.delete(entry.record.identity());
    }

    /// Fold a transport flow update into its state
    pub fn handle_transport_flow(&self, flow: &TransportBiflowRecord) {
        let now = Utc::now();
        let (terminated, evicted) = self.transport_flows.upsert(
            &flow.id,
            || TransportState::new(&flow.id, now),
            |state| state.apply(flow, now),
        );
        if terminated {
            self.close_record(&flow.id, flow.end_time);
        }
        self.forget_flows(evicted);
    }

    /// Fold an application flow update into its state
    pub fn handle_app_flow(&self, flow: &AppBiflowRecord) {
        let now = Utc::now();
        let transport_id = flow.parent.as_deref().unwrap_or_default();
        let (terminated, evicted) = self.app_flows.upsert(
            &flow.id,
            || AppState::new(&flow.id, transport_id, now),
            |state| state.apply(flow, &self.metrics, now),
        );
        if terminated {
            self.close_record(&flow.id, flow.end_time);
        }
        self.forget_flows(evicted);
    }

    /// Copy the end time of a finished flow onto its derived record
    fn close_record(&self, id: &str, end_time: Option<DateTime<Utc>>) {
        let Some(entry) = self.records.get(id) else {
            return;
        };
        let record: Record = match entry.record {
            Record::Connection(mut connection) => {
                connection.end_time = end_time;
                connection.into()
            }
            Record::Request(mut request) => {
                request.end_time = end_time;
                request.into()
            }
            _ => return,
        };
        self.records.update(record);
    }

    fn forget_flows(&self, ids: Vec<String>) {
        for id in ids {
            tracing::debug!(id = %id, "Evicting least recently used flow");
            if self.flows.delete(&id).is_none() {
                self.records.delete(&id);
            }
        }
    }

    fn connector_attrs(&self, id: &str) -> Option<ConnectorAttributes> {
        if let Some(attrs) = self.attributes.lock().connectors.get(id) {
            return Some(attrs.clone());
        }

        let Record::Connector(connector) = self.records.get(id)?.record else {
            return None;
        };
        let attrs = ConnectorAttributes {
            reference: NamedReference {
                id: connector.id,
                name: connector.name.unwrap_or_default(),
            },
            address: connector.address?,
            protocol: connector.protocol?,
            host: connector.dest_host.unwrap_or_default(),
            port: connector.dest_port.unwrap_or_default(),
        };
        self.attributes
            .lock()
            .connectors
            .insert(id.to_string(), attrs.clone());
        Some(attrs)
    }

    fn process_attrs(&self, id: &str) -> Option<ProcessAttributes> {
        if let Some(attrs) = self.attributes.lock().processes.get(id) {
            return Some(attrs.clone());
        }

        let Record::Process(process) = self.records.get(id)?.record else {
            return None;
        };
        let Record::Site(site) = self.records.get(process.parent.as_deref()?)?.record else {
            return None;
        };

        // A named group is created asynchronously, stay incomplete until it exists
        let group = match &process.group {
            Some(name) => {
                let exemplar = Entry::exemplar(
                    ProcessGroupRecord {
                        name: name.clone(),
                        ..Default::default()
                    }
                    .into(),
                );
                let group = self
                    .records
                    .index(TYPE_NAME_INDEX, &exemplar)
                    .into_iter()
                    .next()?;
                NamedReference {
                    id: group.record.identity().to_string(),
                    name: name.clone(),
                }
            }
            None => NamedReference::default(),
        };

        let attrs = ProcessAttributes {
            process: NamedReference {
                id: process.id,
                name: process.name?,
            },
            site: NamedReference {
                id: site.id,
                name: site.name?,
            },
            group,
        };
        self.attributes
            .lock()
            .processes
            .insert(id.to_string(), attrs.clone());
        Some(attrs)
    }

    fn router_attrs(&self, id: &str) -> Option<NamedReference> {
        if let Some(attrs) = self.attributes.lock().routers.get(id) {
            return Some(attrs.clone());
        }

        let Record::Router(router) = self.records.get(id)?.record else {
            return None;
        };
        let attrs = NamedReference {
            id: router.id,
            name: router.name?,
        };
        self.attributes
            .lock()
            .routers
            .insert(id.to_string(), attrs.clone());
        Some(attrs)
    }

    /// Drop every cached connector, process and router attribute
    pub fn clear_attribute_caches(&self) {
        let mut cache = self.attributes.lock();
        cache.connectors.clear();
        cache.processes.clear();
        cache.routers.clear();
    }

    pub fn invalidate_connector(&self, id: &str) {
        self.attributes.lock().connectors.remove(id);
    }

    pub fn invalidate_process(&self, id: &str) {
        self.attributes.lock().processes.remove(id);
    }

    pub fn invalidate_router(&self, id: &str) {
        self.attributes.lock().routers.remove(id);
    }

    /// Resolve both endpoints of a transport flow
    pub fn reconcile(&self, id: &str) -> ReconcileOutcome<Reconciled<ConnectionRecord>> {
        let Some(Entry {
            record: Record::TransportBiflow(flow),
            ..
        }) = self.flows.get(id)
        else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingRecord);
        };

        let listener_id = flow.parent.as_deref().unwrap_or_default();
        let connector_id = flow.connector_id.as_deref().unwrap_or_default();
        let Some(connector) = self.connector_attrs(connector_id) else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingConnector);
        };

        let listener = self.graph.listener(listener_id);
        let source_site = listener.parent().parent();
        let source_id = match (source_site.id(), flow.source_host.as_deref()) {
            (Some(site), Some(host)) if !host.is_empty() => self
                .graph
                .site_host(&site_host_id(site, host))
                .process()
                .id()
                .map(str::to_string),
            _ => None,
        };
        let Some(source) = source_id.and_then(|id| self.process_attrs(&id)) else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingSource);
        };

        let connector_node = self.graph.connector(connector_id);
        let dest_id = connector_node.target().id().map(str::to_string);
        let dest_router_id = connector_node.parent().id().map(str::to_string);
        let Some(dest) = dest_id.and_then(|id| self.process_attrs(&id)) else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingDest);
        };

        let source_router_id = listener.parent().id().map(str::to_string);
        let Some(source_router) = source_router_id.and_then(|id| self.router_attrs(&id)) else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingSource);
        };
        let Some(dest_router) = dest_router_id.and_then(|id| self.router_attrs(&id)) else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingDest);
        };

        let listener_name = listener
            .listener_record()
            .and_then(|record| record.name)
            .unwrap_or_default();

        let record = ConnectionRecord {
            id: flow.id,
            start_time: flow.start_time,
            end_time: flow.end_time,
            address: connector.address,
            protocol: connector.protocol,
            connector_host: connector.host,
            connector_port: connector.port,
            listener: NamedReference {
                id: listener_id.to_string(),
                name: listener_name,
            },
            connector: connector.reference,
            source: source.process,
            source_site: source.site,
            source_router,
            source_group: source.group,
            dest: dest.process,
            dest_site: dest.site,
            dest_router,
            dest_group: dest.group,
        };
        let labels = connection_labels(&record);
        ReconcileOutcome::Reconciled(Reconciled { record, labels })
    }

    /// Resolve an application flow through its reconciled transport flow
    pub fn reconcile_request(&self, id: &str) -> ReconcileOutcome<Reconciled<RequestRecord>> {
        let Some(Entry {
            record: Record::AppBiflow(flow),
            ..
        }) = self.flows.get(id)
        else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingRecord);
        };

        let transport_id = flow.parent.as_deref().unwrap_or_default();
        match self
            .transport_flows
            .modify(transport_id, |state| state.is_reconciled())
        {
            None => return ReconcileOutcome::Pending(ReconcileReason::MissingTransport),
            Some(false) => {
                return ReconcileOutcome::Pending(ReconcileReason::UnreconciledTransport)
            }
            Some(true) => {}
        }

        let Some(Entry {
            record: Record::Connection(connection),
            ..
        }) = self.records.get(transport_id)
        else {
            return ReconcileOutcome::Pending(ReconcileReason::MissingRecord);
        };

        let protocol = normalize_app_protocol(flow.protocol.as_deref());
        let labels = LabelSet {
            protocol: protocol.clone(),
            ..connection_labels(&connection)
        };
        let record = RequestRecord {
            id: flow.id,
            transport_id: transport_id.to_string(),
            start_time: flow.start_time,
            end_time: flow.end_time,
            address: connection.address,
            protocol,
            method: normalize_http_method(flow.method.as_deref()).to_string(),
            result_class: normalize_http_response_class(flow.result.as_deref()).to_string(),
            listener: connection.listener,
            connector: connection.connector,
            source: connection.source,
            source_site: connection.source_site,
            source_router: connection.source_router,
            dest: connection.dest,
            dest_site: connection.dest_site,
            dest_router: connection.dest_router,
        };
        ReconcileOutcome::Reconciled(Reconciled { record, labels })
    }

    fn store_derived(&self, record: Record) {
        if !self.records.add(record.clone(), self.source.clone()) {
            self.records.update(record);
        }
    }

    /// Attempt to reconcile every unresolved transport flow once
    pub fn reconcile_transport_pass(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut reconciled = Vec::new();

        for state in self.transport_flows.items() {
            // Cleared up front so events arriving mid-pass mark it again
            let dirty = self
                .transport_flows
                .modify(&state.id, |s| std::mem::take(&mut s.dirty))
                .unwrap_or(false);
            if dirty {
                summary.dirty += 1;
            }
            if !state.is_reconciled() {
                match self.reconcile(&state.id) {
                    ReconcileOutcome::Reconciled(Reconciled { record, labels }) => {
                        let metrics = self.metrics.transport(&labels);
                        self.pairs.observe(ProcessPair {
                            source: record.source.id.clone(),
                            dest: record.dest.id.clone(),
                            protocol: record.protocol.clone(),
                        });
                        self.store_derived(record.into());
                        self.transport_flows
                            .modify(&state.id, |s| s.metrics = Some(metrics));
                        reconciled.push(state.id.clone());
                    }
                    ReconcileOutcome::Pending(reason) => {
                        *summary.pending.entry(reason).or_insert(0) += 1;
                    }
                }
            }
        }

        summary.reconciled = reconciled.len();
        self.publish_pending(RecordKind::TransportBiflow, &TRANSPORT_REASONS, &summary);

        // Count everything seen before the flow was bound to its metrics
        for id in reconciled {
            if let Some(Entry {
                record: Record::TransportBiflow(flow),
                ..
            }) = self.flows.get(&id)
            {
                self.handle_transport_flow(&flow);
            }
        }
        summary
    }

    /// Attempt to reconcile every unresolved application flow once
    pub fn reconcile_app_pass(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        let mut reconciled = Vec::new();

        for state in self.app_flows.items() {
            let dirty = self
                .app_flows
                .modify(&state.id, |s| std::mem::take(&mut s.dirty))
                .unwrap_or(false);
            if dirty {
                summary.dirty += 1;
            }
            if !state.is_reconciled() {
                match self.reconcile_request(&state.id) {
                    ReconcileOutcome::Reconciled(Reconciled { record, labels }) => {
                        self.store_derived(record.into());
                        self.app_flows.modify(&state.id, |s| s.labels = Some(labels));
                        reconciled.push(state.id.clone());
                    }
                    ReconcileOutcome::Pending(reason) => {
                        *summary.pending.entry(reason).or_insert(0) += 1;
                    }
                }
            }
        }

        summary.reconciled = reconciled.len();
        self.publish_pending(RecordKind::AppBiflow, &APP_REASONS, &summary);

        for id in reconciled {
            if let Some(Entry {
                record: Record::AppBiflow(flow),
                ..
            }) = self.flows.get(&id)
            {
                self.handle_app_flow(&flow);
            }
        }
        summary
    }

    fn publish_pending(&self, kind: RecordKind, reasons: &[ReconcileReason], summary: &PassSummary) {
        let type_name = kind.type_meta().to_string();
        for reason in reasons {
            self.metrics
                .pending_flows
                .with_label_values(&[&type_name, reason.as_label(), &self.source.id])
                .set(summary.pending_for(*reason) as f64);
        }
    }

    /// Remove flows that have not been updated within the idle timeout
    pub fn purge_idle(&self, now: DateTime<Utc>) -> PurgeSummary {
        let idle_timeout = self.config.idle_timeout();
        let mut terminated = Vec::new();
        let mut stale = Vec::new();

        for entry in self.flows.list() {
            let idle = (now - entry.metadata.last_update)
                .to_std()
                .unwrap_or_default();
            if idle < idle_timeout {
                continue;
            }
            let id = entry.record.identity().to_string();
            if entry.record.is_terminated() {
                terminated.push(id);
            } else {
                stale.push(id);
            }
        }

        if !terminated.is_empty() {
            tracing::debug!(count = terminated.len(), "Purging terminated flows");
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Purging stale flows");
        }
        for id in terminated.iter().chain(stale.iter()) {
            self.flows.delete(id);
            self.records.delete(id);
        }

        PurgeSummary {
            terminated: terminated.len(),
            stale: stale.len(),
        }
    }

    /// Register client hosts of flows whose source stayed unresolved
    ///
    /// Returns the number of flow sources added.
    pub fn register_flow_sources(&self, now: DateTime<Utc>) -> usize {
        let grace = self.config.flow_source_grace();
        let mut added = 0;

        for state in self.transport_flows.items() {
            if state.is_reconciled() {
                continue;
            }
            if (now - state.first_seen).to_std().unwrap_or_default() < grace {
                continue;
            }
            let Some(Entry {
                record: Record::TransportBiflow(flow),
                ..
            }) = self.flows.get(&state.id)
            else {
                continue;
            };

            let listener = self.graph.listener(flow.parent.as_deref().unwrap_or_default());
            let site = listener.parent().parent();
            let (Some(site_id), Some(host)) = (site.id(), flow.source_host.as_deref()) else {
                continue;
            };
            if host.is_empty() {
                continue;
            }

            let id = self.idp.id("flowsource", &[site_id, host]);
            if !self.flow_sources.lock().insert(id.clone()) {
                continue;
            }
            tracing::info!(site_id = %site_id, host = %host, "Registering flow source");
            self.records.add(
                FlowSourceRecord {
                    id,
                    site: site_id.to_string(),
                    host: host.to_string(),
                    start: now,
                }
                .into(),
                self.source.clone(),
            );
            added += 1;
        }
        added
    }

    /// Delete every tracked flow along with its derived record
    pub fn shutdown(&self) {
        for entry in self.flows.list() {
            self.flows.delete(entry.record.identity());
        }
    }

    async fn reconcile_loop(
        self: Arc<Self>,
        job: &'static str,
        pass: fn(&ConnectionManager) -> PassSummary,
        cancel: CancellationToken,
    ) {
        let job_time = self
            .metrics
            .collector_job
            .with_label_values(&[&self.source.id, job]);
        let mut backoff = ExponentialBackoff::new(
            self.config.reconcile_min_interval(),
            self.config.reconcile_max_interval(),
        );

        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let start = Instant::now();
            let summary = pass(self.as_ref());
            job_time.observe(start.elapsed().as_secs_f64());

            if summary.reconciled > 0 {
                tracing::debug!(job, count = summary.reconciled, "Reconciled flows");
            }
            if summary.dirty > 0 {
                backoff.reset();
            }
        }
    }

    /// Run the reconcile loops and flow housekeeping until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        loops.spawn(self.clone().reconcile_loop(
            "flow_processes",
            ConnectionManager::reconcile_transport_pass,
            cancel.clone(),
        ));
        loops.spawn(self.clone().reconcile_loop(
            "appflow_processes",
            ConnectionManager::reconcile_app_pass,
            cancel.clone(),
        ));

        let sources_time = self
            .metrics
            .collector_job
            .with_label_values(&[&self.source.id, "flow_sources"]);
        let evictions_time = self
            .metrics
            .collector_job
            .with_label_values(&[&self.source.id, "flow_evictions"]);

        let mut invalidate_cache = ticker(self.config.attribute_cache_ttl());
        let mut purge_flows = ticker(self.config.purge_interval());
        let mut flow_sources = ticker(self.config.flow_source_interval());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = invalidate_cache.tick() => self.clear_attribute_caches(),
                _ = purge_flows.tick() => {
                    let start = Instant::now();
                    self.purge_idle(Utc::now());
                    evictions_time.observe(start.elapsed().as_secs_f64());
                }
                _ = flow_sources.tick() => {
                    let start = Instant::now();
                    self.register_flow_sources(Utc::now());
                    sources_time.observe(start.elapsed().as_secs_f64());
                }
            }
        }

        while loops.join_next().await.is_some() {}
        self.shutdown();
        tracing::debug!("Connection manager stopped");
    }
}

impl Reactor for ConnectionManager {
    fn handle_change_event(&self, event: &ChangeEvent, _records: &RecordStore) {
        match event.record() {
            Record::Connector(connector) => self.invalidate_connector(&connector.id),
            Record::Process(process) => self.invalidate_process(&process.id),
            Record::Router(router) => self.invalidate_router(&router.id),
            // Sites and groups feed cached process attributes
            Record::Site(_) | Record::ProcessGroup(_) => self.clear_attribute_caches(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StableIdentityProvider;
    use crate::records::{ConnectorRecord, ListenerRecord, ProcessRecord, RouterRecord, SiteRecord};
    use prometheus::Registry;

    struct Fixture {
        records: Arc<RecordStore>,
        graph: Arc<Graph>,
        metrics: CollectorMetrics,
        manager: Arc<ConnectionManager>,
    }

    fn fixture(config: FlowsConfig) -> Fixture {
        let records = Arc::new(RecordStore::default());
        let graph = Arc::new(Graph::new(records.clone()));
        let idp: Arc<dyn IdProvider> = Arc::new(StableIdentityProvider::new());
        let source = SourceRef::new("self", "0.1");
        let pairs = Arc::new(PairManager::new(
            records.clone(),
            graph.clone(),
            idp.clone(),
            source.clone(),
        ));
        let metrics = CollectorMetrics::register(&Registry::new()).unwrap();
        let manager = ConnectionManager::new(
            records.clone(),
            graph.clone(),
            idp,
            pairs,
            source,
            metrics.clone(),
            config,
        );
        Fixture {
            records,
            graph,
            metrics,
            manager,
        }
    }

    impl Fixture {
        fn add(&self, record: Record) {
            self.records.add(record.clone(), SourceRef::new("router", "1"));
            self.graph.index(&record);
        }

        /// Two sites, a listener on east and a connector on west targeting p-server
        fn topology(&self) {
            for (id, name) in [("site-east", "east"), ("site-west", "west")] {
                self.add(
                    SiteRecord {
                        id: id.to_string(),
                        name: Some(name.to_string()),
                        ..Default::default()
                    }
                    .into(),
                );
            }
            for (id, site) in [("router-east", "site-east"), ("router-west", "site-west")] {
                self.add(
                    RouterRecord {
                        id: id.to_string(),
                        parent: Some(site.to_string()),
                        name: Some(id.replace('-', " ")),
                        ..Default::default()
                    }
                    .into(),
                );
            }
            self.add(
                ListenerRecord {
                    id: "listener-1".to_string(),
                    parent: Some("router-east".to_string()),
                    name: Some("backend".to_string()),
                    address: Some("backend".to_string()),
                    protocol: Some("tcp".to_string()),
                    ..Default::default()
                }
                .into(),
            );
            self.add(
                ConnectorRecord {
                    id: "connector-1".to_string(),
                    parent: Some("router-west".to_string()),
                    address: Some("backend".to_string()),
                    protocol: Some("tcp".to_string()),
                    dest_host: Some("10.0.0.8".to_string()),
                    dest_port: Some("8080".to_string()),
                    ..Default::default()
                }
                .into(),
            );
            self.add(
                ProcessRecord {
                    id: "p-client".to_string(),
                    parent: Some("site-east".to_string()),
                    name: Some("client".to_string()),
                    source_host: Some("10.0.0.2".to_string()),
                    ..Default::default()
                }
                .into(),
            );
            self.add(
                ProcessRecord {
                    id: "p-server".to_string(),
                    parent: Some("site-west".to_string()),
                    name: Some("server".to_string()),
                    source_host: Some("10.0.0.8".to_string()),
                    ..Default::default()
                }
                .into(),
            );
        }

        fn flow(&self, octets: u64) -> TransportBiflowRecord {
            TransportBiflowRecord {
                id: "flow-1".to_string(),
                parent: Some("listener-1".to_string()),
                connector_id: Some("connector-1".to_string()),
                source_host: Some("10.0.0.2".to_string()),
                start_time: Some(Utc::now()),
                octets: Some(octets),
                ..Default::default()
            }
        }
    }

    #[test]
    fn test_reconcile_missing_record() {
        let f = fixture(FlowsConfig::default());
        assert_eq!(
            f.manager.reconcile("nope").reason(),
            ReconcileReason::MissingRecord
        );
    }

    #[test]
    fn test_reconcile_reasons_progress() {
        let f = fixture(FlowsConfig::default());
        f.manager
            .flows()
            .add(f.flow(0).into(), SourceRef::new("router", "1"));
        assert_eq!(
            f.manager.reconcile("flow-1").reason(),
            ReconcileReason::MissingConnector
        );

        f.topology();
        match f.manager.reconcile("flow-1") {
            ReconcileOutcome::Reconciled(Reconciled { record, labels }) => {
                assert_eq!(record.source.name, "client");
                assert_eq!(record.dest.name, "server");
                assert_eq!(record.source_site.name, "east");
                assert_eq!(record.dest_site.name, "west");
                assert_eq!(record.listener.name, "backend");
                assert_eq!(record.source_router.name, "router east");
                assert_eq!(record.dest_router.name, "router west");
                assert_eq!(record.connector_host, "10.0.0.8");
                assert_eq!(record.connector_port, "8080");
                assert_eq!(labels.routing_key, "backend");
                assert_eq!(labels.protocol, "tcp");
            }
            other => panic!("expected reconciled connection, got {:?}", other.reason()),
        }
    }

    #[test]
    fn test_pass_binds_metrics_and_replays_counts() {
        let f = fixture(FlowsConfig::default());
        f.topology();
        let flows = f.manager.flows();
        flows.add(f.flow(10).into(), SourceRef::new("router", "1"));

        let summary = f.manager.reconcile_transport_pass();
        assert_eq!(summary.dirty, 1);
        assert_eq!(summary.reconciled, 1);
        assert!(f.records.get("flow-1").is_some());

        let state = f.manager.transport_state("flow-1").unwrap();
        assert!(state.opened);
        assert_eq!(state.bytes_sent, 10);

        flows.update(f.flow(25).into());
        let labels = connection_labels(&match f.records.get("flow-1").unwrap().record {
            Record::Connection(c) => c,
            other => panic!("unexpected {:?}", other),
        });
        let sent = f.metrics.sent_bytes.with_label_values(&labels.values());
        assert_eq!(sent.get(), 25);

        let second = f.manager.reconcile_transport_pass();
        assert_eq!(second.reconciled, 0);
    }

    #[test]
    fn test_pending_reasons_counted() {
        let f = fixture(FlowsConfig::default());
        f.manager
            .flows()
            .add(f.flow(0).into(), SourceRef::new("router", "1"));
        let summary = f.manager.reconcile_transport_pass();
        assert_eq!(summary.pending_for(ReconcileReason::MissingConnector), 1);
        assert_eq!(summary.reconciled, 0);
    }

    #[test]
    fn test_request_waits_for_transport() {
        let f = fixture(FlowsConfig::default());
        f.topology();
        let flows = f.manager.flows();
        let request = AppBiflowRecord {
            id: "req-1".to_string(),
            parent: Some("flow-1".to_string()),
            protocol: Some("HTTP/1.1".to_string()),
            method: Some("post".to_string()),
            result: Some("201".to_string()),
            ..Default::default()
        };
        flows.add(request.into(), SourceRef::new("router", "1"));
        assert_eq!(
            f.manager.reconcile_request("req-1").reason(),
            ReconcileReason::MissingTransport
        );

        flows.add(f.flow(0).into(), SourceRef::new("router", "1"));
        assert_eq!(
            f.manager.reconcile_request("req-1").reason(),
            ReconcileReason::UnreconciledTransport
        );

        f.manager.reconcile_transport_pass();
        let summary = f.manager.reconcile_app_pass();
        assert_eq!(summary.reconciled, 1);
        match f.records.get("req-1").unwrap().record {
            Record::Request(r) => {
                assert_eq!(r.transport_id, "flow-1");
                assert_eq!(r.protocol, "http1");
                assert_eq!(r.method, "POST");
                assert_eq!(r.result_class, "2xx");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delete_drops_state_and_record() {
        let f = fixture(FlowsConfig::default());
        f.topology();
        f.manager
            .flows()
            .add(f.flow(0).into(), SourceRef::new("router", "1"));
        f.manager.reconcile_transport_pass();

        f.manager.flows().delete("flow-1");
        assert!(f.manager.transport_state("flow-1").is_none());
        assert!(f.records.get("flow-1").is_none());
    }

    #[test]
    fn test_purge_idle_separates_terminated() {
        let f = fixture(FlowsConfig::default());
        let flows = f.manager.flows();
        let mut done = f.flow(0);
        done.id = "flow-done".to_string();
        done.end_time = done.start_time;
        flows.add(f.flow(0).into(), SourceRef::default());
        flows.add(done.into(), SourceRef::default());

        assert_eq!(f.manager.purge_idle(Utc::now()), PurgeSummary::default());

        let later = Utc::now() + chrono::Duration::minutes(16);
        let summary = f.manager.purge_idle(later);
        assert_eq!(summary.terminated, 1);
        assert_eq!(summary.stale, 1);
        assert!(flows.is_empty());
        assert_eq!(f.manager.tracked_flows(), (0, 0));
    }

    #[test]
    fn test_max_tracked_flows_evicts() {
        let config = FlowsConfig {
            max_tracked_flows: 2,
            ..Default::default()
        };
        let f = fixture(config);
        let flows = f.manager.flows();
        for i in 0..3 {
            let mut flow = f.flow(0);
            flow.id = format!("flow-{i}");
            flows.add(flow.into(), SourceRef::default());
        }

        assert_eq!(f.manager.tracked_flows().0, 2);
        assert!(flows.get("flow-0").is_none());
        assert!(flows.get("flow-2").is_some());
    }

    #[test]
    fn test_register_flow_source_after_grace() {
        let f = fixture(FlowsConfig::default());
        f.topology();
        let mut flow = f.flow(0);
        flow.source_host = Some("10.0.0.99".to_string());
        f.manager.flows().add(flow.into(), SourceRef::default());
        f.manager.reconcile_transport_pass();

        assert_eq!(f.manager.register_flow_sources(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(20);
        assert_eq!(f.manager.register_flow_sources(later), 1);
        // Registered once per (site, host)
        assert_eq!(f.manager.register_flow_sources(later), 0);

        let sources = f.records.index(
            TYPE_INDEX,
            &Entry::exemplar(FlowSourceRecord::default().into()),
        );
        assert_eq!(sources.len(), 1);
        match &sources[0].record {
            Record::FlowSource(r) => {
                assert_eq!(r.site, "site-east");
                assert_eq!(r.host, "10.0.0.99");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unnamed_router_keeps_flow_pending() {
        let f = fixture(FlowsConfig::default());
        f.topology();
        let unnamed: Record = RouterRecord {
            id: "router-west".to_string(),
            parent: Some("site-west".to_string()),
            ..Default::default()
        }
        .into();
        f.records.update(unnamed.clone());
        f.graph.reindex(&unnamed);
        f.manager.clear_attribute_caches();
        f.manager
            .flows()
            .add(f.flow(0).into(), SourceRef::new("router", "1"));
        assert_eq!(
            f.manager.reconcile("flow-1").reason(),
            ReconcileReason::MissingDest
        );

        let named: Record = RouterRecord {
            id: "router-west".to_string(),
            parent: Some("site-west".to_string()),
            name: Some("west-1".to_string()),
            ..Default::default()
        }
        .into();
        f.records.update(named);
        f.manager.invalidate_router("router-west");
        match f.manager.reconcile("flow-1") {
            ReconcileOutcome::Reconciled(Reconciled { record, .. }) => {
                assert_eq!(record.dest_router.id, "router-west");
                assert_eq!(record.dest_router.name, "west-1");
            }
            other => panic!("expected reconciled connection, got {:?}", other.reason()),
        }
    }

    #[test]
    fn test_group_created_later_resolves() {
        let f = fixture(FlowsConfig::default());
        f.topology();
        for (id, site, name, host, group) in [
            ("p-client", "site-east", "client", "10.0.0.2", "frontend"),
            ("p-server", "site-west", "server", "10.0.0.8", "backend"),
        ] {
            f.records.update(
                ProcessRecord {
                    id: id.to_string(),
                    parent: Some(site.to_string()),
                    name: Some(name.to_string()),
                    source_host: Some(host.to_string()),
                    group: Some(group.to_string()),
                    ..Default::default()
                }
                .into(),
            );
        }
        f.manager
            .flows()
            .add(f.flow(0).into(), SourceRef::new("router", "1"));

        let summary = f.manager.reconcile_transport_pass();
        assert_eq!(summary.reconciled, 0);
        assert_eq!(summary.pending_for(ReconcileReason::MissingSource), 1);
        assert!(f.records.get("flow-1").is_none());

        for (id, name) in [("pg-frontend", "frontend"), ("pg-backend", "backend")] {
            f.records.add(
                ProcessGroupRecord {
                    id: id.to_string(),
                    name: name.to_string(),
                    start: Utc::now(),
                }
                .into(),
                SourceRef::new("self", "0.1"),
            );
        }
        let summary = f.manager.reconcile_transport_pass();
        assert_eq!(summary.reconciled, 1);
        match f.records.get("flow-1").unwrap().record {
            Record::Connection(c) => {
                assert_eq!(c.source_group.id, "pg-frontend");
                assert_eq!(c.dest_group.id, "pg-backend");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_event_after_snapshot_stays_dirty() {
        let f = fixture(FlowsConfig::default());
        f.manager
            .flows()
            .add(f.flow(0).into(), SourceRef::new("router", "1"));
        assert_eq!(f.manager.reconcile_transport_pass().dirty, 1);
        assert_eq!(f.manager.reconcile_transport_pass().dirty, 0);

        // An update to an unreconciled flow marks it for the next pass
        f.manager.flows().update(f.flow(5).into());
        assert!(f.manager.transport_state("flow-1").unwrap().dirty);
        assert_eq!(f.manager.reconcile_transport_pass().dirty, 1);
        assert!(!f.manager.transport_state("flow-1").unwrap().dirty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_loop_resets_backoff_on_dirty_pass() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        static PASSES: AtomicUsize = AtomicUsize::new(0);
        fn counting_pass(manager: &ConnectionManager) -> PassSummary {
            PASSES.fetch_add(1, Ordering::SeqCst);
            manager.reconcile_transport_pass()
        }

        let config = FlowsConfig {
            reconcile_min_interval: "100ms".to_string(),
            reconcile_max_interval: "10s".to_string(),
            ..Default::default()
        };
        let f = fixture(config);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(f.manager.clone().reconcile_loop(
            "flow_processes",
            counting_pass,
            cancel.clone(),
        ));

        // Idle passes at 100, 250, 475, 812.5 and 1318.75ms
        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(PASSES.load(Ordering::SeqCst), 5);

        // The next pass at ~2078ms sees a dirty flow and drops back to 100ms
        f.manager
            .flows()
            .add(f.flow(0).into(), SourceRef::new("router", "1"));
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(PASSES.load(Ordering::SeqCst), 6);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(PASSES.load(Ordering::SeqCst), 7);

        cancel.cancel();
        task.await.unwrap();
    }
}
