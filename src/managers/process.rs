//! Synthetic site processes and process groups
//!
//! Connectors forward to a destination host and flow sources report a host
//! where clients live. When no process is known at such a (site, host) the
//! manager adds an external placeholder process, and removes it again once
//! a real process shows up or nothing points at the host anymore. Process
//! groups exist for as long as at least one process names them.

use super::{ChangeEvent, Reactor};
use crate::graph::Graph;
use crate::identity::IdProvider;
use crate::records::{ProcessGroupRecord, ProcessRecord, Record, RecordKind};
use crate::store::indexers::{SOURCE_INDEX, TYPE_INDEX, TYPE_NAME_INDEX, TYPE_PARENT_INDEX};
use crate::store::{Entry, RecordStore, SourceRef};
use crate::util::{short_site, ticker};
use ahash::{HashMap, HashMapExt};
use chrono::Utc;
use parking_lot::Mutex;
use prometheus::HistogramVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const SERVER_CLASS: &str = "site-server";
pub const CLIENT_CLASS: &str = "site-client";

/// What caused a host to be expected at a site
#[derive(Debug, Clone, PartialEq, Eq)]
struct HostInfo {
    /// Connector or flow source id
    id: String,
    server: bool,
}

#[derive(Default)]
struct ProcessState {
    /// Group name -> number of processes naming it
    groups: HashMap<String, i64>,
    /// Connector id -> destination host
    connectors: HashMap<String, String>,
    /// Flow source id -> host
    flow_sources: HashMap<String, String>,
    /// Site id -> host -> reason
    expected_site_hosts: HashMap<String, HashMap<String, HostInfo>>,
    /// Process id -> host, for processes backing an expected host
    process_hosts: HashMap<String, String>,
}

struct Receivers {
    check_group: mpsc::UnboundedReceiver<String>,
    rebuild_connectors: mpsc::Receiver<()>,
    rebuild_processes: mpsc::Receiver<()>,
}

pub struct ProcessManager {
    records: Arc<RecordStore>,
    graph: Arc<Graph>,
    idp: Arc<dyn IdProvider>,
    source: SourceRef,
    state: Mutex<ProcessState>,
    check_group: mpsc::UnboundedSender<String>,
    rebuild_connectors: mpsc::Sender<()>,
    rebuild_processes: mpsc::Sender<()>,
    receivers: Mutex<Option<Receivers>>,
}

impl ProcessManager {
    /// Create a new process manager writing records as `source`
    pub fn new(
        records: Arc<RecordStore>,
        graph: Arc<Graph>,
        idp: Arc<dyn IdProvider>,
        source: SourceRef,
    ) -> Self {
        let (check_group, check_group_rx) = mpsc::unbounded_channel();
        let (rebuild_connectors, rebuild_connectors_rx) = mpsc::channel(1);
        let (rebuild_processes, rebuild_processes_rx) = mpsc::channel(1);
        Self {
            records,
            graph,
            idp,
            source,
            state: Mutex::new(ProcessState::default()),
            check_group,
            rebuild_connectors,
            rebuild_processes,
            receivers: Mutex::new(Some(Receivers {
                check_group: check_group_rx,
                rebuild_connectors: rebuild_connectors_rx,
                rebuild_processes: rebuild_processes_rx,
            })),
        }
    }

    /// Number of processes currently naming `group`
    pub fn group_members(&self, group: &str) -> i64 {
        self.state.lock().groups.get(group).copied().unwrap_or(0)
    }

    /// Recompute the hosts each site should have a process for
    ///
    /// Returns true when the expected set changed.
    pub fn rebuild_expected_hosts(&self) -> bool {
        let mut next_connectors = HashMap::new();
        let mut next_sources = HashMap::new();
        let mut next_site_hosts: HashMap<String, HashMap<String, HostInfo>> = HashMap::new();

        let connectors = self.records.index(
            TYPE_INDEX,
            &Entry::exemplar(Record::Connector(Default::default())),
        );
        for entry in connectors {
            let Record::Connector(connector) = entry.record else {
                continue;
            };
            let Some(dest_host) = connector.dest_host else {
                continue;
            };
            let Some(site) = self
                .graph
                .connector(&connector.id)
                .parent()
                .parent()
                .id()
                .map(str::to_string)
            else {
                continue;
            };
            next_connectors.insert(connector.id.clone(), dest_host.clone());
            next_site_hosts.entry(site).or_default().insert(
                dest_host,
                HostInfo {
                    id: connector.id,
                    server: true,
                },
            );
        }

        let sources = self.records.index(
            TYPE_INDEX,
            &Entry::exemplar(Record::FlowSource(Default::default())),
        );
        for entry in sources {
            let Record::FlowSource(source) = entry.record else {
                continue;
            };
            next_sources.insert(source.id.clone(), source.host.clone());
            // A connector at the same host already makes it a server
            next_site_hosts
                .entry(source.site)
                .or_default()
                .entry(source.host)
                .or_insert(HostInfo {
                    id: source.id,
                    server: false,
                });
        }

        let mut state = self.state.lock();
        let changed = state.connectors != next_connectors
            || state.flow_sources != next_sources
            || state.expected_site_hosts != next_site_hosts;
        state.connectors = next_connectors;
        state.flow_sources = next_sources;
        state.expected_site_hosts = next_site_hosts;
        changed
    }

    /// Add or remove synthetic processes to match the expected hosts
    pub fn rebuild_processes(&self) {
        let expected = self.state.lock().expected_site_hosts.clone();
        let mut actual: HashMap<String, String> = HashMap::new();

        for (site, hosts) in &expected {
            let processes = self.records.index(
                TYPE_PARENT_INDEX,
                &Entry::exemplar(
                    ProcessRecord {
                        parent: Some(site.clone()),
                        ..Default::default()
                    }
                    .into(),
                ),
            );
            let mut by_host: HashMap<&str, Vec<&Entry>> = HashMap::new();
            for entry in &processes {
                if let Record::Process(process) = &entry.record {
                    if let Some(host) = &process.source_host {
                        by_host.entry(host.as_str()).or_default().push(entry);
                    }
                }
            }

            for (host, info) in hosts {
                match by_host.get(host.as_str()).map(Vec::as_slice) {
                    Some([only]) => {
                        actual.insert(only.record.identity().to_string(), host.clone());
                    }
                    None | Some([]) => {
                        let id = self.add_site_process(site, host, info);
                        actual.insert(id, host.clone());
                    }
                    Some(several) => {
                        // Prefer processes reported by a real event source
                        let mut replaced_by = None;
                        let mut synthetic = Vec::new();
                        for entry in several {
                            let id = entry.record.identity();
                            if entry.metadata.source == self.source {
                                synthetic.push(id);
                            } else {
                                replaced_by = Some(id);
                                actual.insert(id.to_string(), host.clone());
                            }
                        }
                        if replaced_by.is_none() {
                            // Only our own placeholders, keep the first
                            if let Some((keep, _)) = synthetic.split_first() {
                                actual.insert(keep.to_string(), host.clone());
                            }
                            continue;
                        }
                        for id in synthetic {
                            tracing::info!(
                                id = %id,
                                host = %host,
                                site_id = %site,
                                replaced_by = %replaced_by.unwrap_or_default(),
                                "Deleting superseded site process"
                            );
                            self.records.delete(id);
                        }
                    }
                }
            }
        }

        // Sweep placeholders for hosts that are no longer expected, at any site
        let ours = self
            .records
            .index(SOURCE_INDEX, &Entry::source_exemplar(self.source.clone()));
        for entry in ours {
            if entry.record.kind() != RecordKind::Process
                || actual.contains_key(entry.record.identity())
            {
                continue;
            }
            if self.records.delete(entry.record.identity()).is_some() {
                tracing::info!(
                    id = entry.record.identity(),
                    "Deleting site process with no connectors or flow sources"
                );
            }
        }

        self.state.lock().process_hosts = actual;
    }

    fn add_site_process(&self, site: &str, host: &str, info: &HostInfo) -> String {
        let class = if info.server { SERVER_CLASS } else { CLIENT_CLASS };
        let id = self.idp.id("siteproc", &[host, site]);
        let name = format!("{}-{}-{}", class, host, short_site(site));
        let group = format!("{}s-{}", class, short_site(site));
        tracing::info!(
            id = %id,
            name = %name,
            site_id = %site,
            cause = %info.id,
            "Adding site process without a matching process"
        );
        self.records.add(
            ProcessRecord {
                id: id.clone(),
                start_time: Some(Utc::now()),
                parent: Some(site.to_string()),
                mode: Some("external".to_string()),
                source_host: Some(host.to_string()),
                name: Some(name),
                group: Some(group),
                ..Default::default()
            }
            .into(),
            self.source.clone(),
        );
        id
    }

    /// Create the group record if processes name it, delete it if none do
    pub fn check_group(&self, name: &str) {
        let members = {
            let mut state = self.state.lock();
            let members = state.groups.get(name).copied().unwrap_or(0);
            if members <= 0 {
                state.groups.remove(name);
            }
            members
        };

        let groups = self.records.index(
            TYPE_NAME_INDEX,
            &Entry::exemplar(
                ProcessGroupRecord {
                    name: name.to_string(),
                    ..Default::default()
                }
                .into(),
            ),
        );
        if members <= 0 {
            for group in groups {
                tracing::info!(
                    id = group.record.identity(),
                    group = %name,
                    "Deleting process group with no processes"
                );
                self.records.delete(group.record.identity());
            }
            return;
        }
        if !groups.is_empty() {
            return;
        }

        let id = self.idp.id("pg", &[name]);
        tracing::info!(id = %id, group = %name, "Creating process group");
        self.records.add(
            ProcessGroupRecord {
                id,
                name: name.to_string(),
                start: Utc::now(),
            }
            .into(),
            self.source.clone(),
        );
    }

    /// Run queued work without waiting, until the queues are empty
    ///
    /// Does nothing while [`ProcessManager::run`] owns the queues.
    pub fn drain(&self) {
        let mut receivers = self.receivers.lock();
        let Some(rx) = receivers.as_mut() else {
            return;
        };
        loop {
            let mut progressed = false;
            while let Ok(name) = rx.check_group.try_recv() {
                self.check_group(&name);
                progressed = true;
            }
            if rx.rebuild_connectors.try_recv().is_ok() {
                if self.rebuild_expected_hosts() {
                    request(&self.rebuild_processes, "processes");
                }
                progressed = true;
            }
            if rx.rebuild_processes.try_recv().is_ok() {
                self.rebuild_processes();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    /// Serve rebuild requests until cancelled
    ///
    /// Every `period` a full rebuild is requested, alternating between the
    /// expected hosts and the processes.
    pub async fn run(
        self: Arc<Self>,
        period: Duration,
        job_time: HistogramVec,
        cancel: CancellationToken,
    ) {
        let Some(mut rx) = self.receivers.lock().take() else {
            tracing::warn!("Process manager is already running");
            return;
        };
        let processes_time = job_time.with_label_values(&[&self.source.id, "process_processes"]);
        let hosts_time = job_time.with_label_values(&[&self.source.id, "process_desired_hosts"]);
        let groups_time = job_time.with_label_values(&[&self.source.id, "process_groups"]);

        let mut rebuild = ticker(period);
        let mut hosts_next = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = rebuild.tick() => {
                    if hosts_next {
                        request(&self.rebuild_connectors, "hosts");
                    } else {
                        request(&self.rebuild_processes, "processes");
                    }
                    hosts_next = !hosts_next;
                }
                Some(()) = rx.rebuild_processes.recv() => {
                    let start = Instant::now();
                    self.rebuild_processes();
                    processes_time.observe(start.elapsed().as_secs_f64());
                }
                Some(()) = rx.rebuild_connectors.recv() => {
                    let start = Instant::now();
                    if self.rebuild_expected_hosts() {
                        request(&self.rebuild_processes, "processes");
                    }
                    hosts_time.observe(start.elapsed().as_secs_f64());
                }
                Some(name) = rx.check_group.recv() => {
                    let start = Instant::now();
                    self.check_group(&name);
                    groups_time.observe(start.elapsed().as_secs_f64());
                }
            }
        }
        tracing::info!("Process manager shutdown complete");
    }

    fn ensure_group(&self, name: &str, delta: i64) {
        let check = {
            let mut state = self.state.lock();
            let added = !state.groups.contains_key(name);
            let members = state.groups.entry(name.to_string()).or_insert(0);
            *members += delta;
            added || *members <= 0
        };
        if check && self.check_group.send(name.to_string()).is_err() {
            tracing::debug!(group = %name, "Group queue closed, dropping check");
        }
    }

    fn track_connector(&self, id: &str, host: Option<&str>, deleted: bool) {
        let rebuild = {
            let state = self.state.lock();
            match (state.connectors.get(id), host) {
                (Some(_), _) if deleted => true,
                (Some(expected), Some(host)) => expected != host,
                // Lost its destination host
                (Some(_), None) => true,
                (None, host) => host.is_some() && !deleted,
            }
        };
        if rebuild {
            request(&self.rebuild_connectors, "hosts");
        }
    }

    fn track_flow_source(&self, id: &str, host: &str, deleted: bool) {
        let rebuild = {
            let state = self.state.lock();
            match state.flow_sources.get(id) {
                Some(_) if deleted => true,
                Some(expected) => expected != host,
                None => !deleted,
            }
        };
        if rebuild {
            request(&self.rebuild_connectors, "hosts");
        }
    }

    fn track_process_host(&self, id: &str, host: &str, deleted: bool) {
        let rebuild = {
            let state = self.state.lock();
            match state.process_hosts.get(id) {
                Some(_) if deleted => true,
                Some(expected) => expected != host,
                None => true,
            }
        };
        if rebuild {
            request(&self.rebuild_processes, "processes");
        }
    }
}

/// Queue a rebuild unless one is already pending
fn request(queue: &mpsc::Sender<()>, what: &str) {
    if queue.try_send(()).is_err() {
        tracing::debug!(rebuild = what, "Skipping rebuild request, one is already pending");
    }
}

impl Reactor for ProcessManager {
    fn handle_change_event(&self, event: &ChangeEvent, _records: &RecordStore) {
        let deleted = event.is_delete();
        match event.record() {
            Record::Connector(connector) => {
                self.track_connector(&connector.id, connector.dest_host.as_deref(), deleted);
            }
            Record::FlowSource(source) => {
                self.track_flow_source(&source.id, &source.host, deleted);
            }
            Record::Process(process) => {
                let previous_group = match event.previous() {
                    Some(Record::Process(prev)) => Some(prev.group.as_deref()),
                    _ => None,
                };
                match (event, previous_group) {
                    (ChangeEvent::Added(_), _) => {
                        if let Some(group) = &process.group {
                            self.ensure_group(group, 1);
                        }
                    }
                    (ChangeEvent::Deleted(_), _) => {
                        if let Some(group) = &process.group {
                            self.ensure_group(group, -1);
                        }
                    }
                    (ChangeEvent::Updated { .. }, Some(prev)) if prev != process.group.as_deref() => {
                        if let Some(prev) = prev {
                            self.ensure_group(prev, -1);
                        }
                        if let Some(group) = &process.group {
                            self.ensure_group(group, 1);
                        }
                    }
                    _ => {}
                }
                if let (Some(host), Some(_)) = (&process.source_host, &process.parent) {
                    self.track_process_host(&process.id, host, deleted);
                }
            }
            _ => {}
        }
    }
}
