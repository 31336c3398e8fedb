//! Topology graph derived from the record store
//!
//! Each topology record becomes a vertex and its references (parent,
//! address/protocol, process, destination host) become edges pointing from
//! the referenced vertex to the referencing one. Vertices for references that
//! have not arrived yet are created as placeholders, so relations resolve as
//! soon as either side is known.
//!
//! One lock guards the whole DAG. Navigation takes a short read lock per step,
//! indexing takes the write lock. The graph lock is always taken before any
//! store lock, never the other way around.

mod nodes;

pub use nodes::*;

use crate::records::{
    ConnectorRecord, LinkRecord, ListenerRecord, ProcessRecord, Record, RecordKind,
    RouterAccessRecord, RouterRecord,
};
use crate::store::indexers::TYPE_PARENT_INDEX;
use crate::store::{Entry, RecordStore};
use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::sync::Arc;

/// Kind of a graph vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Site,
    Router,
    Link,
    RouterAccess,
    Listener,
    Connector,
    Process,
    Address,
    /// `protocol:address` shared by listeners, connectors and their address
    RoutingKey,
    /// `site:host` linking connectors to the process running at that host
    SiteHost,
}

/// Id of the routing key vertex for an address
pub fn routing_key_id(address: &str, protocol: &str) -> String {
    format!("{protocol}:{address}")
}

/// Id of the site host vertex for a host at a site
pub fn site_host_id(site: &str, host: &str) -> String {
    format!("{site}:{host}")
}

#[derive(Debug, Clone)]
struct Vertex {
    id: String,
    kind: NodeKind,
}

#[derive(Default)]
struct Dag {
    graph: StableDiGraph<Vertex, ()>,
    ids: HashMap<String, NodeIndex>,
}

impl Dag {
    /// Ensure a vertex exists, setting its kind
    fn upsert(&mut self, id: &str, kind: NodeKind) -> NodeIndex {
        if let Some(&idx) = self.ids.get(id) {
            if let Some(vertex) = self.graph.node_weight_mut(idx) {
                vertex.kind = kind;
            }
            return idx;
        }
        self.insert(id, kind)
    }

    /// Ensure a vertex exists, keeping the kind of an existing one
    fn placeholder(&mut self, id: &str, kind: NodeKind) -> NodeIndex {
        match self.ids.get(id) {
            Some(&idx) => idx,
            None => self.insert(id, kind),
        }
    }

    fn insert(&mut self, id: &str, kind: NodeKind) -> NodeIndex {
        let idx = self.graph.add_node(Vertex {
            id: id.to_string(),
            kind,
        });
        self.ids.insert(id.to_string(), idx);
        idx
    }

    fn remove(&mut self, id: &str) {
        if let Some(idx) = self.ids.remove(id) {
            self.graph.remove_node(idx);
        }
    }

    /// Make the parents of `id` exactly `parents`, adding and removing edges
    fn ensure_parents(&mut self, id: &str, parents: &[(String, NodeKind)]) {
        let Some(&child) = self.ids.get(id) else {
            return;
        };
        let mut desired: HashMap<&str, NodeKind> = HashMap::with_capacity(parents.len());
        for (parent, kind) in parents {
            if parent != id {
                desired.insert(parent.as_str(), *kind);
            }
        }

        let current: Vec<_> = self
            .graph
            .edges_directed(child, Direction::Incoming)
            .map(|edge| (edge.id(), edge.source()))
            .collect();
        for (edge, source) in current {
            let keep = self
                .graph
                .node_weight(source)
                .map(|vertex| desired.remove(vertex.id.as_str()).is_some())
                .unwrap_or(false);
            if !keep {
                self.graph.remove_edge(edge);
            }
        }

        for (parent, kind) in desired {
            let idx = self.placeholder(parent, kind);
            self.graph.add_edge(idx, child, ());
        }
    }

    fn parent_of(&self, id: &str, kind: NodeKind) -> Option<String> {
        let idx = *self.ids.get(id)?;
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n))
            .find(|vertex| vertex.kind == kind)
            .map(|vertex| vertex.id.clone())
    }

    fn children_of(&self, id: &str, kind: NodeKind) -> Vec<String> {
        let Some(&idx) = self.ids.get(id) else {
            return Vec::new();
        };
        let mut children: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .filter_map(|n| self.graph.node_weight(n))
            .filter(|vertex| vertex.kind == kind)
            .map(|vertex| vertex.id.clone())
            .collect();
        children.sort_unstable();
        children
    }

    fn kind_of(&self, id: &str) -> Option<NodeKind> {
        let idx = *self.ids.get(id)?;
        self.graph.node_weight(idx).map(|vertex| vertex.kind)
    }

    fn reindex(&mut self, store: &RecordStore, record: &Record, full: bool) {
        let id = record.identity();
        match record {
            Record::Site(_) => {
                self.upsert(id, NodeKind::Site);
                if full {
                    let mut children = children_in_store(store, RouterRecord::default().into(), id);
                    children.extend(children_in_store(store, ProcessRecord::default().into(), id));
                    for child in children {
                        self.reindex(store, &child.record, false);
                    }
                }
            }
            Record::Router(router) => {
                self.upsert(id, NodeKind::Router);
                let parents: Vec<_> = router
                    .parent
                    .iter()
                    .map(|p| (p.clone(), NodeKind::Site))
                    .collect();
                self.ensure_parents(id, &parents);

                if full {
                    let mut children = children_in_store(store, LinkRecord::default().into(), id);
                    children.extend(children_in_store(store, RouterAccessRecord::default().into(), id));
                    children.extend(children_in_store(store, ListenerRecord::default().into(), id));
                    children.extend(children_in_store(store, ConnectorRecord::default().into(), id));
                    for child in children {
                        self.reindex(store, &child.record, false);
                    }
                }
            }
            Record::Link(link) => {
                self.upsert(id, NodeKind::Link);
                let mut parents = Vec::new();
                if let Some(parent) = &link.parent {
                    parents.push((parent.clone(), NodeKind::Router));
                }
                if let Some(peer) = &link.peer {
                    parents.push((peer.clone(), NodeKind::RouterAccess));
                }
                self.ensure_parents(id, &parents);
            }
            Record::RouterAccess(access) => {
                self.upsert(id, NodeKind::RouterAccess);
                let parents: Vec<_> = access
                    .parent
                    .iter()
                    .map(|p| (p.clone(), NodeKind::Router))
                    .collect();
                self.ensure_parents(id, &parents);
            }
            Record::Listener(listener) => {
                self.upsert(id, NodeKind::Listener);
                let mut parents = Vec::new();
                if let Some(parent) = &listener.parent {
                    parents.push((parent.clone(), NodeKind::Router));
                }
                if let (Some(address), Some(protocol)) = (&listener.address, &listener.protocol) {
                    parents.push((routing_key_id(address, protocol), NodeKind::RoutingKey));
                }
                self.ensure_parents(id, &parents);
            }
            Record::Process(process) => {
                self.upsert(id, NodeKind::Process);
                let parents: Vec<_> = process
                    .parent
                    .iter()
                    .map(|p| (p.clone(), NodeKind::Site))
                    .collect();
                self.ensure_parents(id, &parents);

                if let (Some(site), Some(host)) = (&process.parent, &process.source_host) {
                    let site_host = site_host_id(site, host);
                    self.upsert(&site_host, NodeKind::SiteHost);
                    self.ensure_parents(&site_host, &[(id.to_string(), NodeKind::Process)]);

                    if full {
                        // Connectors at this site may have been waiting on this process
                        let routers = children_in_store(store, RouterRecord::default().into(), site);
                        for router in routers {
                            let connectors = children_in_store(
                                store,
                                ConnectorRecord::default().into(),
                                router.record.identity(),
                            );
                            for connector in connectors {
                                self.reindex(store, &connector.record, false);
                            }
                        }
                    }
                }
            }
            Record::Connector(connector) => {
                self.upsert(id, NodeKind::Connector);
                let mut parents = Vec::new();
                if let Some(parent) = &connector.parent {
                    parents.push((parent.clone(), NodeKind::Router));
                }
                if let (Some(address), Some(protocol)) = (&connector.address, &connector.protocol)
                {
                    parents.push((routing_key_id(address, protocol), NodeKind::RoutingKey));
                }
                if let Some(process_id) = &connector.process_id {
                    parents.push((process_id.clone(), NodeKind::Process));
                }
                if let (Some(host), Some(router)) = (&connector.dest_host, &connector.parent) {
                    if let Some(site) = self.parent_of(router, NodeKind::Site) {
                        parents.push((site_host_id(&site, host), NodeKind::SiteHost));
                    }
                }
                self.ensure_parents(id, &parents);
            }
            Record::Address(address) => {
                self.upsert(id, NodeKind::Address);
                let key = routing_key_id(&address.name, &address.protocol);
                self.upsert(&key, NodeKind::RoutingKey);
                self.ensure_parents(&key, &[(id.to_string(), NodeKind::Address)]);
            }
            _ => {}
        }
    }
}

/// Store entries of the exemplar's type whose parent is `parent`
fn children_in_store(store: &RecordStore, exemplar: Record, parent: &str) -> Vec<Entry> {
    let exemplar = match exemplar {
        Record::Router(r) => Record::Router(RouterRecord {
            parent: Some(parent.to_string()),
            ..r
        }),
        Record::Process(r) => Record::Process(ProcessRecord {
            parent: Some(parent.to_string()),
            ..r
        }),
        Record::Link(r) => Record::Link(LinkRecord {
            parent: Some(parent.to_string()),
            ..r
        }),
        Record::RouterAccess(r) => Record::RouterAccess(RouterAccessRecord {
            parent: Some(parent.to_string()),
            ..r
        }),
        Record::Listener(r) => Record::Listener(ListenerRecord {
            parent: Some(parent.to_string()),
            ..r
        }),
        Record::Connector(r) => Record::Connector(ConnectorRecord {
            parent: Some(parent.to_string()),
            ..r
        }),
        _ => return Vec::new(),
    };
    store.index(TYPE_PARENT_INDEX, &Entry::exemplar(exemplar))
}

/// Rebuild order so referenced vertices precede the records that reference them
fn reset_rank(kind: RecordKind) -> u8 {
    match kind {
        RecordKind::Site => 0,
        RecordKind::Router => 1,
        RecordKind::RouterAccess => 2,
        RecordKind::Link => 3,
        RecordKind::Listener => 4,
        RecordKind::Process => 5,
        RecordKind::Address => 6,
        RecordKind::Connector => 7,
        _ => 8,
    }
}

/// The topology DAG over a record store
pub struct Graph {
    dag: RwLock<Dag>,
    store: Arc<RecordStore>,
}

impl Graph {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            dag: RwLock::new(Dag::default()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Index a newly added record and re-resolve children already in the store
    pub fn index(&self, record: &Record) {
        self.dag.write().reindex(&self.store, record, true);
    }

    /// Recompute the edges of a known record
    pub fn reindex(&self, record: &Record) {
        self.dag.write().reindex(&self.store, record, false);
    }

    /// Remove the vertex for a record along with its edges
    pub fn unindex(&self, record: &Record) {
        self.dag.write().remove(record.identity());
    }

    /// Rebuild the whole graph from the store
    pub fn reset(&self) {
        let mut entries = self.store.list();
        entries.sort_by_key(|entry| reset_rank(entry.record.kind()));

        let mut dag = Dag::default();
        for entry in &entries {
            dag.reindex(&self.store, &entry.record, false);
        }
        *self.dag.write() = dag;
    }

    /// Number of vertices, placeholders included
    pub fn vertex_count(&self) -> usize {
        self.dag.read().graph.node_count()
    }

    pub fn site(&self, id: &str) -> SiteNode<'_> {
        self.node(id)
    }

    pub fn router(&self, id: &str) -> RouterNode<'_> {
        self.node(id)
    }

    pub fn link(&self, id: &str) -> LinkNode<'_> {
        self.node(id)
    }

    pub fn router_access(&self, id: &str) -> RouterAccessNode<'_> {
        self.node(id)
    }

    pub fn listener(&self, id: &str) -> ListenerNode<'_> {
        self.node(id)
    }

    pub fn connector(&self, id: &str) -> ConnectorNode<'_> {
        self.node(id)
    }

    pub fn process(&self, id: &str) -> ProcessNode<'_> {
        self.node(id)
    }

    pub fn address(&self, id: &str) -> AddressNode<'_> {
        self.node(id)
    }

    pub fn routing_key(&self, id: &str) -> RoutingKeyNode<'_> {
        self.node(id)
    }

    pub fn site_host(&self, id: &str) -> SiteHostNode<'_> {
        self.node(id)
    }

    fn node<K: kind::Kind>(&self, id: &str) -> Node<'_, K> {
        let known = self.dag.read().kind_of(id) == Some(K::KIND);
        Node::new(self, known.then(|| id.to_string()))
    }

    fn parent_of(&self, id: &str, kind: NodeKind) -> Option<String> {
        self.dag.read().parent_of(id, kind)
    }

    fn children_of(&self, id: &str, kind: NodeKind) -> Vec<String> {
        self.dag.read().children_of(id, kind)
    }
}
