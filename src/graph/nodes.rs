//! Typed node handles for navigating the topology graph
//!
//! A handle never fails to navigate. Following a relation that does not exist
//! yields an unknown handle whose own relations are unknown as well, so chains
//! like `connector.target().parent()` are always safe to write.

use super::{Graph, NodeKind};
use crate::records::{
    AddressRecord, ConnectorRecord, LinkRecord, ListenerRecord, ProcessRecord, Record,
    RouterAccessRecord, RouterRecord, SiteRecord,
};
use crate::store::Entry;
use std::fmt;
use std::marker::PhantomData;

/// Marker types naming the kind of vertex a [`Node`] refers to
pub mod kind {
    use super::NodeKind;

    pub trait Kind {
        const KIND: NodeKind;
    }

    macro_rules! kinds {
        ($($name:ident),* $(,)?) => {
            $(
                #[derive(Debug, Clone, Copy)]
                pub struct $name;

                impl Kind for $name {
                    const KIND: NodeKind = NodeKind::$name;
                }
            )*
        };
    }

    kinds!(Site, Router, Link, RouterAccess, Listener, Connector, Process, Address, RoutingKey, SiteHost);
}

use kind::Kind;

/// Handle to a vertex of kind `K`
pub struct Node<'g, K> {
    graph: &'g Graph,
    id: Option<String>,
    _kind: PhantomData<K>,
}

pub type SiteNode<'g> = Node<'g, kind::Site>;
pub type RouterNode<'g> = Node<'g, kind::Router>;
pub type LinkNode<'g> = Node<'g, kind::Link>;
pub type RouterAccessNode<'g> = Node<'g, kind::RouterAccess>;
pub type ListenerNode<'g> = Node<'g, kind::Listener>;
pub type ConnectorNode<'g> = Node<'g, kind::Connector>;
pub type ProcessNode<'g> = Node<'g, kind::Process>;
pub type AddressNode<'g> = Node<'g, kind::Address>;
pub type RoutingKeyNode<'g> = Node<'g, kind::RoutingKey>;
pub type SiteHostNode<'g> = Node<'g, kind::SiteHost>;

impl<'g, K> Clone for Node<'g, K> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph,
            id: self.id.clone(),
            _kind: PhantomData,
        }
    }
}

impl<'g, K: Kind> fmt::Debug for Node<'g, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &K::KIND)
            .field("id", &self.id)
            .finish()
    }
}

impl<'g, K: Kind> Node<'g, K> {
    pub(super) fn new(graph: &'g Graph, id: Option<String>) -> Self {
        Self {
            graph,
            id,
            _kind: PhantomData,
        }
    }

    /// Id of the vertex, `None` for an unknown node
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// True when the vertex exists in the graph
    ///
    /// A known node may still lack a backing record, see [`Node::get`].
    pub fn is_known(&self) -> bool {
        self.id.is_some()
    }

    /// Store entry backing this vertex
    pub fn get(&self) -> Option<Entry> {
        self.graph.store.get(self.id.as_deref()?)
    }

    fn parent_of_kind<P: Kind>(&self) -> Node<'g, P> {
        let parent = self
            .id
            .as_deref()
            .and_then(|id| self.graph.parent_of(id, P::KIND));
        Node::new(self.graph, parent)
    }

    fn children_of_kind<C: Kind>(&self) -> Vec<Node<'g, C>> {
        let Some(id) = self.id.as_deref() else {
            return Vec::new();
        };
        self.graph
            .children_of(id, C::KIND)
            .into_iter()
            .map(|child| Node::new(self.graph, Some(child)))
            .collect()
    }

    fn record(&self) -> Option<Record> {
        self.get().map(|entry| entry.record)
    }
}

impl<'g> SiteNode<'g> {
    pub fn site_record(&self) -> Option<SiteRecord> {
        match self.record()? {
            Record::Site(r) => Some(r),
            _ => None,
        }
    }

    pub fn routers(&self) -> Vec<RouterNode<'g>> {
        self.children_of_kind()
    }

    pub fn processes(&self) -> Vec<ProcessNode<'g>> {
        self.children_of_kind()
    }

    pub fn links(&self) -> Vec<LinkNode<'g>> {
        self.routers().iter().flat_map(|r| r.links()).collect()
    }

    pub fn router_accesses(&self) -> Vec<RouterAccessNode<'g>> {
        self.routers().iter().flat_map(|r| r.router_accesses()).collect()
    }
}

impl<'g> RouterNode<'g> {
    pub fn router_record(&self) -> Option<RouterRecord> {
        match self.record()? {
            Record::Router(r) => Some(r),
            _ => None,
        }
    }

    pub fn parent(&self) -> SiteNode<'g> {
        self.parent_of_kind()
    }

    pub fn listeners(&self) -> Vec<ListenerNode<'g>> {
        self.children_of_kind()
    }

    pub fn connectors(&self) -> Vec<ConnectorNode<'g>> {
        self.children_of_kind()
    }

    pub fn links(&self) -> Vec<LinkNode<'g>> {
        self.children_of_kind()
    }

    pub fn router_accesses(&self) -> Vec<RouterAccessNode<'g>> {
        self.children_of_kind()
    }
}

impl<'g> LinkNode<'g> {
    pub fn link_record(&self) -> Option<LinkRecord> {
        match self.record()? {
            Record::Link(r) => Some(r),
            _ => None,
        }
    }

    pub fn parent(&self) -> RouterNode<'g> {
        self.parent_of_kind()
    }

    /// Router access on the remote router this link terminates on
    pub fn peer(&self) -> RouterAccessNode<'g> {
        self.parent_of_kind()
    }
}

impl<'g> RouterAccessNode<'g> {
    pub fn router_access_record(&self) -> Option<RouterAccessRecord> {
        match self.record()? {
            Record::RouterAccess(r) => Some(r),
            _ => None,
        }
    }

    pub fn parent(&self) -> RouterNode<'g> {
        self.parent_of_kind()
    }

    pub fn peers(&self) -> Vec<LinkNode<'g>> {
        self.children_of_kind()
    }
}

impl<'g> ListenerNode<'g> {
    pub fn listener_record(&self) -> Option<ListenerRecord> {
        match self.record()? {
            Record::Listener(r) => Some(r),
            _ => None,
        }
    }

    pub fn parent(&self) -> RouterNode<'g> {
        self.parent_of_kind()
    }

    pub fn routing_key(&self) -> RoutingKeyNode<'g> {
        self.parent_of_kind()
    }

    pub fn address(&self) -> AddressNode<'g> {
        self.routing_key().parent()
    }
}

impl<'g> ConnectorNode<'g> {
    pub fn connector_record(&self) -> Option<ConnectorRecord> {
        match self.record()? {
            Record::Connector(r) => Some(r),
            _ => None,
        }
    }

    pub fn parent(&self) -> RouterNode<'g> {
        self.parent_of_kind()
    }

    pub fn routing_key(&self) -> RoutingKeyNode<'g> {
        self.parent_of_kind()
    }

    pub fn address(&self) -> AddressNode<'g> {
        self.routing_key().parent()
    }

    /// Process the connector forwards to
    ///
    /// An explicit process reference wins over a process found at the
    /// connector's (site, destination host).
    pub fn target(&self) -> ProcessNode<'g> {
        let explicit: ProcessNode<'g> = self.parent_of_kind();
        if explicit.is_known() {
            return explicit;
        }
        let site_host: SiteHostNode<'g> = self.parent_of_kind();
        site_host.process()
    }
}

impl<'g> ProcessNode<'g> {
    pub fn process_record(&self) -> Option<ProcessRecord> {
        match self.record()? {
            Record::Process(r) => Some(r),
            _ => None,
        }
    }

    pub fn parent(&self) -> SiteNode<'g> {
        self.parent_of_kind()
    }

    pub fn site_hosts(&self) -> Vec<SiteHostNode<'g>> {
        self.children_of_kind()
    }

    /// Connectors targeting this process, explicitly or by (site, host)
    pub fn connectors(&self) -> Vec<ConnectorNode<'g>> {
        let mut connectors: Vec<ConnectorNode<'g>> = self.children_of_kind();
        for site_host in self.site_hosts() {
            connectors.extend(site_host.connectors());
        }
        connectors
    }
}

impl<'g> RoutingKeyNode<'g> {
    pub fn parent(&self) -> AddressNode<'g> {
        self.parent_of_kind()
    }

    pub fn listeners(&self) -> Vec<ListenerNode<'g>> {
        self.children_of_kind()
    }

    pub fn connectors(&self) -> Vec<ConnectorNode<'g>> {
        self.children_of_kind()
    }
}

impl<'g> SiteHostNode<'g> {
    pub fn process(&self) -> ProcessNode<'g> {
        self.parent_of_kind()
    }

    pub fn connectors(&self) -> Vec<ConnectorNode<'g>> {
        self.children_of_kind()
    }
}

impl<'g> AddressNode<'g> {
    pub fn address_record(&self) -> Option<AddressRecord> {
        match self.record()? {
            Record::Address(r) => Some(r),
            _ => None,
        }
    }

    pub fn routing_key(&self) -> RoutingKeyNode<'g> {
        let mut keys: Vec<RoutingKeyNode<'g>> = self.children_of_kind();
        if keys.len() == 1 {
            keys.remove(0)
        } else {
            Node::new(self.graph, None)
        }
    }
}
