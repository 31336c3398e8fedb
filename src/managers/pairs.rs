//! Site, process group and process pair materialization
//!
//! Every reconciled connection reports its (source process, dest process,
//! protocol) triple. Pairs stay pending until both endpoints resolve far
//! enough to write the derived pair records, then they are left alone.

use crate::graph::Graph;
use crate::identity::IdProvider;
use crate::records::{
    ProcGroupPairRecord, ProcPairRecord, ProcessGroupRecord, Record, SitePairRecord,
};
use crate::store::indexers::TYPE_NAME_INDEX;
use crate::store::{Entry, RecordStore, SourceRef};
use crate::util::ticker;
use ahash::{HashMap, HashMapExt};
use chrono::Utc;
use parking_lot::Mutex;
use prometheus::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Traffic between two processes over one protocol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessPair {
    pub source: String,
    pub dest: String,
    pub protocol: String,
}

pub struct PairManager {
    records: Arc<RecordStore>,
    graph: Arc<Graph>,
    idp: Arc<dyn IdProvider>,
    source: SourceRef,
    /// Known pairs and whether they still need materializing
    pairs: Mutex<HashMap<ProcessPair, bool>>,
}

impl PairManager {
    /// Create a new pair manager writing records as `source`
    pub fn new(
        records: Arc<RecordStore>,
        graph: Arc<Graph>,
        idp: Arc<dyn IdProvider>,
        source: SourceRef,
    ) -> Self {
        Self {
            records,
            graph,
            idp,
            source,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Record that traffic was seen for a pair. Repeats are ignored.
    pub fn observe(&self, pair: ProcessPair) {
        self.pairs.lock().entry(pair).or_insert(true);
    }

    /// Number of pending pairs
    pub fn pending(&self) -> usize {
        self.pairs.lock().values().filter(|dirty| **dirty).count()
    }

    /// Try to materialize every pending pair, returning how many resolved
    pub fn rescan(&self) -> usize {
        let pending: Vec<ProcessPair> = self
            .pairs
            .lock()
            .iter()
            .filter(|(_, dirty)| **dirty)
            .map(|(pair, _)| pair.clone())
            .collect();

        let mut resolved = 0;
        for pair in pending {
            if self.materialize(&pair) {
                if let Some(dirty) = self.pairs.lock().get_mut(&pair) {
                    *dirty = false;
                }
                resolved += 1;
            }
        }
        resolved
    }

    /// Write the pair records that can be derived so far
    ///
    /// Returns true once nothing more can be learned about the pair.
    fn materialize(&self, pair: &ProcessPair) -> bool {
        let source_node = self.graph.process(&pair.source);
        let dest_node = self.graph.process(&pair.dest);
        let (Some(source_proc), Some(dest_proc)) =
            (source_node.process_record(), dest_node.process_record())
        else {
            return false;
        };

        let id = self
            .idp
            .id("processpair", &[&pair.source, &pair.dest, &pair.protocol]);
        self.add_once(
            ProcPairRecord {
                id,
                source: pair.source.clone(),
                dest: pair.dest.clone(),
                protocol: pair.protocol.clone(),
                start: Utc::now(),
            }
            .into(),
        );

        let source_site = source_node.parent();
        let dest_site = dest_node.parent();
        let sites_known = match (source_site.id(), dest_site.id()) {
            (Some(source), Some(dest)) => {
                let id = self.idp.id("sitepair", &[source, dest, &pair.protocol]);
                self.add_once(
                    SitePairRecord {
                        id,
                        source: source.to_string(),
                        dest: dest.to_string(),
                        protocol: pair.protocol.clone(),
                        start: Utc::now(),
                    }
                    .into(),
                );
                true
            }
            _ => false,
        };

        let (source_group, dest_group) = match (&source_proc.group, &dest_proc.group) {
            (Some(source), Some(dest)) => (source, dest),
            // Ungrouped processes never form a group pair
            _ => return sites_known,
        };
        let groups_known = match (self.group_id(source_group), self.group_id(dest_group)) {
            (Some(source), Some(dest)) => {
                let id = self
                    .idp
                    .id("processgrouppair", &[&source, &dest, &pair.protocol]);
                self.add_once(
                    ProcGroupPairRecord {
                        id,
                        source,
                        dest,
                        protocol: pair.protocol.clone(),
                        start: Utc::now(),
                    }
                    .into(),
                );
                true
            }
            _ => false,
        };

        sites_known && groups_known
    }

    fn group_id(&self, name: &str) -> Option<String> {
        let exemplar = Entry::exemplar(
            ProcessGroupRecord {
                name: name.to_string(),
                ..Default::default()
            }
            .into(),
        );
        self.records
            .index(TYPE_NAME_INDEX, &exemplar)
            .into_iter()
            .next()
            .map(|entry| entry.record.identity().to_string())
    }

    fn add_once(&self, record: Record) {
        if self.records.get(record.identity()).is_some() {
            return;
        }
        tracing::info!(
            id = record.identity(),
            kind = record.kind().type_name(),
            "Adding pair record"
        );
        self.records.add(record, self.source.clone());
    }

    /// Periodically rescan pending pairs until cancelled
    pub async fn run(
        self: Arc<Self>,
        period: Duration,
        job_time: Histogram,
        cancel: CancellationToken,
    ) {
        let mut rescan = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = rescan.tick() => {
                    let start = Instant::now();
                    let resolved = self.rescan();
                    job_time.observe(start.elapsed().as_secs_f64());
                    if resolved > 0 {
                        tracing::debug!(count = resolved, "Resolved process pairs");
                    }
                }
            }
        }
        tracing::debug!("Pair manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StableIdentityProvider;
    use crate::records::{ProcessRecord, RecordKind};
    use crate::store::indexers::TYPE_INDEX;

    fn setup() -> (Arc<RecordStore>, Arc<Graph>, PairManager) {
        let records = Arc::new(RecordStore::default());
        let graph = Arc::new(Graph::new(records.clone()));
        let manager = PairManager::new(
            records.clone(),
            graph.clone(),
            Arc::new(StableIdentityProvider::new()),
            SourceRef::new("self", "0.1"),
        );
        (records, graph, manager)
    }

    fn add(records: &RecordStore, graph: &Graph, record: Record) {
        records.add(record.clone(), SourceRef::default());
        graph.index(&record);
    }

    fn process(id: &str, site: &str, group: Option<&str>) -> Record {
        ProcessRecord {
            id: id.to_string(),
            parent: Some(site.to_string()),
            name: Some(id.to_string()),
            group: group.map(str::to_string),
            ..Default::default()
        }
        .into()
    }

    fn count(records: &RecordStore, kind: RecordKind) -> usize {
        let exemplar = match kind {
            RecordKind::SitePair => SitePairRecord::default().into(),
            RecordKind::ProcGroupPair => ProcGroupPairRecord::default().into(),
            _ => ProcPairRecord::default().into(),
        };
        records.index(TYPE_INDEX, &Entry::exemplar(exemplar)).len()
    }

    fn pair() -> ProcessPair {
        ProcessPair {
            source: "p1".to_string(),
            dest: "p2".to_string(),
            protocol: "tcp".to_string(),
        }
    }

    #[test]
    fn test_unresolved_pair_stays_pending() {
        let (records, _graph, manager) = setup();
        manager.observe(pair());
        assert_eq!(manager.rescan(), 0);
        assert_eq!(manager.pending(), 1);
        assert!(records.is_empty());
    }

    #[test]
    fn test_materializes_all_pairs() {
        let (records, graph, manager) = setup();
        add(&records, &graph, process("p1", "site-a", Some("frontend")));
        add(&records, &graph, process("p2", "site-b", Some("backend")));
        for name in ["frontend", "backend"] {
            records.add(
                ProcessGroupRecord {
                    id: format!("pg-{name}"),
                    name: name.to_string(),
                    start: Utc::now(),
                }
                .into(),
                SourceRef::default(),
            );
        }

        manager.observe(pair());
        assert_eq!(manager.rescan(), 1);
        assert_eq!(manager.pending(), 0);
        assert_eq!(count(&records, RecordKind::ProcPair), 1);
        assert_eq!(count(&records, RecordKind::SitePair), 1);
        assert_eq!(count(&records, RecordKind::ProcGroupPair), 1);

        let site_pair = records
            .index(TYPE_INDEX, &Entry::exemplar(SitePairRecord::default().into()))
            .remove(0);
        match site_pair.record {
            Record::SitePair(r) => {
                assert_eq!(r.source, "site-a");
                assert_eq!(r.dest, "site-b");
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_waits_for_groups() {
        let (records, graph, manager) = setup();
        add(&records, &graph, process("p1", "site-a", Some("frontend")));
        add(&records, &graph, process("p2", "site-b", Some("backend")));

        manager.observe(pair());
        assert_eq!(manager.rescan(), 0);
        assert_eq!(count(&records, RecordKind::SitePair), 1);
        assert_eq!(count(&records, RecordKind::ProcGroupPair), 0);
        assert_eq!(manager.pending(), 1);
    }
}
