use std::sync::Arc;
use std::thread;
use vanflow_collector::graph::Graph;
use vanflow_collector::records::{
    ConnectorRecord, ProcessRecord, Record, RouterRecord, SiteRecord,
};
use vanflow_collector::store::{PatchOutcome, RecordStore, SourceRef};
use vanflow_collector::{Collector, Ingest};

fn site(id: &str) -> Record {
    SiteRecord {
        id: id.to_string(),
        name: Some(id.to_string()),
        ..Default::default()
    }
    .into()
}

fn router(id: &str, site: &str) -> Record {
    RouterRecord {
        id: id.to_string(),
        parent: Some(site.to_string()),
        ..Default::default()
    }
    .into()
}

#[test]
fn test_store_round_trip_keeps_source() {
    let store = RecordStore::default();
    let source = SourceRef::new("router-a", "2");
    let record = ProcessRecord {
        id: "p1".to_string(),
        parent: Some("s1".to_string()),
        source_host: Some("10.0.0.5".to_string()),
        ..Default::default()
    };

    assert!(store.add(record.clone().into(), source.clone()));
    let entry = store.get("p1").unwrap();
    assert_eq!(entry.record, Record::Process(record));
    assert_eq!(entry.metadata.source, source);
}

#[test]
fn test_matching_patch_is_silent_end_to_end() {
    let collector = Collector::new(Default::default(), &prometheus::Registry::new()).unwrap();
    let source = SourceRef::new("router-west", "1");
    let connector = ConnectorRecord {
        id: "c1".to_string(),
        address: Some("backend".to_string()),
        protocol: Some("tcp".to_string()),
        dest_host: Some("10.0.0.8".to_string()),
        ..Default::default()
    };

    let outcome = collector
        .ingest(Ingest::Update {
            source: source.clone(),
            record: connector.clone().into(),
        })
        .unwrap();
    assert_eq!(outcome, Some(PatchOutcome::Added));
    assert_eq!(collector.drain_events(), 1);

    // Same attributes again: nothing reaches the work queue
    let outcome = collector
        .ingest(Ingest::Update {
            source: source.clone(),
            record: connector.into(),
        })
        .unwrap();
    assert_eq!(outcome, Some(PatchOutcome::NoChange));
    assert_eq!(collector.drain_events(), 0);

    // A single attribute changes only that attribute
    let outcome = collector
        .ingest(Ingest::Update {
            source,
            record: ConnectorRecord {
                id: "c1".to_string(),
                dest_host: Some("10.0.0.9".to_string()),
                ..Default::default()
            }
            .into(),
        })
        .unwrap();
    assert_eq!(outcome, Some(PatchOutcome::Changed));
    assert_eq!(collector.drain_events(), 1);

    match collector.records().get("c1").unwrap().record {
        Record::Connector(c) => {
            assert_eq!(c.dest_host.as_deref(), Some("10.0.0.9"));
            assert_eq!(c.address.as_deref(), Some("backend"));
            assert_eq!(c.protocol.as_deref(), Some("tcp"));
        }
        other => panic!("unexpected record {:?}", other),
    }
}

#[test]
fn test_concurrent_graph_access() {
    let store = Arc::new(RecordStore::default());
    let graph = Arc::new(Graph::new(store.clone()));
    for i in 0..4 {
        let record = site(&format!("site-{i}"));
        store.add(record.clone(), SourceRef::default());
        graph.index(&record);
    }

    thread::scope(|scope| {
        for writer in 0..4 {
            let store = store.clone();
            let graph = graph.clone();
            scope.spawn(move || {
                for i in 0..200 {
                    let id = format!("router-{writer}-{i}");
                    let record = router(&id, &format!("site-{}", i % 4));
                    store.add(record.clone(), SourceRef::default());
                    graph.index(&record);
                    if i % 3 == 0 {
                        // Move it to another site
                        let moved = router(&id, &format!("site-{}", (i + 1) % 4));
                        store.update(moved.clone());
                        graph.reindex(&moved);
                    }
                }
            });
        }
        for _ in 0..4 {
            let graph = graph.clone();
            scope.spawn(move || {
                for i in 0..500 {
                    let site = graph.site(&format!("site-{}", i % 4));
                    assert!(site.is_known());
                    for router in site.routers() {
                        // A router may move between reads, never to nowhere
                        let parent = router.parent();
                        assert!(parent.id().map_or(true, |id| id.starts_with("site-")));
                    }
                }
            });
        }
    });

    let total: usize = (0..4)
        .map(|i| graph.site(&format!("site-{i}")).routers().len())
        .sum();
    assert_eq!(total, 800);
    for writer in 0..4 {
        let moved = graph.router(&format!("router-{writer}-3"));
        assert_eq!(moved.parent().id(), Some("site-0"));
    }
}
