//! End-to-end scenarios for the subscription core.
//!
//! These tests run the manager against the embedded store with collecting
//! sinks standing in for gateway connections, and verify:
//! - initial snapshot delivery on subscribe
//! - added/removed diffs after updates
//! - predicate de-duplication across subscribers
//! - barrier timeout containment (the endpoint stays untouched)
//! - unit teardown on unsubscribe
//! - the shutdown sweep reaching every subscriber
//! - per-unit sequence monotonicity

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use iris::config::{FilterMode, ProcessingConfig};
use iris::endpoint::embedded::EmbeddedEndpoint;
use iris::endpoint::SparqlEndpoint;
use iris::sparql::bindings::{Binding, RdfTerm};
use iris::sparql::notifications::{
    EventSink, Notification, NotificationPayload, SinkClosed, TerminationReason,
};
use iris::sparql::requests::{SubscribeRequest, UpdateRequest};
use iris::subscriptions::manager::SpuManager;
use iris::subscriptions::metrics::SpuManagerMetrics;
use iris::subscriptions::spu::{NaivePolicy, PreUpdatePolicy};

const PREDICATE: &str = "SELECT ?x WHERE { ?x <urn:p> ?v }";

struct CollectingSink(Mutex<Vec<Notification>>);

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(CollectingSink(Mutex::new(Vec::new())))
    }

    fn events(&self) -> Vec<Notification> {
        self.0.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn notify(&self, notification: &Notification) -> Result<(), SinkClosed> {
        self.0.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// A pre-update policy that stalls once for predicates naming a slow
/// resource.
struct SleepyPolicy {
    delay: Duration,
    armed: AtomicBool,
}

impl SleepyPolicy {
    fn new(delay: Duration) -> Self {
        SleepyPolicy { delay, armed: AtomicBool::new(true) }
    }
}

impl PreUpdatePolicy for SleepyPolicy {
    fn pre_update(&self, predicate: &SubscribeRequest, _update: &UpdateRequest) {
        if predicate.sparql.contains("urn:sluggish") && self.armed.swap(false, Ordering::SeqCst) {
            thread::sleep(self.delay);
        }
    }
}

fn subscribe_request(sparql: &str, gid: &str, sink: Arc<dyn EventSink>) -> SubscribeRequest {
    SubscribeRequest {
        sparql: sparql.to_string(),
        default_graph_uri: Vec::new(),
        named_graph_uri: Vec::new(),
        alias: Some("test".to_string()),
        gid: gid.to_string(),
        principal: None,
        sink,
    }
}

fn engine_with(
    timeout_ms: u64,
    policy: Arc<dyn PreUpdatePolicy>,
) -> (Arc<SpuManager>, Arc<EmbeddedEndpoint>, Arc<SpuManagerMetrics>) {
    let endpoint = Arc::new(EmbeddedEndpoint::new().unwrap());
    // Initial state: { (a, p, 1) }
    endpoint.update("INSERT DATA { <urn:a> <urn:p> 1 }", &[], &[], None).unwrap();

    let config = ProcessingConfig {
        spu_processing_timeout_ms: timeout_ms,
        ..ProcessingConfig::default()
    };
    let metrics = Arc::new(SpuManagerMetrics::new(&config));
    let manager = SpuManager::with_options(
        endpoint.clone() as Arc<dyn SparqlEndpoint>,
        Arc::clone(&metrics),
        policy,
        FilterMode::All,
    );
    (manager, endpoint, metrics)
}

fn engine() -> (Arc<SpuManager>, Arc<EmbeddedEndpoint>, Arc<SpuManagerMetrics>) {
    engine_with(5000, Arc::new(NaivePolicy))
}

fn row(iri: &str) -> Binding {
    Binding::new().bind("x", RdfTerm::iri(iri))
}

fn added_of(notification: &Notification) -> Option<&iris::sparql::bindings::Bindings> {
    match &notification.payload {
        NotificationPayload::Added(b) => Some(b),
        _ => None,
    }
}

fn removed_of(notification: &Notification) -> Option<&iris::sparql::bindings::Bindings> {
    match &notification.payload {
        NotificationPayload::Removed(b) => Some(b),
        _ => None,
    }
}

#[test]
fn test_subscribe_delivers_initial_snapshot() {
    let (manager, _endpoint, _metrics) = engine();
    let sink = CollectingSink::new();

    let response = manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();

    assert_eq!(response.first_results.len(), 1);
    assert!(response.first_results.contains(&row("urn:a")));
    assert_eq!(response.alias.as_deref(), Some("test"));
    assert!(response.sid.starts_with("iris:sub:"));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence, 1);
    match &events[0].payload {
        NotificationPayload::InitialSnapshot(bindings) => {
            assert_eq!(bindings.len(), 1);
            assert!(bindings.contains(&row("urn:a")));
        }
        other => panic!("expected an initial snapshot, got {:?}", other),
    }
}

#[test]
fn test_insert_produces_added_only() {
    let (manager, _endpoint, _metrics) = engine();
    let sink = CollectingSink::new();
    manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();

    let reply = manager.update(UpdateRequest::new("INSERT DATA { <urn:b> <urn:p> 2 }")).unwrap();
    assert!(reply.is_success());

    let events = sink.events();
    assert_eq!(events.len(), 2, "snapshot plus exactly one delta");
    let added = added_of(&events[1]).expect("second event must be an added delta");
    assert_eq!(added.len(), 1);
    assert!(added.contains(&row("urn:b")));
    assert!(events.iter().all(|e| removed_of(e).is_none()));
}

#[test]
fn test_delete_produces_removed_only() {
    let (manager, _endpoint, _metrics) = engine();
    let sink = CollectingSink::new();
    manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();

    let reply = manager.update(UpdateRequest::new("DELETE DATA { <urn:a> <urn:p> 1 }")).unwrap();
    assert!(reply.is_success());

    let events = sink.events();
    assert_eq!(events.len(), 2);
    let removed = removed_of(&events[1]).expect("second event must be a removed delta");
    assert_eq!(removed.len(), 1);
    assert!(removed.contains(&row("urn:a")));
}

#[test]
fn test_mixed_update_emits_added_before_removed() {
    let (manager, _endpoint, _metrics) = engine();
    let sink = CollectingSink::new();
    manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();

    let reply = manager
        .update(UpdateRequest::new(
            "DELETE DATA { <urn:a> <urn:p> 1 } ; INSERT DATA { <urn:c> <urn:p> 3 }",
        ))
        .unwrap();
    assert!(reply.is_success());

    let events = sink.events();
    assert_eq!(events.len(), 3);
    let added = added_of(&events[1]).expect("added must come first");
    assert!(added.contains(&row("urn:c")));
    let removed = removed_of(&events[2]).expect("removed must come second");
    assert!(removed.contains(&row("urn:a")));
    assert_eq!(events[1].sequence + 1, events[2].sequence);
}

#[test]
fn test_same_predicate_shares_one_unit() {
    let (manager, _endpoint, _metrics) = engine();
    let first = CollectingSink::new();
    let second = CollectingSink::new();

    let r1 = manager.subscribe(subscribe_request(PREDICATE, "g1", first.clone())).unwrap();
    let r2 = manager.subscribe(subscribe_request(PREDICATE, "g2", second.clone())).unwrap();
    assert_ne!(r1.sid, r2.sid);

    // Both snapshots name the same unit.
    let spuid_one = first.events()[0].spuid.clone();
    let spuid_two = second.events()[0].spuid.clone();
    assert_eq!(spuid_one, spuid_two);

    manager.update(UpdateRequest::new("INSERT DATA { <urn:b> <urn:p> 2 }")).unwrap();

    // One barrier, identical deltas to both subscribers.
    let delta_one = first.events().into_iter().nth(1).expect("first subscriber delta");
    let delta_two = second.events().into_iter().nth(1).expect("second subscriber delta");
    assert_eq!(delta_one, delta_two);
}

#[test]
fn test_pre_barrier_timeout_leaves_endpoint_untouched() {
    let (manager, endpoint, _metrics) =
        engine_with(10, Arc::new(SleepyPolicy::new(Duration::from_secs(1))));

    for i in 0..9 {
        let sink = CollectingSink::new();
        let sparql = format!("SELECT ?x WHERE {{ ?x <urn:p{}> ?v }}", i);
        manager.subscribe(subscribe_request(&sparql, "g1", sink)).unwrap();
    }
    let slow_sink = CollectingSink::new();
    manager
        .subscribe(subscribe_request(
            "SELECT ?x WHERE { ?x <urn:sluggish> ?v }",
            "g1",
            slow_sink,
        ))
        .unwrap();

    let started = Instant::now();
    let err = manager.update(UpdateRequest::new("INSERT DATA { <urn:z> <urn:p> 9 }")).unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code, 500);
    assert_eq!(err.kind, "timeout");
    assert!(err.body.contains("pre_update_processing"));
    // 10 units at 10 ms each: the deadline is 100 ms, far below the stall.
    assert!(elapsed < Duration::from_millis(900), "barrier must abandon the wait, took {:?}", elapsed);

    // The endpoint was never mutated.
    let check = endpoint
        .query("SELECT ?x WHERE { ?x <urn:p> 9 }", &[], &[], None)
        .unwrap();
    assert!(check.is_empty());

    // The straggler acknowledges late; the manager must shrug it off and
    // serve the next update normally.
    thread::sleep(Duration::from_millis(1100));
    let reply = manager.update(UpdateRequest::new("INSERT DATA { <urn:z> <urn:p> 9 }")).unwrap();
    assert!(reply.is_success());
}

#[test]
fn test_unsubscribe_tears_down_the_unit() {
    let (manager, _endpoint, metrics) = engine();
    let sink = CollectingSink::new();

    let response = manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();
    assert_eq!(metrics.active_spus(), 1);

    let unsubscribed = manager.unsubscribe(&response.sid, "g1").unwrap();
    assert_eq!(unsubscribed.sid, response.sid);
    assert_eq!(metrics.active_spus(), 0);

    let events = sink.events();
    let last = events.last().expect("a terminated event");
    assert_eq!(
        last.payload,
        NotificationPayload::Terminated(TerminationReason::Unsubscribed)
    );

    // An update over an empty active set still returns the endpoint reply,
    // and nobody hears about it.
    let before = sink.events().len();
    let reply = manager.update(UpdateRequest::new("INSERT DATA { <urn:b> <urn:p> 2 }")).unwrap();
    assert!(reply.is_success());
    assert_eq!(sink.events().len(), before);
}

#[test]
fn test_shutdown_notifies_every_subscriber() {
    let (manager, _endpoint, metrics) = engine();
    let first = CollectingSink::new();
    let second = CollectingSink::new();

    manager.subscribe(subscribe_request(PREDICATE, "g1", first.clone())).unwrap();
    manager
        .subscribe(subscribe_request("SELECT ?x WHERE { ?x <urn:q> ?v }", "g2", second.clone()))
        .unwrap();

    manager.shutdown();

    for sink in [&first, &second] {
        let events = sink.events();
        let last = events.last().expect("a terminated event");
        assert_eq!(
            last.payload,
            NotificationPayload::Terminated(TerminationReason::Shutdown)
        );
    }
    assert_eq!(metrics.active_spus(), 0);

    // The broker outlives its population: an update over the empty active
    // set still relays the endpoint reply.
    let reply = manager.update(UpdateRequest::new("INSERT DATA { <urn:b> <urn:p> 2 }")).unwrap();
    assert!(reply.is_success());
}

#[test]
fn test_sequences_are_strictly_increasing_without_gaps() {
    let (manager, _endpoint, _metrics) = engine();
    let sink = CollectingSink::new();
    manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();

    manager.update(UpdateRequest::new("INSERT DATA { <urn:b> <urn:p> 2 }")).unwrap();
    manager.update(UpdateRequest::new("INSERT DATA { <urn:c> <urn:p> 3 }")).unwrap();
    manager.update(UpdateRequest::new("DELETE DATA { <urn:a> <urn:p> 1 }")).unwrap();

    let events = sink.events();
    assert!(events.len() >= 4);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64 + 1, "sequence gap at position {}", i);
    }
}

#[test]
fn test_failed_update_emits_nothing() {
    let (manager, _endpoint, _metrics) = engine();
    let sink = CollectingSink::new();
    manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();

    // The embedded store answers a parse failure with a 400 reply; the
    // manager relays it and the units skip recomputation.
    let reply = manager.update(UpdateRequest::new("INSERT NONSENSE")).unwrap();
    assert_eq!(reply.status, 400);

    let events = sink.events();
    assert_eq!(events.len(), 1, "only the initial snapshot");
}

#[test]
fn test_updates_keep_result_set_consistent_with_endpoint() {
    let (manager, endpoint, _metrics) = engine();
    let sink = CollectingSink::new();
    manager.subscribe(subscribe_request(PREDICATE, "g1", sink.clone())).unwrap();

    manager.update(UpdateRequest::new("INSERT DATA { <urn:b> <urn:p> 2 }")).unwrap();
    manager.update(UpdateRequest::new("DELETE DATA { <urn:b> <urn:p> 2 }")).unwrap();
    manager.update(UpdateRequest::new("INSERT DATA { <urn:d> <urn:p> 4 }")).unwrap();

    // Replay the deltas over the snapshot; the outcome must equal a direct
    // evaluation of the predicate against the endpoint.
    let mut replayed = iris::sparql::bindings::Bindings::empty();
    for event in sink.events() {
        match event.payload {
            NotificationPayload::InitialSnapshot(b) => replayed = b,
            NotificationPayload::Added(b) => {
                for binding in b.iter() {
                    replayed.insert(binding.clone());
                }
            }
            NotificationPayload::Removed(b) => {
                replayed = replayed.difference(&b);
            }
            NotificationPayload::Terminated(_) => {}
        }
    }

    let direct = endpoint.query(PREDICATE, &[], &[], None).unwrap();
    assert_eq!(replayed.len(), direct.len());
    for binding in direct.iter() {
        assert!(replayed.contains(binding), "missing {:?}", binding);
    }
}
