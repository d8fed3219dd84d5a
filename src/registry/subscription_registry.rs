//! The subscription registry: canonical table of live processing units and
//! their subscribers.
//!
//! The registry owns every processing unit. All tables are keyed for
//! constant-time average lookup, and every mutation happens under the
//! manager's monitor, so the registry itself carries no locks. Identity
//! invariants enforced here: one unit per fingerprint, every subscriber in
//! exactly one unit's subscriber set, and unit removal clears every table in
//! one step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::sparql::notifications::{EventSink, Notification};
use crate::sparql::requests::{Fingerprint, SubscribeRequest};
use crate::subscriptions::spu::{Spu, SpuId};

/// Subscriber identifier, unique across the process.
pub type Sid = String;
/// Gateway-scoped connection identifier.
pub type Gid = String;

/// Errors specific to registry operations. Both are recoverable by the
/// caller.
#[derive(Debug)]
pub enum RegistryError {
    SubscriberNotFound(Sid),
    DuplicateFingerprint(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::SubscriberNotFound(sid) => {
                write!(f, "subscriber not found: {}", sid)
            }
            RegistryError::DuplicateFingerprint(msg) => {
                write!(f, "a unit already exists for this predicate: {}", msg)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// One attached subscriber: identity plus the delivery capability.
#[derive(Clone)]
pub struct Subscriber {
    pub sid: Sid,
    pub gid: Gid,
    pub spuid: SpuId,
    pub sink: Arc<dyn EventSink>,
}

/// Registry tables. Owned by the manager and mutated only under its monitor.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_fingerprint: HashMap<Fingerprint, SpuId>,
    by_spuid: HashMap<SpuId, Spu>,
    by_sid: HashMap<Sid, Subscriber>,
    by_gid: HashMap<Gid, HashSet<Sid>>,
    spu_subscribers: HashMap<SpuId, HashSet<Sid>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry::default()
    }

    /// Fingerprint hit test.
    pub fn contains(&self, request: &SubscribeRequest) -> bool {
        self.by_fingerprint.contains_key(&request.fingerprint())
    }

    /// The unit serving this predicate, if any.
    pub fn get_spu(&self, request: &SubscribeRequest) -> Option<&Spu> {
        self.by_fingerprint.get(&request.fingerprint()).and_then(|id| self.by_spuid.get(id))
    }

    pub fn spu(&self, spuid: &str) -> Option<&Spu> {
        self.by_spuid.get(spuid)
    }

    pub fn contains_spu(&self, spuid: &str) -> bool {
        self.by_spuid.contains_key(spuid)
    }

    pub fn spu_ids(&self) -> impl Iterator<Item = &SpuId> {
        self.by_spuid.keys()
    }

    pub fn spus(&self) -> impl Iterator<Item = &Spu> {
        self.by_spuid.values()
    }

    pub fn spu_count(&self) -> usize {
        self.by_spuid.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.by_sid.len()
    }

    /// Inserts a freshly built unit. Fails if a unit already serves the same
    /// fingerprint.
    pub fn register(&mut self, spu: Spu) -> Result<SpuId, RegistryError> {
        let fingerprint = spu.request().fingerprint();
        if self.by_fingerprint.contains_key(&fingerprint) {
            return Err(RegistryError::DuplicateFingerprint(fingerprint.to_string()));
        }
        let spuid = spu.spuid().to_string();
        self.by_fingerprint.insert(fingerprint, spuid.clone());
        self.spu_subscribers.insert(spuid.clone(), HashSet::new());
        self.by_spuid.insert(spuid.clone(), spu);
        Ok(spuid)
    }

    /// Creates a subscriber for `request`, attached to the unit `spuid`.
    pub fn add_subscriber(&mut self, request: &SubscribeRequest, spuid: &str) -> Subscriber {
        let subscriber = Subscriber {
            sid: format!("iris:sub:{}", Uuid::new_v4()),
            gid: request.gid.clone(),
            spuid: spuid.to_string(),
            sink: Arc::clone(&request.sink),
        };

        self.spu_subscribers
            .entry(subscriber.spuid.clone())
            .or_default()
            .insert(subscriber.sid.clone());
        self.by_gid.entry(subscriber.gid.clone()).or_default().insert(subscriber.sid.clone());
        self.by_sid.insert(subscriber.sid.clone(), subscriber.clone());

        debug!(sid = %subscriber.sid, spuid = %subscriber.spuid, "subscriber attached");
        subscriber
    }

    pub fn get_subscriber(&self, sid: &str) -> Result<&Subscriber, RegistryError> {
        self.by_sid.get(sid).ok_or_else(|| RegistryError::SubscriberNotFound(sid.to_string()))
    }

    /// Detaches a subscriber from every table. Returns the removed subscriber
    /// and `true` iff its unit's subscriber set became empty, in which case
    /// the caller must terminate the unit.
    pub fn remove_subscriber(&mut self, sid: &str) -> Result<(Subscriber, bool), RegistryError> {
        let subscriber = self
            .by_sid
            .remove(sid)
            .ok_or_else(|| RegistryError::SubscriberNotFound(sid.to_string()))?;

        if let Some(sids) = self.by_gid.get_mut(&subscriber.gid) {
            sids.remove(sid);
            if sids.is_empty() {
                self.by_gid.remove(&subscriber.gid);
            }
        }

        let empty = match self.spu_subscribers.get_mut(&subscriber.spuid) {
            Some(sids) => {
                sids.remove(sid);
                sids.is_empty()
            }
            None => false,
        };

        debug!(%sid, spuid = %subscriber.spuid, last = empty, "subscriber detached");
        Ok((subscriber, empty))
    }

    /// Removes a unit from every table in one step and hands ownership back
    /// to the caller. Any subscribers still attached are dropped with it.
    pub fn unregister(&mut self, spuid: &str) -> Option<Spu> {
        let spu = self.by_spuid.remove(spuid)?;
        self.by_fingerprint.remove(&spu.request().fingerprint());
        if let Some(sids) = self.spu_subscribers.remove(spuid) {
            for sid in sids {
                if let Some(subscriber) = self.by_sid.remove(&sid) {
                    if let Some(gid_sids) = self.by_gid.get_mut(&subscriber.gid) {
                        gid_sids.remove(&sid);
                        if gid_sids.is_empty() {
                            self.by_gid.remove(&subscriber.gid);
                        }
                    }
                }
            }
        }
        Some(spu)
    }

    pub fn subscribers_of(&self, spuid: &str) -> Vec<&Subscriber> {
        match self.spu_subscribers.get(spuid) {
            Some(sids) => sids.iter().filter_map(|sid| self.by_sid.get(sid)).collect(),
            None => Vec::new(),
        }
    }

    /// All subscribers attached through one gateway connection.
    pub fn sids_of_gid(&self, gid: &str) -> Vec<Sid> {
        match self.by_gid.get(gid) {
            Some(sids) => sids.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Best-effort delivery of `notification` to every subscriber of the
    /// unit. A failed sink never aborts delivery to the others; the dead
    /// connections are returned for the caller to surface.
    pub fn notify_subscribers(
        &self,
        spuid: &str,
        notification: &Notification,
    ) -> Vec<(Gid, Sid)> {
        let mut lost = Vec::new();
        for subscriber in self.subscribers_of(spuid) {
            if subscriber.sink.notify(notification).is_err() {
                warn!(sid = %subscriber.sid, gid = %subscriber.gid, "event sink closed");
                lost.push((subscriber.gid.clone(), subscriber.sid.clone()));
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::endpoint::embedded::EmbeddedEndpoint;
    use crate::sparql::notifications::{SinkClosed, TerminationReason};
    use crate::subscriptions::spu::{NaivePolicy, ProcessingListener};

    struct NullListener;

    impl ProcessingListener for NullListener {
        fn end_of_processing(&self, _spuid: &str) {}
        fn exception_on_processing(&self, _spuid: &str) {}
        fn notify_event(&self, _notification: Notification) {}
    }

    struct CollectingSink(Mutex<Vec<Notification>>);

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(CollectingSink(Mutex::new(Vec::new())))
        }

        fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    impl EventSink for CollectingSink {
        fn notify(&self, notification: &Notification) -> Result<(), SinkClosed> {
            self.0.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct DeadSink;

    impl EventSink for DeadSink {
        fn notify(&self, _notification: &Notification) -> Result<(), SinkClosed> {
            Err(SinkClosed)
        }
    }

    fn request(sparql: &str, gid: &str, sink: Arc<dyn EventSink>) -> SubscribeRequest {
        SubscribeRequest {
            sparql: sparql.to_string(),
            default_graph_uri: Vec::new(),
            named_graph_uri: Vec::new(),
            alias: None,
            gid: gid.to_string(),
            principal: None,
            sink,
        }
    }

    fn build_spu(request: &SubscribeRequest) -> Spu {
        let endpoint = Arc::new(EmbeddedEndpoint::new().unwrap());
        Spu::build(request.clone(), endpoint, Arc::new(NullListener), Arc::new(NaivePolicy))
            .unwrap()
    }

    #[test]
    fn test_register_and_lookup_roundtrip() {
        let mut registry = SubscriptionRegistry::new();
        let req = request("SELECT ?x WHERE { ?x ?p ?o }", "g1", CollectingSink::new());
        let spu = build_spu(&req);
        let spuid = registry.register(spu).unwrap();

        assert!(registry.contains(&req));
        assert_eq!(registry.get_spu(&req).unwrap().spuid(), spuid);
        assert_eq!(registry.spu(&spuid).unwrap().spuid(), spuid);
        assert_eq!(registry.spu_count(), 1);
    }

    #[test]
    fn test_duplicate_fingerprint_rejected() {
        let mut registry = SubscriptionRegistry::new();
        let req = request("SELECT ?x WHERE { ?x ?p ?o }", "g1", CollectingSink::new());
        registry.register(build_spu(&req)).unwrap();
        let err = registry.register(build_spu(&req)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateFingerprint(_)));
    }

    #[test]
    fn test_subscriber_in_exactly_one_set() {
        let mut registry = SubscriptionRegistry::new();
        let req_a = request("SELECT ?x WHERE { ?x <urn:p> ?o }", "g1", CollectingSink::new());
        let req_b = request("SELECT ?x WHERE { ?x <urn:q> ?o }", "g1", CollectingSink::new());
        let spuid_a = registry.register(build_spu(&req_a)).unwrap();
        let spuid_b = registry.register(build_spu(&req_b)).unwrap();

        let sub = registry.add_subscriber(&req_a, &spuid_a);

        assert_eq!(registry.subscribers_of(&spuid_a).len(), 1);
        assert_eq!(registry.subscribers_of(&spuid_b).len(), 0);
        assert_eq!(registry.get_subscriber(&sub.sid).unwrap().spuid, spuid_a);
        assert_eq!(registry.sids_of_gid("g1"), vec![sub.sid.clone()]);
    }

    #[test]
    fn test_remove_last_subscriber_flags_empty() {
        let mut registry = SubscriptionRegistry::new();
        let req = request("SELECT ?x WHERE { ?x ?p ?o }", "g1", CollectingSink::new());
        let spuid = registry.register(build_spu(&req)).unwrap();

        let first = registry.add_subscriber(&req, &spuid);
        let second = registry.add_subscriber(&req, &spuid);

        let (_, empty) = registry.remove_subscriber(&first.sid).unwrap();
        assert!(!empty);
        let (_, empty) = registry.remove_subscriber(&second.sid).unwrap();
        assert!(empty);
    }

    #[test]
    fn test_unregister_clears_every_table() {
        let mut registry = SubscriptionRegistry::new();
        let req = request("SELECT ?x WHERE { ?x ?p ?o }", "g1", CollectingSink::new());
        let spuid = registry.register(build_spu(&req)).unwrap();
        let sub = registry.add_subscriber(&req, &spuid);

        let mut spu = registry.unregister(&spuid).unwrap();
        spu.finish();

        assert!(!registry.contains(&req));
        assert!(!registry.contains_spu(&spuid));
        assert!(registry.get_subscriber(&sub.sid).is_err());
        assert!(registry.sids_of_gid("g1").is_empty());
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_unknown_sid_reports_not_found() {
        let mut registry = SubscriptionRegistry::new();
        let err = registry.remove_subscriber("iris:sub:nope").unwrap_err();
        assert!(matches!(err, RegistryError::SubscriberNotFound(_)));
    }

    #[test]
    fn test_dead_sink_does_not_abort_fanout() {
        let mut registry = SubscriptionRegistry::new();
        let live = CollectingSink::new();
        let req_live = request("SELECT ?x WHERE { ?x ?p ?o }", "g1", live.clone());
        let spuid = registry.register(build_spu(&req_live)).unwrap();
        registry.add_subscriber(&req_live, &spuid);

        let req_dead = request("SELECT ?x WHERE { ?x ?p ?o }", "g2", Arc::new(DeadSink));
        let dead_sub = registry.add_subscriber(&req_dead, &spuid);

        let notification =
            Notification::terminated(&spuid, 1, TerminationReason::Shutdown);
        let lost = registry.notify_subscribers(&spuid, &notification);

        assert_eq!(live.count(), 1);
        assert_eq!(lost, vec![("g2".to_string(), dead_sub.sid)]);
    }
}
