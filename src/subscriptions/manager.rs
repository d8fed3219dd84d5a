//! The subscription manager: a monitor coordinating every processing unit.
//!
//! The manager is the only admission point for updates, the only mutator of
//! the registry and the coordinator of the barrier protocol. An update runs
//! as: pre-update barrier across the filtered units, endpoint mutation,
//! post-update barrier across the same units. Admission is serialized by an
//! outer lock held for the whole operation; registry and pool state live
//! under an inner lock the barrier condvar pairs with, so workers can
//! acknowledge while a barrier wait is parked.
//!
//! Workers talk back only through the narrow [`ProcessingListener`]
//! capability and never take the admission lock, which keeps the completion
//! path deadlock-free.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::FilterMode;
use crate::endpoint::{EndpointError, SparqlEndpoint};
use crate::error::{BarrierPhase, EngineError, Result};
use crate::registry::subscription_registry::{Sid, SubscriptionRegistry};
use crate::sparql::notifications::{Notification, TerminationReason};
use crate::sparql::requests::{SubscribeRequest, UpdateRequest};
use crate::sparql::responses::{
    EndpointResponse, ErrorResponse, SubscribeResponse, UnsubscribeResponse,
};
use crate::subscriptions::metrics::SpuManagerMetrics;
use crate::subscriptions::spu::{
    NaivePolicy, PreUpdatePolicy, ProcessingListener, Spu, SpuId, SpuTask,
};

/// Collaborator informed of subscription lifecycle events that concern the
/// gateway layer: orderly unsubscribes and dead connections discovered during
/// fan-out.
pub trait DependabilityMonitor: Send + Sync {
    fn on_unsubscribe(&self, _gid: &str, _sid: &str) {}
    fn connection_lost(&self, _gid: &str) {}
}

struct ManagerInner {
    registry: SubscriptionRegistry,
    processing_pool: HashSet<SpuId>,
    active_spus: Vec<SpuId>,
}

/// The monitor. One instance owns the registry and sequences all access to
/// the endpoint's update channel.
pub struct SpuManager {
    /// Serializes update / subscribe / unsubscribe for their whole duration,
    /// barrier waits included. Workers never take this lock.
    admission: Mutex<()>,
    state: Mutex<ManagerInner>,
    barrier: Condvar,
    endpoint: Arc<dyn SparqlEndpoint>,
    metrics: Arc<SpuManagerMetrics>,
    policy: Arc<dyn PreUpdatePolicy>,
    filter_mode: FilterMode,
    dependability: Mutex<Option<Arc<dyn DependabilityMonitor>>>,
}

impl SpuManager {
    pub fn new(endpoint: Arc<dyn SparqlEndpoint>, metrics: Arc<SpuManagerMetrics>) -> Arc<Self> {
        Self::with_options(endpoint, metrics, Arc::new(NaivePolicy), FilterMode::All)
    }

    pub fn with_options(
        endpoint: Arc<dyn SparqlEndpoint>,
        metrics: Arc<SpuManagerMetrics>,
        policy: Arc<dyn PreUpdatePolicy>,
        filter_mode: FilterMode,
    ) -> Arc<Self> {
        Arc::new(SpuManager {
            admission: Mutex::new(()),
            state: Mutex::new(ManagerInner {
                registry: SubscriptionRegistry::new(),
                processing_pool: HashSet::new(),
                active_spus: Vec::new(),
            }),
            barrier: Condvar::new(),
            endpoint,
            metrics,
            policy,
            filter_mode,
            dependability: Mutex::new(None),
        })
    }

    pub fn set_dependability(&self, monitor: Arc<dyn DependabilityMonitor>) {
        *self.dependability.lock().unwrap() = Some(monitor);
    }

    fn dependability(&self) -> Option<Arc<dyn DependabilityMonitor>> {
        self.dependability.lock().unwrap().clone()
    }

    /// Admits one update: pre-barrier, endpoint mutation, post-barrier.
    /// Returns the endpoint's own response, or the broker-level error that
    /// stopped the update.
    pub fn update(&self, request: UpdateRequest) -> std::result::Result<EndpointResponse, ErrorResponse> {
        self.metrics.update_request();
        let _admission = self.admission.lock().unwrap();

        let request = match self.pre_process(request) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "pre-update processing failed");
                return Err(e.to_response());
            }
        };
        let update = Arc::new(request);
        let timeout_ms = self.metrics.spu_processing_timeout_ms();

        let mut state = self.state.lock().unwrap();

        let filter_started = Instant::now();
        let active = self.filter(&state.registry, &update);
        state.active_spus = active;
        self.metrics.record_filtering(filter_started.elapsed());

        // Pre-update barrier: the endpoint is untouched until every unit in
        // the pool has acknowledged. Timeout scales with the pool size.
        let pre_started = Instant::now();
        Self::dispatch_barrier(&mut state, |_| SpuTask::PreUpdate(Arc::clone(&update)));
        debug!(pool = state.processing_pool.len(), "pre-update barrier dispatched");

        if !state.processing_pool.is_empty() {
            let deadline = Duration::from_millis(
                timeout_ms.saturating_mul(state.processing_pool.len() as u64),
            );
            state = self.wait_for_pool(state, deadline);
            if !state.processing_pool.is_empty() {
                for spuid in &state.processing_pool {
                    error!(%spuid, "pre-update barrier: unit still running at deadline");
                }
                self.metrics.record_pre_barrier(pre_started.elapsed());
                let e = EngineError::BarrierTimeout {
                    phase: BarrierPhase::Pre,
                    pending: state.processing_pool.len(),
                };
                return Err(e.to_response());
            }
        }
        self.metrics.record_pre_barrier(pre_started.elapsed());
        drop(state);

        // Mutate the endpoint. The reply is captured whether success or
        // error; the post-update barrier runs either way.
        let outcome = match self.endpoint.update(
            &update.sparql,
            &update.using_graph_uri,
            &update.using_named_graph_uri,
            update.principal.as_deref(),
        ) {
            Ok(response) => response,
            Err(EndpointError::Auth(msg)) => {
                error!("endpoint rejected the principal");
                EndpointResponse::new(401, &msg)
            }
            Err(e) => {
                error!(error = %e, "update failed to reach the endpoint");
                EndpointResponse::new(502, &e.to_string())
            }
        };
        if !outcome.is_success() {
            error!(status = outcome.status, "update processing failed");
        }

        // Post-update barrier: a diff and emit pass, bounded by the scalar
        // timeout.
        let outcome = Arc::new(outcome);
        let post_started = Instant::now();
        let mut state = self.state.lock().unwrap();
        Self::dispatch_barrier(&mut state, |_| SpuTask::PostUpdate(Arc::clone(&outcome)));
        debug!(pool = state.processing_pool.len(), "post-update barrier dispatched");

        if !state.processing_pool.is_empty() {
            state = self.wait_for_pool(state, Duration::from_millis(timeout_ms));
            if !state.processing_pool.is_empty() {
                for spuid in &state.processing_pool {
                    error!(%spuid, "post-update barrier: unit still running at deadline");
                }
                self.metrics.record_post_barrier(post_started.elapsed());
                let e = EngineError::BarrierTimeout {
                    phase: BarrierPhase::Post,
                    pending: state.processing_pool.len(),
                };
                return Err(e.to_response());
            }
        }
        self.metrics.record_post_barrier(post_started.elapsed());
        drop(state);

        if outcome.status == 401 {
            return Err(ErrorResponse::new(401, "auth_error", &outcome.body));
        }
        Ok((*outcome).clone())
    }

    /// Attaches a subscriber: to the existing unit for this predicate, or to
    /// a freshly initialized one. The new subscriber receives the initial
    /// snapshot through its own sink; the response carries the same result
    /// set.
    pub fn subscribe(
        self: &Arc<Self>,
        request: SubscribeRequest,
    ) -> std::result::Result<SubscribeResponse, ErrorResponse> {
        self.metrics.subscribe_request();
        let _admission = self.admission.lock().unwrap();

        let existing = {
            let state = self.state.lock().unwrap();
            state.registry.get_spu(&request).map(|spu| spu.spuid().to_string())
        };

        let spuid = match existing {
            Some(spuid) => {
                debug!(%spuid, "linking subscriber to an existing unit");
                spuid
            }
            None => {
                // Unit initialization queries the endpoint before anything is
                // registered; a failure here leaves no trace.
                let listener: Arc<dyn ProcessingListener> = self.clone();
                let spu = Spu::build(
                    request.clone(),
                    Arc::clone(&self.endpoint),
                    listener,
                    Arc::clone(&self.policy),
                )
                .map_err(|e| {
                    error!(error = %e, "unit initialization failed");
                    e.to_response()
                })?;

                let mut state = self.state.lock().unwrap();
                let spuid =
                    state.registry.register(spu).map_err(|e| EngineError::from(e).to_response())?;
                self.metrics.set_active_spus(state.registry.spu_count() as u64);
                info!(%spuid, "processing unit registered");
                spuid
            }
        };

        let mut state = self.state.lock().unwrap();
        let (first, sequence) = {
            let spu = state.registry.spu(&spuid).ok_or_else(|| {
                ErrorResponse::new(500, "endpoint_error", "unit vanished during subscribe")
            })?;
            (spu.last_bindings(), spu.next_sequence())
        };
        let subscriber = state.registry.add_subscriber(&request, &spuid);
        self.metrics.set_subscribers(state.registry.subscriber_count() as u64);

        let snapshot = Notification::initial_snapshot(&spuid, sequence, first.clone());
        let sink_closed = subscriber.sink.notify(&snapshot).is_err();
        drop(state);

        if sink_closed {
            warn!(sid = %subscriber.sid, "subscriber sink closed before the initial snapshot");
            if let Some(monitor) = self.dependability() {
                monitor.connection_lost(&subscriber.gid);
            }
        }

        Ok(SubscribeResponse {
            sid: subscriber.sid,
            alias: request.alias.clone(),
            first_results: first,
        })
    }

    /// Detaches a subscriber and, when it was the last one, terminates its
    /// unit. The dependability collaborator is informed.
    pub fn unsubscribe(
        &self,
        sid: &str,
        gid: &str,
    ) -> std::result::Result<UnsubscribeResponse, ErrorResponse> {
        self.internal_unsubscribe(sid, gid, true, TerminationReason::Unsubscribed)
    }

    /// Like [`unsubscribe`](Self::unsubscribe) but without the dependability
    /// notification, for connections the gateway already knows are dead.
    pub fn kill_subscription(&self, sid: &str, gid: &str) {
        if let Err(e) =
            self.internal_unsubscribe(sid, gid, false, TerminationReason::ConnectionLost)
        {
            warn!(%sid, error = %e, "kill subscription failed");
        }
    }

    fn internal_unsubscribe(
        &self,
        sid: &str,
        gid: &str,
        dependable: bool,
        reason: TerminationReason,
    ) -> std::result::Result<UnsubscribeResponse, ErrorResponse> {
        self.metrics.unsubscribe_request();
        let _admission = self.admission.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let subscriber = match state.registry.get_subscriber(sid) {
            Ok(subscriber) => subscriber.clone(),
            Err(e) => {
                warn!(%sid, "unsubscribe: {}", e);
                return Err(EngineError::from(e).to_response());
            }
        };
        let spuid = subscriber.spuid.clone();

        // The departing subscriber sees the end of its subscription.
        if let Some(spu) = state.registry.spu(&spuid) {
            let notification = Notification::terminated(&spuid, spu.next_sequence(), reason);
            let _ = subscriber.sink.notify(&notification);
        }

        let (_, last) = state
            .registry
            .remove_subscriber(sid)
            .map_err(|e| EngineError::from(e).to_response())?;

        if last {
            if let Some(mut spu) = state.registry.unregister(&spuid) {
                spu.finish();
            }
            state.active_spus.retain(|id| id != &spuid);
            state.processing_pool.remove(&spuid);
            self.metrics.set_active_spus(state.registry.spu_count() as u64);
            info!(%spuid, active = state.registry.spu_count(), "processing unit terminated");
        }
        self.metrics.set_subscribers(state.registry.subscriber_count() as u64);
        drop(state);

        if dependable {
            if let Some(monitor) = self.dependability() {
                monitor.on_unsubscribe(gid, sid);
            }
        }
        Ok(UnsubscribeResponse { sid: sid.to_string() })
    }

    /// All subscribers attached through one gateway connection, for the
    /// close-time sweep.
    pub fn sids_of_gid(&self, gid: &str) -> Vec<Sid> {
        self.state.lock().unwrap().registry.sids_of_gid(gid)
    }

    /// Orderly engine shutdown: every remaining subscriber receives
    /// `Terminated(Shutdown)`, every worker drains out and the registry
    /// empties. Queued behind any barrier in progress.
    pub fn shutdown(&self) {
        let _admission = self.admission.lock().unwrap();
        let mut state = self.state.lock().unwrap();

        let spuids: Vec<SpuId> = state.registry.spu_ids().cloned().collect();
        for spuid in spuids {
            let notification = state.registry.spu(&spuid).map(|spu| {
                Notification::terminated(&spuid, spu.next_sequence(), TerminationReason::Shutdown)
            });
            if let Some(notification) = notification {
                state.registry.notify_subscribers(&spuid, &notification);
            }
            if let Some(mut spu) = state.registry.unregister(&spuid) {
                spu.finish();
            }
        }
        state.active_spus.clear();
        state.processing_pool.clear();
        self.metrics.set_active_spus(0);
        self.metrics.set_subscribers(0);
        info!("all processing units terminated");
    }

    /// Stateless rewrite of the update before admission.
    fn pre_process(&self, request: UpdateRequest) -> Result<UpdateRequest> {
        if request.sparql.trim().is_empty() {
            return Err(EngineError::PreUpdateProcessing("empty update".to_string()));
        }
        Ok(request)
    }

    /// Selects the units that could possibly be affected by `update`. Must
    /// never omit a unit whose result set would actually change.
    fn filter(&self, registry: &SubscriptionRegistry, update: &UpdateRequest) -> Vec<SpuId> {
        match self.filter_mode {
            FilterMode::All => registry.spu_ids().cloned().collect(),
            FilterMode::Lut => registry
                .spus()
                .filter(|spu| Self::may_affect(spu.request(), update))
                .map(|spu| spu.spuid().to_string())
                .collect(),
        }
    }

    /// Conservative graph intersection. A unit may only be skipped when the
    /// omission is provably safe: both sides declare graph sets, the sets are
    /// disjoint, and the update text contains no form that could write a
    /// graph outside its declared sets. `INSERT { GRAPH <g> { ... } }`,
    /// `WITH <g> ...` and the graph management operations all target graphs
    /// the protocol parameters never mention, so their presence forces
    /// inclusion.
    fn may_affect(predicate: &SubscribeRequest, update: &UpdateRequest) -> bool {
        let subscribed: HashSet<&str> = predicate
            .default_graph_uri
            .iter()
            .chain(predicate.named_graph_uri.iter())
            .map(|g| g.as_str())
            .collect();
        let updated: HashSet<&str> = update
            .using_graph_uri
            .iter()
            .chain(update.using_named_graph_uri.iter())
            .map(|g| g.as_str())
            .collect();
        if subscribed.is_empty() || updated.is_empty() {
            return true;
        }
        if Self::addresses_graphs_directly(&update.sparql) {
            return true;
        }
        !subscribed.is_disjoint(&updated)
    }

    /// Whether the update text names graphs on its own, beyond the
    /// `using-graph-uri` / `using-named-graph-uri` parameters. The keyword
    /// scan over-approximates (a keyword inside a literal also counts),
    /// which only widens the active set, never narrows it.
    fn addresses_graphs_directly(sparql: &str) -> bool {
        const GRAPH_ADDRESSING: &[&str] = &[
            "GRAPH", "WITH", "INTO", "USING", "CLEAR", "DROP", "CREATE", "ADD", "MOVE", "COPY",
            "LOAD", "ALL", "NAMED", "DEFAULT",
        ];
        sparql
            .split(|c: char| c.is_whitespace() || "{}()<>;,".contains(c))
            .any(|token| {
                GRAPH_ADDRESSING.iter().any(|keyword| token.eq_ignore_ascii_case(keyword))
            })
    }

    /// Copies the active set into the processing pool and queues one task per
    /// unit. A unit whose worker is gone counts as already acknowledged.
    fn dispatch_barrier(state: &mut ManagerInner, make_task: impl Fn(&Spu) -> SpuTask) {
        state.processing_pool.clear();
        for spuid in state.active_spus.clone() {
            let dispatched = match state.registry.spu(&spuid) {
                Some(spu) => spu.dispatch(make_task(spu)),
                None => false,
            };
            if dispatched {
                state.processing_pool.insert(spuid);
            } else {
                warn!(%spuid, "unit gone before dispatch");
            }
        }
    }

    /// Parks on the barrier condvar until the pool drains or the deadline
    /// expires. The caller distinguishes the two by pool emptiness.
    fn wait_for_pool<'a>(
        &self,
        state: MutexGuard<'a, ManagerInner>,
        deadline: Duration,
    ) -> MutexGuard<'a, ManagerInner> {
        debug!(pool = state.processing_pool.len(), ?deadline, "waiting for the processing pool");
        let (state, _timeout) = self
            .barrier
            .wait_timeout_while(state, deadline, |s| !s.processing_pool.is_empty())
            .unwrap();
        state
    }
}

impl ProcessingListener for SpuManager {
    fn end_of_processing(&self, spuid: &str) {
        let mut state = self.state.lock().unwrap();
        if state.processing_pool.remove(spuid) {
            debug!(%spuid, "end of processing");
            if state.processing_pool.is_empty() {
                self.barrier.notify_one();
            }
        } else {
            // A straggler from a barrier already abandoned.
            debug!(%spuid, "late acknowledgement ignored");
        }
    }

    fn exception_on_processing(&self, spuid: &str) {
        let mut state = self.state.lock().unwrap();
        error!(%spuid, "exception on processing");
        state.active_spus.retain(|id| id != spuid);
        if state.processing_pool.remove(spuid) && state.processing_pool.is_empty() {
            self.barrier.notify_one();
        }
    }

    fn notify_event(&self, notification: Notification) {
        let lost = {
            let state = self.state.lock().unwrap();
            // Membership check defeats stragglers from terminated units.
            if !state.registry.contains_spu(&notification.spuid) {
                debug!(spuid = %notification.spuid, "notification from a terminated unit dropped");
                return;
            }
            state.registry.notify_subscribers(&notification.spuid, &notification)
        };

        if !lost.is_empty() {
            if let Some(monitor) = self.dependability() {
                for (gid, _sid) in lost {
                    monitor.connection_lost(&gid);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::endpoint::embedded::EmbeddedEndpoint;
    use crate::sparql::notifications::{EventSink, SinkClosed};

    struct NullSink;

    impl EventSink for NullSink {
        fn notify(&self, _notification: &Notification) -> std::result::Result<(), SinkClosed> {
            Ok(())
        }
    }

    fn subscribe_request(
        sparql: &str,
        default_graphs: &[&str],
        named_graphs: &[&str],
    ) -> SubscribeRequest {
        SubscribeRequest {
            sparql: sparql.to_string(),
            default_graph_uri: default_graphs.iter().map(|g| g.to_string()).collect(),
            named_graph_uri: named_graphs.iter().map(|g| g.to_string()).collect(),
            alias: None,
            gid: "gid-test".to_string(),
            principal: None,
            sink: Arc::new(NullSink),
        }
    }

    fn update_request(sparql: &str, using_graphs: &[&str]) -> UpdateRequest {
        UpdateRequest {
            sparql: sparql.to_string(),
            using_graph_uri: using_graphs.iter().map(|g| g.to_string()).collect(),
            using_named_graph_uri: Vec::new(),
            principal: None,
        }
    }

    fn manager() -> Arc<SpuManager> {
        let endpoint = Arc::new(EmbeddedEndpoint::new().unwrap());
        let metrics = Arc::new(SpuManagerMetrics::new(&ProcessingConfig::default()));
        SpuManager::new(endpoint, metrics)
    }

    #[test]
    fn test_graph_filter_is_conservative() {
        let unscoped = subscribe_request("SELECT * WHERE { ?s ?p ?o }", &[], &[]);
        let scoped = subscribe_request("SELECT * WHERE { ?s ?p ?o }", &["urn:g1"], &[]);
        let named = subscribe_request("SELECT * WHERE { ?s ?p ?o }", &[], &["urn:g2"]);

        let unscoped_update = update_request("INSERT DATA { <urn:a> <urn:p> 1 }", &[]);
        let g1_update = update_request("INSERT DATA { <urn:a> <urn:p> 1 }", &["urn:g1"]);
        let g3_update = update_request("INSERT DATA { <urn:a> <urn:p> 1 }", &["urn:g3"]);

        // A side that declares no graphs can always be affected.
        assert!(SpuManager::may_affect(&unscoped, &g1_update));
        assert!(SpuManager::may_affect(&scoped, &unscoped_update));

        assert!(SpuManager::may_affect(&scoped, &g1_update));
        assert!(!SpuManager::may_affect(&scoped, &g3_update));
        assert!(!SpuManager::may_affect(&named, &g1_update));
    }

    #[test]
    fn test_graph_addressing_updates_are_never_skipped() {
        let scoped = subscribe_request("SELECT * WHERE { ?s ?p ?o }", &["urn:g1"], &[]);

        // The protocol parameters say g2, but the body writes g1: the
        // declared sets prove nothing, so the unit must stay in.
        let graph_block = update_request(
            "INSERT { GRAPH <urn:g1> { ?s ?p ?o } } WHERE { ?s ?p ?o }",
            &["urn:g2"],
        );
        assert!(SpuManager::may_affect(&scoped, &graph_block));

        let with_form =
            update_request("WITH <urn:g1> DELETE { ?s ?p ?o } WHERE { ?s ?p ?o }", &["urn:g2"]);
        assert!(SpuManager::may_affect(&scoped, &with_form));

        let management = update_request("DROP GRAPH <urn:g1>", &["urn:g2"]);
        assert!(SpuManager::may_affect(&scoped, &management));

        // A plain data update confined to its declared set is still
        // skippable when the sets are disjoint.
        let confined = update_request("INSERT DATA { <urn:a> <urn:p> 1 }", &["urn:g2"]);
        assert!(!SpuManager::may_affect(&scoped, &confined));
    }

    #[test]
    fn test_empty_update_rejected_before_admission() {
        let manager = manager();
        let err = manager.update(update_request("   ", &[])).unwrap_err();
        assert_eq!(err.code, 500);
        assert_eq!(err.kind, "pre_update_processing_failed");
    }

    #[test]
    fn test_late_acknowledgement_is_ignored() {
        let manager = manager();
        // No barrier in progress: must be a no-op, not a panic or a wake-up.
        manager.end_of_processing("iris:spu:ghost");
        manager.exception_on_processing("iris:spu:ghost");
    }

    #[test]
    fn test_unsubscribe_unknown_sid() {
        let manager = manager();
        let err = manager.unsubscribe("iris:sub:nope", "gid-test").unwrap_err();
        assert_eq!(err.code, 500);
        assert_eq!(err.kind, "sid_not_found");
    }
}
