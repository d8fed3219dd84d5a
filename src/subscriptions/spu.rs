//! Subscription Processing Unit.
//!
//! One unit exists per distinct subscription predicate. The unit owns the
//! last result set observed from the endpoint and a worker thread that, on
//! every update barrier, re-evaluates the predicate, diffs the new result set
//! against the previous one and publishes the added and removed bindings.
//!
//! Workers never touch the manager's monitor directly. They see only the
//! narrow [`ProcessingListener`] capability, and its two acknowledgement
//! calls are the only completion signals the manager consumes.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tracing::{debug, error};
use uuid::Uuid;

use crate::endpoint::SparqlEndpoint;
use crate::error::{EngineError, Result};
use crate::sparql::bindings::Bindings;
use crate::sparql::notifications::Notification;
use crate::sparql::requests::{SubscribeRequest, UpdateRequest};
use crate::sparql::responses::EndpointResponse;

/// Stable opaque identifier of a processing unit.
pub type SpuId = String;

/// Completion and event channel a worker uses to talk back to the manager.
pub trait ProcessingListener: Send + Sync {
    /// Barrier work finished for this unit.
    fn end_of_processing(&self, spuid: &str);
    /// Barrier work failed for this unit; it should not take part in the rest
    /// of the current update.
    fn exception_on_processing(&self, spuid: &str);
    /// A notification to fan out to the unit's subscribers.
    fn notify_event(&self, notification: Notification);
}

/// What a unit does with the yet-to-be-applied update during the pre-update
/// barrier. A policy may inspect the update to short-circuit later work.
pub trait PreUpdatePolicy: Send + Sync {
    fn pre_update(&self, predicate: &SubscribeRequest, update: &UpdateRequest);
}

/// The default policy: acknowledge the barrier without looking at the update.
pub struct NaivePolicy;

impl PreUpdatePolicy for NaivePolicy {
    fn pre_update(&self, _predicate: &SubscribeRequest, _update: &UpdateRequest) {}
}

/// Unit lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpuState {
    Initializing = 0,
    Idle = 1,
    PreProcessing = 2,
    AwaitingEndpoint = 3,
    PostProcessing = 4,
    Terminating = 5,
    Dead = 6,
}

impl From<u8> for SpuState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => SpuState::Initializing,
            1 => SpuState::Idle,
            2 => SpuState::PreProcessing,
            3 => SpuState::AwaitingEndpoint,
            4 => SpuState::PostProcessing,
            5 => SpuState::Terminating,
            _ => SpuState::Dead,
        }
    }
}

/// Barrier work dispatched to a unit's worker.
pub enum SpuTask {
    PreUpdate(Arc<UpdateRequest>),
    PostUpdate(Arc<EndpointResponse>),
    Finish,
}

/// Handle to one processing unit. Owned by the registry; the worker thread
/// holds clones of the shared pieces.
pub struct Spu {
    spuid: SpuId,
    request: SubscribeRequest,
    last_bindings: Arc<Mutex<Bindings>>,
    sequence: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
    tasks: Sender<SpuTask>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Spu {
    /// Creates a unit for `request`: synchronously evaluates the predicate to
    /// seed the result set, then starts the worker thread.
    ///
    /// An endpoint or authorization failure here destroys the unit before it
    /// was ever registered; the error becomes the subscribe response.
    pub fn build(
        request: SubscribeRequest,
        endpoint: Arc<dyn SparqlEndpoint>,
        listener: Arc<dyn ProcessingListener>,
        policy: Arc<dyn PreUpdatePolicy>,
    ) -> Result<Spu> {
        let first = endpoint
            .query(
                &request.sparql,
                &request.default_graph_uri,
                &request.named_graph_uri,
                request.principal.as_deref(),
            )
            .map_err(EngineError::from)?;

        let spuid: SpuId = format!("iris:spu:{}", Uuid::new_v4());
        debug!(%spuid, rows = first.len(), "processing unit initialized");

        let last_bindings = Arc::new(Mutex::new(first));
        let sequence = Arc::new(AtomicU64::new(0));
        let state = Arc::new(AtomicU8::new(SpuState::Initializing as u8));
        let (tasks, task_queue) = mpsc::channel();

        let worker_state = SpuWorker {
            spuid: spuid.clone(),
            request: request.clone(),
            endpoint,
            listener,
            policy,
            last_bindings: Arc::clone(&last_bindings),
            sequence: Arc::clone(&sequence),
            state: Arc::clone(&state),
            tasks: task_queue,
        };

        let worker = thread::Builder::new()
            .name(spuid.clone())
            .spawn(move || worker_state.run())
            .map_err(|e| EngineError::Endpoint(format!("cannot start worker thread: {}", e)))?;

        state.store(SpuState::Idle as u8, Ordering::SeqCst);

        Ok(Spu {
            spuid,
            request,
            last_bindings,
            sequence,
            state,
            tasks,
            worker: Some(worker),
        })
    }

    pub fn spuid(&self) -> &str {
        &self.spuid
    }

    pub fn request(&self) -> &SubscribeRequest {
        &self.request
    }

    /// A copy of the most recent result set.
    pub fn last_bindings(&self) -> Bindings {
        self.last_bindings.lock().unwrap().clone()
    }

    pub fn state(&self) -> SpuState {
        SpuState::from(self.state.load(Ordering::SeqCst))
    }

    /// Reserves the next notification sequence number. Strictly increasing,
    /// no gaps, shared between the worker and the manager.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues barrier work for the worker. Returns `false` when the worker is
    /// gone; the caller then treats the unit as already acknowledged.
    pub fn dispatch(&self, task: SpuTask) -> bool {
        self.tasks.send(task).is_ok()
    }

    /// Terminal: the unit refuses further barrier participation and the
    /// worker drains out. The thread is detached, never joined, so a caller
    /// holding the monitor cannot deadlock against a worker acknowledging.
    pub fn finish(&mut self) {
        self.state.store(SpuState::Terminating as u8, Ordering::SeqCst);
        let _ = self.tasks.send(SpuTask::Finish);
        self.worker.take();
    }
}

struct SpuWorker {
    spuid: SpuId,
    request: SubscribeRequest,
    endpoint: Arc<dyn SparqlEndpoint>,
    listener: Arc<dyn ProcessingListener>,
    policy: Arc<dyn PreUpdatePolicy>,
    last_bindings: Arc<Mutex<Bindings>>,
    sequence: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
    tasks: Receiver<SpuTask>,
}

impl SpuWorker {
    fn run(self) {
        while let Ok(task) = self.tasks.recv() {
            match task {
                SpuTask::PreUpdate(update) => {
                    self.set_state(SpuState::PreProcessing);
                    self.policy.pre_update(&self.request, &update);
                    self.listener.end_of_processing(&self.spuid);
                    self.set_state(SpuState::AwaitingEndpoint);
                }
                SpuTask::PostUpdate(outcome) => {
                    self.set_state(SpuState::PostProcessing);
                    self.post_update(&outcome);
                    self.set_state(SpuState::Idle);
                }
                SpuTask::Finish => {
                    debug!(spuid = %self.spuid, "processing unit finished");
                    break;
                }
            }
        }
        self.set_state(SpuState::Dead);
    }

    fn post_update(&self, outcome: &EndpointResponse) {
        if !outcome.is_success() {
            debug!(
                spuid = %self.spuid,
                status = outcome.status,
                "update failed at the endpoint, skipping recomputation"
            );
            self.listener.end_of_processing(&self.spuid);
            return;
        }

        let new_bindings = match self.endpoint.query(
            &self.request.sparql,
            &self.request.default_graph_uri,
            &self.request.named_graph_uri,
            self.request.principal.as_deref(),
        ) {
            Ok(bindings) => bindings,
            Err(e) => {
                error!(spuid = %self.spuid, error = %e, "predicate re-evaluation failed");
                self.listener.exception_on_processing(&self.spuid);
                return;
            }
        };

        let (added, removed) = {
            let mut last = self.last_bindings.lock().unwrap();
            let added = new_bindings.difference(&last);
            let removed = last.difference(&new_bindings);
            *last = new_bindings;
            (added, removed)
        };

        if !added.is_empty() {
            let seq = self.next_sequence();
            self.listener.notify_event(Notification::added(&self.spuid, seq, added));
        }
        if !removed.is_empty() {
            let seq = self.next_sequence();
            self.listener.notify_event(Notification::removed(&self.spuid, seq, removed));
        }

        self.listener.end_of_processing(&self.spuid);
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_state(&self, state: SpuState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}
