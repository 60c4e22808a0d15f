//! Worker fabric (C7). One long-lived consumer per agent queue, each
//! running in its own `tokio::spawn`'d task. Every handler invocation
//! also runs on its own spawned task, with the `JoinHandle` awaited and
//! matched so a panic surfaces as `JoinError::is_panic()` rather than
//! unwinding into the consumer loop.

use catalyst_core::agent::{Agent, Runtime};
use catalyst_core::bus::{Bus, QueuedEnvelope};
use catalyst_core::error::AgentError;
use catalyst_core::event::{event_types, Envelope};
use catalyst_core::store::Store;
use catalyst_core::stream::TaskStreamManager;
use catalyst_core::types::{TaskPhase, TaskStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Type-erased handle to one `Runtime<A>`, so `WorkerManager` can hold a
/// heterogeneous set of agent runtimes behind a single map.
#[async_trait::async_trait]
pub trait QueueWorker: Send + Sync {
    fn queue_name(&self) -> &'static str;
    async fn run_once(&self, envelope: &Envelope) -> Result<Envelope, AgentError>;
}

#[async_trait::async_trait]
impl<A: Agent> QueueWorker for Runtime<A> {
    fn queue_name(&self) -> &'static str {
        self.agent.name()
    }

    async fn run_once(&self, envelope: &Envelope) -> Result<Envelope, AgentError> {
        self.run_event(envelope).await
    }
}

const MAX_CONSECUTIVE_CRASHES: u32 = 5;

pub struct WorkerManager {
    bus: Arc<dyn Bus>,
    store: Arc<Store>,
    stream: Arc<TaskStreamManager>,
    workers: HashMap<&'static str, Arc<dyn QueueWorker>>,
    coder_rework_max: u32,
    /// Per-queue consecutive-crash counters; a queue that trips
    /// `MAX_CONSECUTIVE_CRASHES` is logged unhealthy (the health
    /// aggregator currently probes the container host and store rather
    /// than per-queue counters, so this is the audit trail until it
    /// grows a consumer).
    crash_counts: HashMap<&'static str, Arc<AtomicU32>>,
}

impl WorkerManager {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<Store>,
        stream: Arc<TaskStreamManager>,
        workers: Vec<Arc<dyn QueueWorker>>,
        coder_rework_max: u32,
    ) -> Self {
        let mut map = HashMap::new();
        let mut crash_counts = HashMap::new();
        for w in workers {
            let name = w.queue_name();
            crash_counts.insert(name, Arc::new(AtomicU32::new(0)));
            map.insert(name, w);
        }
        WorkerManager { bus, store, stream, workers: map, coder_rework_max, crash_counts }
    }

    /// Marks a task terminal (complete or failed), closes its log stream,
    /// and publishes a `<event>.complete` marker for the orchestrator
    /// queue's wildcard binding to observe.
    async fn finalize_task(&self, task_id: Uuid, phase: TaskPhase, status: TaskStatus, marker_event: &str) {
        if let Err(e) = self.store.transition(task_id, phase, status).await {
            warn!(%task_id, error = %e, "worker manager: failed to record terminal transition");
        }
        self.stream.end_task(task_id).await;
        let marker = Envelope::new(
            Uuid::new_v4(),
            task_id,
            "worker-manager",
            format!("{marker_event}.complete"),
            serde_json::json!({}),
        );
        let _ = self.bus.publish(marker).await;
    }

    async fn is_cancelled(&self, task_id: Uuid) -> bool {
        matches!(self.store.get_task(task_id).await, Ok(task) if task.cancel_requested)
    }

    async fn finalize_cancelled(&self, task_id: Uuid) {
        self.finalize_task(task_id, TaskPhase::Failed, TaskStatus::Cancelled, event_types::TASK_CANCELLED).await;
    }

    fn handle_crash(&self, queue: &'static str) {
        if let Some(counter) = self.crash_counts.get(queue) {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= MAX_CONSECUTIVE_CRASHES {
                error!(queue, crashes = n, "worker manager: queue marked unhealthy after repeated crashes");
            }
        }
    }

    fn reset_crash(&self, queue: &'static str) {
        if let Some(counter) = self.crash_counts.get(queue) {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Runs one handler call on its own spawned task, translating a panic
    /// into an `AgentError::Tool` so the surrounding consumer loop's
    /// ordinary failure handling (nack, rework, finalize) applies
    /// uniformly whether the handler returned an error or panicked.
    async fn run_caught(worker: Arc<dyn QueueWorker>, envelope: Envelope) -> Result<Envelope, AgentError> {
        let handle = tokio::spawn(async move { worker.run_once(&envelope).await });
        match handle.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(AgentError::Tool("agent handler panicked".into())),
            Err(join_err) => Err(AgentError::Tool(format!("agent task cancelled: {join_err}"))),
        }
    }

    pub fn spawn_all(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for queue in self.workers.keys().copied().collect::<Vec<_>>() {
            let manager = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                manager.consume_queue(queue).await;
            }));
        }
        handles.push({
            let manager = Arc::clone(&self);
            tokio::spawn(async move { manager.consume_explorer().await })
        });
        handles.push({
            let manager = Arc::clone(&self);
            tokio::spawn(async move { manager.consume_orchestrator().await })
        });
        handles.push({
            let manager = Arc::clone(&self);
            tokio::spawn(async move { manager.consume_dlq().await })
        });
        handles
    }

    /// Drains the exchange's dead-letter queue. An envelope only lands
    /// here once both `Runtime::run_event`'s retries and `Bus::nack`'s
    /// redelivery limit are exhausted, so the owning task can never make
    /// further progress and is finalized failed rather than left stuck
    /// in `Running` forever.
    async fn consume_dlq(&self) {
        let Some(mut rx) = self.bus.dlq_receiver() else {
            warn!("worker manager: no dlq receiver available (already taken?)");
            return;
        };
        while let Some(dead) = rx.recv().await {
            let task_id = dead.envelope.task_id;
            error!(
                %task_id,
                event = %dead.envelope.event_type.0,
                reason = %dead.reason,
                "worker manager: event dead-lettered, failing task"
            );
            self.finalize_task(task_id, TaskPhase::Failed, TaskStatus::Failed, event_types::TASK_FAILED).await;
        }
    }

    async fn consume_queue(&self, queue: &'static str) {
        let Some(mut rx) = self.bus.take_receiver(queue) else {
            warn!(queue, "worker manager: no receiver available for queue (already taken?)");
            return;
        };
        let worker = Arc::clone(self.workers.get(queue).expect("worker present for its own queue name"));

        loop {
            let Some(queued) = rx.recv().await else {
                info!(queue, "worker manager: queue closed, consumer exiting");
                return;
            };
            self.handle_one(queue, Arc::clone(&worker), queued).await;
        }
    }

    async fn handle_one(&self, queue: &'static str, worker: Arc<dyn QueueWorker>, queued: QueuedEnvelope) {
        let envelope = queued.envelope.clone();
        let task_id = envelope.task_id;

        if self.is_cancelled(task_id).await {
            info!(%task_id, queue, "worker manager: task cancelled, skipping dispatch");
            self.finalize_cancelled(task_id).await;
            return;
        }

        if let Err(e) = self.store.append_event(&envelope).await {
            warn!(%task_id, error = %e, "worker manager: failed to persist inbound event");
        }

        let result = Self::run_caught(Arc::clone(&worker), envelope.clone()).await;

        match result {
            Ok(out) => {
                self.reset_crash(queue);
                self.stream.push_agent_log(task_id, worker.queue_name(), "info", "phase completed").await;
                self.on_success(queue, out).await;
            }
            Err(e) => {
                self.handle_crash(queue);
                self.stream.push_agent_log(task_id, worker.queue_name(), "err", &e.to_string()).await;
                if e.retryable() {
                    self.bus.nack(queue, queued, e.to_string()).await;
                } else {
                    warn!(%task_id, queue, error = %e, "worker manager: non-retryable failure, terminating task");
                    self.finalize_task(task_id, TaskPhase::Failed, TaskStatus::Failed, event_types::TASK_FAILED).await;
                }
            }
        }
    }

    /// `tester` is the one queue whose successor depends on payload
    /// content rather than a fixed binding: a passing run routes forward
    /// to the reviewer exactly like any other phase, but a failing run
    /// loops back to the coder directly (bypassing the bus) for up to
    /// `coder_rework_max` attempts before the task is terminated.
    async fn on_success(&self, queue: &'static str, out: Envelope) {
        let task_id = out.task_id;
        if let Err(e) = self.store.append_event(&out).await {
            warn!(%task_id, error = %e, "worker manager: failed to persist outbound event");
        }

        if self.is_cancelled(task_id).await {
            info!(%task_id, queue, "worker manager: task cancelled after phase completed, not forwarding");
            self.finalize_cancelled(task_id).await;
            return;
        }

        if queue == "tester" {
            let passed = out.payload.get("passed_overall").and_then(|v| v.as_bool()).unwrap_or(false);
            if passed {
                self.route_forward(out).await;
                return;
            }
            self.rework_or_fail(task_id, out).await;
            return;
        }

        if out.event_type.0 == event_types::DEPLOY_STATUS {
            let ok = out.payload.get("status").and_then(|v| v.as_str()) == Some("ok");
            if ok {
                if let Some(summary) = out.payload.get("preview_url").and_then(|v| v.as_str()) {
                    let _ = self.store.set_summary(task_id, summary).await;
                }
                self.finalize_task(task_id, TaskPhase::Complete, TaskStatus::Succeeded, event_types::DEPLOY_STATUS).await;
            } else {
                self.finalize_task(task_id, TaskPhase::Failed, TaskStatus::Failed, event_types::DEPLOY_STATUS).await;
            }
            return;
        }

        self.route_forward(out).await;
    }

    async fn rework_or_fail(&self, task_id: Uuid, test_results: Envelope) {
        let attempts = match self.store.bump_rework(task_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%task_id, error = %e, "worker manager: failed to bump rework counter");
                self.finalize_task(task_id, TaskPhase::Failed, TaskStatus::Failed, event_types::TASK_FAILED).await;
                return;
            }
        };
        if attempts > self.coder_rework_max {
            info!(%task_id, attempts, "worker manager: rework budget exhausted, failing task");
            self.finalize_task(task_id, TaskPhase::Failed, TaskStatus::Failed, event_types::TASK_FAILED).await;
            return;
        }

        info!(%task_id, attempts, "worker manager: routing failing test run back to coder for rework");
        let coder = Arc::clone(self.workers.get("coder").expect("coder worker registered"));
        match Self::run_caught(coder, test_results).await {
            Ok(reworked) => {
                self.stream.push_agent_log(task_id, "coder", "info", "rework commit produced").await;
                if let Err(e) = self.store.append_event(&reworked).await {
                    warn!(%task_id, error = %e, "worker manager: failed to persist rework event");
                }
                self.route_forward(reworked).await;
            }
            Err(e) => {
                warn!(%task_id, error = %e, "worker manager: coder rework failed");
                self.finalize_task(task_id, TaskPhase::Failed, TaskStatus::Failed, event_types::TASK_FAILED).await;
            }
        }
    }

    async fn route_forward(&self, out: Envelope) {
        let task_id = out.task_id;
        if let Some(next_phase) = phase_for_event(&out.event_type.0) {
            if let Err(e) = self.store.transition(task_id, next_phase, TaskStatus::Running).await {
                warn!(%task_id, error = %e, "worker manager: failed to advance task phase");
            }
        }
        if let Err(e) = self.bus.publish(out).await {
            warn!(%task_id, error = %e, "worker manager: failed to route successor event");
        }
    }

    async fn consume_explorer(&self) {
        let Some(mut rx) = self.bus.take_receiver("explorer") else { return };
        while let Some(queued) = rx.recv().await {
            let envelope = queued.envelope;
            let system_name = envelope.payload.get("system_name").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
            let brief = envelope.payload.get("brief").and_then(|v| v.as_str()).unwrap_or("").to_string();
            let risks = envelope.payload.get("risks").cloned().unwrap_or_default();
            let proposals = envelope.payload.get("proposals").cloned().unwrap_or_default();
            if let Err(e) = self.store.ingest_explorer_scan(&system_name, &brief, risks, proposals).await {
                warn!(error = %e, "worker manager: failed to ingest explorer scan");
            }
        }
    }

    /// Consumes the `*.complete` terminal markers published by
    /// `finalize_task`; purely observational bookkeeping (structured
    /// logging), since the store/stream state is already final by the
    /// time a marker lands here.
    async fn consume_orchestrator(&self) {
        let Some(mut rx) = self.bus.take_receiver("orchestrator") else { return };
        while let Some(queued) = rx.recv().await {
            info!(task_id = %queued.envelope.task_id, event = %queued.envelope.event_type.0, "task reached terminal state");
        }
    }
}

fn phase_for_event(event_type: &str) -> Option<TaskPhase> {
    use event_types::*;
    match event_type {
        PLAN_CREATED => Some(TaskPhase::Architecture),
        ARCHITECTURE_PROPOSED => Some(TaskPhase::Coding),
        CODE_PR_OPENED => Some(TaskPhase::Testing),
        TEST_RESULTS => Some(TaskPhase::Reviewing),
        REVIEW_DECISION => Some(TaskPhase::Deploying),
        _ => None,
    }
}
