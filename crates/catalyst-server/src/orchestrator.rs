//! Orchestrator (C8). Dual-mode task driver: the event-driven path just
//! publishes `task.initiated` and returns, letting the worker fabric
//! carry the task phase by phase; the sequential path runs the same six
//! agents in-process, one after another, synchronously. Which path runs
//! is decided once per task from `Capabilities.event_streaming`.

use crate::worker::QueueWorker;
use catalyst_core::bus::Bus;
use catalyst_core::env_probe::Capabilities;
use catalyst_core::error::AgentError;
use catalyst_core::event::{event_types, Envelope};
use catalyst_core::store::Store;
use catalyst_core::stream::TaskStreamManager;
use catalyst_core::types::{Task, TaskPhase, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] catalyst_core::error::StoreError),
    #[error("bus error: {0}")]
    Bus(#[from] catalyst_core::error::BusError),
    #[error("agent phase failed: {0}")]
    Agent(#[from] AgentError),
}

pub struct Orchestrator {
    bus: Arc<dyn Bus>,
    store: Arc<Store>,
    stream: Arc<TaskStreamManager>,
    capabilities: Capabilities,
    agents: HashMap<&'static str, Arc<dyn QueueWorker>>,
    coder_rework_max: u32,
}

impl Orchestrator {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<Store>,
        stream: Arc<TaskStreamManager>,
        capabilities: Capabilities,
        agents: Vec<Arc<dyn QueueWorker>>,
        coder_rework_max: u32,
    ) -> Self {
        let mut map = HashMap::new();
        for a in agents {
            map.insert(a.queue_name(), a);
        }
        Orchestrator { bus, store, stream, capabilities, agents: map, coder_rework_max }
    }

    /// Creates the task row, starts its log stream, and dispatches it on
    /// whichever path the environment probe selected at startup. On the
    /// event-driven path this returns as soon as `task.initiated` is
    /// published; on the sequential path it returns only once the task
    /// has reached a terminal phase.
    pub async fn execute_task(
        &self,
        project_id: String,
        prompt: String,
    ) -> Result<Uuid, OrchestratorError> {
        let task = Task::new(project_id.clone(), prompt.clone());
        let task_id = task.id;
        self.store.create_task(&task).await?;
        self.stream.start(task_id).await;
        self.stream.push_agent_log(task_id, "orchestrator", "info", "task accepted").await;

        let payload = serde_json::json!({"prompt": prompt, "project_id": project_id});

        if self.capabilities.event_streaming {
            info!(%task_id, "orchestrator: dispatching task on the event-driven path");
            let envelope = Envelope::new(Uuid::new_v4(), task_id, "orchestrator", event_types::TASK_INITIATED, payload);
            self.bus.publish(envelope).await?;
            return Ok(task_id);
        }

        info!(%task_id, "orchestrator: running task on the sequential path");
        let task_id_for_spawn = task_id;
        let orchestrator = self.clone_wiring();
        tokio::spawn(async move {
            orchestrator.run_sequential(task_id_for_spawn, payload).await;
        });
        Ok(task_id)
    }

    /// Sequential mode shares no state across tasks, so the wiring is
    /// cheap to clone (every field is already an `Arc`) rather than
    /// requiring `Orchestrator` itself to be wrapped in one.
    fn clone_wiring(&self) -> Arc<Self> {
        Arc::new(Orchestrator {
            bus: Arc::clone(&self.bus),
            store: Arc::clone(&self.store),
            stream: Arc::clone(&self.stream),
            capabilities: self.capabilities,
            agents: self.agents.clone(),
            coder_rework_max: self.coder_rework_max,
        })
    }

    async fn run_sequential(&self, task_id: Uuid, initial_payload: serde_json::Value) {
        if let Err(e) = self.run_sequential_inner(task_id, initial_payload).await {
            warn!(%task_id, error = %e, "orchestrator: sequential run failed");
            self.finalize(task_id, TaskPhase::Failed, TaskStatus::Failed).await;
        }
    }

    async fn run_sequential_inner(
        &self,
        task_id: Uuid,
        initial_payload: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let trace_id = Uuid::new_v4();
        let input = Envelope::new(trace_id, task_id, "orchestrator", event_types::TASK_INITIATED, initial_payload);

        if self.bail_if_cancelled(task_id).await? {
            return Ok(());
        }
        let plan = self.run_phase("planner", &input, TaskPhase::Architecture).await?;

        if self.bail_if_cancelled(task_id).await? {
            return Ok(());
        }
        let architecture = self.run_phase("architect", &plan, TaskPhase::Coding).await?;

        if self.bail_if_cancelled(task_id).await? {
            return Ok(());
        }
        let mut code = self.run_phase("coder", &architecture, TaskPhase::Testing).await?;

        if self.bail_if_cancelled(task_id).await? {
            return Ok(());
        }
        let test_results = loop {
            let results = self.run_phase("tester", &code, TaskPhase::Reviewing).await?;
            let passed = results.payload.get("passed_overall").and_then(|v| v.as_bool()).unwrap_or(false);
            if passed {
                break results;
            }

            let attempts = self.store.bump_rework(task_id).await?;
            if attempts > self.coder_rework_max {
                info!(%task_id, attempts, "orchestrator: rework budget exhausted, failing task");
                self.finalize(task_id, TaskPhase::Failed, TaskStatus::Failed).await;
                return Ok(());
            }
            if self.bail_if_cancelled(task_id).await? {
                return Ok(());
            }
            info!(%task_id, attempts, "orchestrator: rerunning coder after failing test run");
            code = self.run_phase_no_transition("coder", &results).await?;
        };

        if self.bail_if_cancelled(task_id).await? {
            return Ok(());
        }
        let review = self.run_phase("reviewer", &test_results, TaskPhase::Deploying).await?;

        if self.bail_if_cancelled(task_id).await? {
            return Ok(());
        }
        let deployed = self.run_phase_no_transition("deployer", &review).await?;

        let ok = deployed.payload.get("status").and_then(|v| v.as_str()) == Some("ok");
        if ok {
            if let Some(url) = deployed.payload.get("preview_url").and_then(|v| v.as_str()) {
                let _ = self.store.set_summary(task_id, url).await;
            }
            self.finalize(task_id, TaskPhase::Complete, TaskStatus::Succeeded).await;
        } else {
            self.finalize(task_id, TaskPhase::Failed, TaskStatus::Failed).await;
        }
        Ok(())
    }

    /// Runs one agent directly (bypassing the bus), persists both sides
    /// of the exchange, logs to the task stream, and advances the task's
    /// phase on success.
    async fn run_phase(
        &self,
        queue: &'static str,
        input: &Envelope,
        next_phase: TaskPhase,
    ) -> Result<Envelope, OrchestratorError> {
        let out = self.run_phase_no_transition(queue, input).await?;
        self.store.transition(input.task_id, next_phase, TaskStatus::Running).await?;
        Ok(out)
    }

    async fn run_phase_no_transition(
        &self,
        queue: &'static str,
        input: &Envelope,
    ) -> Result<Envelope, OrchestratorError> {
        let task_id = input.task_id;
        self.store.append_event(input).await?;
        let agent = Arc::clone(self.agents.get(queue).expect("agent registered for its own queue name"));
        let out = agent.run_once(input).await?;
        self.stream.push_agent_log(task_id, queue, "info", "phase completed").await;
        self.store.append_event(&out).await?;
        Ok(out)
    }

    /// Checks `cancel_requested` and, if set, finalizes the task as
    /// cancelled and tells the caller to stop advancing phases. Called
    /// between every phase on the sequential path so a cancellation
    /// requested mid-run takes effect at the next phase boundary instead
    /// of being silently overwritten by the next `transition` call.
    async fn bail_if_cancelled(&self, task_id: Uuid) -> Result<bool, OrchestratorError> {
        let task = self.store.get_task(task_id).await?;
        if task.cancel_requested {
            info!(%task_id, "orchestrator: cancellation requested, stopping sequential run");
            self.finalize(task_id, TaskPhase::Failed, TaskStatus::Cancelled).await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn finalize(&self, task_id: Uuid, phase: TaskPhase, status: TaskStatus) {
        if let Err(e) = self.store.transition(task_id, phase, status).await {
            warn!(%task_id, error = %e, "orchestrator: failed to record terminal transition");
        }
        self.stream.end_task(task_id).await;
    }
}
