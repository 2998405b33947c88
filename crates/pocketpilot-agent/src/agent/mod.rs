mod dispatch;
mod run_loop;


use crate::callbacks::AgentCallbacks;
use crate::config::AgentConfig;
use crate::resolver::AppResolver;
use crate::state::{AgentSnapshot, AgentState};
use pocketpilot_core::record::{ExecutionRecord, StepRecord, TaskPlan};
use pocketpilot_core::storage::RecordStorage;
use pocketpilot_device::DeviceBackend;
use pocketpilot_llm::client::ModelBackend;
use pocketpilot_llm::memory::ConversationMemory;
use pocketpilot_llm::planner::PlannerClient;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// External control signals delivered through the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Stop,
    /// Resume after a takeover suspension.
    Continue,
}

/// The orchestration state machine for one run. Owns its memory, its
/// execution record, and the published state; everything else is injected.
pub struct AgentLoop<M: ModelBackend, B: DeviceBackend, R: AppResolver> {
    pub(crate) instruction: String,
    pub(crate) config: AgentConfig,
    pub(crate) vlm: Arc<M>,
    pub(crate) planner: Option<Arc<PlannerClient<M>>>,
    pub(crate) device: Arc<B>,
    pub(crate) resolver: Arc<R>,
    pub(crate) callbacks: Arc<dyn AgentCallbacks>,
    pub(crate) storage: Arc<RecordStorage>,
    pub(crate) cancel: CancellationToken,
    pub(crate) commands: Receiver<ControlCommand>,
    pub(crate) state_tx: watch::Sender<AgentSnapshot>,
    pub(crate) memory: ConversationMemory,
    pub(crate) record: ExecutionRecord,
    pub(crate) plan: Option<TaskPlan>,
    pub(crate) parse_errors: u32,
}

impl<M: ModelBackend, B: DeviceBackend, R: AppResolver> AgentLoop<M, B, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instruction: impl Into<String>,
        config: AgentConfig,
        vlm: Arc<M>,
        planner: Option<Arc<PlannerClient<M>>>,
        device: Arc<B>,
        resolver: Arc<R>,
        callbacks: Arc<dyn AgentCallbacks>,
        storage: Arc<RecordStorage>,
        cancel: CancellationToken,
        commands: Receiver<ControlCommand>,
    ) -> (Self, watch::Receiver<AgentSnapshot>) {
        let instruction = instruction.into();
        let record = ExecutionRecord::new(instruction.as_str());
        let snapshot = AgentSnapshot {
            record_id: record.id,
            instruction: instruction.clone(),
            state: AgentState::Idle,
            steps_completed: 0,
        };
        let (state_tx, state_rx) = watch::channel(snapshot);
        let memory = ConversationMemory::new(String::new(), config.memory_window);

        let agent = Self {
            instruction,
            config,
            vlm,
            planner,
            device,
            resolver,
            callbacks,
            storage,
            cancel,
            commands,
            state_tx,
            memory,
            record,
            plan: None,
            parse_errors: 0,
        };
        (agent, state_rx)
    }

    pub fn record_id(&self) -> uuid::Uuid {
        self.record.id
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        self.state_tx.send_replace(AgentSnapshot {
            record_id: self.record.id,
            instruction: self.instruction.clone(),
            state,
            steps_completed: self.record.steps.len() as u32,
        });
    }

    pub(crate) fn stop_requested(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        matches!(self.commands.try_recv(), Ok(ControlCommand::Stop))
    }

    /// Persist the record. Storage failures are logged, never fatal.
    pub(crate) fn save_record(&self) {
        if let Err(e) = self.storage.save(&self.record) {
            warn!(record_id = %self.record.id, error = %e, "Failed to persist execution record");
        }
    }

    /// Append a finished step, persist, and notify.
    pub(crate) fn commit_step(&mut self, step: StepRecord) {
        self.record.push_step(step);
        self.save_record();
        if let Some(step) = self.record.steps.last() {
            self.callbacks.on_step_complete(step);
        }
    }
}
