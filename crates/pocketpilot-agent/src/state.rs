use pocketpilot_core::record::RecordStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Planning,
    Stepping { step: u32 },
    AwaitingTakeover { message: String },
    Finished { success: bool, message: String },
    Stopped,
    Failed { error: String },
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentState::Finished { .. } | AgentState::Stopped | AgentState::Failed { .. }
        )
    }
}

/// Read-only view of a run, published through a watch channel. The loop is
/// the sole writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub record_id: Uuid,
    pub instruction: String,
    pub state: AgentState,
    pub steps_completed: u32,
}

/// Final outcome delivered to `on_complete` and returned from the run task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RecordStatus,
    pub success: bool,
    pub message: String,
    pub steps: u32,
}
