use crate::state::RunResult;
use pocketpilot_core::action::Action;
use pocketpilot_core::record::{StepRecord, Verification};

/// Observer protocol fired by the agent loop. Every method defaults to a
/// no-op; implementations must return quickly — anything that needs a human
/// answers through its own channel and lets the loop suspend via takeover.
///
/// Ordering within a step: `on_step_start`, `on_thinking_chunk`*,
/// `on_thinking`, `on_action_start`?, `on_action`, `on_performance_metrics`,
/// `on_step_complete`. Step n's `on_step_complete` happens-before step
/// n+1's `on_step_start`; `on_complete` fires exactly once, last.
pub trait AgentCallbacks: Send + Sync {
    fn on_step_start(&self, _step: u32) {}

    fn on_thinking_chunk(&self, _chunk: &str) {}

    /// Full thinking text, fired once the thinking phase ends.
    fn on_thinking(&self, _thinking: &str) {}

    /// An action marker was detected in the stream.
    fn on_action_start(&self) {}

    fn on_action(&self, _action: &Action) {}

    fn on_step_complete(&self, _step: &StepRecord) {}

    fn on_plan_ready(&self, _steps: &[String]) {}

    fn on_verification(&self, _verification: &Verification) {}

    /// Synchronous gate before a model-flagged dangerous action (payment
    /// confirmation and the like). Defaults to deny.
    fn on_sensitive_action(&self, _message: &str) -> bool {
        false
    }

    fn on_take_over(&self, _message: &str) {}

    fn on_performance_metrics(&self, _ttft_ms: Option<u64>, _total_ms: u64) {}

    fn on_complete(&self, _result: &RunResult) {}
}

/// Callbacks implementation that ignores everything.
pub struct NoopCallbacks;

impl AgentCallbacks for NoopCallbacks {}
