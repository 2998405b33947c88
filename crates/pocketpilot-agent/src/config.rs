use serde::{Deserialize, Serialize};

/// What to do when the OS refuses screen capture on a protected screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivePolicy {
    /// Fail the run immediately.
    Stop,
    /// Suspend and hand the device to the user.
    Takeover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on loop iterations; the sole step budget.
    pub max_steps: u32,
    pub use_streaming: bool,
    /// Plan before the first step when a planner is configured.
    pub use_planning: bool,
    /// Past exchanges kept in conversation memory.
    pub memory_window: usize,
    /// Run verification every N steps (when a planner is configured).
    pub verify_every: u32,
    /// Consecutive unparseable replies tolerated before failing.
    pub parse_error_budget: u32,
    pub sensitive_policy: SensitivePolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            use_streaming: true,
            use_planning: true,
            memory_window: 4,
            verify_every: 1,
            parse_error_budget: 2,
            sensitive_policy: SensitivePolicy::Stop,
        }
    }
}
