use crate::action::Action;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a screenshot attempt resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScreenClass {
    /// Bytes arrived and decoded.
    Ok,
    /// The platform refused capture (protected screen). The agent must not
    /// send the placeholder to the model nor dispatch actions for this step.
    SensitiveBlocked,
    /// Capture nominally succeeded but the bytes did not decode; a black
    /// placeholder stands in.
    Fallback { reason: String },
}

/// Which low-level mechanism serviced a dispatched action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchMethod {
    #[serde(rename = "a11y")]
    Accessibility,
    #[serde(rename = "shell")]
    Shell,
    #[serde(rename = "system")]
    System,
}

/// Outcome of a single device dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub ok: bool,
    pub method: DispatchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DispatchOutcome {
    pub fn ok(method: DispatchMethod) -> Self {
        Self {
            ok: true,
            method,
            detail: None,
        }
    }

    pub fn failed(method: DispatchMethod, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            method,
            detail: Some(detail.into()),
        }
    }
}

/// Task decomposition produced by the planner before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub reasoning: String,
    pub steps: Vec<String>,
    pub estimated_steps: u32,
}

/// Progress verdict from the planner's verification pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub on_track: bool,
    /// 0..=100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub should_continue: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// One iteration of the inner loop, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based, strictly monotonic.
    pub step: u32,
    pub timestamp: DateTime<Utc>,
    pub screen: ScreenClass,
    /// Path of the persisted screenshot, when one was saved for this step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    pub thinking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DispatchOutcome>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub coord_clamped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

impl StepRecord {
    pub fn new(step: u32, screen: ScreenClass) -> Self {
        Self {
            step,
            timestamp: Utc::now(),
            screen,
            screenshot: None,
            thinking: String::new(),
            action: None,
            outcome: None,
            coord_clamped: false,
            warnings: Vec::new(),
            ttft_ms: None,
            duration_ms: 0,
            verification: None,
        }
    }
}

/// Append-only structured log of one agent run. Persisted after every
/// mutation so concurrent readers observe a monotone sequence of
/// well-formed snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub title: String,
    pub instruction: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskPlan>,
    pub steps: Vec<StepRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_message: Option<String>,
}

impl ExecutionRecord {
    pub fn new(instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        Self {
            id: Uuid::new_v4(),
            title: truncate_title(&instruction),
            instruction,
            started_at: Utc::now(),
            ended_at: None,
            status: RecordStatus::Running,
            plan: None,
            steps: Vec::new(),
            final_message: None,
        }
    }

    pub fn push_step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    pub fn finish(&mut self, status: RecordStatus, final_message: Option<String>) {
        self.status = status;
        self.final_message = final_message;
        self.ended_at = Some(Utc::now());
    }
}

/// Shorten an instruction into a record title, snapping to a char boundary.
pub fn truncate_title(instruction: &str) -> String {
    if instruction.len() <= 50 {
        return instruction.to_string();
    }
    let mut end = 47;
    while end > 0 && !instruction.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &instruction[..end])
}
