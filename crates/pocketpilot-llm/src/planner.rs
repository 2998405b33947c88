//! Optional text-only planner/verifier.
//!
//! Three operations, each one templated completion: decompose the task
//! before the first step, verify progress during the run, and pick one of
//! N options. Planning failures are hard errors; verification and decision
//! failures degrade to safe defaults so they never block a run.

use crate::client::{LlmError, ModelBackend};
use crate::types::Message;
use pocketpilot_core::record::{TaskPlan, Verification};
use serde_json::Value;
use tracing::{debug, info, warn};

pub struct PlannerClient<B: ModelBackend> {
    backend: B,
}

impl<B: ModelBackend> PlannerClient<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Decompose `task` into ordered step descriptions. Unparseable output
    /// is a hard error; the caller decides whether to continue planless.
    pub async fn plan(&self, task: &str) -> Result<TaskPlan, LlmError> {
        info!(task = %task, "Planning task");
        let messages = vec![
            Message::system(PLAN_SYSTEM_PROMPT),
            Message::user(format!("Task: {}", task)),
        ];
        let reply = self.backend.predict(messages).await?;
        let plan = parse_plan(&reply).map_err(LlmError::Decode)?;
        info!(
            steps = plan.steps.len(),
            estimated = plan.estimated_steps,
            "Plan ready"
        );
        Ok(plan)
    }

    /// Judge whether the run is on track. Never fails: model errors and
    /// unparseable replies degrade to "continue at proportional progress".
    pub async fn verify(
        &self,
        task: &str,
        current_step: u32,
        total_steps: u32,
        recent_actions: &[String],
        screen_desc: &str,
    ) -> Verification {
        let recent = recent_actions
            .iter()
            .rev()
            .take(5)
            .rev()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n- ");

        let prompt = format!(
            "Task: {}\n\
             Current step: {} of ~{}\n\
             Recent actions:\n- {}\n\
             Current screen: {}\n\
             \n\
             Is the run on track? Return ONLY a JSON object:\n\
             {{\"on_track\": true/false, \"progress\": 0-100, \"suggestion\": \"optional hint\", \"should_continue\": true/false}}",
            task, current_step, total_steps, recent, screen_desc
        );

        let messages = vec![Message::system(VERIFY_SYSTEM_PROMPT), Message::user(prompt)];

        match self.backend.predict(messages).await {
            Ok(reply) => parse_verification(&reply, current_step, total_steps),
            Err(e) => {
                warn!(error = %e, "Verification call failed, assuming on track");
                default_verification(current_step, total_steps)
            }
        }
    }

    /// Pick one of `options` by index. Tolerant of chatty replies: the
    /// first run of digits decides, clamped into range, fallback 0.
    pub async fn decide(
        &self,
        task: &str,
        screen_desc: &str,
        options: &[String],
        ctx: Option<&str>,
    ) -> usize {
        if options.is_empty() {
            return 0;
        }

        let listed = options
            .iter()
            .enumerate()
            .map(|(i, o)| format!("{}. {}", i, o))
            .collect::<Vec<_>>()
            .join("\n");
        let context = ctx.map(|c| format!("\nContext: {}", c)).unwrap_or_default();

        let prompt = format!(
            "Task: {}\n\
             Current screen: {}{}\n\
             \n\
             Options:\n{}\n\
             \n\
             Reply with the number of the best option.",
            task, screen_desc, context, listed
        );

        let messages = vec![Message::system(DECIDE_SYSTEM_PROMPT), Message::user(prompt)];

        match self.backend.predict(messages).await {
            Ok(reply) => {
                let choice = first_digits(&reply)
                    .unwrap_or(0)
                    .min(options.len() - 1);
                debug!(reply = %reply, choice, "Decision parsed");
                choice
            }
            Err(e) => {
                warn!(error = %e, "Decision call failed, picking first option");
                0
            }
        }
    }
}

const PLAN_SYSTEM_PROMPT: &str = r#"You are a task planner for a mobile GUI agent. The agent operates a phone by tapping, swiping, and typing on screenshots it is shown.

Decompose the user's task into short imperative steps an agent can execute one screen at a time.

Return ONLY a JSON object:
{
  "reasoning": "one paragraph explaining the decomposition",
  "steps": ["step 1", "step 2", ...],
  "estimated_steps": <number>
}

Keep steps concrete ("open the search bar", "type the product name"), 3-8 of them for typical tasks. Do not include verification steps; the agent verifies separately."#;

const VERIFY_SYSTEM_PROMPT: &str = r#"You monitor a mobile GUI agent mid-task. Given the task, the recent actions, and a description of the current screen, judge whether the run is still on track. Be lenient: intermediate screens and app switches are normal. Only set should_continue to false when the agent is clearly lost or acting destructively. Return ONLY the requested JSON object."#;

const DECIDE_SYSTEM_PROMPT: &str = r#"You help a mobile GUI agent choose between concrete options (apps to open, buttons to press). Reply with the single number of the best option and nothing else."#;

/// Extract the outermost `{...}` JSON object from a reply that may carry
/// prose or markdown fences around it.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_plan(reply: &str) -> Result<TaskPlan, String> {
    let json_str = extract_json_object(reply)
        .ok_or_else(|| format!("no JSON object in planner reply: {}", reply))?;
    let parsed: Value = serde_json::from_str(json_str)
        .map_err(|e| format!("planner reply is not valid JSON: {}", e))?;

    let steps: Vec<String> = parsed["steps"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    if steps.is_empty() {
        return Err("planner returned no steps".to_string());
    }

    let reasoning = parsed["reasoning"].as_str().unwrap_or("").to_string();
    let estimated_steps = parsed["estimated_steps"]
        .as_u64()
        .map(|n| n as u32)
        .unwrap_or(steps.len() as u32);

    Ok(TaskPlan {
        reasoning,
        steps,
        estimated_steps,
    })
}

fn default_verification(current_step: u32, total_steps: u32) -> Verification {
    let progress = (current_step * 100 / total_steps.max(1)).min(100) as u8;
    Verification {
        on_track: true,
        progress,
        suggestion: None,
        should_continue: true,
    }
}

fn parse_verification(reply: &str, current_step: u32, total_steps: u32) -> Verification {
    let Some(json_str) = extract_json_object(reply) else {
        debug!(reply = %reply, "No JSON in verification reply, assuming on track");
        return default_verification(current_step, total_steps);
    };
    let Ok(parsed) = serde_json::from_str::<Value>(json_str) else {
        debug!(reply = %reply, "Invalid JSON in verification reply, assuming on track");
        return default_verification(current_step, total_steps);
    };

    let progress = parsed["progress"]
        .as_i64()
        .map(|p| p.clamp(0, 100) as u8)
        .unwrap_or_else(|| default_verification(current_step, total_steps).progress);

    Verification {
        on_track: parsed["on_track"].as_bool().unwrap_or(true),
        progress,
        suggestion: parsed["suggestion"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        should_continue: parsed["should_continue"].as_bool().unwrap_or(true),
    }
}

fn first_digits(reply: &str) -> Option<usize> {
    let start = reply.find(|c: char| c.is_ascii_digit())?;
    let digits: String = reply[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
