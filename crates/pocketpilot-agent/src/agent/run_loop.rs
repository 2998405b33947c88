use super::{AgentLoop, ControlCommand};
use crate::config::SensitivePolicy;
use crate::resolver::AppResolver;
use crate::state::{AgentState, RunResult};
use pocketpilot_core::AgentError;
use pocketpilot_core::action::{Action, find_marker, parse_reply};
use pocketpilot_core::record::{
    DispatchMethod, DispatchOutcome, RecordStatus, ScreenClass, StepRecord,
};
use pocketpilot_device::{DeviceBackend, capture, encode_jpeg, jpeg_data_url};
use pocketpilot_llm::client::{LlmError, ModelBackend};
use pocketpilot_llm::memory::ConversationMemory;
use pocketpilot_llm::prompt::agent_system_prompt;
use pocketpilot_llm::stream::{StreamEvent, StreamOutcome};
use pocketpilot_llm::types::Message;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Terminal outcome of the drive phase, turned into the final record state
/// and `RunResult` by the non-cancellable finalizer.
#[derive(Debug)]
pub(crate) enum Terminal {
    Finished { message: String },
    Stopped,
    Failed { error: AgentError },
}

/// What one step decided about the rest of the run.
pub(crate) enum StepFlow {
    Continue,
    Takeover { message: String },
    Terminal(Terminal),
}

enum TakeoverOutcome {
    Resumed,
    Stopped,
}

impl<M: ModelBackend, B: DeviceBackend, R: AppResolver> AgentLoop<M, B, R> {
    /// Run to completion. The drive phase observes cancellation at its
    /// suspension points and resolves into a terminal outcome; finalization
    /// then persists the terminal record and fires `on_complete`
    /// unconditionally. Callers await this future instead of aborting it,
    /// which is what makes the cleanup non-cancellable.
    pub async fn run(mut self) -> RunResult {
        info!(
            record_id = %self.record.id,
            instruction = %self.instruction,
            model = %self.vlm.model_name(),
            "Agent run started"
        );
        self.save_record();
        let terminal = self.drive().await;
        self.finalize(terminal)
    }

    async fn drive(&mut self) -> Terminal {
        self.set_state(AgentState::Planning);

        if self.config.use_planning
            && let Some(planner) = self.planner.clone()
        {
            let plan_result = tokio::select! {
                _ = self.cancel.cancelled() => return Terminal::Stopped,
                result = planner.plan(&self.instruction) => result,
            };
            match plan_result {
                Ok(plan) => {
                    self.callbacks.on_plan_ready(&plan.steps);
                    self.record.plan = Some(plan.clone());
                    self.plan = Some(plan);
                    self.save_record();
                }
                // A missing plan degrades the run, it does not end it.
                Err(e) => {
                    warn!(error = %e, "Planning failed, continuing without a plan");
                }
            }
        }

        let (width, height) = self.device.screen_size();
        self.memory =
            ConversationMemory::new(agent_system_prompt(width, height), self.config.memory_window);

        let mut step_no = 0u32;
        loop {
            if self.stop_requested() {
                return Terminal::Stopped;
            }
            step_no += 1;
            if step_no > self.config.max_steps {
                return Terminal::Failed {
                    error: AgentError::MaxStepsExceeded(self.config.max_steps),
                };
            }
            self.set_state(AgentState::Stepping { step: step_no });

            match self.execute_step(step_no).await {
                StepFlow::Continue => {}
                StepFlow::Terminal(terminal) => return terminal,
                StepFlow::Takeover { message } => match self.await_takeover(&message).await {
                    TakeoverOutcome::Resumed => {}
                    TakeoverOutcome::Stopped => return Terminal::Stopped,
                },
            }
        }
    }

    async fn execute_step(&mut self, step_no: u32) -> StepFlow {
        let step_started = Instant::now();
        self.callbacks.on_step_start(step_no);
        info!(step = step_no, "Step started");

        let screen = tokio::select! {
            _ = self.cancel.cancelled() => return StepFlow::Terminal(Terminal::Stopped),
            screen = capture(self.device.as_ref()) => screen,
        };
        let mut step = StepRecord::new(step_no, screen.classification.clone());

        // Safety invariant: a blocked screen is never shown to the model
        // and never acted on.
        if screen.classification == ScreenClass::SensitiveBlocked {
            warn!(step = step_no, policy = ?self.config.sensitive_policy, "Sensitive screen");
            step.duration_ms = step_started.elapsed().as_millis() as u64;
            self.commit_step(step);
            return match self.config.sensitive_policy {
                SensitivePolicy::Stop => StepFlow::Terminal(Terminal::Failed {
                    error: AgentError::SensitiveScreen,
                }),
                SensitivePolicy::Takeover => StepFlow::Takeover {
                    message: "A protected screen needs your attention.".to_string(),
                },
            };
        }

        let jpeg = match encode_jpeg(&screen.image) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "Screenshot encode failed");
                step.warnings.push(format!("screenshot encode failed: {}", e));
                None
            }
        };
        let image_url = jpeg.as_deref().map(jpeg_data_url);
        if let Some(bytes) = &jpeg {
            match self
                .storage
                .save_step_screenshot(self.record.id, step_no, bytes)
            {
                Ok(path) => step.screenshot = Some(path.to_string_lossy().to_string()),
                Err(e) => warn!(error = %e, "Failed to persist step screenshot"),
            }
        }

        let context_text = self.step_context_text(step_no, &screen.classification);
        let messages = self.memory.to_messages(&context_text, image_url.as_deref());

        let (result, partial_thinking) = if self.config.use_streaming {
            self.predict_streaming(messages).await
        } else {
            self.predict_blocking(messages).await
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                // Partial thinking survives into the record even when the
                // stream died mid-reply.
                step.thinking = partial_thinking;
                step.warnings.push(format!("model request failed: {}", e));
                step.duration_ms = step_started.elapsed().as_millis() as u64;
                self.commit_step(step);
                let error = map_llm_error(e);
                return if error == AgentError::Cancelled {
                    StepFlow::Terminal(Terminal::Stopped)
                } else {
                    StepFlow::Terminal(Terminal::Failed { error })
                };
            }
        };

        // Authoritative final parse over the complete reply.
        let parsed = parse_reply(&outcome.text);
        step.thinking = parsed.thinking.clone();
        step.ttft_ms = outcome.ttft_ms;
        step.warnings.extend(parsed.warnings.clone());
        for warning in &parsed.warnings {
            warn!(step = step_no, warning = %warning, "Reply warning");
        }
        self.callbacks.on_action(&parsed.action);
        step.action = Some(parsed.action.clone());

        match parsed.action.clone() {
            Action::Finish { message } => {
                info!(step = step_no, message = %message, "Task finished");
                self.finish_step(step, step_started, true);
                StepFlow::Terminal(Terminal::Finished { message })
            }

            Action::CallUser { message } => {
                self.parse_errors = 0;
                self.memory.push_exchange(
                    context_text,
                    image_url,
                    outcome.text.clone(),
                    parsed.action.summary(),
                );
                self.finish_step(step, step_started, true);
                StepFlow::Takeover { message }
            }

            Action::ParseError { reason } => {
                self.parse_errors += 1;
                warn!(
                    step = step_no,
                    consecutive = self.parse_errors,
                    reason = %reason,
                    "Reply contained no valid action"
                );
                if self.parse_errors >= self.config.parse_error_budget {
                    self.finish_step(step, step_started, true);
                    return StepFlow::Terminal(Terminal::Failed {
                        error: AgentError::ParseBudgetExceeded(self.config.parse_error_budget),
                    });
                }
                // Keep the broken reply in memory; the next turn carries a
                // correction nudge so the model can recover.
                self.memory.push_exchange(
                    context_text,
                    None,
                    outcome.text.clone(),
                    "invalid reply",
                );
                self.finish_step(step, step_started, true);
                StepFlow::Continue
            }

            action => {
                self.parse_errors = 0;

                if let Some(confirm) = parsed.confirm.as_deref()
                    && !self.callbacks.on_sensitive_action(confirm)
                {
                    info!(step = step_no, "Sensitive action declined by user");
                    step.warnings
                        .push("sensitive action declined by user".to_string());
                    step.outcome = Some(DispatchOutcome::failed(
                        DispatchMethod::System,
                        "declined by user",
                    ));
                } else {
                    let (dispatch, clamped) = self
                        .dispatch_action(&action, (screen.width, screen.height))
                        .await;
                    if !dispatch.ok {
                        // Recoverable: recorded, never auto-retried; the next
                        // model turn sees the unchanged screen.
                        warn!(step = step_no, detail = ?dispatch.detail, "Dispatch failed");
                    }
                    step.coord_clamped = clamped;
                    step.outcome = Some(dispatch);
                }

                if let Some(flow) = self.maybe_verify(step_no, &parsed.thinking, &mut step).await {
                    self.finish_step(step, step_started, true);
                    return flow;
                }

                self.memory.push_exchange(
                    context_text,
                    image_url,
                    outcome.text.clone(),
                    action.summary(),
                );
                self.finish_step(step, step_started, true);
                StepFlow::Continue
            }
        }
    }

    /// Run the verifier on its cadence. Returns a terminal flow when it
    /// says do-not-continue, after recording the verdict on the step.
    async fn maybe_verify(
        &mut self,
        step_no: u32,
        thinking: &str,
        step: &mut StepRecord,
    ) -> Option<StepFlow> {
        if !self.config.use_planning || step_no % self.config.verify_every.max(1) != 0 {
            return None;
        }
        let planner = self.planner.clone()?;

        let mut recent: Vec<String> = self
            .record
            .steps
            .iter()
            .filter_map(|s| s.action.as_ref().map(|a| a.summary()))
            .collect();
        if let Some(action) = &step.action {
            recent.push(action.summary());
        }

        let total_steps = self
            .plan
            .as_ref()
            .map(|p| p.estimated_steps)
            .unwrap_or(self.config.max_steps)
            .max(step_no);
        let screen_desc = truncate_chars(thinking, 300);

        let verification = tokio::select! {
            _ = self.cancel.cancelled() => return Some(StepFlow::Terminal(Terminal::Stopped)),
            v = planner.verify(&self.instruction, step_no, total_steps, &recent, &screen_desc) => v,
        };

        self.callbacks.on_verification(&verification);
        step.verification = Some(verification.clone());

        if !verification.should_continue {
            let reason = verification
                .suggestion
                .unwrap_or_else(|| "verifier stopped the run".to_string());
            return Some(StepFlow::Terminal(Terminal::Failed {
                error: AgentError::PlannerAbort(reason),
            }));
        }
        None
    }

    /// Stream a prediction, forwarding thinking/action events to the
    /// callbacks as they arrive. Returns the result plus whatever thinking
    /// was forwarded, so cancellation preserves the partial text.
    async fn predict_streaming(
        &self,
        messages: Vec<Message>,
    ) -> (Result<StreamOutcome, LlmError>, String) {
        let (tx, mut rx) = mpsc::channel(64);
        let vlm = self.vlm.clone();
        let cancel = self.cancel.clone();
        let fut = async move { vlm.predict_stream(messages, cancel, tx).await };
        tokio::pin!(fut);

        let mut thinking_acc = String::new();
        let mut thinking_done = false;
        let mut channel_open = true;

        let result = loop {
            tokio::select! {
                result = &mut fut => break result,
                event = rx.recv(), if channel_open => match event {
                    Some(event) => {
                        self.forward_stream_event(event, &mut thinking_acc, &mut thinking_done);
                    }
                    None => channel_open = false,
                },
            }
        };
        while let Ok(event) = rx.try_recv() {
            self.forward_stream_event(event, &mut thinking_acc, &mut thinking_done);
        }

        (result, thinking_acc)
    }

    fn forward_stream_event(
        &self,
        event: StreamEvent,
        thinking_acc: &mut String,
        thinking_done: &mut bool,
    ) {
        match event {
            StreamEvent::FirstToken { .. } => {}
            StreamEvent::Thinking { chunk } => {
                thinking_acc.push_str(&chunk);
                self.callbacks.on_thinking_chunk(&chunk);
            }
            StreamEvent::ActionStart { .. } => {
                if !*thinking_done {
                    *thinking_done = true;
                    self.callbacks.on_thinking(thinking_acc);
                }
                self.callbacks.on_action_start();
            }
            StreamEvent::Action { .. } => {}
            StreamEvent::Complete => {
                if !*thinking_done {
                    *thinking_done = true;
                    self.callbacks.on_thinking(thinking_acc);
                }
            }
        }
    }

    /// One-shot prediction with the same callback surface as streaming.
    async fn predict_blocking(
        &self,
        messages: Vec<Message>,
    ) -> (Result<StreamOutcome, LlmError>, String) {
        let started = Instant::now();
        let vlm = self.vlm.clone();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(LlmError::Cancelled),
            result = async move { vlm.predict(messages).await } => result,
        };

        match result {
            Ok(text) => {
                let (thinking, action) = match find_marker(&text) {
                    Some((pos, _)) => (text[..pos].to_string(), text[pos..].to_string()),
                    None => (text.clone(), String::new()),
                };
                self.callbacks.on_thinking(&thinking);
                if !action.is_empty() {
                    self.callbacks.on_action_start();
                }
                let outcome = StreamOutcome {
                    text,
                    thinking: thinking.clone(),
                    action,
                    ttft_ms: None,
                    tta_ms: None,
                    total_ms: started.elapsed().as_millis() as u64,
                };
                (Ok(outcome), thinking)
            }
            Err(e) => (Err(e), String::new()),
        }
    }

    fn finish_step(&mut self, mut step: StepRecord, started: Instant, with_metrics: bool) {
        step.duration_ms = started.elapsed().as_millis() as u64;
        if with_metrics {
            self.callbacks
                .on_performance_metrics(step.ttft_ms, step.duration_ms);
        }
        self.commit_step(step);
    }

    async fn await_takeover(&mut self, message: &str) -> TakeoverOutcome {
        info!(message = %message, "Awaiting user takeover");
        self.callbacks.on_take_over(message);
        self.set_state(AgentState::AwaitingTakeover {
            message: message.to_string(),
        });

        tokio::select! {
            _ = self.cancel.cancelled() => TakeoverOutcome::Stopped,
            command = self.commands.recv() => match command {
                Some(ControlCommand::Continue) => {
                    info!("Takeover finished, resuming");
                    TakeoverOutcome::Resumed
                }
                Some(ControlCommand::Stop) | None => TakeoverOutcome::Stopped,
            },
        }
    }

    fn step_context_text(&self, step_no: u32, screen: &ScreenClass) -> String {
        let mut text = if self.memory.is_empty() {
            let mut t = format!("Task: {}", self.instruction);
            if let Some(plan) = &self.plan {
                t.push_str("\n\nPlan:");
                for (i, step) in plan.steps.iter().enumerate() {
                    t.push_str(&format!("\n{}. {}", i + 1, step));
                }
            }
            t
        } else {
            format!("Step {}.", step_no)
        };

        if let ScreenClass::Fallback { reason } = screen {
            text.push_str(&format!(
                "\n(Screenshot unavailable: {}. A black placeholder is shown; rely on prior context or wait.)",
                reason
            ));
        }
        if self.parse_errors > 0 {
            text.push_str(
                "\nYour previous reply contained no valid action. Reply with your reasoning followed by exactly one do(...), finish(...) or call_user(...) action.",
            );
        }
        text.push_str("\nObserve the screenshot and take the next action.");
        text
    }

    fn finalize(&mut self, terminal: Terminal) -> RunResult {
        let (state, status, success, message) = match terminal {
            Terminal::Finished { message } => (
                AgentState::Finished {
                    success: true,
                    message: message.clone(),
                },
                RecordStatus::Completed,
                true,
                message,
            ),
            Terminal::Stopped => (
                AgentState::Stopped,
                RecordStatus::Stopped,
                false,
                "stopped by user".to_string(),
            ),
            Terminal::Failed { error } => (
                AgentState::Failed {
                    error: error.to_string(),
                },
                RecordStatus::Failed,
                false,
                error.to_string(),
            ),
        };

        self.record.finish(status, Some(message.clone()));
        self.save_record();
        self.set_state(state);

        let result = RunResult {
            status,
            success,
            message,
            steps: self.record.steps.len() as u32,
        };
        info!(
            record_id = %self.record.id,
            status = ?result.status,
            steps = result.steps,
            "Agent run finished"
        );
        self.callbacks.on_complete(&result);
        result
    }
}

fn map_llm_error(e: LlmError) -> AgentError {
    match e {
        LlmError::Transient(detail) => AgentError::NetworkTransient(detail),
        LlmError::Permanent { status, message } => {
            AgentError::NetworkPermanent(format!("{}: {}", status, message))
        }
        LlmError::Decode(detail) => {
            AgentError::NetworkPermanent(format!("undecodable response: {}", detail))
        }
        LlmError::Cancelled => AgentError::Cancelled,
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    format!("{}...", text.chars().take(max).collect::<String>())
}
