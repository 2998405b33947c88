//! Host-facing adapter: start runs, stop them, observe their state.
//!
//! Ownership is deliberately one-way: the supervisor hands the loop a
//! cancellation token and a command channel, the loop publishes snapshots
//! through a watch channel and fires callbacks. Neither side owns the
//! other.

use crate::agent::{AgentLoop, ControlCommand};
use crate::callbacks::AgentCallbacks;
use crate::config::AgentConfig;
use crate::resolver::AppResolver;
use crate::state::{AgentSnapshot, RunResult};
use pocketpilot_core::storage::RecordStorage;
use pocketpilot_device::DeviceBackend;
use pocketpilot_llm::client::ModelBackend;
use pocketpilot_llm::planner::PlannerClient;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to one live (or finished) run.
#[derive(Clone)]
pub struct RunHandle {
    cancel: CancellationToken,
    commands: mpsc::Sender<ControlCommand>,
    state: watch::Receiver<AgentSnapshot>,
    task: Arc<Mutex<Option<JoinHandle<RunResult>>>>,
}

impl RunHandle {
    /// Request cancellation. Idempotent: in-flight HTTP is aborted at the
    /// next suspension point and the loop's finalizer still persists a
    /// terminal record and fires `on_complete`.
    pub fn stop(&self) {
        self.cancel.cancel();
        let _ = self.commands.try_send(ControlCommand::Stop);
    }

    /// Resume a run suspended in takeover. Returns false when the run is
    /// no longer listening.
    pub fn continue_after_takeover(&self) -> bool {
        self.commands.try_send(ControlCommand::Continue).is_ok()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.state.borrow().clone()
    }

    /// Await the run's final result. Returns `None` after the first call,
    /// or when the task panicked.
    pub async fn join(&self) -> Option<RunResult> {
        let handle = self.task.lock().await.take()?;
        match handle.await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "Agent task did not complete cleanly");
                None
            }
        }
    }
}

/// Constructs agent loops from shared components and enforces the
/// one-live-run rule.
pub struct Supervisor<M: ModelBackend, B: DeviceBackend, R: AppResolver> {
    config: AgentConfig,
    vlm: Arc<M>,
    planner: Option<Arc<PlannerClient<M>>>,
    device: Arc<B>,
    resolver: Arc<R>,
    storage: Arc<RecordStorage>,
    current: Mutex<Option<RunHandle>>,
}

impl<M, B, R> Supervisor<M, B, R>
where
    M: ModelBackend + 'static,
    B: DeviceBackend + 'static,
    R: AppResolver + 'static,
{
    pub fn new(
        config: AgentConfig,
        vlm: M,
        planner: Option<PlannerClient<M>>,
        device: B,
        resolver: R,
        storage: RecordStorage,
    ) -> Self {
        Self {
            config,
            vlm: Arc::new(vlm),
            planner: planner.map(Arc::new),
            device: Arc::new(device),
            resolver: Arc::new(resolver),
            storage: Arc::new(storage),
            current: Mutex::new(None),
        }
    }

    /// Start a run. Any live run is cancelled and awaited first; at most
    /// one run exists at a time.
    pub async fn run(
        &self,
        instruction: impl Into<String>,
        callbacks: Arc<dyn AgentCallbacks>,
    ) -> RunHandle {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            if !previous.snapshot().state.is_terminal() {
                info!("Cancelling previous run before starting a new one");
            }
            previous.stop();
            previous.join().await;
        }

        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(8);
        let (agent, state_rx) = AgentLoop::new(
            instruction,
            self.config.clone(),
            self.vlm.clone(),
            self.planner.clone(),
            self.device.clone(),
            self.resolver.clone(),
            callbacks,
            self.storage.clone(),
            cancel.clone(),
            command_rx,
        );

        let task = tokio::spawn(agent.run());
        let handle = RunHandle {
            cancel,
            commands: command_tx,
            state: state_rx,
            task: Arc::new(Mutex::new(Some(task))),
        };
        *current = Some(handle.clone());
        handle
    }

    /// Snapshot of the current run, if any.
    pub async fn snapshot(&self) -> Option<AgentSnapshot> {
        self.current.lock().await.as_ref().map(|h| h.snapshot())
    }

    /// Stop the current run, if any. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.current.lock().await.as_ref() {
            handle.stop();
        }
    }
}
