pub mod agent;
pub mod callbacks;
pub mod config;
pub mod resolver;
pub mod state;
pub mod supervisor;

pub use agent::{AgentLoop, ControlCommand};
pub use callbacks::{AgentCallbacks, NoopCallbacks};
pub use config::{AgentConfig, SensitivePolicy};
pub use resolver::{AppResolver, StaticAppResolver};
pub use state::{AgentSnapshot, AgentState, RunResult};
pub use supervisor::{RunHandle, Supervisor};
