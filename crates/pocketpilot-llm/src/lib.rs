pub mod client;
pub mod memory;
pub mod planner;
pub mod prompt;
pub mod stream;
pub mod types;

pub use client::{LlmClient, LlmConfig, LlmError, ModelBackend, RetryPolicy, with_retries};
pub use memory::ConversationMemory;
pub use planner::PlannerClient;
pub use stream::{StreamEvent, StreamOutcome};
pub use types::{ChatRequest, ChatResponse, Choice, Content, ContentPart, ImageUrl, Message, Usage};
