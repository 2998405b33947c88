use crate::stream::{StreamAccumulator, StreamEvent, StreamOutcome, next_sse_data, replay_text};
use crate::types::{ChatRequest, ChatResponse, Message, ModelsResponse, StreamDelta};
use futures::StreamExt;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Model-facing error taxonomy. Only `Transient` is retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmError {
    /// DNS, connect, timeout, or mid-transfer I/O failure.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Semantic rejection: bad auth, unknown model, malformed request.
    #[error("request rejected ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }

    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LlmError::Decode(e.to_string())
        } else {
            LlmError::Transient(e.to_string())
        }
    }

    fn from_status(status: u16, body: String) -> Self {
        if (400..500).contains(&status) {
            LlmError::Permanent {
                status,
                message: body,
            }
        } else {
            LlmError::Transient(format!("server returned {}: {}", status, body))
        }
    }
}

/// Declarative retry policy: linear backoff, transient failures only.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Run `op` under `policy`. The cancellation token is checked before every
/// attempt and during backoff sleeps; an exhausted budget surfaces the last
/// transient error annotated with the attempt count.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.base_delay * attempt;
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Transient model failure, retrying in {:?}",
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(LlmError::Transient(detail)) => {
                return Err(LlmError::Transient(format!(
                    "{} (after {} attempts)",
                    detail, attempt
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Seam for model interaction, allowing mock backends in tests.
///
/// `predict_stream` has a default implementation that replays the full
/// non-streaming reply through the event protocol, so mocks and
/// stream-incapable providers only implement `predict`.
pub trait ModelBackend: Send + Sync {
    fn model_name(&self) -> &str;

    fn predict(
        &self,
        messages: Vec<Message>,
    ) -> impl Future<Output = Result<String, LlmError>> + Send;

    fn predict_stream(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
        events: Sender<StreamEvent>,
    ) -> impl Future<Output = Result<StreamOutcome, LlmError>> + Send {
        async move {
            let started = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                result = self.predict(messages) => {
                    let text = result?;
                    Ok(replay_text(&text, started, &events).await)
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::vlm("http://localhost:1234/v1", None, "local-model")
    }
}

impl LlmConfig {
    /// Vision-model profile: deterministic sampling, room for long replies.
    pub fn vlm(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.0,
            top_p: Some(0.85),
            frequency_penalty: Some(0.2),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(90),
            retry: RetryPolicy::default(),
        }
    }

    /// Text-only planner profile: some sampling freedom, shorter replies,
    /// longer read timeout for big decompositions.
    pub fn planner(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            model: model.into(),
            max_tokens: 2048,
            temperature: 0.3,
            top_p: None,
            frequency_penalty: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "HTTP client builder failed, using defaults");
                reqwest::Client::new()
            });
        Self { config, http }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn build_request(&self, messages: Vec<Message>, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            stream,
        }
    }

    /// Query the provider for available model ids.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let url = self.endpoint("models");
        let mut builder = self.http.get(&url);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(LlmError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), body));
        }

        let body: ModelsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(format!("models response: {}", e)))?;
        Ok(body.data.into_iter().map(|m| m.id).collect())
    }

    async fn predict_once(&self, messages: Vec<Message>) -> Result<String, LlmError> {
        let url = self.endpoint("chat/completions");
        let request = self.build_request(messages, false);

        debug!(
            url = %url,
            message_count = request.messages.len(),
            model = %request.model,
            "Model request"
        );

        let mut builder = self.http.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(LlmError::from_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), body));
        }

        let text = response.text().await.map_err(LlmError::from_transport)?;
        trace!(response_body = %text, "Model response body");

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::Decode(format!("chat response: {}", e)))?;

        Ok(parsed
            .choices
            .first()
            .and_then(|c| c.message.content_text())
            .unwrap_or_default())
    }

    async fn open_stream(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let url = self.endpoint("chat/completions");
        let request = self.build_request(messages, true);

        debug!(
            url = %url,
            message_count = request.messages.len(),
            model = %request.model,
            "Model stream request"
        );

        let mut builder = self.http.post(&url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            sent = builder.send() => sent.map_err(LlmError::from_transport)?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    async fn consume_stream(
        &self,
        response: reqwest::Response,
        started: Instant,
        cancel: &CancellationToken,
        events: &Sender<StreamEvent>,
    ) -> Result<StreamOutcome, LlmError> {
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut acc = StreamAccumulator::new(started);

        'receive: loop {
            let chunk = tokio::select! {
                // Dropping the response body aborts the connection.
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                chunk = byte_stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk.map_err(LlmError::from_transport)?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(data) = next_sse_data(&mut buffer) {
                if data == "[DONE]" {
                    break 'receive;
                }
                let delta: StreamDelta = match serde_json::from_str(&data) {
                    Ok(delta) => delta,
                    Err(e) => {
                        debug!(error = %e, "Skipping unparseable stream delta");
                        continue;
                    }
                };
                if let Some(content) = delta.choices.first().and_then(|c| c.delta.content.as_ref())
                {
                    acc.push(content, events).await;
                }
            }
        }

        Ok(acc.finish(events).await)
    }
}

impl ModelBackend for LlmClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn predict(&self, messages: Vec<Message>) -> Result<String, LlmError> {
        let cancel = CancellationToken::new();
        with_retries(&self.config.retry, &cancel, || {
            self.predict_once(messages.clone())
        })
        .await
    }

    async fn predict_stream(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
        events: Sender<StreamEvent>,
    ) -> Result<StreamOutcome, LlmError> {
        let started = Instant::now();
        // Only connection establishment is retried; once deltas have been
        // emitted a replay would duplicate events.
        let response = with_retries(&self.config.retry, &cancel, || {
            self.open_stream(messages.clone(), &cancel)
        })
        .await?;
        self.consume_stream(response, started, &cancel, &events)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let attempts = AtomicU32::new(0);
        let result = with_retries(&fast_policy(), &CancellationToken::new(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(LlmError::Transient("timeout".to_string()))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_reports_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&fast_policy(), &CancellationToken::new(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(LlmError::Transient("timeout".to_string())) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            LlmError::Transient(detail) => assert!(detail.contains("after 3 attempts")),
            other => panic!("expected transient, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&fast_policy(), &CancellationToken::new(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::Permanent {
                    status: 401,
                    message: "bad key".to_string(),
                })
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(LlmError::Permanent { status: 401, .. })));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&fast_policy(), &cancel, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            LlmError::from_status(404, "no such model".to_string()),
            LlmError::Permanent { status: 404, .. }
        ));
        assert!(LlmError::from_status(503, "overloaded".to_string()).is_retryable());
    }

    #[test]
    fn profile_parameters() {
        let vlm = LlmConfig::vlm("http://host/v1", None, "glm-4v");
        assert_eq!(vlm.max_tokens, 4096);
        assert_eq!(vlm.temperature, 0.0);
        assert_eq!(vlm.top_p, Some(0.85));
        assert_eq!(vlm.frequency_penalty, Some(0.2));
        assert_eq!(vlm.read_timeout, Duration::from_secs(90));

        let planner = LlmConfig::planner("http://host/v1", None, "glm-4");
        assert_eq!(planner.max_tokens, 2048);
        assert_eq!(planner.temperature, 0.3);
        assert_eq!(planner.read_timeout, Duration::from_secs(120));
    }

    /// Mock backend that only implements `predict`, exercising the default
    /// streaming replay.
    struct MockBackend {
        reply: String,
    }

    impl ModelBackend for MockBackend {
        fn model_name(&self) -> &str {
            "mock-model"
        }

        async fn predict(&self, _messages: Vec<Message>) -> Result<String, LlmError> {
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn default_predict_stream_replays_reply() {
        let mock = MockBackend {
            reply: "tapping now. do(action=\"tap\", coordinate=[10,20])".to_string(),
        };
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = mock
            .predict_stream(vec![Message::user("go")], CancellationToken::new(), tx)
            .await
            .unwrap();

        assert_eq!(outcome.thinking, "tapping now. ");
        assert_eq!(outcome.action, "do(action=\"tap\", coordinate=[10,20])");

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(StreamEvent::FirstToken { .. })));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }

    #[tokio::test]
    async fn default_predict_stream_observes_cancellation() {
        struct Hanging;
        impl ModelBackend for Hanging {
            fn model_name(&self) -> &str {
                "hanging"
            }
            async fn predict(&self, _messages: Vec<Message>) -> Result<String, LlmError> {
                std::future::pending().await
            }
        }

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(4);
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { Hanging.predict_stream(vec![], cancel, tx).await }
        });
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }
}
