//! Streaming event protocol and SSE framing.
//!
//! Events arrive on a channel in a fixed order per response:
//! `FirstToken` once, `Thinking` chunks, then `ActionStart` + `Action`
//! chunks if an action marker appears, then `Complete`. Failures surface
//! as the error of the `predict_stream` call itself.

use pocketpilot_core::stream::{StreamParser, StreamToken};
use std::time::Instant;
use tokio::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// First content delta observed, `t_ms` since request start.
    FirstToken { t_ms: u64 },
    Thinking { chunk: String },
    /// First action marker observed, `t_ms` since request start.
    ActionStart { t_ms: u64 },
    Action { chunk: String },
    Complete,
}

/// Final accounting of one streamed prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// The full reply, byte-exact concatenation of all deltas.
    pub text: String,
    pub thinking: String,
    pub action: String,
    pub ttft_ms: Option<u64>,
    pub tta_ms: Option<u64>,
    pub total_ms: u64,
}

/// Accumulates deltas, splits them into thinking/action, and emits events.
/// Shared by the real SSE path and the non-streaming replay path.
pub(crate) struct StreamAccumulator {
    started: Instant,
    splitter: StreamParser,
    text: String,
    thinking: String,
    action: String,
    ttft_ms: Option<u64>,
    tta_ms: Option<u64>,
}

impl StreamAccumulator {
    pub(crate) fn new(started: Instant) -> Self {
        Self {
            started,
            splitter: StreamParser::new(),
            text: String::new(),
            thinking: String::new(),
            action: String::new(),
            ttft_ms: None,
            tta_ms: None,
        }
    }

    /// Feed one content delta, forwarding events. A dropped receiver is
    /// tolerated; accumulation continues so the outcome stays complete.
    pub(crate) async fn push(&mut self, delta: &str, events: &Sender<StreamEvent>) {
        if delta.is_empty() {
            return;
        }
        if self.ttft_ms.is_none() {
            let t_ms = self.started.elapsed().as_millis() as u64;
            self.ttft_ms = Some(t_ms);
            let _ = events.send(StreamEvent::FirstToken { t_ms }).await;
        }
        self.text.push_str(delta);
        for token in self.splitter.push(delta) {
            self.emit(token, events).await;
        }
    }

    pub(crate) async fn finish(mut self, events: &Sender<StreamEvent>) -> StreamOutcome {
        for token in self.splitter.finish() {
            self.emit(token, events).await;
        }
        let _ = events.send(StreamEvent::Complete).await;
        StreamOutcome {
            text: self.text,
            thinking: self.thinking,
            action: self.action,
            ttft_ms: self.ttft_ms,
            tta_ms: self.tta_ms,
            total_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    async fn emit(&mut self, token: StreamToken, events: &Sender<StreamEvent>) {
        match token {
            StreamToken::Thinking(chunk) => {
                self.thinking.push_str(&chunk);
                let _ = events.send(StreamEvent::Thinking { chunk }).await;
            }
            StreamToken::ActionStart => {
                let t_ms = self.started.elapsed().as_millis() as u64;
                self.tta_ms = Some(t_ms);
                let _ = events.send(StreamEvent::ActionStart { t_ms }).await;
            }
            StreamToken::Action(chunk) => {
                self.action.push_str(&chunk);
                let _ = events.send(StreamEvent::Action { chunk }).await;
            }
        }
    }
}

/// Replay a complete reply through the event protocol. Backs the default
/// `predict_stream` so non-streaming backends and mocks behave identically
/// to a real stream, just with a single delta.
pub(crate) async fn replay_text(
    text: &str,
    started: Instant,
    events: &Sender<StreamEvent>,
) -> StreamOutcome {
    let mut acc = StreamAccumulator::new(started);
    acc.push(text, events).await;
    acc.finish(events).await
}

/// Pop the payload of the next complete `data:` line out of `buffer`.
/// Non-data lines (comments, blank keep-alives) are discarded.
pub(crate) fn next_sse_data(buffer: &mut String) -> Option<String> {
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if let Some(data) = line.strip_prefix("data:") {
            return Some(data.trim_start().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn replay_emits_ordered_protocol() {
        let (tx, rx) = mpsc::channel(64);
        let outcome = replay_text(
            "thinking first. do(action=\"back\")",
            Instant::now(),
            &tx,
        )
        .await;

        let events = drain(rx).await;
        assert!(matches!(events[0], StreamEvent::FirstToken { .. }));
        assert!(matches!(events[1], StreamEvent::Thinking { .. }));
        assert!(matches!(events[2], StreamEvent::ActionStart { .. }));
        assert!(matches!(events[3], StreamEvent::Action { .. }));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));

        assert_eq!(outcome.text, "thinking first. do(action=\"back\")");
        assert_eq!(outcome.thinking, "thinking first. ");
        assert_eq!(outcome.action, "do(action=\"back\")");
        assert!(outcome.ttft_ms.is_some());
        assert!(outcome.tta_ms.is_some());
    }

    #[tokio::test]
    async fn accumulator_concatenation_is_exact() {
        let (tx, rx) = mpsc::channel(256);
        let chunks = ["I should ", "tap. do(ac", "tion=\"tap\", coordinate=[1,2])"];
        let mut acc = StreamAccumulator::new(Instant::now());
        for chunk in chunks {
            acc.push(chunk, &tx).await;
        }
        let outcome = acc.finish(&tx).await;

        let full: String = chunks.concat();
        assert_eq!(outcome.text, full);
        assert_eq!(format!("{}{}", outcome.thinking, outcome.action), full);

        // Event payloads reassemble to the same split.
        let mut thinking = String::new();
        let mut action = String::new();
        for ev in drain(rx).await {
            match ev {
                StreamEvent::Thinking { chunk } => thinking.push_str(&chunk),
                StreamEvent::Action { chunk } => action.push_str(&chunk),
                _ => {}
            }
        }
        assert_eq!(thinking, outcome.thinking);
        assert_eq!(action, outcome.action);
    }

    #[tokio::test]
    async fn no_action_start_without_marker() {
        let (tx, rx) = mpsc::channel(64);
        let outcome = replay_text("no action here at all", Instant::now(), &tx).await;
        assert!(outcome.tta_ms.is_none());
        assert!(outcome.action.is_empty());
        assert!(
            !drain(rx)
                .await
                .iter()
                .any(|e| matches!(e, StreamEvent::ActionStart { .. }))
        );
    }

    #[test]
    fn sse_data_lines_extracted_in_order() {
        let mut buffer = String::from(
            "data: {\"a\":1}\n\ndata: {\"b\":2}\n: keep-alive\ndata: [DONE]\n",
        );
        assert_eq!(next_sse_data(&mut buffer).as_deref(), Some("{\"a\":1}"));
        assert_eq!(next_sse_data(&mut buffer).as_deref(), Some("{\"b\":2}"));
        assert_eq!(next_sse_data(&mut buffer).as_deref(), Some("[DONE]"));
        assert_eq!(next_sse_data(&mut buffer), None);
    }

    #[test]
    fn sse_partial_line_waits_for_newline() {
        let mut buffer = String::from("data: {\"a\"");
        assert_eq!(next_sse_data(&mut buffer), None);
        buffer.push_str(":1}\n");
        assert_eq!(next_sse_data(&mut buffer).as_deref(), Some("{\"a\":1}"));
    }
}
