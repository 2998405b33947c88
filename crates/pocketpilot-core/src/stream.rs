//! Incremental thinking/action splitter for streamed model output.
//!
//! The model's reply is thinking text up to the first action marker and
//! action text from the marker onward. Chunks arrive at arbitrary
//! boundaries, so a marker can be split across chunks; the splitter holds
//! back the shortest tail that could still grow into a marker and emits
//! everything before it. No character is ever misclassified and
//! concatenating the emitted tokens reproduces the input exactly.

use crate::action::{LONGEST_MARKER_LEN, find_marker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// Text that is provably before the first action marker.
    Thinking(String),
    /// The first action marker was just detected; emitted exactly once.
    ActionStart,
    /// Text from the marker onward, marker characters included.
    Action(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Thinking,
    Action,
}

#[derive(Debug)]
pub struct StreamParser {
    mode: Mode,
    /// Held-back tail that may still extend into a marker. Never longer
    /// than `LONGEST_MARKER_LEN - 1` after a `push` returns.
    carry: String,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            mode: Mode::Thinking,
            carry: String::new(),
        }
    }

    /// True once the first action marker has been seen.
    pub fn in_action(&self) -> bool {
        self.mode == Mode::Action
    }

    /// Feed one chunk and collect the tokens it releases.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamToken> {
        if self.mode == Mode::Action {
            if chunk.is_empty() {
                return Vec::new();
            }
            return vec![StreamToken::Action(chunk.to_string())];
        }

        self.carry.push_str(chunk);
        let mut out = Vec::new();

        if let Some((pos, _)) = find_marker(&self.carry) {
            if pos > 0 {
                out.push(StreamToken::Thinking(self.carry[..pos].to_string()));
            }
            out.push(StreamToken::ActionStart);
            let action = self.carry[pos..].to_string();
            if !action.is_empty() {
                out.push(StreamToken::Action(action));
            }
            self.carry.clear();
            self.mode = Mode::Action;
            return out;
        }

        let hold = marker_prefix_suffix_len(&self.carry);
        let safe = self.carry.len() - hold;
        if safe > 0 {
            out.push(StreamToken::Thinking(self.carry[..safe].to_string()));
            self.carry.drain(..safe);
        }
        out
    }

    /// Flush at end of stream. Any held-back tail was not a marker after all.
    pub fn finish(&mut self) -> Vec<StreamToken> {
        if self.mode == Mode::Thinking && !self.carry.is_empty() {
            let tail = std::mem::take(&mut self.carry);
            return vec![StreamToken::Thinking(tail)];
        }
        Vec::new()
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of an
/// action marker. Bounded by `LONGEST_MARKER_LEN - 1`.
fn marker_prefix_suffix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let max = (LONGEST_MARKER_LEN - 1).min(bytes.len());
    for len in (1..=max).rev() {
        let tail = &bytes[bytes.len() - len..];
        if crate::action::marker_starts_with(tail) {
            return len;
        }
    }
    0
}
