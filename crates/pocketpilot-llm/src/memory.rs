//! Rolling conversation memory for the VLM request.
//!
//! Holds the fixed system message plus a bounded window of past
//! screenshot/reply exchanges. Only the most recent retained exchange keeps
//! its image; older ones carry a one-line textual stand-in so the
//! trajectory survives without the token cost. The agent loop is the sole
//! writer.

use crate::types::Message;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct Exchange {
    user_text: String,
    /// Data URL of the screenshot, dropped when the exchange ages.
    image: Option<String>,
    assistant_reply: String,
    /// Compact description of the action taken, used as the image stand-in.
    action_summary: String,
}

#[derive(Debug)]
pub struct ConversationMemory {
    system_prompt: String,
    window: usize,
    exchanges: VecDeque<Exchange>,
}

pub const DEFAULT_MEMORY_WINDOW: usize = 4;

impl ConversationMemory {
    pub fn new(system_prompt: impl Into<String>, window: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            window: window.max(1),
            exchanges: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Append a completed exchange, then age older images out and evict
    /// beyond the window (oldest first).
    pub fn push_exchange(
        &mut self,
        user_text: impl Into<String>,
        image: Option<String>,
        assistant_reply: impl Into<String>,
        action_summary: impl Into<String>,
    ) {
        self.exchanges.push_back(Exchange {
            user_text: user_text.into(),
            image,
            assistant_reply: assistant_reply.into(),
            action_summary: action_summary.into(),
        });

        let keep_image_from = self.exchanges.len().saturating_sub(1);
        for (i, exchange) in self.exchanges.iter_mut().enumerate() {
            if i < keep_image_from {
                exchange.image = None;
            }
        }

        while self.exchanges.len() > self.window {
            self.exchanges.pop_front();
        }
    }

    /// Serialize history plus the in-flight user turn. Does not mutate.
    pub fn to_messages(&self, current_text: &str, current_image: Option<&str>) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2 + self.exchanges.len() * 2);
        messages.push(Message::system(&self.system_prompt));

        for exchange in &self.exchanges {
            match &exchange.image {
                Some(url) => {
                    messages.push(Message::user_with_image(&exchange.user_text, url));
                }
                None => {
                    messages.push(Message::user(format!(
                        "{}\n[screenshot omitted — action taken: {}]",
                        exchange.user_text, exchange.action_summary
                    )));
                }
            }
            messages.push(Message::assistant(&exchange.assistant_reply));
        }

        match current_image {
            Some(url) => messages.push(Message::user_with_image(current_text, url)),
            None => messages.push(Message::user(current_text)),
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with(n: usize, window: usize) -> ConversationMemory {
        let mut memory = ConversationMemory::new("system", window);
        for i in 0..n {
            memory.push_exchange(
                format!("screen {}", i),
                Some(format!("data:image/jpeg;base64,img{}", i)),
                format!("reply {}", i),
                format!("tap({},{})", i, i),
            );
        }
        memory
    }

    #[test]
    fn history_is_chronological() {
        let memory = memory_with(3, 4);
        let messages = memory.to_messages("now", None);
        // system + 3 exchanges * 2 + current
        assert_eq!(messages.len(), 8);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content_text().unwrap().contains("screen 0"));
        assert!(messages[3].content_text().unwrap().contains("screen 1"));
        assert!(messages[5].content_text().unwrap().contains("screen 2"));
        assert_eq!(messages[7].content_text().as_deref(), Some("now"));
    }

    #[test]
    fn eviction_drops_oldest_first() {
        let memory = memory_with(6, 4);
        assert_eq!(memory.len(), 4);
        let messages = memory.to_messages("now", None);
        let first_user = messages[1].content_text().unwrap();
        assert!(first_user.contains("screen 2"), "oldest kept is screen 2");
    }

    #[test]
    fn only_newest_exchange_keeps_its_image() {
        let memory = memory_with(3, 4);
        let messages = memory.to_messages("now", None);
        let with_images: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_image())
            .map(|(i, _)| i)
            .collect();
        // Only the newest past exchange (index 5) carries an image.
        assert_eq!(with_images, vec![5]);
    }

    #[test]
    fn aged_exchanges_carry_action_stand_in() {
        let memory = memory_with(2, 4);
        let messages = memory.to_messages("now", None);
        let aged = messages[1].content_text().unwrap();
        assert!(aged.contains("screenshot omitted"));
        assert!(aged.contains("tap(0,0)"));
    }

    #[test]
    fn current_turn_carries_image_without_joining_history() {
        let memory = memory_with(1, 4);
        let messages = memory.to_messages("now", Some("data:image/jpeg;base64,current"));
        assert!(messages.last().unwrap().has_image());
        assert_eq!(memory.len(), 1);
    }
}
