use serde::{Deserialize, Serialize};

/// OpenAI-compatible chat completions request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
}

/// Message content: plain text or a list of text/image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(Content::Text(content.into())),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(Content::Text(content.into())),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(Content::Text(content.into())),
        }
    }

    /// User turn with a text part followed by one inline image.
    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(Content::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.into(),
                    },
                },
            ])),
        }
    }

    /// Flattened text of the message, image parts excluded.
    pub fn content_text(&self) -> Option<String> {
        match self.content.as_ref()? {
            Content::Text(text) => Some(text.clone()),
            Content::Parts(parts) => {
                let text: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        ContentPart::ImageUrl { .. } => None,
                    })
                    .collect();
                Some(text.join("\n"))
            }
        }
    }

    pub fn has_image(&self) -> bool {
        matches!(
            &self.content,
            Some(Content::Parts(parts))
                if parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. }))
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// `GET <base>/models` response.
#[derive(Debug, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

/// One `data:` line of a streaming response.
#[derive(Debug, Deserialize)]
pub struct StreamDelta {
    pub choices: Vec<DeltaChoice>,
}

#[derive(Debug, Deserialize)]
pub struct DeltaChoice {
    pub delta: DeltaContent,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeltaContent {
    #[serde(default)]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_part_serializes_to_wire_shape() {
        let msg = Message::user_with_image("look at this", "data:image/jpeg;base64,AAAA");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,AAAA"
        );
    }

    #[test]
    fn request_skips_unset_sampling_params() {
        let request = ChatRequest {
            model: "planner".to_string(),
            messages: vec![Message::system("sys")],
            max_tokens: 2048,
            temperature: 0.3,
            top_p: None,
            frequency_penalty: None,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("top_p").is_none());
        assert!(json.get("frequency_penalty").is_none());
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn content_text_flattens_parts() {
        let msg = Message::user_with_image("caption", "data:image/jpeg;base64,BBBB");
        assert_eq!(msg.content_text().as_deref(), Some("caption"));
        assert!(msg.has_image());
    }

    #[test]
    fn response_parses_without_usage() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            response.choices[0].message.content_text().as_deref(),
            Some("hi")
        );
        assert!(response.usage.is_none());
    }

    #[test]
    fn delta_parses_empty_content() {
        let raw = r#"{"choices":[{"delta":{}}]}"#;
        let delta: StreamDelta = serde_json::from_str(raw).unwrap();
        assert!(delta.choices[0].delta.content.is_none());
    }
}
