//! Chat templates for converting messages to model prompts
//!
//! The [`ChatTemplate`] trait converts a sequence of [`ChatMessage`]s into a
//! prompt string. The runtime uses it to render a system prompt once per
//! session and prepend it to every message sent afterwards.

/// A chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Role of the message sender (`"system"`, `"user"`, `"assistant"`).
    pub role: String,
    /// Content of the message.
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }
}

/// Converts messages into a prompt string for the model.
pub trait ChatTemplate: Send + Sync {
    /// Apply the template to a list of messages, producing a prompt string.
    fn apply(&self, messages: &[ChatMessage]) -> String;
}

/// ChatML: `<|im_start|>role\ncontent<|im_end|>\n` per message.
///
/// The markers only become control tokens when the prompt is tokenized with
/// special-token parsing enabled.
pub struct ChatMlTemplate;

impl ChatTemplate for ChatMlTemplate {
    fn apply(&self, messages: &[ChatMessage]) -> String {
        let mut out = String::new();
        for m in messages {
            out.push_str("<|im_start|>");
            out.push_str(&m.role);
            out.push('\n');
            out.push_str(&m.content);
            out.push_str("<|im_end|>\n");
        }
        out
    }
}
