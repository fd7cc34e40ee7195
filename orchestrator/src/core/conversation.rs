//! Agent conversations and the completion-service seam.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// System instructions (the persona) plus an ordered message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub system: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![Message {
                role: Role::User,
                content: prompt.into(),
            }],
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message {
            role: Role::User,
            content: content.into(),
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message {
            role: Role::Assistant,
            content: content.into(),
        });
    }

    /// The first user message: the task as originally stated.
    pub fn original_instructions(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map_or("", |m| m.content.as_str())
    }

    /// Plain-text transcript for completion backends that take a single prompt.
    pub fn render_transcript(&self) -> String {
        let mut out = String::new();
        if !self.system.trim().is_empty() {
            out.push_str("# System\n\n");
            out.push_str(self.system.trim_end());
            out.push_str("\n\n");
        }
        for message in &self.messages {
            out.push_str(match message.role {
                Role::User => "# User\n\n",
                Role::Assistant => "# Assistant\n\n",
            });
            out.push_str(message.content.trim_end());
            out.push_str("\n\n");
        }
        out
    }
}

/// Completion service: conversation in, text out.
///
/// Errors mean the service itself failed (unreachable, timed out, crashed) and
/// are treated as infrastructure failures by callers.
pub trait Completer {
    fn complete(&self, conversation: &Conversation) -> Result<String>;
}

impl<C: Completer + ?Sized> Completer for &C {
    fn complete(&self, conversation: &Conversation) -> Result<String> {
        (**self).complete(conversation)
    }
}
