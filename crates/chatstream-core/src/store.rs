use std::sync::Arc;

use async_trait::async_trait;
use chatstream_runtime::{Role, Usage};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::errors::{OperationFailure, StoreError};

/// Reasoning trace of a reply and how long the model spent on it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Reasoning {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub content: String,
    /// Detected source language, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
}

/// Generation speed of a reply, measured from the start of dispatch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    /// Time to the first content, reasoning or tool call delta.
    pub ttft_ms: u64,
    /// Completion tokens per second of output.
    pub tps: f64,
    /// Start of dispatch to the end of the stream.
    pub latency_ms: u64,
    /// First delta to the end of the stream.
    pub duration_ms: u64,
}

/// A message record as the store keeps it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<Performance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<Translation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            session_id: None,
            topic_id: None,
        }
    }

    /// An empty assistant message, the usual target of a generation.
    pub fn assistant_placeholder() -> Self {
        Self::new(Role::Assistant, "")
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ContentUpdate {
    Append(String),
    Replace(String),
}

/// Partial update; `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessagePatch {
    pub reasoning: Option<Reasoning>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<Usage>,
    pub performance: Option<Performance>,
    pub finish_reason: Option<String>,
    pub translation: Option<Translation>,
    pub detected_language: Option<String>,
    pub summary: Option<String>,
}

impl MessagePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Persistence collaborator owning message records.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: NewMessage) -> Result<String, StoreError>;

    async fn update_message_content(
        &self,
        id: &str,
        update: ContentUpdate,
    ) -> Result<(), StoreError>;

    /// Sets or clears the error shown on a message. Content is kept.
    async fn update_message_error(
        &self,
        id: &str,
        error: Option<OperationFailure>,
    ) -> Result<(), StoreError>;

    async fn update_message(&self, id: &str, patch: MessagePatch) -> Result<(), StoreError>;

    async fn get_message(&self, id: &str) -> Result<Option<MessageDraft>, StoreError>;
}

pub type SharedMessageStore = Arc<dyn MessageStore>;

/// Process-local store, used by tests and the CLI.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    messages: Arc<DashMap<String, MessageDraft>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn with_message<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MessageDraft) -> R,
    ) -> Result<R, StoreError> {
        let mut entry = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        Ok(f(entry.value_mut()))
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_message(&self, message: NewMessage) -> Result<String, StoreError> {
        let id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        self.messages.insert(
            id.clone(),
            MessageDraft {
                id: id.clone(),
                role: message.role,
                content: message.content,
                reasoning: None,
                tool_calls: Vec::new(),
                usage: None,
                performance: None,
                finish_reason: None,
                error: None,
                translation: None,
                detected_language: None,
                summary: None,
                session_id: message.session_id,
                topic_id: message.topic_id,
            },
        );
        Ok(id)
    }

    async fn update_message_content(
        &self,
        id: &str,
        update: ContentUpdate,
    ) -> Result<(), StoreError> {
        self.with_message(id, |message| match update {
            ContentUpdate::Append(delta) => message.content.push_str(&delta),
            ContentUpdate::Replace(content) => message.content = content,
        })
    }

    async fn update_message_error(
        &self,
        id: &str,
        error: Option<OperationFailure>,
    ) -> Result<(), StoreError> {
        self.with_message(id, |message| message.error = error)
    }

    async fn update_message(&self, id: &str, patch: MessagePatch) -> Result<(), StoreError> {
        self.with_message(id, |message| {
            if let Some(reasoning) = patch.reasoning {
                message.reasoning = Some(reasoning);
            }
            if let Some(tool_calls) = patch.tool_calls {
                message.tool_calls = tool_calls;
            }
            if let Some(usage) = patch.usage {
                message.usage = Some(usage);
            }
            if let Some(performance) = patch.performance {
                message.performance = Some(performance);
            }
            if let Some(finish_reason) = patch.finish_reason {
                message.finish_reason = Some(finish_reason);
            }
            if let Some(translation) = patch.translation {
                message.translation = Some(translation);
            }
            if let Some(language) = patch.detected_language {
                message.detected_language = Some(language);
            }
            if let Some(summary) = patch.summary {
                message.summary = Some(summary);
            }
        })
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageDraft>, StoreError> {
        Ok(self.messages.get(id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn content_appends_and_replaces() {
        let store = InMemoryMessageStore::new();
        let id = store
            .create_message(NewMessage::assistant_placeholder().session("s1"))
            .await
            .expect("create");
        assert!(id.starts_with("msg_"));

        store
            .update_message_content(&id, ContentUpdate::Append("Hel".into()))
            .await
            .expect("append");
        store
            .update_message_content(&id, ContentUpdate::Append("lo".into()))
            .await
            .expect("append");
        let message = store.get_message(&id).await.expect("get").expect("exists");
        assert_eq!(message.content, "Hello");
        assert_eq!(message.session_id.as_deref(), Some("s1"));

        store
            .update_message_content(&id, ContentUpdate::Replace("Bye".into()))
            .await
            .expect("replace");
        let message = store.get_message(&id).await.expect("get").expect("exists");
        assert_eq!(message.content, "Bye");
    }

    #[tokio::test]
    async fn patch_leaves_unset_fields_alone() {
        let store = InMemoryMessageStore::new();
        let id = store
            .create_message(NewMessage::new(Role::User, "hola"))
            .await
            .expect("create");
        store
            .update_message(
                &id,
                MessagePatch {
                    detected_language: Some("es".into()),
                    ..MessagePatch::default()
                },
            )
            .await
            .expect("patch");
        store
            .update_message(
                &id,
                MessagePatch {
                    summary: Some("greeting".into()),
                    ..MessagePatch::default()
                },
            )
            .await
            .expect("patch");
        let message = store.get_message(&id).await.expect("get").expect("exists");
        assert_eq!(message.detected_language.as_deref(), Some("es"));
        assert_eq!(message.summary.as_deref(), Some("greeting"));
        assert_eq!(message.content, "hola");
    }

    #[tokio::test]
    async fn writes_to_unknown_messages_fail() {
        let store = InMemoryMessageStore::new();
        let err = store
            .update_message_error("msg_missing", None)
            .await
            .expect_err("unknown");
        assert_eq!(
            err,
            StoreError::NotFound {
                id: "msg_missing".into()
            }
        );
        assert!(store.get_message("msg_missing").await.expect("get").is_none());
        assert!(MessagePatch::default().is_empty());
    }
}
