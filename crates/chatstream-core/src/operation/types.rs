use std::fmt;
use std::time::{Duration, Instant};

use crate::errors::OperationFailure;

/// Process-unique operation identifier (`op_<uuid>`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub(crate) fn generate() -> Self {
        Self(format!("op_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of tracked generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    GenerateChat,
    Translate,
    DetectLanguage,
    Summarize,
}

impl OperationType {
    /// Whether operations of this type own the content of their message.
    pub fn holds_write_authority(self) -> bool {
        matches!(self, Self::GenerateChat)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Domain objects an operation works on.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OperationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
}

impl OperationContext {
    pub fn for_message(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Self::default()
        }
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    /// Fills unset fields from `parent`.
    pub(crate) fn inherit(mut self, parent: &OperationContext) -> Self {
        if self.message_id.is_none() {
            self.message_id = parent.message_id.clone();
        }
        if self.session_id.is_none() {
            self.session_id = parent.session_id.clone();
        }
        if self.topic_id.is_none() {
            self.topic_id = parent.topic_id.clone();
        }
        self
    }
}

/// Incremental progress of a running operation.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    pub current: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(current: u64) -> Self {
        Self {
            current,
            total: None,
        }
    }

    pub fn of(current: u64, total: u64) -> Self {
        Self {
            current,
            total: Some(total),
        }
    }

    /// Completion ratio in percent when the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.current as f64 / total as f64 * 100.0).min(100.0)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OperationMetadata {
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub duration: Option<Duration>,
    pub progress: Option<Progress>,
    pub cancel_reason: Option<String>,
}

/// Snapshot of one tracked operation.
#[derive(Clone, Debug)]
pub struct Operation {
    pub id: OperationId,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub context: OperationContext,
    pub parent: Option<OperationId>,
    pub children: Vec<OperationId>,
    pub label: Option<String>,
    pub metadata: OperationMetadata,
    /// Present only when `status` is `Failed`.
    pub failure: Option<OperationFailure>,
}

impl Operation {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Selects operations by type, status and context. Unset fields match anything.
#[derive(Clone, Debug, Default)]
pub struct OperationFilter {
    pub op_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
}

impl OperationFilter {
    pub fn of_type(op_type: OperationType) -> Self {
        Self {
            op_type: Some(op_type),
            ..Self::default()
        }
    }

    pub fn for_message(message_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Self::default()
        }
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn for_topic(topic_id: impl Into<String>) -> Self {
        Self {
            topic_id: Some(topic_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, op: &Operation) -> bool {
        fn field_matches(want: &Option<String>, have: &Option<String>) -> bool {
            want.is_none() || want == have
        }
        self.op_type.is_none_or(|t| t == op.op_type)
            && self.status.is_none_or(|s| s == op.status)
            && field_matches(&self.message_id, &op.context.message_id)
            && field_matches(&self.session_id, &op.context.session_id)
            && field_matches(&self.topic_id, &op.context.topic_id)
    }
}

/// Lifecycle notification sent to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationUpdate {
    Started {
        id: OperationId,
        op_type: OperationType,
        context: OperationContext,
    },
    Progress {
        id: OperationId,
        progress: Progress,
    },
    Finished {
        id: OperationId,
        status: OperationStatus,
    },
}

/// Callback run when an operation is cancelled, with the cancel reason.
pub type CancelHandler = Box<dyn FnOnce(&OperationId, &str) + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = OperationId::generate();
        let b = OperationId::generate();
        assert!(a.as_str().starts_with("op_"));
        assert_ne!(a, b);
    }

    #[test]
    fn child_context_inherits_missing_fields() {
        let parent = OperationContext::for_message("m1").session("s1").topic("t1");
        let child = OperationContext::default().topic("t2").inherit(&parent);
        assert_eq!(child.message_id.as_deref(), Some("m1"));
        assert_eq!(child.session_id.as_deref(), Some("s1"));
        assert_eq!(child.topic_id.as_deref(), Some("t2"));
    }

    #[test]
    fn progress_percentage() {
        assert_eq!(Progress::of(1, 4).percentage(), Some(25.0));
        assert_eq!(Progress::new(7).percentage(), None);
        assert_eq!(Progress::of(3, 0).percentage(), None);
    }
}
