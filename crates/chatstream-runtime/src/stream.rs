use std::pin::Pin;

use crate::errors::ProviderError;

/// Token accounting reported by a provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One piece of a tool call as streamed by the provider.
///
/// `id` and `name` usually arrive on the first fragment of a call; later
/// fragments only carry more `arguments` text.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolCallFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// Normalized unit of incremental output.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Visible content delta.
    Text(String),
    /// Private "thinking" channel delta.
    Reasoning(String),
    /// Fragment of the tool call at position `index`.
    ToolCallDelta {
        index: usize,
        fragment: ToolCallFragment,
    },
    /// Token usage for the whole generation.
    Usage(Usage),
    /// Terminal failure.
    Error(ProviderError),
    /// Provider signalled logical completion.
    Done { finish_reason: Option<String> },
}

impl StreamEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Text(delta.into())
    }

    pub fn done(finish_reason: Option<&str>) -> Self {
        Self::Done {
            finish_reason: finish_reason.map(ToOwned::to_owned),
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done { .. })
    }
}

/// Boxed stream of normalized events returned by `ProviderRuntime::stream_chat`.
pub type EventStream = Pin<Box<dyn futures::Stream<Item = StreamEvent> + Send + 'static>>;
