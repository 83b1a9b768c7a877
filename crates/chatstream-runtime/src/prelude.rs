//! Common imports for typical runtime usage.
pub use crate::{
    AbortHandle, AbortSignal, ChatMessage, ChatPayload, ChatSummary, EventStream, ModelRef,
    ProviderError, ProviderId, ProviderProfile, ProviderRuntime, ResponseShape, RuntimeFactory,
    StreamCallbacks, StreamEvent,
};
