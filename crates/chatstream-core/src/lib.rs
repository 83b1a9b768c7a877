//! Orchestration on top of `chatstream-runtime`: tracked operations, the
//! message dispatcher, chat generation and auxiliary tasks.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chatstream_core::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let factory = RuntimeFactory::new(settings.factory_config());
//! let runtimes = Arc::new(RuntimeSet::from_settings(&settings, &factory)?);
//! let store = InMemoryMessageStore::new();
//! let tracker = Arc::new(OperationTracker::new());
//!
//! let message_id = store.create_message(NewMessage::assistant_placeholder()).await?;
//! let chat = ChatGeneration::new(tracker, Arc::new(store.clone()), runtimes);
//! let payload = ChatPayload::new("gpt-4o-mini", vec![ChatMessage::user("Say hello")]);
//! let report = chat.run(ChatRequest::new("openai", payload, &message_id)).await?;
//! println!("{:?}: {}", report.outcome, report.content);
//! # Ok(())
//! # }
//! ```

/// Translation, language detection and summaries for stored messages.
pub mod auxiliary;
/// Chat generation into a stored message.
pub mod chat;
/// Settings file and system agent models.
pub mod config;
/// Application of event streams to messages.
pub mod dispatcher;
/// Error types shared by the orchestration layer.
pub mod errors;
/// Operation lifecycle tracking.
pub mod operation;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Prompt builders for auxiliary tasks.
pub mod prompts;
/// Provider runtimes keyed by id.
pub mod runtime_set;
/// Message store seam and the in-memory implementation.
pub mod store;

#[cfg(test)]
mod testing;

pub use auxiliary::{AuxiliaryPipeline, MessageTranslation, TaskOutcome, TaskReport};
pub use chat::{ChatGeneration, ChatRequest};
pub use config::{Settings, SystemAgentSettings};
pub use dispatcher::{DispatchOutcome, DispatchReport, DispatchTarget, MessageStreamDispatcher};
pub use errors::{CoreError, OperationFailure, StoreError};
pub use observability::init_observability;
pub use operation::{
    Operation, OperationContext, OperationFilter, OperationId, OperationStatus, OperationTracker,
    OperationType, OperationUpdate, Progress,
};
pub use runtime_set::RuntimeSet;
pub use store::{
    InMemoryMessageStore, MessageDraft, MessagePatch, MessageStore, NewMessage, Performance,
};
