//! Provider runtime layer: one normalized, cancellable streaming chat call
//! over providers with different wire formats.
//!
//! # Usage
//!
//! ```no_run
//! use chatstream_runtime::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = RuntimeFactory::default();
//! let runtime = factory.create(ProviderProfile::openai())?;
//!
//! let summary = runtime
//!     .stream_chat_with(
//!         ChatPayload::new("gpt-4o-mini", vec![ChatMessage::user("Say hello")]),
//!         AbortSignal::never(),
//!         StreamCallbacks::new().on_text(|delta| print!("{delta}")),
//!     )
//!     .await?;
//! println!("\n{:?}", summary.usage);
//! # Ok(())
//! # }
//! ```

/// Cancellation flags raced against network pulls.
pub mod abort;
/// Bounded TTL cache.
pub mod cache;
/// Mapping of provider chunks to stream events.
pub mod chunk;
/// Injectable time source.
pub mod clock;
/// Client seam and the HTTP implementation.
pub mod completer;
/// Guaranteed full consumption of streams.
pub mod drain;
/// Injectable environment lookup.
pub mod env;
/// Error taxonomy and HTTP error classification.
pub mod errors;
/// Runtime construction from profiles.
pub mod factory;
/// Incremental JSON object extraction.
pub mod json_stream;
/// Request-side data types.
pub mod model;
/// Common imports for typical usage.
pub mod prelude;
/// Declarative provider descriptors.
pub mod profile;
/// The provider runtime.
pub mod runtime;
/// Server-sent events framing.
pub mod sse;
/// Normalized stream events.
pub mod stream;

pub use abort::{AbortHandle, AbortSignal};
pub use cache::TtlCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use completer::{ByteStream, ChatCompleter, CompletionResponse, HttpCompleter};
pub use drain::{DrainSummary, drain_stream};
pub use env::EnvSource;
pub use errors::{ApiErrorKind, ProviderError, RuntimeError};
pub use factory::{FactoryConfig, RuntimeFactory};
pub use json_stream::{IncrementalJsonParser, ScanMode};
pub use model::{ChatMessage, ChatPayload, ModelRef, OutgoingRequest, ProviderId, Role};
pub use profile::{AuthScheme, DebugPredicate, ProviderProfile, ResponseShape, TransformStep};
pub use runtime::{ChatSummary, ProviderRuntime, StreamCallbacks};
pub use stream::{EventStream, StreamEvent, ToolCallFragment, Usage};
