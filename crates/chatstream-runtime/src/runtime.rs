use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::chunk::{ChunkMapper, events_from_response};
use crate::completer::{ByteStream, ChatCompleter, CompletionResponse};
use crate::drain::drain_stream;
use crate::env::EnvSource;
use crate::errors::ProviderError;
use crate::model::{ChatPayload, OutgoingRequest, ProviderId};
use crate::profile::ProviderProfile;
use crate::stream::{EventStream, StreamEvent, ToolCallFragment, Usage};

/// Tracing target for raw request/response dumps.
pub const DEBUG_TARGET: &str = "chatstream::debug";

/// Normalized streaming chat for one provider.
///
/// Cheap to clone; clones share the profile and client.
#[derive(Clone)]
pub struct ProviderRuntime {
    profile: Arc<ProviderProfile>,
    completer: Arc<dyn ChatCompleter>,
    env: EnvSource,
}

impl std::fmt::Debug for ProviderRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRuntime")
            .field("provider", &self.profile.id)
            .finish_non_exhaustive()
    }
}

impl ProviderRuntime {
    pub fn new(
        profile: Arc<ProviderProfile>,
        completer: Arc<dyn ChatCompleter>,
        env: EnvSource,
    ) -> Self {
        Self {
            profile,
            completer,
            env,
        }
    }

    pub fn id(&self) -> &ProviderId {
        &self.profile.id
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    /// Applies the profile transforms without dispatching anything.
    pub fn prepare(&self, payload: &ChatPayload) -> Result<OutgoingRequest, ProviderError> {
        self.profile.prepare(payload)
    }

    /// Starts a completion and returns its normalized events.
    ///
    /// The stream always ends with exactly one terminal event: `Done` or
    /// `Error`. Aborting `abort` ends it with `Error(Cancelled)` even if the
    /// provider keeps sending.
    pub fn stream_chat(&self, payload: ChatPayload, abort: AbortSignal) -> EventStream {
        let debug_on = self.profile.debug.is_enabled(&self.env);
        let state = State {
            provider: self.profile.id.clone(),
            profile: self.profile.clone(),
            completer: self.completer.clone(),
            abort,
            debug_on,
            phase: Phase::Start(Box::new(payload)),
            pending: VecDeque::new(),
            ended: false,
        };
        Box::pin(stream::unfold(state, next_event))
    }

    /// Callback-shaped variant of [`stream_chat`](Self::stream_chat).
    ///
    /// Every callback has run by the time this returns. Cancellation and
    /// failures are returned as `Err` after `on_error` was invoked.
    pub async fn stream_chat_with(
        &self,
        payload: ChatPayload,
        abort: AbortSignal,
        mut callbacks: StreamCallbacks,
    ) -> Result<ChatSummary, ProviderError> {
        let mut summary = ChatSummary::default();
        let events = self.stream_chat(payload, abort).map(|event| {
            summary.events += 1;
            match event {
                StreamEvent::Text(delta) => {
                    callbacks.text(&delta);
                    summary.text.push_str(&delta);
                }
                StreamEvent::Reasoning(delta) => {
                    callbacks.reasoning(&delta);
                    summary.reasoning.push_str(&delta);
                }
                StreamEvent::ToolCallDelta { index, fragment } => {
                    callbacks.tool_call_delta(index, &fragment);
                    summary.merge_tool_call(index, fragment);
                }
                StreamEvent::Usage(usage) => {
                    callbacks.usage(&usage);
                    summary.usage = Some(usage);
                }
                StreamEvent::Done { finish_reason } => summary.finish_reason = finish_reason,
                StreamEvent::Error(err) => {
                    callbacks.error(&err);
                    return Err(err);
                }
            }
            Ok(())
        });
        drain_stream(Some(events)).await?;
        Ok(summary)
    }
}

/// Optional observers for [`ProviderRuntime::stream_chat_with`].
#[derive(Default)]
pub struct StreamCallbacks {
    on_text: Option<Box<dyn FnMut(&str) + Send>>,
    on_reasoning: Option<Box<dyn FnMut(&str) + Send>>,
    on_tool_call_delta: Option<Box<dyn FnMut(usize, &ToolCallFragment) + Send>>,
    on_usage: Option<Box<dyn FnMut(&Usage) + Send>>,
    on_error: Option<Box<dyn FnMut(&ProviderError) + Send>>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_text(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_text = Some(Box::new(f));
        self
    }

    pub fn on_reasoning(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_reasoning = Some(Box::new(f));
        self
    }

    pub fn on_tool_call_delta(
        mut self,
        f: impl FnMut(usize, &ToolCallFragment) + Send + 'static,
    ) -> Self {
        self.on_tool_call_delta = Some(Box::new(f));
        self
    }

    pub fn on_usage(mut self, f: impl FnMut(&Usage) + Send + 'static) -> Self {
        self.on_usage = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&ProviderError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn text(&mut self, delta: &str) {
        if let Some(f) = self.on_text.as_mut() {
            f(delta);
        }
    }

    fn reasoning(&mut self, delta: &str) {
        if let Some(f) = self.on_reasoning.as_mut() {
            f(delta);
        }
    }

    fn tool_call_delta(&mut self, index: usize, fragment: &ToolCallFragment) {
        if let Some(f) = self.on_tool_call_delta.as_mut() {
            f(index, fragment);
        }
    }

    fn usage(&mut self, usage: &Usage) {
        if let Some(f) = self.on_usage.as_mut() {
            f(usage);
        }
    }

    fn error(&mut self, err: &ProviderError) {
        if let Some(f) = self.on_error.as_mut() {
            f(err);
        }
    }
}

/// Aggregate of a fully consumed chat stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatSummary {
    pub text: String,
    pub reasoning: String,
    /// Tool calls merged by index.
    pub tool_calls: BTreeMap<usize, ToolCallFragment>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    /// Number of events observed.
    pub events: u64,
}

impl ChatSummary {
    fn merge_tool_call(&mut self, index: usize, fragment: ToolCallFragment) {
        let entry = self.tool_calls.entry(index).or_default();
        if fragment.id.is_some() {
            entry.id = fragment.id;
        }
        if fragment.name.is_some() {
            entry.name = fragment.name;
        }
        entry.arguments.push_str(&fragment.arguments);
    }
}

enum Phase {
    Start(Box<ChatPayload>),
    Streaming { body: ByteStream, mapper: ChunkMapper },
    Finished,
}

struct State {
    provider: ProviderId,
    profile: Arc<ProviderProfile>,
    completer: Arc<dyn ChatCompleter>,
    abort: AbortSignal,
    debug_on: bool,
    phase: Phase,
    pending: VecDeque<StreamEvent>,
    ended: bool,
}

impl State {
    fn fail(&mut self, err: ProviderError) {
        self.pending.push_back(StreamEvent::Error(err));
        self.phase = Phase::Finished;
    }
}

async fn next_event(mut state: State) -> Option<(StreamEvent, State)> {
    loop {
        if state.ended {
            return None;
        }
        if state.abort.is_aborted() {
            state.pending.clear();
            state.fail(ProviderError::Cancelled);
        }
        if let Some(event) = state.pending.pop_front() {
            if event.is_terminal() {
                state.pending.clear();
                state.ended = true;
            }
            return Some((event, state));
        }

        match std::mem::replace(&mut state.phase, Phase::Finished) {
            Phase::Start(payload) => {
                let request = match state.profile.prepare(&payload) {
                    Ok(request) => request,
                    Err(err) => {
                        state.fail(err);
                        continue;
                    }
                };
                if state.debug_on {
                    debug!(target: DEBUG_TARGET, provider = %state.provider, path = %request.path, body = %request.body, "chat completion request");
                }
                let streaming = request.is_streaming();
                let signal = state.abort.clone();
                let created = tokio::select! {
                    biased;
                    _ = state.abort.aborted() => Err(ProviderError::Cancelled),
                    created = state.completer.create(request, signal) => created,
                };
                match created {
                    Ok(CompletionResponse::Stream(body)) => {
                        let mapper = ChunkMapper::new(
                            state.provider.clone(),
                            state.profile.response_shape,
                            state.profile.json_scan,
                        );
                        state.phase = Phase::Streaming { body, mapper };
                    }
                    Ok(CompletionResponse::Whole(value)) => {
                        if state.debug_on {
                            debug!(target: DEBUG_TARGET, provider = %state.provider, response = %value, streaming, "chat completion response");
                        }
                        state
                            .pending
                            .extend(events_from_response(&state.provider, &value));
                    }
                    Err(err) => state.fail(err),
                }
            }
            Phase::Streaming { mut body, mut mapper } => {
                let next = tokio::select! {
                    biased;
                    _ = state.abort.aborted() => {
                        state.fail(ProviderError::Cancelled);
                        continue;
                    }
                    next = body.next() => next,
                };
                match next {
                    Some(Ok(chunk)) => {
                        if state.debug_on {
                            debug!(target: DEBUG_TARGET, provider = %state.provider, chunk = %String::from_utf8_lossy(&chunk), "chat completion chunk");
                        }
                        state.pending.extend(mapper.push(&chunk));
                        state.phase = Phase::Streaming { body, mapper };
                    }
                    Some(Err(err)) => state.fail(err),
                    None => state.pending.extend(mapper.finish()),
                }
            }
            Phase::Finished => {
                if state.pending.is_empty() {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::abort::AbortHandle;
    use crate::model::ChatMessage;
    use crate::profile::{ResponseShape, TransformStep};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted completer that records the requests it receives.
    pub(crate) struct FakeCompleter {
        pub requests: Mutex<Vec<OutgoingRequest>>,
        behavior: FakeBehavior,
    }

    pub(crate) enum FakeBehavior {
        Chunks(Vec<Result<&'static str, ProviderError>>),
        Whole(serde_json::Value),
        Fail(ProviderError),
        /// Sends the chunks, then never ends.
        ChunksThenPending(Vec<&'static str>),
    }

    impl FakeCompleter {
        pub(crate) fn new(behavior: FakeBehavior) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                behavior,
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatCompleter for FakeCompleter {
        async fn create(
            &self,
            request: OutgoingRequest,
            _abort: AbortSignal,
        ) -> Result<CompletionResponse, ProviderError> {
            self.requests.lock().expect("lock").push(request);
            let to_bytes = |s: &'static str| bytes::Bytes::from_static(s.as_bytes());
            match &self.behavior {
                FakeBehavior::Chunks(chunks) => {
                    let items: Vec<_> = chunks
                        .iter()
                        .map(|c| c.clone().map(to_bytes))
                        .collect();
                    Ok(CompletionResponse::Stream(Box::pin(stream::iter(items))))
                }
                FakeBehavior::Whole(value) => Ok(CompletionResponse::Whole(value.clone())),
                FakeBehavior::Fail(err) => Err(err.clone()),
                FakeBehavior::ChunksThenPending(chunks) => {
                    let items: Vec<Result<bytes::Bytes, ProviderError>> =
                        chunks.iter().map(|c| Ok(to_bytes(c))).collect();
                    Ok(CompletionResponse::Stream(Box::pin(
                        stream::iter(items).chain(stream::pending()),
                    )))
                }
            }
        }
    }

    pub(crate) fn runtime_with(
        shape: ResponseShape,
        behavior: FakeBehavior,
    ) -> (ProviderRuntime, Arc<FakeCompleter>) {
        let mut profile = ProviderProfile::openai_compatible("fake", "https://fake.test/v1");
        profile.response_shape = shape;
        let completer = FakeCompleter::new(behavior);
        let runtime = ProviderRuntime::new(Arc::new(profile), completer.clone(), EnvSource::empty());
        (runtime, completer)
    }

    fn payload() -> ChatPayload {
        ChatPayload::new("m", vec![ChatMessage::user("hi")])
    }

    async fn collect(stream: EventStream) -> Vec<StreamEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn plain_text_chunks_stream_and_complete() {
        let (runtime, _) = runtime_with(
            ResponseShape::PlainText,
            FakeBehavior::Chunks(vec![Ok("Hel"), Ok("lo"), Ok(" world")]),
        );
        let events = collect(runtime.stream_chat(payload(), AbortSignal::never())).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::text("Hel"),
                StreamEvent::text("lo"),
                StreamEvent::text(" world"),
                StreamEvent::done(None),
            ]
        );
    }

    #[tokio::test]
    async fn transforms_reach_the_client() {
        let mut profile = ProviderProfile::openai_compatible("fake", "https://fake.test/v1");
        profile.transforms = vec![
            TransformStep::Scale {
                field: "temperature".into(),
                factor: 0.5,
            },
            TransformStep::Scale {
                field: "top_p".into(),
                factor: 0.5,
            },
            TransformStep::Clamp {
                field: "top_p".into(),
                min: Some(0.1),
                max: Some(9.9),
            },
        ];
        let completer = FakeCompleter::new(FakeBehavior::Chunks(vec![Ok("data: [DONE]\n\n")]));
        let runtime = ProviderRuntime::new(Arc::new(profile), completer.clone(), EnvSource::empty());
        let events = collect(runtime.stream_chat(
            payload().temperature(2.0).top_p(20.0),
            AbortSignal::never(),
        ))
        .await;
        assert_eq!(events, vec![StreamEvent::done(None)]);

        let requests = completer.requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body["temperature"], serde_json::json!(1.0));
        assert_eq!(requests[0].body["top_p"], serde_json::json!(9.9));
    }

    #[tokio::test]
    async fn client_errors_become_terminal_error_events() {
        let err = ProviderError::transport("fake", "connection refused");
        let (runtime, _) = runtime_with(ResponseShape::Sse, FakeBehavior::Fail(err.clone()));
        let events = collect(runtime.stream_chat(payload(), AbortSignal::never())).await;
        assert_eq!(events, vec![StreamEvent::Error(err)]);
    }

    #[tokio::test]
    async fn body_error_mid_stream_keeps_prior_events() {
        let err = ProviderError::transport("fake", "reset");
        let (runtime, _) = runtime_with(
            ResponseShape::PlainText,
            FakeBehavior::Chunks(vec![Ok("a"), Err(err.clone()), Ok("b")]),
        );
        let events = collect(runtime.stream_chat(payload(), AbortSignal::never())).await;
        assert_eq!(events, vec![StreamEvent::text("a"), StreamEvent::Error(err)]);
    }

    #[tokio::test]
    async fn whole_response_is_converted() {
        let (runtime, _) = runtime_with(
            ResponseShape::Sse,
            FakeBehavior::Whole(serde_json::json!({
                "choices": [{"message": {"content": "done"}, "finish_reason": "stop"}]
            })),
        );
        let events = collect(runtime.stream_chat(payload().non_streaming(), AbortSignal::never())).await;
        assert_eq!(events, vec![StreamEvent::text("done"), StreamEvent::done(Some("stop"))]);
    }

    #[tokio::test]
    async fn abort_ends_a_stalled_stream_with_cancelled() {
        let (runtime, _) = runtime_with(
            ResponseShape::PlainText,
            FakeBehavior::ChunksThenPending(vec!["first"]),
        );
        let handle = AbortHandle::new();
        let mut stream = runtime.stream_chat(payload(), handle.signal());
        assert_eq!(stream.next().await, Some(StreamEvent::text("first")));
        handle.abort();
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("abort honored");
        assert_eq!(next, Some(StreamEvent::Error(ProviderError::Cancelled)));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn stream_chat_with_runs_callbacks_before_returning() {
        let (runtime, _) = runtime_with(
            ResponseShape::Sse,
            FakeBehavior::Chunks(vec![
                Ok("data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n"),
                Ok("data: {\"choices\":[{\"delta\":{\"content\":\"y\",\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"function\":{\"name\":\"f\",\"arguments\":\"{}\"}}]},\"finish_reason\":\"stop\"}]}\n\n"),
            ]),
        );
        let seen = Arc::new(Mutex::new(String::new()));
        let sink = seen.clone();
        let summary = runtime
            .stream_chat_with(
                payload(),
                AbortSignal::never(),
                StreamCallbacks::new().on_text(move |delta| sink.lock().expect("lock").push_str(delta)),
            )
            .await
            .expect("summary");
        assert_eq!(seen.lock().expect("lock").as_str(), "Hey");
        assert_eq!(summary.text, "Hey");
        assert_eq!(summary.finish_reason.as_deref(), Some("stop"));
        assert_eq!(summary.tool_calls[&0].name.as_deref(), Some("f"));
    }

    #[tokio::test]
    async fn stream_chat_with_reports_incomplete_stream() {
        let (runtime, _) = runtime_with(
            ResponseShape::Sse,
            FakeBehavior::Chunks(vec![Ok("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n")]),
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let result = runtime
            .stream_chat_with(
                payload(),
                AbortSignal::never(),
                StreamCallbacks::new().on_error(move |err| sink.lock().expect("lock").push(err.clone())),
            )
            .await;
        assert!(matches!(result, Err(ProviderError::StreamIncomplete { .. })));
        assert_eq!(errors.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn live_openai_smoke_when_key_present() {
        let env = EnvSource::process();
        let Some(_) = env.get("OPENAI_API_KEY") else {
            eprintln!("skipping live smoke test: OPENAI_API_KEY not set");
            return;
        };
        let profile = ProviderProfile::openai();
        let key = profile.resolve_api_key(&env).expect("key");
        let completer = crate::completer::HttpCompleter::new(&profile, key, Duration::from_secs(60))
            .expect("client");
        let runtime = ProviderRuntime::new(Arc::new(profile), Arc::new(completer), env);
        let summary = runtime
            .stream_chat_with(
                ChatPayload::new("gpt-4o-mini", vec![ChatMessage::user("Reply with: ok")]),
                AbortSignal::never(),
                StreamCallbacks::new(),
            )
            .await
            .expect("live completion");
        assert!(!summary.text.trim().is_empty());
    }
}
