//! Scripted collaborators shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chatstream_runtime::{
    AbortSignal, AuthScheme, ChatCompleter, CompletionResponse, EnvSource, ModelRef,
    OutgoingRequest, ProviderError, ProviderProfile, ProviderRuntime, ResponseShape,
};
use futures::{StreamExt, stream};

use crate::config::SystemAgentSettings;
use crate::errors::{OperationFailure, StoreError};
use crate::runtime_set::RuntimeSet;
use crate::store::{
    ContentUpdate, InMemoryMessageStore, MessageDraft, MessagePatch, MessageStore, NewMessage,
};

pub(crate) const FAKE_PROVIDER: &str = "fake";

pub(crate) enum Script {
    Chunks(Vec<&'static str>),
    /// Sends the chunks, then stalls until aborted.
    ChunksThenPending(Vec<&'static str>),
    Fail(ProviderError),
    /// Picks the chunks of the first route whose needle occurs in the request body.
    Routed(Vec<(&'static str, Vec<&'static str>)>),
}

pub(crate) struct ScriptedCompleter {
    pub requests: Mutex<Vec<OutgoingRequest>>,
    script: Script,
}

impl ScriptedCompleter {
    pub(crate) fn requests(&self) -> Vec<OutgoingRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

fn body(chunks: &[&'static str]) -> Vec<Result<Bytes, ProviderError>> {
    chunks
        .iter()
        .map(|c| Ok(Bytes::from_static(c.as_bytes())))
        .collect()
}

#[async_trait]
impl ChatCompleter for ScriptedCompleter {
    async fn create(
        &self,
        request: OutgoingRequest,
        _abort: AbortSignal,
    ) -> Result<CompletionResponse, ProviderError> {
        let raw = request.body.to_string();
        self.requests.lock().expect("lock").push(request);
        match &self.script {
            Script::Chunks(chunks) => Ok(CompletionResponse::Stream(Box::pin(stream::iter(
                body(chunks),
            )))),
            Script::ChunksThenPending(chunks) => Ok(CompletionResponse::Stream(Box::pin(
                stream::iter(body(chunks)).chain(stream::pending()),
            ))),
            Script::Fail(err) => Err(err.clone()),
            Script::Routed(routes) => {
                let (_, chunks) = routes
                    .iter()
                    .find(|(needle, _)| raw.contains(needle))
                    .ok_or_else(|| ProviderError::transport(FAKE_PROVIDER, "no route"))?;
                Ok(CompletionResponse::Stream(Box::pin(stream::iter(body(chunks)))))
            }
        }
    }
}

/// Plain-text runtime for provider `fake`, registered alone in a set.
pub(crate) fn fake_runtimes(script: Script) -> (Arc<RuntimeSet>, Arc<ScriptedCompleter>) {
    let mut profile = ProviderProfile::openai_compatible(FAKE_PROVIDER, "https://fake.test/v1");
    profile.auth = AuthScheme::None;
    profile.response_shape = ResponseShape::PlainText;
    let completer = Arc::new(ScriptedCompleter {
        requests: Mutex::new(Vec::new()),
        script,
    });
    let runtime = ProviderRuntime::new(Arc::new(profile), completer.clone(), EnvSource::empty());
    let set = RuntimeSet::builder()
        .register(Arc::new(runtime))
        .build()
        .expect("runtime set");
    (Arc::new(set), completer)
}

pub(crate) fn fake_agents() -> SystemAgentSettings {
    let model = ModelRef::new(FAKE_PROVIDER, "fake-model");
    SystemAgentSettings {
        translation: model.clone(),
        language_detection: model.clone(),
        summary: model,
        default_target_language: "en-US".into(),
    }
}

/// In-memory store that also keeps every patch it was given.
#[derive(Default)]
pub(crate) struct RecordingStore {
    pub inner: InMemoryMessageStore,
    pub patches: Mutex<Vec<MessagePatch>>,
}

impl RecordingStore {
    pub(crate) fn patches(&self) -> Vec<MessagePatch> {
        self.patches.lock().expect("lock").clone()
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn create_message(&self, message: NewMessage) -> Result<String, StoreError> {
        self.inner.create_message(message).await
    }

    async fn update_message_content(
        &self,
        id: &str,
        update: ContentUpdate,
    ) -> Result<(), StoreError> {
        self.inner.update_message_content(id, update).await
    }

    async fn update_message_error(
        &self,
        id: &str,
        error: Option<OperationFailure>,
    ) -> Result<(), StoreError> {
        self.inner.update_message_error(id, error).await
    }

    async fn update_message(&self, id: &str, patch: MessagePatch) -> Result<(), StoreError> {
        self.patches.lock().expect("lock").push(patch.clone());
        self.inner.update_message(id, patch).await
    }

    async fn get_message(&self, id: &str) -> Result<Option<MessageDraft>, StoreError> {
        self.inner.get_message(id).await
    }
}
