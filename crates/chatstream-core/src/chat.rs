use std::sync::Arc;

use chatstream_runtime::{AbortSignal, ChatPayload, EventStream, ProviderId};
use tokio::task::JoinHandle;
use tracing::info;

use crate::dispatcher::{DispatchReport, DispatchTarget, MessageStreamDispatcher};
use crate::errors::CoreError;
use crate::operation::{OperationContext, OperationId, OperationTracker, OperationType};
use crate::runtime_set::RuntimeSet;
use crate::store::SharedMessageStore;

/// A chat reply to generate into an existing message.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub provider: ProviderId,
    pub payload: ChatPayload,
    pub message_id: String,
    pub session_id: Option<String>,
    pub topic_id: Option<String>,
}

impl ChatRequest {
    pub fn new(
        provider: impl Into<ProviderId>,
        payload: ChatPayload,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            payload,
            message_id: message_id.into(),
            session_id: None,
            topic_id: None,
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
}

/// Primary chat path: one tracked operation streaming into one message.
#[derive(Clone)]
pub struct ChatGeneration {
    tracker: Arc<OperationTracker>,
    runtimes: Arc<RuntimeSet>,
    dispatcher: MessageStreamDispatcher,
}

impl ChatGeneration {
    pub fn new(
        tracker: Arc<OperationTracker>,
        store: SharedMessageStore,
        runtimes: Arc<RuntimeSet>,
    ) -> Self {
        let dispatcher = MessageStreamDispatcher::new(tracker.clone(), store);
        Self {
            tracker,
            runtimes,
            dispatcher,
        }
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    /// Starts the generation and drives it on a background task.
    ///
    /// The operation exists (and any previous writer of the message is
    /// cancelled) by the time this returns.
    pub fn spawn(
        &self,
        request: ChatRequest,
    ) -> Result<(OperationId, JoinHandle<DispatchReport>), CoreError> {
        let (target, events) = self.begin(request)?;
        let operation = target.operation.clone();
        let dispatcher = self.dispatcher.clone();
        let handle = tokio::spawn(async move { dispatcher.dispatch(&target, events).await });
        Ok((operation, handle))
    }

    /// Runs the generation to its end on the current task.
    pub async fn run(&self, request: ChatRequest) -> Result<DispatchReport, CoreError> {
        let (target, events) = self.begin(request)?;
        Ok(self.dispatcher.dispatch(&target, events).await)
    }

    /// Cancels whatever generation is writing `message_id`.
    pub fn stop(&self, message_id: &str) -> bool {
        match self.tracker.active_writer(message_id) {
            Some(id) => self.tracker.cancel(&id, "stopped by user"),
            None => false,
        }
    }

    fn begin(&self, request: ChatRequest) -> Result<(DispatchTarget, EventStream), CoreError> {
        let runtime = self.runtimes.get(&request.provider)?;
        let context = OperationContext {
            message_id: Some(request.message_id.clone()),
            session_id: request.session_id,
            topic_id: request.topic_id,
        };
        let label = format!("{}/{}", request.provider, request.payload.model);
        let operation = self
            .tracker
            .start_labeled(OperationType::GenerateChat, context, label);
        info!(operation_id = %operation, message_id = %request.message_id, provider = %request.provider, model = %request.payload.model, "chat generation started");
        let abort = self
            .tracker
            .abort_signal(&operation)
            .unwrap_or_else(AbortSignal::never);
        let events = runtime.stream_chat(request.payload, abort);
        Ok((
            DispatchTarget {
                operation,
                message_id: request.message_id,
                provider: request.provider,
            },
            events,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatchOutcome;
    use crate::operation::{OperationStatus, OperationUpdate};
    use crate::store::{InMemoryMessageStore, MessageStore, NewMessage};
    use crate::testing::{FAKE_PROVIDER, Script, fake_runtimes};
    use chatstream_runtime::ChatMessage;
    use std::time::Duration;

    async fn setup(script: Script) -> (ChatGeneration, InMemoryMessageStore, String) {
        let store = InMemoryMessageStore::new();
        let message_id = store
            .create_message(NewMessage::assistant_placeholder())
            .await
            .expect("create");
        let (runtimes, _) = fake_runtimes(script);
        let chat = ChatGeneration::new(
            Arc::new(OperationTracker::new()),
            Arc::new(store.clone()),
            runtimes,
        );
        (chat, store, message_id)
    }

    fn request(message_id: &str) -> ChatRequest {
        ChatRequest::new(
            FAKE_PROVIDER,
            ChatPayload::new("fake-model", vec![ChatMessage::user("hi")]),
            message_id,
        )
    }

    async fn content(store: &InMemoryMessageStore, id: &str) -> String {
        store
            .get_message(id)
            .await
            .expect("get")
            .expect("exists")
            .content
    }

    #[tokio::test]
    async fn plain_text_chunks_complete_the_message() {
        let (chat, store, message_id) = setup(Script::Chunks(vec!["Hel", "lo", " world"])).await;
        let report = chat.run(request(&message_id)).await.expect("run");

        assert_eq!(report.outcome, DispatchOutcome::Completed);
        assert_eq!(content(&store, &message_id).await, "Hello world");
        let ops = chat.tracker().operations(&Default::default());
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, OperationStatus::Completed);
        assert_eq!(ops[0].label.as_deref(), Some("fake/fake-model"));
    }

    #[tokio::test]
    async fn stopping_mid_stream_keeps_the_prefix() {
        let (chat, store, message_id) =
            setup(Script::ChunksThenPending(vec!["Hel", "lo"])).await;
        let (operation, handle) = chat.spawn(request(&message_id)).expect("spawn");

        for _ in 0..200 {
            if content(&store, &message_id).await == "Hello" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(chat.stop(&message_id));

        let report = handle.await.expect("join");
        assert_eq!(report.outcome, DispatchOutcome::Cancelled);
        assert_eq!(content(&store, &message_id).await, "Hello");
        assert_eq!(
            chat.tracker().status(&operation),
            Some(OperationStatus::Cancelled)
        );
        assert!(!chat.stop(&message_id));
    }

    #[tokio::test]
    async fn regenerating_cancels_the_previous_writer_first() {
        let (chat, _store, message_id) = setup(Script::ChunksThenPending(vec!["x"])).await;
        let mut updates = chat.tracker().subscribe();

        let (first, first_handle) = chat.spawn(request(&message_id)).expect("spawn");
        let (second, second_handle) = chat.spawn(request(&message_id)).expect("spawn");

        assert_eq!(
            first_handle.await.expect("join").outcome,
            DispatchOutcome::Cancelled
        );
        let mut order = Vec::new();
        while let Ok(update) = updates.try_recv() {
            match update {
                OperationUpdate::Started { id, .. } => order.push(format!("start {id}")),
                OperationUpdate::Finished { id, status } => {
                    order.push(format!("{status:?} {id}"))
                }
                OperationUpdate::Progress { .. } => {}
            }
        }
        let cancelled_at = order
            .iter()
            .position(|e| *e == format!("Cancelled {first}"))
            .expect("first cancelled");
        let second_started_at = order
            .iter()
            .position(|e| *e == format!("start {second}"))
            .expect("second started");
        assert!(cancelled_at < second_started_at);

        chat.tracker().cancel_all("test over");
        assert_eq!(
            second_handle.await.expect("join").outcome,
            DispatchOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected_before_starting() {
        let (chat, _store, message_id) = setup(Script::Chunks(vec![])).await;
        let mut request = request(&message_id);
        request.provider = ProviderId::new("nobody");
        assert!(matches!(
            chat.run(request).await,
            Err(CoreError::UnknownProvider(_))
        ));
        assert!(chat.tracker().operations(&Default::default()).is_empty());
    }
}
