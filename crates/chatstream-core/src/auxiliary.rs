use std::sync::Arc;

use chatstream_runtime::{AbortSignal, ChatPayload, ModelRef, ProviderError, StreamEvent};
use futures::StreamExt;
use tracing::{debug, info};

use crate::config::SystemAgentSettings;
use crate::errors::{CoreError, OperationFailure};
use crate::operation::{OperationContext, OperationId, OperationTracker, OperationType, Progress};
use crate::prompts;
use crate::runtime_set::RuntimeSet;
use crate::store::{MessageDraft, MessagePatch, SharedMessageStore, Translation};

#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    /// Final text of the task, trimmed.
    Completed(String),
    Failed(OperationFailure),
    Cancelled,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskReport {
    pub operation: OperationId,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn text(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Completed(text) => Some(text),
            _ => None,
        }
    }
}

/// Result of [`AuxiliaryPipeline::translate_message`].
#[derive(Clone, Debug, PartialEq)]
pub struct MessageTranslation {
    pub detection: TaskReport,
    pub translation: TaskReport,
    /// Source language recorded on the translation.
    pub source_language: Option<String>,
}

/// One-shot completions about an existing message.
///
/// Each task is its own tracked operation on the message's context. None of
/// them holds write authority, so they run alongside a chat generation on the
/// same message and only touch their own fields.
#[derive(Clone)]
pub struct AuxiliaryPipeline {
    tracker: Arc<OperationTracker>,
    store: SharedMessageStore,
    runtimes: Arc<RuntimeSet>,
    agents: SystemAgentSettings,
}

impl AuxiliaryPipeline {
    pub fn new(
        tracker: Arc<OperationTracker>,
        store: SharedMessageStore,
        runtimes: Arc<RuntimeSet>,
        agents: SystemAgentSettings,
    ) -> Self {
        Self {
            tracker,
            store,
            runtimes,
            agents,
        }
    }

    /// Translates the message content, writing the partial translation as it
    /// streams. `to` defaults to the configured target language.
    pub async fn translate(&self, message_id: &str, to: Option<&str>) -> Result<TaskReport, CoreError> {
        self.translate_from(message_id, None, to).await
    }

    /// Like [`translate`](Self::translate) with a known source language.
    pub async fn translate_from(
        &self,
        message_id: &str,
        from: Option<String>,
        to: Option<&str>,
    ) -> Result<TaskReport, CoreError> {
        let message = self.message(message_id).await?;
        let to = to
            .map(str::to_string)
            .unwrap_or_else(|| self.agents.default_target_language.clone());
        let model = &self.agents.translation;
        let payload = prompts::translate(&model.model, &message.content, from.as_deref(), &to);

        let translation = move |content: &str| MessagePatch {
            translation: Some(Translation {
                content: content.to_string(),
                from: from.clone(),
                to: to.clone(),
            }),
            ..MessagePatch::default()
        };
        let partial = translation.clone();
        self.run_task(
            OperationType::Translate,
            &message,
            model,
            payload,
            move |text| Some(partial(text)),
            translation,
        )
        .await
    }

    /// Detects the language of the message and records it.
    pub async fn detect_language(&self, message_id: &str) -> Result<TaskReport, CoreError> {
        let message = self.message(message_id).await?;
        let model = &self.agents.language_detection;
        let payload = prompts::detect_language(&model.model, &message.content);
        let mut report = self
            .run_task(
                OperationType::DetectLanguage,
                &message,
                model,
                payload,
                |_| None,
                |text| MessagePatch {
                    detected_language: prompts::parse_language_tag(text),
                    ..MessagePatch::default()
                },
            )
            .await?;
        if let TaskOutcome::Completed(text) = &report.outcome
            && let Some(tag) = prompts::parse_language_tag(text)
        {
            report.outcome = TaskOutcome::Completed(tag);
        }
        Ok(report)
    }

    /// Summarizes the message in `language` (default: the configured target
    /// language).
    pub async fn summarize(
        &self,
        message_id: &str,
        language: Option<&str>,
    ) -> Result<TaskReport, CoreError> {
        let message = self.message(message_id).await?;
        let language = language.unwrap_or(self.agents.default_target_language.as_str());
        let model = &self.agents.summary;
        let payload = prompts::summarize(&model.model, &message.content, language);
        self.run_task(
            OperationType::Summarize,
            &message,
            model,
            payload,
            |_| None,
            |text| MessagePatch {
                summary: Some(text.to_string()),
                ..MessagePatch::default()
            },
        )
        .await
    }

    /// Runs language detection and translation concurrently, then records the
    /// detected language as the translation's source.
    pub async fn translate_message(
        &self,
        message_id: &str,
        to: Option<&str>,
    ) -> Result<MessageTranslation, CoreError> {
        let (detection, translation) =
            tokio::join!(self.detect_language(message_id), self.translate(message_id, to));
        let (detection, translation) = (detection?, translation?);

        let source_language = detection.text().map(str::to_string);
        if let (Some(from), Some(content)) = (source_language.as_ref(), translation.text()) {
            let to = to
                .map(str::to_string)
                .unwrap_or_else(|| self.agents.default_target_language.clone());
            let patch = MessagePatch {
                translation: Some(Translation {
                    content: content.to_string(),
                    from: Some(from.clone()),
                    to,
                }),
                ..MessagePatch::default()
            };
            self.store.update_message(message_id, patch).await?;
        }
        Ok(MessageTranslation {
            detection,
            translation,
            source_language,
        })
    }

    async fn message(&self, message_id: &str) -> Result<MessageDraft, CoreError> {
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| CoreError::UnknownMessage(message_id.to_string()))?;
        if message.content.trim().is_empty() {
            return Err(CoreError::EmptyMessage(message_id.to_string()));
        }
        Ok(message)
    }

    /// Streams one completion into a single text buffer. `partial` may turn
    /// the buffer into a write after each delta; `finish` builds the final
    /// write from the trimmed text.
    async fn run_task(
        &self,
        op_type: OperationType,
        message: &MessageDraft,
        model: &ModelRef,
        payload: ChatPayload,
        mut partial: impl FnMut(&str) -> Option<MessagePatch> + Send,
        finish: impl FnOnce(&str) -> MessagePatch + Send,
    ) -> Result<TaskReport, CoreError> {
        let runtime = self.runtimes.get(&model.provider)?;
        let context = OperationContext {
            message_id: Some(message.id.clone()),
            session_id: message.session_id.clone(),
            topic_id: message.topic_id.clone(),
        };
        let id = self.tracker.start_labeled(
            op_type,
            context,
            format!("{}/{}", model.provider, model.model),
        );
        info!(operation_id = %id, ?op_type, message_id = %message.id, provider = %model.provider, "auxiliary task started");
        let abort = self
            .tracker
            .abort_signal(&id)
            .unwrap_or_else(AbortSignal::never);
        let mut events = runtime.stream_chat(payload, abort);

        let mut text = String::new();
        let mut saw_done = false;
        let mut finish = Some(finish);
        let outcome = loop {
            let next = events.next().await;
            if !self.tracker.is_active(&id) {
                debug!(operation_id = %id, "auxiliary task no longer active");
                break TaskOutcome::Cancelled;
            }
            match next {
                Some(StreamEvent::Text(delta)) => {
                    text.push_str(&delta);
                    self.tracker
                        .report_progress(&id, Progress::new(text.chars().count() as u64));
                    if let Some(patch) = partial(&text)
                        && let Err(err) = self.store.update_message(&message.id, patch).await
                    {
                        break self.fail(&id, err.into());
                    }
                }
                Some(StreamEvent::Error(ProviderError::Cancelled)) => {
                    self.tracker.cancel(&id, "aborted");
                    break TaskOutcome::Cancelled;
                }
                Some(StreamEvent::Error(err)) => break self.fail(&id, err.into()),
                Some(StreamEvent::Done { .. }) => saw_done = true,
                // Reasoning, tool calls and usage are not used here.
                Some(_) => {}
                None if !saw_done => {
                    break self.fail(
                        &id,
                        ProviderError::StreamIncomplete {
                            provider: model.provider.clone(),
                        }
                        .into(),
                    );
                }
                None => {
                    let result = text.trim().to_string();
                    let Some(finish) = finish.take() else {
                        break TaskOutcome::Completed(result);
                    };
                    if let Err(err) = self.store.update_message(&message.id, finish(&result)).await {
                        break self.fail(&id, err.into());
                    }
                    break if self.tracker.complete(&id) {
                        TaskOutcome::Completed(result)
                    } else {
                        TaskOutcome::Cancelled
                    };
                }
            }
        };
        debug!(operation_id = %id, outcome = ?outcome, "auxiliary task finished");
        Ok(TaskReport {
            operation: id,
            outcome,
        })
    }

    fn fail(&self, id: &OperationId, failure: OperationFailure) -> TaskOutcome {
        self.tracker.fail(id, failure.clone());
        TaskOutcome::Failed(failure)
    }
}
