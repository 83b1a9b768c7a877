use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatstream_runtime::{
    Clock, EventStream, ProviderError, ProviderId, StreamEvent, SystemClock, ToolCallFragment, Usage,
};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::errors::OperationFailure;
use crate::operation::{OperationId, OperationStatus, OperationTracker, Progress};
use crate::store::{
    ContentUpdate, MessagePatch, Performance, Reasoning, SharedMessageStore, ToolCall,
};

/// Which operation a stream belongs to and which message it writes.
#[derive(Clone, Debug)]
pub struct DispatchTarget {
    pub operation: OperationId,
    pub message_id: String,
    pub provider: ProviderId,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    Completed,
    Failed(OperationFailure),
    Cancelled,
}

/// What a dispatch applied before it ended.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub content: String,
    pub reasoning: Option<Reasoning>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    /// Only measured for completed streams that reported usage.
    pub performance: Option<Performance>,
    pub finish_reason: Option<String>,
    pub events_applied: u64,
}

struct Accumulator {
    clock: Arc<dyn Clock>,
    started: Instant,
    first_delta: Option<Instant>,
    performance: Option<Performance>,
    content: String,
    content_chars: u64,
    reasoning: String,
    reasoning_started: Option<Instant>,
    reasoning_duration: Option<Duration>,
    tool_calls: BTreeMap<usize, ToolCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    saw_done: bool,
    events_applied: u64,
}

impl Accumulator {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            started: clock.now(),
            clock,
            first_delta: None,
            performance: None,
            content: String::new(),
            content_chars: 0,
            reasoning: String::new(),
            reasoning_started: None,
            reasoning_duration: None,
            tool_calls: BTreeMap::new(),
            usage: None,
            finish_reason: None,
            saw_done: false,
            events_applied: 0,
        }
    }

    fn mark_first_delta(&mut self) -> Instant {
        let now = self.clock.now();
        self.first_delta.get_or_insert(now);
        now
    }

    fn push_text(&mut self, delta: &str) {
        self.mark_first_delta();
        self.stop_reasoning_clock();
        self.content.push_str(delta);
        self.content_chars += delta.chars().count() as u64;
    }

    fn push_reasoning(&mut self, delta: &str) {
        let now = self.mark_first_delta();
        self.reasoning_started.get_or_insert(now);
        self.reasoning.push_str(delta);
    }

    fn stop_reasoning_clock(&mut self) {
        if self.reasoning_duration.is_none()
            && let Some(started) = self.reasoning_started
        {
            self.reasoning_duration = Some(self.clock.now().saturating_duration_since(started));
        }
    }

    /// Time to first delta and output speed, once usage is known.
    fn measure(&mut self) -> Option<Performance> {
        let usage = self.usage.as_ref()?;
        let first = self.first_delta?;
        let now = self.clock.now();
        let output = now.saturating_duration_since(first);
        // Floor at 1ms so an instant reply still has a finite speed.
        let secs = output.max(Duration::from_millis(1)).as_secs_f64();
        let performance = Performance {
            ttft_ms: millis(first.saturating_duration_since(self.started)),
            tps: usage.completion_tokens as f64 / secs,
            latency_ms: millis(now.saturating_duration_since(self.started)),
            duration_ms: millis(output),
        };
        self.performance = Some(performance.clone());
        Some(performance)
    }

    fn merge_tool_call(&mut self, index: usize, fragment: ToolCallFragment) {
        self.mark_first_delta();
        let call = self.tool_calls.entry(index).or_default();
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
            call.name = name;
        }
        call.arguments.push_str(&fragment.arguments);
    }

    fn reasoning(&self) -> Option<Reasoning> {
        (!self.reasoning.is_empty()).then(|| Reasoning {
            content: self.reasoning.clone(),
            duration_ms: self.reasoning_duration.map(millis),
        })
    }

    fn finalized_tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .values()
            .cloned()
            .map(|mut call| {
                if call.arguments.trim().is_empty() {
                    call.arguments = "{}".to_string();
                }
                call
            })
            .collect()
    }

    fn into_report(self, outcome: DispatchOutcome) -> DispatchReport {
        DispatchReport {
            reasoning: self.reasoning(),
            tool_calls: self.finalized_tool_calls(),
            outcome,
            content: self.content,
            usage: self.usage,
            performance: self.performance,
            finish_reason: self.finish_reason,
            events_applied: self.events_applied,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Applies a normalized event stream to one message while its operation is
/// active.
///
/// Each event is fully applied (store write and progress report) before the
/// next one is pulled. Once the tracker says the operation is no longer
/// active, the stream is dropped without applying anything further.
#[derive(Clone)]
pub struct MessageStreamDispatcher {
    tracker: Arc<OperationTracker>,
    store: SharedMessageStore,
    clock: Arc<dyn Clock>,
}

impl MessageStreamDispatcher {
    pub fn new(tracker: Arc<OperationTracker>, store: SharedMessageStore) -> Self {
        Self::with_clock(tracker, store, Arc::new(SystemClock))
    }

    /// Dispatcher timing reasoning and generation speed with `clock`.
    pub fn with_clock(
        tracker: Arc<OperationTracker>,
        store: SharedMessageStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker,
            store,
            clock,
        }
    }

    pub async fn dispatch(&self, target: &DispatchTarget, events: EventStream) -> DispatchReport {
        let mut acc = Accumulator::new(self.clock.clone());
        let outcome = match self.pump(target, events, &mut acc).await {
            Ok(outcome) => outcome,
            Err(failure) => self.fail(target, failure, &mut acc).await,
        };
        debug!(
            operation_id = %target.operation,
            message_id = %target.message_id,
            outcome = ?outcome,
            events = acc.events_applied,
            "dispatch finished"
        );
        acc.into_report(outcome)
    }

    async fn pump(
        &self,
        target: &DispatchTarget,
        mut events: EventStream,
        acc: &mut Accumulator,
    ) -> Result<DispatchOutcome, OperationFailure> {
        let id = &target.operation;
        loop {
            let next = events.next().await;
            if !self.tracker.is_active(id) {
                drop(events);
                debug!(operation_id = %id, "operation no longer active, dropping stream");
                return Ok(DispatchOutcome::Cancelled);
            }
            let Some(event) = next else {
                break;
            };
            acc.events_applied += 1;

            match event {
                StreamEvent::Text(delta) => {
                    if delta.is_empty() {
                        continue;
                    }
                    acc.push_text(&delta);
                    self.store
                        .update_message_content(&target.message_id, ContentUpdate::Append(delta))
                        .await?;
                    self.tracker
                        .report_progress(id, Progress::new(acc.content_chars));
                }
                StreamEvent::Reasoning(delta) => {
                    acc.push_reasoning(&delta);
                    let patch = MessagePatch {
                        reasoning: Some(Reasoning {
                            content: acc.reasoning.clone(),
                            duration_ms: None,
                        }),
                        ..MessagePatch::default()
                    };
                    self.store.update_message(&target.message_id, patch).await?;
                }
                StreamEvent::ToolCallDelta { index, fragment } => {
                    acc.merge_tool_call(index, fragment);
                }
                StreamEvent::Usage(usage) => {
                    acc.usage = Some(usage);
                }
                StreamEvent::Error(ProviderError::Cancelled) => {
                    drop(events);
                    self.tracker.cancel(id, "aborted");
                    return Ok(DispatchOutcome::Cancelled);
                }
                StreamEvent::Error(error) => {
                    drop(events);
                    return Err(error.into());
                }
                StreamEvent::Done { finish_reason } => {
                    acc.saw_done = true;
                    if finish_reason.is_some() {
                        acc.finish_reason = finish_reason;
                    }
                }
            }
        }

        if !acc.saw_done {
            return Err(ProviderError::StreamIncomplete {
                provider: target.provider.clone(),
            }
            .into());
        }

        acc.stop_reasoning_clock();
        let tool_calls = acc.finalized_tool_calls();
        let patch = MessagePatch {
            reasoning: acc.reasoning(),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            usage: acc.usage.clone(),
            performance: acc.measure(),
            finish_reason: acc.finish_reason.clone(),
            ..MessagePatch::default()
        };
        if !patch.is_empty() {
            self.store.update_message(&target.message_id, patch).await?;
        }

        if self.tracker.complete(id) {
            Ok(DispatchOutcome::Completed)
        } else {
            Ok(self.settled_outcome(id))
        }
    }

    async fn fail(
        &self,
        target: &DispatchTarget,
        failure: OperationFailure,
        acc: &mut Accumulator,
    ) -> DispatchOutcome {
        let id = &target.operation;
        if !self.tracker.is_active(id) {
            return self.settled_outcome(id);
        }
        acc.stop_reasoning_clock();
        if let Some(reasoning) = acc.reasoning() {
            let patch = MessagePatch {
                reasoning: Some(reasoning),
                ..MessagePatch::default()
            };
            if let Err(err) = self.store.update_message(&target.message_id, patch).await {
                warn!(operation_id = %id, error = %err, "could not save partial reasoning");
            }
        }
        if let Err(err) = self
            .store
            .update_message_error(&target.message_id, Some(failure.clone()))
            .await
        {
            warn!(operation_id = %id, error = %err, "could not record failure on message");
        }
        self.tracker.fail(id, failure.clone());
        DispatchOutcome::Failed(failure)
    }

    /// Outcome of an operation some other party already finished.
    fn settled_outcome(&self, id: &OperationId) -> DispatchOutcome {
        match self.tracker.get(id) {
            Some(op) if op.status == OperationStatus::Failed => DispatchOutcome::Failed(
                op.failure
                    .unwrap_or(OperationFailure::Provider(ProviderError::Cancelled)),
            ),
            Some(op) if op.status == OperationStatus::Completed => DispatchOutcome::Completed,
            _ => DispatchOutcome::Cancelled,
        }
    }
}
