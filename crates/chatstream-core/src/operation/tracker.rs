use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatstream_runtime::{AbortHandle, AbortSignal, Clock, SystemClock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::types::{
    CancelHandler, Operation, OperationContext, OperationFilter, OperationId, OperationMetadata,
    OperationStatus, OperationType, OperationUpdate, Progress,
};
use crate::errors::{CoreError, OperationFailure};

/// How long finished operations stay visible before automatic cleanup.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

const UPDATE_CHANNEL_CAPACITY: usize = 256;

struct Entry {
    op: Operation,
    abort: AbortHandle,
    handlers: Vec<CancelHandler>,
}

#[derive(Default)]
struct Inner {
    ops: HashMap<OperationId, Entry>,
    /// message id -> operation holding write authority over it
    writers: HashMap<String, OperationId>,
}

impl Inner {
    fn release_writer(&mut self, message_id: Option<&str>, id: &OperationId) {
        if let Some(message_id) = message_id
            && self.writers.get(message_id) == Some(id)
        {
            self.writers.remove(message_id);
        }
    }
}

type DeferredHandler = (OperationId, String, CancelHandler);

/// Owner of every in-flight operation.
///
/// All transitions go through here, and it is the authority every writer
/// asks before touching a message. Redundant transitions are ignored rather
/// than reported, so a cancel racing a nearly finished task is harmless.
///
/// Updates are broadcast while the internal lock is held, so subscribers see
/// them in transition order.
pub struct OperationTracker {
    inner: Mutex<Inner>,
    updates: broadcast::Sender<OperationUpdate>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_RETENTION)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, retention: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            updates,
            clock,
            retention,
        }
    }

    /// Opens a running top-level operation.
    ///
    /// For chat generation on a message, the current writer of that message
    /// is cancelled before the new operation exists.
    pub fn start(&self, op_type: OperationType, context: OperationContext) -> OperationId {
        self.cleanup_completed(self.retention);
        let mut deferred = Vec::new();
        let id = {
            let mut inner = self.lock();
            self.insert_locked(&mut inner, op_type, context, None, None, &mut deferred)
        };
        run_cancel_handlers(deferred);
        id
    }

    /// Like [`start`](Self::start) with a display label.
    pub fn start_labeled(
        &self,
        op_type: OperationType,
        context: OperationContext,
        label: impl Into<String>,
    ) -> OperationId {
        self.cleanup_completed(self.retention);
        let mut deferred = Vec::new();
        let id = {
            let mut inner = self.lock();
            self.insert_locked(
                &mut inner,
                op_type,
                context,
                None,
                Some(label.into()),
                &mut deferred,
            )
        };
        run_cancel_handlers(deferred);
        id
    }

    /// Opens an operation nested under `parent`. Unset context fields are
    /// taken from the parent; cancelling the parent cancels the child.
    pub fn start_child(
        &self,
        parent: &OperationId,
        op_type: OperationType,
        context: OperationContext,
    ) -> Result<OperationId, CoreError> {
        let mut deferred = Vec::new();
        let id = {
            let mut inner = self.lock();
            let Some(parent_entry) = inner.ops.get(parent) else {
                return Err(CoreError::UnknownOperation(parent.to_string()));
            };
            let context = context.inherit(&parent_entry.op.context);
            let id = self.insert_locked(
                &mut inner,
                op_type,
                context,
                Some(parent.clone()),
                None,
                &mut deferred,
            );
            if let Some(parent_entry) = inner.ops.get_mut(parent) {
                parent_entry.op.children.push(id.clone());
            }
            id
        };
        run_cancel_handlers(deferred);
        Ok(id)
    }

    fn insert_locked(
        &self,
        inner: &mut Inner,
        op_type: OperationType,
        context: OperationContext,
        parent: Option<OperationId>,
        label: Option<String>,
        deferred: &mut Vec<DeferredHandler>,
    ) -> OperationId {
        let id = OperationId::generate();
        if op_type.holds_write_authority()
            && let Some(message_id) = context.message_id.clone()
        {
            if let Some(prior) = inner.writers.get(&message_id).cloned() {
                self.cancel_locked(inner, &prior, "superseded by a new generation", deferred);
            }
            inner.writers.insert(message_id, id.clone());
        }

        let op = Operation {
            id: id.clone(),
            op_type,
            status: OperationStatus::Running,
            context: context.clone(),
            parent,
            children: Vec::new(),
            label,
            metadata: OperationMetadata {
                started_at: self.clock.now(),
                ended_at: None,
                duration: None,
                progress: None,
                cancel_reason: None,
            },
            failure: None,
        };
        inner.ops.insert(
            id.clone(),
            Entry {
                op,
                abort: AbortHandle::new(),
                handlers: Vec::new(),
            },
        );
        debug!(operation_id = %id, ?op_type, message_id = ?context.message_id, "operation started");
        self.emit(OperationUpdate::Started {
            id: id.clone(),
            op_type,
            context,
        });
        id
    }

    /// Notifies subscribers of incremental progress. Ignored unless running.
    pub fn report_progress(&self, id: &OperationId, progress: Progress) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.ops.get_mut(id).filter(|e| e.op.is_active()) else {
            debug!(operation_id = %id, "dropping progress for inactive operation");
            return false;
        };
        entry.op.metadata.progress = Some(progress.clone());
        self.emit(OperationUpdate::Progress {
            id: id.clone(),
            progress,
        });
        true
    }

    /// Marks the operation completed. Returns `false` if it had already
    /// finished.
    pub fn complete(&self, id: &OperationId) -> bool {
        self.finish(id, OperationStatus::Completed, None)
    }

    /// Marks the operation failed. Returns `false` if it had already
    /// finished.
    pub fn fail(&self, id: &OperationId, failure: OperationFailure) -> bool {
        self.finish(id, OperationStatus::Failed, Some(failure))
    }

    fn finish(
        &self,
        id: &OperationId,
        status: OperationStatus,
        failure: Option<OperationFailure>,
    ) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        let Some(entry) = inner.ops.get_mut(id) else {
            debug!(operation_id = %id, ?status, "transition on unknown operation ignored");
            return false;
        };
        if entry.op.status.is_terminal() {
            debug!(operation_id = %id, current = ?entry.op.status, requested = ?status, "operation already finished");
            return false;
        }
        entry.op.status = status;
        entry.op.metadata.ended_at = Some(now);
        entry.op.metadata.duration = Some(now.duration_since(entry.op.metadata.started_at));
        if let Some(failure) = &failure {
            warn!(operation_id = %id, error = %failure, "operation failed");
        }
        entry.op.failure = failure;
        entry.handlers.clear();
        let message_id = entry.op.context.message_id.clone();
        inner.release_writer(message_id.as_deref(), id);
        self.emit(OperationUpdate::Finished {
            id: id.clone(),
            status,
        });
        true
    }

    /// Cancels the operation and its children: fires the abort signal, runs
    /// cancel handlers, marks it cancelled. No-op once finished.
    pub fn cancel(&self, id: &OperationId, reason: &str) -> bool {
        let mut deferred = Vec::new();
        let cancelled = {
            let mut inner = self.lock();
            self.cancel_locked(&mut inner, id, reason, &mut deferred)
        };
        run_cancel_handlers(deferred);
        cancelled
    }

    fn cancel_locked(
        &self,
        inner: &mut Inner,
        id: &OperationId,
        reason: &str,
        deferred: &mut Vec<DeferredHandler>,
    ) -> bool {
        let now = self.clock.now();
        let Some(entry) = inner.ops.get_mut(id) else {
            debug!(operation_id = %id, "cancel on unknown operation ignored");
            return false;
        };
        if entry.op.status.is_terminal() {
            return false;
        }
        entry.abort.abort();
        entry.op.status = OperationStatus::Cancelled;
        entry.op.metadata.ended_at = Some(now);
        entry.op.metadata.duration = Some(now.duration_since(entry.op.metadata.started_at));
        entry.op.metadata.cancel_reason = Some(reason.to_string());
        deferred.extend(
            entry
                .handlers
                .drain(..)
                .map(|handler| (id.clone(), reason.to_string(), handler)),
        );
        let children = entry.op.children.clone();
        let message_id = entry.op.context.message_id.clone();
        inner.release_writer(message_id.as_deref(), id);
        info!(operation_id = %id, reason, "operation cancelled");
        self.emit(OperationUpdate::Finished {
            id: id.clone(),
            status: OperationStatus::Cancelled,
        });

        for child in children {
            self.cancel_locked(inner, &child, reason, deferred);
        }
        true
    }

    /// Cancels every active operation matched by `filter`; returns how many
    /// were cancelled, children included.
    pub fn cancel_matching(&self, filter: &OperationFilter, reason: &str) -> usize {
        let mut deferred = Vec::new();
        let count = {
            let mut inner = self.lock();
            let mut targets: Vec<(std::time::Instant, OperationId)> = inner
                .ops
                .values()
                .filter(|e| e.op.is_active() && filter.matches(&e.op))
                .map(|e| (e.op.metadata.started_at, e.op.id.clone()))
                .collect();
            targets.sort();
            let before = active_count(&inner);
            for (_, id) in &targets {
                self.cancel_locked(&mut inner, id, reason, &mut deferred);
            }
            before - active_count(&inner)
        };
        run_cancel_handlers(deferred);
        count
    }

    pub fn cancel_all(&self, reason: &str) -> usize {
        self.cancel_matching(&OperationFilter::default(), reason)
    }

    /// Registers a callback run on cancellation. Returns `false` (and drops
    /// the handler) when the operation is unknown or finished.
    pub fn on_cancel(&self, id: &OperationId, handler: CancelHandler) -> bool {
        let mut inner = self.lock();
        match inner.ops.get_mut(id).filter(|e| e.op.is_active()) {
            Some(entry) => {
                entry.handlers.push(handler);
                true
            }
            None => false,
        }
    }

    /// Records that `id` writes to `message_id`.
    ///
    /// Another operation still writing that message is cancelled first, so a
    /// message never has two active writers.
    pub fn associate(&self, message_id: &str, id: &OperationId) -> bool {
        let mut deferred = Vec::new();
        let associated = {
            let mut inner = self.lock();
            let Some(entry) = inner.ops.get_mut(id).filter(|e| e.op.is_active()) else {
                return false;
            };
            if entry.op.context.message_id.is_none() {
                entry.op.context.message_id = Some(message_id.to_string());
            }
            if let Some(prior) = inner.writers.get(message_id).cloned()
                && prior != *id
            {
                self.cancel_locked(
                    &mut inner,
                    &prior,
                    "superseded by a new generation",
                    &mut deferred,
                );
            }
            inner.writers.insert(message_id.to_string(), id.clone());
            true
        };
        run_cancel_handlers(deferred);
        associated
    }

    /// The active operation holding write authority over `message_id`.
    pub fn active_writer(&self, message_id: &str) -> Option<OperationId> {
        let inner = self.lock();
        inner
            .writers
            .get(message_id)
            .filter(|id| inner.ops.get(*id).is_some_and(|e| e.op.is_active()))
            .cloned()
    }

    /// Forgets finished operations that ended at least `older_than` ago.
    pub fn cleanup_completed(&self, older_than: Duration) -> usize {
        let now = self.clock.now();
        let mut inner = self.lock();
        let before = inner.ops.len();
        inner.ops.retain(|_, entry| {
            entry
                .op
                .metadata
                .ended_at
                .is_none_or(|ended| now.duration_since(ended) < older_than)
        });
        let Inner { ops, writers } = &mut *inner;
        writers.retain(|_, id| ops.contains_key(id));
        let removed = before - inner.ops.len();
        if removed > 0 {
            debug!(removed, "cleaned up finished operations");
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationUpdate> {
        self.updates.subscribe()
    }

    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.lock().ops.get(id).map(|e| e.op.clone())
    }

    pub fn status(&self, id: &OperationId) -> Option<OperationStatus> {
        self.lock().ops.get(id).map(|e| e.op.status)
    }

    pub fn is_active(&self, id: &OperationId) -> bool {
        self.status(id).is_some_and(|s| !s.is_terminal())
    }

    /// Signal fired when the operation is cancelled.
    pub fn abort_signal(&self, id: &OperationId) -> Option<AbortSignal> {
        self.lock().ops.get(id).map(|e| e.abort.signal())
    }

    /// Snapshots of operations matching `filter`, oldest first.
    pub fn operations(&self, filter: &OperationFilter) -> Vec<Operation> {
        let inner = self.lock();
        let mut ops: Vec<Operation> = inner
            .ops
            .values()
            .filter(|e| filter.matches(&e.op))
            .map(|e| e.op.clone())
            .collect();
        ops.sort_by_key(|op| op.metadata.started_at);
        ops
    }

    fn emit(&self, update: OperationUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn active_count(inner: &Inner) -> usize {
    inner.ops.values().filter(|e| e.op.is_active()).count()
}

fn run_cancel_handlers(deferred: Vec<DeferredHandler>) {
    for (id, reason, handler) in deferred {
        if catch_unwind(AssertUnwindSafe(|| handler(&id, &reason))).is_err() {
            warn!(operation_id = %id, "cancel handler panicked");
        }
    }
}
