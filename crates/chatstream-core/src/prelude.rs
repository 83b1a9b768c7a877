pub use chatstream_runtime::prelude::*;

pub use crate::{
    AuxiliaryPipeline, ChatGeneration, ChatRequest, CoreError, DispatchOutcome, InMemoryMessageStore,
    MessageStore, NewMessage, OperationContext, OperationStatus, OperationTracker, OperationType,
    RuntimeSet, Settings,
};
