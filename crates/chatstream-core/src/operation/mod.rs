mod tracker;
mod types;

pub use tracker::{DEFAULT_RETENTION, OperationTracker};
pub use types::{
    CancelHandler, Operation, OperationContext, OperationFilter, OperationId, OperationMetadata,
    OperationStatus, OperationType, OperationUpdate, Progress,
};
