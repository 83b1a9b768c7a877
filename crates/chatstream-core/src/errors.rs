use chatstream_runtime::{ProviderError, ProviderId, RuntimeError};

/// What a failed operation records.
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OperationFailure {
    /// Failure reported by the provider runtime, kept verbatim.
    #[error("{0}")]
    Provider(ProviderError),
    /// The message store rejected a write.
    #[error("store error: {message}")]
    Store { message: String },
}

impl From<ProviderError> for OperationFailure {
    fn from(value: ProviderError) -> Self {
        Self::Provider(value)
    }
}

impl From<StoreError> for OperationFailure {
    fn from(value: StoreError) -> Self {
        Self::Store {
            message: value.to_string(),
        }
    }
}

/// Message store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message not found: {id}")]
    NotFound { id: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Orchestration errors raised before an operation can run.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown message: {0}")]
    UnknownMessage(String),
    #[error("message {0} has no content to process")]
    EmptyMessage(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("no runtime registered for provider {0}")]
    UnknownProvider(ProviderId),
    #[error("settings error: {0}")]
    Settings(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl CoreError {
    pub fn settings(message: impl Into<String>) -> Self {
        Self::Settings(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_failure_serializes_with_both_tags() {
        let failure = OperationFailure::from(ProviderError::transport("acme", "refused"));
        let value = serde_json::to_value(&failure).expect("serialize");
        assert_eq!(value["source"], "provider");
        assert_eq!(value["type"], "transport");
        assert_eq!(value["message"], "refused");
        let back: OperationFailure = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, failure);
    }
}
