use thiserror::Error;

/// Error kinds surfaced at the ContextManager boundary. Component-internal
/// errors are recoverable or tagged and bubbled up to here; no error ever
/// causes a user message to be lost from the session file.
#[derive(Debug, Error)]
pub enum CceError {
    #[error("unknown model id: {0}")]
    ProfileUnknown(String),

    #[error("budget unrecoverable after rollover; snapshot {snapshot_id}")]
    BudgetUnrecoverable { snapshot_id: String },

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider timed out after {0:?}")]
    ProviderTimeout(std::time::Duration),

    #[error("provider returned a malformed response: {0}")]
    ProviderMalformedResponse(String),

    #[error("failed to write session file: {0}")]
    SessionWriteFailed(String),

    #[error("failed to write snapshot file: {0}")]
    SnapshotWriteFailed(String),

    #[error("summarization lock timed out after {0:?}")]
    SummarizationTimeout(std::time::Duration),

    #[error("summarization already in progress")]
    SummarizationBusy,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
