use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Step cannot be replayed: {0}")]
    StepNotReplayable(String),

    #[error("Step execution is disabled: {0}")]
    StepExecutionDisabled(String),

    #[error("Step is not in a retryable state: {0}")]
    StepNotRetryable(String),

    #[error("Step has an unresolved approval: {0}")]
    ApprovalPending(String),

    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Approval expired: {0}")]
    ApprovalExpired(String),

    #[error("Revision conflict on workflow {0}")]
    RevisionConflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Queue closed: {0}")]
    QueueClosed(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}
