use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("Translation failure: {0}")]
    TranslationFailure(String),

    #[error("Unauthorized operation: {0}")]
    UnauthorizedOperation(String),

    #[error("Execution failure at `{fragment}`: {reason}")]
    ExecutionFailure { fragment: String, reason: String },

    #[error("Narration failure: {0}")]
    NarrationFailure(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AssistantError {
    pub fn execution(fragment: impl Into<String>, reason: impl Into<String>) -> Self {
        AssistantError::ExecutionFailure {
            fragment: fragment.into(),
            reason: reason.into(),
        }
    }

    /// True for the kind that is answered with the read-only refusal.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AssistantError::UnauthorizedOperation(_))
    }
}

pub type Result<T> = std::result::Result<T, AssistantError>;
