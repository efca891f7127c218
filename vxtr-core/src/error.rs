use thiserror::Error;

/// Shorthand for results carrying an [`ExtractError`].
pub type ExtractResult<T> = Result<T, ExtractError>;

/// Transport-level failures raised by a model gateway before any usable
/// output exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The backend could not be reached, refused the request, or answered
    /// with something that is not a chat response.
    #[error("model gateway unavailable: {reason}")]
    Unavailable { reason: String },

    /// The backend accepted the request but produced nothing within the
    /// configured deadline.
    #[error("model call exceeded {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
}

/// Why a single attempt of the extraction loop did not produce a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// No JSON object could be recovered from the model output.
    #[error("output is not a parseable JSON object: {reason}")]
    Malformed { reason: String, raw_text: String },

    /// The output parsed but a field did not satisfy its declared type.
    #[error("field '{field}' expected {expected}, found {found}")]
    SchemaViolation {
        field: String,
        expected: String,
        found: String,
    },

    /// The gateway failed before validation could run.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Errors surfaced to callers of the extraction service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("unknown task kind '{0}'")]
    UnknownTaskKind(String),

    #[error("invalid schema for task '{task}': {reason}")]
    InvalidSchema { task: String, reason: String },

    /// Every attempt in the budget failed; carries the most recent failure.
    #[error("no valid output after {attempts} attempts: {last}")]
    RetryBudgetExhausted { attempts: u32, last: AttemptFailure },

    #[error("extraction cancelled")]
    Cancelled,
}
