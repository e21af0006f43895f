use shardflow_store::{ErrorKind as StoreErrorKind, StoreError};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("External tool failed ({status}): {stderr}")]
    ExternalTool { status: String, stderr: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Resource request exceeds worker capacity: {0}")]
    ResourceExceeded(String),

    #[error("Dependency cycle detected while expanding job {0}")]
    CycleDetected(Uuid),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Input of job {consumer} references job {producer} which has no committed outputs")]
    UnresolvedInput { consumer: Uuid, producer: Uuid },

    #[error("Unknown handler kind: {0}")]
    UnknownHandler(String),

    #[error("Job {name} ({id}) permanently failed after {attempts} attempts: {reason}")]
    PermanentFailure {
        id: Uuid,
        name: String,
        attempts: u32,
        reason: String,
    },

    #[error("No runnable or running jobs but the run is incomplete")]
    Stalled,

    #[error("Run aborted")]
    Aborted,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    /// Retry category of this error.
    ///
    /// Carried by the variant rather than recovered from the message text, so
    /// the scheduler's retry decision cannot drift from the error site.
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Store(e) => match e.kind {
                StoreErrorKind::Io => ErrorCategory::Transient,
                StoreErrorKind::NotFound | StoreErrorKind::Corrupt => ErrorCategory::Fatal,
            },
            EngineError::ExternalTool { .. }
            | EngineError::Parse(_)
            | EngineError::Io(_)
            | EngineError::Database(_)
            | EngineError::Other(_) => ErrorCategory::Transient,
            EngineError::JobFailed(_) => ErrorCategory::Permanent,
            EngineError::ResourceExceeded(_)
            | EngineError::CycleDetected(_)
            | EngineError::InvalidStateTransition { .. }
            | EngineError::JobNotFound(_)
            | EngineError::UnresolvedInput { .. }
            | EngineError::UnknownHandler(_)
            | EngineError::PermanentFailure { .. }
            | EngineError::Stalled
            | EngineError::Aborted
            | EngineError::Serialization(_)
            | EngineError::Config(_) => ErrorCategory::Fatal,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Retry the job, up to its retry budget (tool crash, transient I/O)
    Transient,
    /// Fail the job immediately, no retries (definitive bad input)
    Permanent,
    /// Abort the whole run (structural bug: cycle, dangling handle, config)
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Fatal => "fatal",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "fatal" => Ok(ErrorCategory::Fatal),
            _ => Err(EngineError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Fatal,
        ] {
            let s = category.as_str();
            let parsed = ErrorCategory::from_str(s).unwrap();
            assert_eq!(*category, parsed);
        }
    }

    #[test]
    fn test_error_category_invalid() {
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_tool_errors_are_transient() {
        let err = EngineError::ExternalTool {
            status: "exit code 2".to_string(),
            stderr: "boom".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_dangling_handle_is_fatal() {
        let err = EngineError::Store(StoreError::not_found("sha256:dead"));
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_store_io_is_transient() {
        let err = EngineError::Store(StoreError::io("disk hiccup"));
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_structural_errors_are_fatal() {
        let err = EngineError::CycleDetected(Uuid::new_v4());
        assert_eq!(err.category(), ErrorCategory::Fatal);

        let err = EngineError::ResourceExceeded("needs 128 cores".to_string());
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }
}
