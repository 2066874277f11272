use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the CutSearch system
#[derive(Error, Debug)]
pub enum CsError {
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Selection error: {0}")]
    Selection(#[from] SelectionError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Failures while turning a raw instance into an embedding.
///
/// These are contained per instance: the instance is excluded from the
/// embedding set and the run continues.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Instance {instance} could not be read from {path:?}: {message}")]
    Unreadable {
        instance: String,
        path: PathBuf,
        message: String,
    },

    #[error("Instance {instance} is malformed at line {line}: {message}")]
    Parse {
        instance: String,
        line: usize,
        message: String,
    },

    #[error("Instance {instance} exceeds the {what} limit: {actual} > {limit}")]
    TooLarge {
        instance: String,
        what: String,
        actual: u64,
        limit: u64,
    },

    #[error("Instance {instance} has no {what}")]
    Empty { instance: String, what: String },
}

impl ExtractionError {
    pub fn instance(&self) -> &str {
        match self {
            Self::Unreadable { instance, .. }
            | Self::Parse { instance, .. }
            | Self::TooLarge { instance, .. }
            | Self::Empty { instance, .. } => instance,
        }
    }
}

/// Diversity-selection errors
#[derive(Error, Debug, PartialEq)]
pub enum SelectionError {
    #[error("Insufficient data: requested {requested} instances but only {available} embeddings are available")]
    InsufficientData { requested: usize, available: usize },

    #[error("Embedding dimension mismatch for {instance}: expected {expected}, got {actual}")]
    DimensionMismatch {
        instance: String,
        expected: usize,
        actual: usize,
    },

    #[error("Embedding for {instance} contains non-finite values")]
    NonFinite { instance: String },

    #[error("Duplicate instance id in embedding set: {instance}")]
    DuplicateInstance { instance: String },

    #[error("Seed instance not found: {instance}")]
    UnknownSeed { instance: String },
}

/// Job dispatch errors surfaced to callers of the dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Execution backend unreachable: {message}")]
    BackendUnreachable { message: String },

    #[error("Unknown job handle: {job_id}")]
    UnknownJob { job_id: String },

    #[error("Job rejected: {reason}")]
    Rejected { reason: String },

    #[error("Result log error: {message}")]
    ResultLog { message: String },
}

/// Setup and bookkeeping errors of the configuration search loop.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Invalid budget: {message}")]
    InvalidBudget { message: String },

    #[error("The instance subset is empty")]
    EmptySubset,

    #[error("Invalid configuration parameter {parameter}: {message}")]
    InvalidConfiguration { parameter: String, message: String },

    #[error("Search state is corrupted: {message}")]
    StateCorrupted { message: String },

    #[error("Search state at {path:?} belongs to a different run: {message}")]
    StateMismatch { path: PathBuf, message: String },

    #[error("Interrupted before {stage} completed")]
    Interrupted { stage: String },
}

/// Result type alias for CutSearch operations
pub type CsResult<T> = Result<T, CsError>;

/// Helper trait for converting string errors
pub trait IntoCsError {
    fn into_cs_error(self) -> CsError;
}

impl IntoCsError for String {
    fn into_cs_error(self) -> CsError {
        CsError::Internal(self)
    }
}

impl IntoCsError for &str {
    fn into_cs_error(self) -> CsError {
        CsError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::CsError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::CsError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CsError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = SelectionError::InsufficientData {
            requested: 40,
            available: 0,
        };

        assert!(error.to_string().contains("Insufficient data"));
        assert!(error.to_string().contains("40"));
    }

    #[test]
    fn test_error_conversion() {
        let extraction = ExtractionError::Empty {
            instance: "air04".to_string(),
            what: "rows".to_string(),
        };
        let cs_error: CsError = extraction.into();

        match cs_error {
            CsError::Extraction(e) => assert_eq!(e.instance(), "air04"),
            _ => panic!("Expected Extraction error"),
        }
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, CsError::Validation(_)));
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing required field: {}", "solver.program");
        assert!(config_err.to_string().contains("solver.program"));
    }
}
