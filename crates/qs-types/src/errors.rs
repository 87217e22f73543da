use thiserror::Error;

/// Main error type for the scan engine
#[derive(Error, Debug)]
pub enum QsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Objective error: {0}")]
    Objective(#[from] ObjectiveError),

    #[error("Solver error: {0}")]
    Solver(#[from] SolverError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QsError {
    /// True for errors that must abort before any scan work starts.
    pub fn is_config(&self) -> bool {
        matches!(self, QsError::Config(_) | QsError::Objective(_))
    }
}

/// Input and configuration-shape errors. Always fatal, always reported at
/// load time with the offending field.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Field `{field}` has length {actual}, expected {expected}")]
    LengthMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown parameter identifier `{name}` in `{field}`")]
    UnknownParameter { field: String, name: String },

    #[error("Invalid value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Field `{field}` refers to stage {stage}, but the pipeline has {stages} stages")]
    StageOutOfRange {
        field: String,
        stage: usize,
        stages: usize,
    },

    #[error("Field `{field}` refers to Fourier mode {index}, but only {len} modes exist at that stage")]
    ModeOutOfRange {
        field: String,
        index: usize,
        len: usize,
    },

    #[error("Failed to parse input: {message}")]
    Parse { message: String },
}

/// Problems with an objective function definition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObjectiveError {
    #[error("Objective has no active terms (every weight is zero)")]
    NoActiveTerms,

    #[error("Weight for `{term}` must be finite and non-negative, got {weight}")]
    InvalidWeight { term: String, weight: f64 },
}

/// Numerical breakdown inside a stage. Non-fatal for the scan: the job that
/// hit it is recorded as failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Non-finite residual `{term}` at iteration {iteration}")]
    NonFiniteResidual { iteration: usize, term: String },

    #[error("Non-finite Jacobian column for `{parameter}` at iteration {iteration}")]
    NonFiniteJacobian { iteration: usize, parameter: String },

    #[error("Stage {stage} failed: {source}")]
    StageFailed {
        stage: usize,
        #[source]
        source: Box<SolverError>,
    },
}

/// Coordination and persistence errors in the scan driver.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Checkpoint write failed after {persisted} persisted results: {message}")]
    CheckpointFailed { persisted: usize, message: String },

    #[error("Result store could not be read: {message}")]
    StoreUnreadable { message: String },

    #[error("Worker {worker} disconnected: {message}")]
    WorkerLost { worker: usize, message: String },

    #[error("Job {index} panicked: {message}")]
    JobPanicked { index: usize, message: String },

    #[error("Stored result for grid point {index} does not belong to this grid: {message}")]
    StoreMismatch { index: usize, message: String },
}

/// Result type alias for scan engine operations
pub type QsResult<T> = Result<T, QsError>;

/// Macro for creating invalid-value configuration errors
#[macro_export]
macro_rules! config_error {
    ($field:expr, $($arg:tt)*) => {
        $crate::ConfigError::InvalidValue {
            field: $field.to_string(),
            message: format!($($arg)*),
        }
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::QsError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::LengthMismatch {
            field: "params_min".to_string(),
            expected: 3,
            actual: 2,
        };

        assert!(error.to_string().contains("params_min"));
        assert!(error.to_string().contains('3'));
        assert!(error.to_string().contains('2'));
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::Parse {
            message: "test".to_string(),
        };
        let qs_error: QsError = config_error.into();

        match qs_error {
            QsError::Config(_) => (),
            _ => panic!("Expected Config error"),
        }
        assert!(QsError::from(ObjectiveError::NoActiveTerms).is_config());
        assert!(!QsError::Internal("x".into()).is_config());
    }

    #[test]
    fn test_stage_failure_keeps_source() {
        let inner = SolverError::NonFiniteJacobian {
            iteration: 4,
            parameter: "eta_bar".into(),
        };
        let outer = SolverError::StageFailed {
            stage: 1,
            source: Box::new(inner),
        };
        let text = outer.to_string();
        assert!(text.contains("Stage 1"));
        assert!(text.contains("eta_bar"));
    }

    #[test]
    fn test_macros() {
        let err = config_error!("params_n", "count must be positive, got {}", 0);
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "params_n"));
        let _internal_err = internal_error!("Something went wrong");
    }
}
