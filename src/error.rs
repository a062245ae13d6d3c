//! Error types.
//!
//! `CalibrationError` is what the library returns; `AppError` is the binary's
//! boundary type carrying a process exit code.

use thiserror::Error;

use crate::domain::CalibrationStage;
use crate::fit::FailureReason;

/// Errors raised by the calibration engine.
#[derive(Debug, Clone, Error)]
pub enum CalibrationError {
    /// Malformed or inconsistent input tables. Aborts the affected species only.
    #[error("{species}: invalid input: {message}")]
    StructuralInput { species: String, message: String },

    /// A stage was invoked before its precondition stage completed.
    #[error("{species}: cannot run {attempted} before {required} (species is at {current})")]
    StageOrder {
        species: String,
        attempted: CalibrationStage,
        required: CalibrationStage,
        current: CalibrationStage,
    },

    /// Every catch-fit attempt for a species failed numerically.
    #[error("{species}: catch fit failed after {attempts} attempt(s), last failure: {reason}")]
    NumericDivergence {
        species: String,
        attempts: usize,
        reason: FailureReason,
    },
}

impl CalibrationError {
    pub fn structural(species: impl Into<String>, message: impl Into<String>) -> Self {
        CalibrationError::StructuralInput {
            species: species.into(),
            message: message.into(),
        }
    }

    /// Stage-order violations are programming errors and abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CalibrationError::StageOrder { .. })
    }
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<CalibrationError> for AppError {
    fn from(err: CalibrationError) -> Self {
        let exit_code = match err {
            CalibrationError::StructuralInput { .. } => 2,
            CalibrationError::StageOrder { .. } => 3,
            CalibrationError::NumericDivergence { .. } => 4,
        };
        AppError::new(exit_code, err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let err: AppError = CalibrationError::structural("cod", "bad").into();
        assert_eq!(err.exit_code(), 2);

        let err: AppError = CalibrationError::StageOrder {
            species: "cod".to_string(),
            attempted: CalibrationStage::CatchMatched,
            required: CalibrationStage::BiomassMatched,
            current: CalibrationStage::Raw,
        }
        .into();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("cod"));
    }
}
