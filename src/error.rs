//! Error kinds the pipeline has to tell apart.
//!
//! Everything else (configuration, collaborator construction, binaries) uses
//! `anyhow` with context strings.

use std::io;

use thiserror::Error;

/// Failure of a single recognition call.
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// The service could not be reached (connection refused, DNS, socket timeout).
    #[error("recognition service unreachable: {0}")]
    Transport(String),
    /// The service answered with a non-success status.
    #[error("recognition service returned {status}: {message}")]
    Service { status: u16, message: String },
    /// The response body could not be understood.
    #[error("failed to decode recognition response: {0}")]
    Decode(String),
    /// The frame could not be encoded for submission.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl RecognitionError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Validation failure while building or parsing a [`crate::SubjectIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubjectError {
    #[error("malformed subject '{input}': {reason}")]
    Malformed { input: String, reason: &'static str },
    #[error("{field} must not be empty")]
    EmptyName { field: &'static str },
    #[error("last name '{0}' must not contain a comma")]
    CommaInLastName(String),
    #[error("id number '{0}' must be a non-empty string of digits")]
    InvalidIdNumber(String),
    #[error("grade '{0}' must be 0-13 or T")]
    InvalidGrade(String),
}

impl SubjectError {
    pub(crate) fn malformed(input: &str, reason: &'static str) -> Self {
        Self::Malformed {
            input: input.to_string(),
            reason,
        }
    }
}

/// A matched detection carried a subject label that is not a valid identity.
///
/// Raised by the collector; the whole event is rejected when this happens.
#[derive(Debug, Clone, Error)]
#[error("matched subject '{subject}' failed validation")]
pub struct IntegrityError {
    pub subject: String,
    #[source]
    pub source: SubjectError,
}

/// Invalid detection geometry or threshold values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectionError {
    #[error("bounding box ({x_min},{y_min})-({x_max},{y_max}) is empty or inverted")]
    InvalidBox {
        x_min: i32,
        y_min: i32,
        x_max: i32,
        y_max: i32,
    },
    #[error("age range {low}-{high} is inverted")]
    InvalidAgeRange { low: u32, high: u32 },
    #[error("threshold {0} must be in (0, 1]")]
    InvalidThreshold(f64),
    #[error("similarity {0} must be in [0, 1]")]
    InvalidSimilarity(f64),
}

/// Failure to persist one export batch.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export io error: {0}")]
    Io(#[from] io::Error),
    #[error("export csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("export json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("export rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_distinguishable() {
        assert!(RecognitionError::transport("refused").is_transport());
        assert!(!RecognitionError::decode("bad json").is_transport());
        assert!(!RecognitionError::Service {
            status: 500,
            message: "boom".into()
        }
        .is_transport());
    }

    #[test]
    fn integrity_error_keeps_its_source() {
        let err = IntegrityError {
            subject: "Doe, Jane (x) [T]".into(),
            source: SubjectError::InvalidIdNumber("x".into()),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("id number 'x' must be a non-empty string of digits")
        );
    }
}
