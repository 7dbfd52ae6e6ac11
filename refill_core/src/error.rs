//! Error types for the refill_core library.

use std::io;
use uuid::Uuid;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for refill_core operations
///
/// The `Invalid*` variants are input-validation failures. They are surfaced
/// to the caller as-is and never retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dosing interval or duration was not strictly positive
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// Dosage per interval was not strictly positive
    #[error("Invalid dosage: {0}")]
    InvalidDosage(String),

    /// Supply count was not strictly positive
    #[error("Invalid supply: {0}")]
    InvalidSupply(String),

    /// Reminder offset, count, or spacing was unusable
    #[error("Invalid reminder configuration: {0}")]
    InvalidReminderConfig(String),

    /// Start anchor did not carry exactly one of date or time
    #[error("Invalid start: {0}")]
    InvalidStart(String),

    /// Any other malformed prescription field
    #[error("Invalid prescription: {0}")]
    InvalidPrescription(String),

    /// Temporal arithmetic left the representable range
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// No prescription with this id in the store
    #[error("Prescription not found: {0}")]
    NotFound(Uuid),

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures caused by bad caller input.
    ///
    /// These should be reported back so the caller can re-prompt.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidInterval(_)
                | Error::InvalidDosage(_)
                | Error::InvalidSupply(_)
                | Error::InvalidReminderConfig(_)
                | Error::InvalidStart(_)
                | Error::InvalidPrescription(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(Error::InvalidDosage("0".into()).is_validation());
        assert!(Error::InvalidStart("both".into()).is_validation());
        assert!(!Error::NotFound(Uuid::nil()).is_validation());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_validation());
    }
}
