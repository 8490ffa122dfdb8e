//! Error types for the dubflow scheduler.
//!
//! One taxonomy covers the whole crate: caller errors surface immediately,
//! resilience-primitive refusals surface to the caller of `execute`, and
//! opaque stage failures are carried as sanitized strings so a failed job's
//! `error_message` is always human-readable.

use thiserror::Error;

/// The main error type for dubflow operations.
#[derive(Debug, Error)]
pub enum DubflowError {
    /// The referenced job id is unknown to the store.
    #[error("job not found: {id}")]
    JobNotFound {
        /// The unknown job id.
        id: String,
    },

    /// The requested dubbing target language is not in the supported set.
    #[error("unsupported target language: {language}")]
    UnsupportedLanguage {
        /// The rejected language code.
        language: String,
    },

    /// The circuit breaker for a service is open and refused the call.
    #[error("circuit breaker open for service '{service}'")]
    CircuitOpen {
        /// The guarded service name.
        service: String,
    },

    /// The bulkhead refused a call that would exceed its concurrency bound.
    #[error("bulkhead rejected call to service '{service}' ({active}/{max} calls active)")]
    BulkheadRejected {
        /// The guarded service name.
        service: String,
        /// Active calls at the time of rejection.
        active: usize,
        /// The configured concurrency bound.
        max: usize,
    },

    /// A bulkhead-guarded call did not produce a result within its timeout.
    ///
    /// The underlying call keeps running; only the wait is abandoned.
    #[error("call to service '{service}' timed out after {timeout_ms}ms")]
    BulkheadTimeout {
        /// The guarded service name.
        service: String,
        /// The configured wait timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Processing was cancelled cooperatively.
    #[error("job cancelled: {0}")]
    Cancelled(String),

    /// The worker pool is no longer accepting submissions.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// An opaque, provider-defined stage failure.
    #[error("stage execution error: {0}")]
    StageExecution(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DubflowError {
    /// Creates a stage execution error from any displayable failure.
    #[must_use]
    pub fn stage(message: impl Into<String>) -> Self {
        Self::StageExecution(message.into())
    }

    /// Returns true if this error is an admission refusal from a
    /// resilience primitive rather than a failure of the call itself.
    #[must_use]
    pub fn is_admission_refusal(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadRejected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_are_sanitized_strings() {
        let err = DubflowError::JobNotFound {
            id: "job_abc".to_string(),
        };
        assert_eq!(err.to_string(), "job not found: job_abc");

        let err = DubflowError::UnsupportedLanguage {
            language: "xx".to_string(),
        };
        assert_eq!(err.to_string(), "unsupported target language: xx");
    }

    #[test]
    fn test_admission_refusals() {
        assert!(DubflowError::CircuitOpen {
            service: "translation".to_string()
        }
        .is_admission_refusal());

        assert!(DubflowError::BulkheadRejected {
            service: "speech_to_text".to_string(),
            active: 4,
            max: 4,
        }
        .is_admission_refusal());

        assert!(!DubflowError::PoolShutdown.is_admission_refusal());
        assert!(!DubflowError::stage("boom").is_admission_refusal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DubflowError = io.into();
        assert!(matches!(err, DubflowError::Io(_)));
    }
}
