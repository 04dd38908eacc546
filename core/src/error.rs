//! Error categories and protocol errors shared by every hearth crate

use thiserror::Error;

/// Coarse classification of a failure
///
/// Retry and circuit-breaking decisions are made on the category rather than
/// on concrete error types, so any error crossing a resilience boundary
/// implements [`Categorized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection refused, reset, broken pipe
    Network,
    /// An I/O or call deadline elapsed
    Timeout,
    /// Rejected by a rate limiter
    RateLimit,
    /// Downstream temporarily unavailable (e.g. circuit open)
    Unavailable,
    /// Malformed input
    Validation,
    /// A bounded resource is exhausted
    Capacity,
    /// The component is shutting down
    Shutdown,
    /// Anything else
    Internal,
}

impl ErrorCategory {
    /// Whether failures in this category are worth retrying
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::Unavailable
        )
    }

    /// Stable lowercase label, used for metrics and logs
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Capacity => "capacity",
            ErrorCategory::Shutdown => "shutdown",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can report their [`ErrorCategory`]
pub trait Categorized {
    /// The category of this error
    fn category(&self) -> ErrorCategory;

    /// Whether this error is worth retrying
    fn is_transient(&self) -> bool {
        self.category().is_transient()
    }
}

/// Error raised while decoding an inbound client frame
///
/// Protocol errors never terminate a connection; the reader logs them and
/// keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not a valid JSON envelope
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame exceeds the configured inbound size limit
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Actual frame size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Envelope `type` is not a known control message
    #[error("unknown message type '{0}'")]
    UnknownType(String),

    /// A required field is missing from `data`
    #[error("message '{message_type}' is missing field '{field}'")]
    MissingField {
        /// Envelope type
        message_type: String,
        /// Missing field name
        field: &'static str,
    },

    /// A field is present but has the wrong shape
    #[error("message '{message_type}' has invalid field '{field}'")]
    InvalidField {
        /// Envelope type
        message_type: String,
        /// Offending field name
        field: &'static str,
    },
}

impl Categorized for ProtocolError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Validation
    }
}
