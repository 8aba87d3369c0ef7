//! Errors for values rejected at a domain boundary.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Input that cannot become a domain value.
///
/// Raised while parsing identifiers and tags or checking submission limits;
/// callers at the HTTP edge surface it as a 400. Storage and execution
/// failures have their own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value violates a rule (unknown tag, out-of-range count, oversized key).
    #[error("invalid value: {0}")]
    Validation(String),

    /// An identifier is not a well-formed UUID.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure_class() {
        assert_eq!(
            DomainError::validation("max_attempts must be between 1 and 100").to_string(),
            "invalid value: max_attempts must be between 1 and 100"
        );
        assert!(DomainError::invalid_id("JobId: bad").to_string().starts_with("invalid identifier"));
    }
}
