use thiserror::Error;

/// Failure taxonomy shared by every gateway and by the blob layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommunicationError {
    /// Transport failure before any response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response carrying a parsed `{error}` body.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// The requested object does not exist (blob 404, unknown message).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed JSON / YAML body or archive.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Well-formed input that violates the schema. Collects every problem.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl CommunicationError {
    /// Whether a bounded retry wrapper may try again after this error.
    ///
    /// Missing objects and malformed payloads never get better on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Remote { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for CommunicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<serde_yaml::Error> for CommunicationError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Accumulates validation messages instead of failing on the first one.
#[derive(Debug, Default)]
pub struct Violations(Vec<String>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn check(&mut self, ok: bool, message: impl FnOnce() -> String) {
        if !ok {
            self.0.push(message());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(CommunicationError::Validation(self.0))
        }
    }
}

pub type Result<T> = std::result::Result<T, CommunicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violations_accumulate() {
        let mut v = Violations::new();
        v.check(true, || "never".into());
        v.check(false, || "first".into());
        v.push("second");
        match v.into_result() {
            Err(CommunicationError::Validation(list)) => assert_eq!(list, vec!["first", "second"]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn not_found_is_not_retryable() {
        assert!(!CommunicationError::NotFound("blob".into()).is_retryable());
        assert!(CommunicationError::Network("reset".into()).is_retryable());
    }
}
