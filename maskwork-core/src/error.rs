use thiserror::Error;

/// Coarse classification used by callers to decide between
/// "fix your request" and "retry later".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    ResourceUnavailable,
    NotFound,
    ProcessingFailure,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid mask format: {0}")]
    InvalidMaskFormat(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Processing failure: {0}")]
    ProcessingFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound { kind, id: id.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) | Error::InvalidMaskFormat(_) => ErrorKind::InvalidInput,
            Error::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::ProcessingFailure(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Configuration(_) => ErrorKind::ProcessingFailure,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_format_is_invalid_input() {
        let err = Error::InvalidMaskFormat("truncated png".to_string());
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("truncated png"));
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("session", "abc");
        assert_eq!(err.to_string(), "session not found: abc");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_unavailable_is_distinct() {
        let err = Error::ResourceUnavailable("no checkpoint".to_string());
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert_ne!(err.kind(), ErrorKind::InvalidInput);
    }
}
