//! Error types for maskwork-eye

use maskwork_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Model unavailable: {0}")]
    Unavailable(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl From<VisionError> for CoreError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Unavailable(msg) => CoreError::ResourceUnavailable(msg),
            VisionError::InvalidInput(msg) => CoreError::InvalidInput(msg),
            VisionError::Core(inner) => inner,
            VisionError::Io(e) => CoreError::Io(e),
            other => CoreError::ProcessingFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maskwork_core::ErrorKind;

    #[test]
    fn test_vision_error_display() {
        let err = VisionError::Model("Test error".to_string());
        assert!(err.to_string().contains("Model error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_vision_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let vision_err: VisionError = io_err.into();
        match vision_err {
            VisionError::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_vision_error_to_core_error() {
        let core_err: CoreError = VisionError::Unavailable("no checkpoint".to_string()).into();
        assert_eq!(core_err.kind(), ErrorKind::ResourceUnavailable);

        let core_err: CoreError = VisionError::InvalidInput("bad".to_string()).into();
        assert_eq!(core_err.kind(), ErrorKind::InvalidInput);

        let core_err: CoreError = VisionError::Processing("boom".to_string()).into();
        assert_eq!(core_err.kind(), ErrorKind::ProcessingFailure);
        assert!(core_err.to_string().contains("boom"));
    }

    #[test]
    fn test_core_error_passes_through() {
        let original = CoreError::not_found("session", "abc");
        let core_err: CoreError = VisionError::Core(original).into();
        assert_eq!(core_err.kind(), ErrorKind::NotFound);
    }
}
