// THEORY:
// Every failure the engine can produce falls into one of four kinds. Normalizers and the
// analytics extractor fail fast with one of them, the pipeline passes them through
// untouched after cleaning its output directory, and the boundary layer (HTTP, CLI)
// turns them into a generic "processing failed" response using `kind()` plus the
// `Display` message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormError {
    /// Wrong sample layout, inconsistent buffer, unreadable image, unknown method or a
    /// missing reference.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// `transform` was requested on a reference-based normalizer that was never fitted.
    #[error("Normalizer has not been fitted yet; call fit() with a reference image first")]
    NotFitted,

    /// The input makes the method meaningless (empty image, singular statistics).
    #[error("Numerical error: {0}")]
    Numerical(String),

    /// Reading or writing working-directory artifacts failed.
    #[error("Resource error: {0}")]
    Resource(String),
}

impl NormError {
    /// Machine-readable kind for boundary layers.
    pub fn kind(&self) -> &'static str {
        match self {
            NormError::InvalidInput(_) => "invalid_input",
            NormError::NotFitted => "not_fitted",
            NormError::Numerical(_) => "numerical",
            NormError::Resource(_) => "resource",
        }
    }
}

impl From<std::io::Error> for NormError {
    fn from(err: std::io::Error) -> Self {
        NormError::Resource(err.to_string())
    }
}

impl From<image::ImageError> for NormError {
    fn from(err: image::ImageError) -> Self {
        NormError::Resource(err.to_string())
    }
}

pub type NormResult<T> = Result<T, NormError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(NormError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(NormError::NotFitted.kind(), "not_fitted");
        assert_eq!(NormError::Numerical("x".into()).kind(), "numerical");
        assert_eq!(NormError::Resource("x".into()).kind(), "resource");
    }

    #[test]
    fn io_errors_become_resource_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let err: NormError = io.into();
        assert_eq!(err.kind(), "resource");
        assert!(err.to_string().contains("locked"));
    }
}
