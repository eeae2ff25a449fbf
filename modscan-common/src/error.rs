use thiserror::Error;

/// Common error type for modscan components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias using modscan's common Error.
pub type Result<T> = std::result::Result<T, Error>;
