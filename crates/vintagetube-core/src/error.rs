//! Error types for VintageTube core operations.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in VintageTube core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A download run was requested with an empty queue or no save folder.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The external engine failed to download one request.
    #[error("Download failed for {url}: {message}")]
    Download {
        /// URL of the request that failed.
        url: String,
        /// Error message reported by the engine.
        message: String,
    },

    /// The engine stopped a transfer because cancellation was requested.
    ///
    /// This is the expected outcome of the cooperative-cancellation path and
    /// is never surfaced as a per-item failure.
    #[error("Download cancelled")]
    Cancelled,

    /// The external engine binary could not be located.
    #[error("Download engine not found: {0}")]
    EngineNotFound(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build a `Download` error for one request from any engine failure.
    pub fn download(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Download {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Whether this error is the cooperative-cancellation outcome.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
