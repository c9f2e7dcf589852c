/*!
 * Error types for the Perfuse engine crate.
 */
use thiserror::Error;

/// Error type for Perfuse engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Engine error
    #[error("Engine error: {0}")]
    Engine(String),

    /// Sequence error
    #[error("Sequence error: {0}")]
    Sequence(String),

    /// Executor error
    #[error("Executor error: {0}")]
    Executor(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] perfuse_device::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] perfuse_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for Perfuse engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new engine error
    pub fn engine<S: AsRef<str>>(msg: S) -> Self {
        Error::Engine(msg.as_ref().to_string())
    }

    /// Create a new sequence error
    pub fn sequence<S: AsRef<str>>(msg: S) -> Self {
        Error::Sequence(msg.as_ref().to_string())
    }

    /// Create a new executor error
    pub fn executor<S: AsRef<str>>(msg: S) -> Self {
        Error::Executor(msg.as_ref().to_string())
    }

    /// Create a new not found error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        Error::NotFound(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}
