//! Error types for yantra-core

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// yantra-core error types
///
/// Most failure modes in this crate are *not* errors: measurement noise,
/// convergence failures and communication drop-outs are reported as ordinary
/// negative results or status codes so the caller can retry. The variants
/// here cover I/O problems and the one class that must never be retried:
/// [`Error::MotionFault`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid packet or response on the MMU link
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Motion subsystem consistency violation.
    ///
    /// Raised when a stepper does not end up exactly where the planner
    /// commanded it: an untouched motor moved during a single-motor probe,
    /// a probed motor did not return to its origin, or phase alignment
    /// failed after a step-exact move. These indicate a planner/stepper
    /// desynchronization bug, not a mechanical issue, so callers must halt
    /// instead of retrying.
    #[error("Motion fault: {0}")]
    MotionFault(&'static str),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Config(e.to_string())
    }
}
