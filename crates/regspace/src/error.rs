use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for register-space and mock-device operations.
///
/// Every failure in the harness propagates synchronously through this enum;
/// there is no retry or local recovery anywhere. The test layer turns a
/// surfaced error into a failed assertion.
#[derive(Debug, Error)]
pub enum Error {
    /// No register is mapped at the accessed offset.
    #[error("no register mapped at offset {addr:#x}")]
    NotFound { addr: u64 },

    /// Access width outside the supported 1/2/4/8-byte set, or a width a
    /// remote backend cannot carry.
    #[error("unsupported access size {size}")]
    UnsupportedSize { size: usize },

    /// Capability that the mock deliberately does not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("out of resources: {0}")]
    OutOfResources(&'static str),

    /// Malformed or unexpected response from a remote backend.
    #[error("device error: {0}")]
    DeviceError(String),

    /// Transport failure talking to a remote backend.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
