//! Platform errors

use thiserror::Error;

/// Platform errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// No interface owns the address or name
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Address already assigned to another interface
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// Frame could not be put on the wire
    #[error("Injection error: {0}")]
    InjectionError(String),

    /// The network was shut down
    #[error("Network is shut down")]
    Shutdown,

    /// Error from the core library
    #[error(transparent)]
    Core(#[from] splice_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Platform result type
pub type Result<T> = std::result::Result<T, PlatformError>;

impl From<PlatformError> for splice_core::Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Core(core) => core,
            PlatformError::Io(io) => splice_core::Error::Io(io),
            other => splice_core::Error::Handler {
                handler: "platform".to_string(),
                message: other.to_string(),
            },
        }
    }
}
