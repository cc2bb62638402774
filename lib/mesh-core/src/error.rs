use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No endpoint available for service: {0}")]
    NoEndpoint(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

/// Failure to build a connection for a node address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Transport error: {0}")]
    Transport(String),
}
