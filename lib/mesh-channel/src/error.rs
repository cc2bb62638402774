use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Call to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to read response body: {0}")]
    Body(String),
}
