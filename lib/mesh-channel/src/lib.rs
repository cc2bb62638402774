//! HTTP/1 and HTTP/2 channels to discovered nodes
pub mod channel;
pub mod error;

pub use channel::{Protocol, RpcChannel, RpcChannelFactory};
pub use error::ChannelError;
