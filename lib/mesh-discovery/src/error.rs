use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Failed to register {key}: {reason}")]
    Registration { key: String, reason: String },

    #[error("Malformed watch event: {0}")]
    MalformedEvent(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("etcd error: {0}")]
    Etcd(String),
}

#[cfg(feature = "etcd")]
impl From<etcd_client::Error> for DiscoveryError {
    fn from(e: etcd_client::Error) -> Self {
        DiscoveryError::Etcd(e.to_string())
    }
}
