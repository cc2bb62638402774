//! Discovery key handling
//!
//! Each node instance is published under `<service>/<discriminator>`, with the
//! node address as the value. The service a node belongs to is everything
//! before the last `/` of its key.

/// Derive the service name from a discovery key.
///
/// A key without any `/` is treated as a service name on its own.
pub fn service_name_of(discovery_key: &str) -> &str {
    match discovery_key.rfind('/') {
        Some(pos) => &discovery_key[..pos],
        None => discovery_key,
    }
}

/// Build the discovery key for one instance of a service
pub fn instance_key(service_name: &str, discriminator: &str) -> String {
    format!("{}/{}", service_name, discriminator)
}
