//! Channel bound to a single node address
//!
//! A channel owns a pooled hyper client and sends every call to the node it
//! was created for. Creating a channel only validates the address and
//! options; connections are established lazily on the first call.

use crate::ChannelError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::http::uri::Authority;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use mesh_core::{ChannelOptions, ConnectionError, ConnectionFactory};
use std::str::FromStr;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// Statuses a node answers with while it cannot serve; calls are retried on them
const RETRYABLE_STATUSES: [StatusCode; 3] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// Longest delay between two attempts of a call
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Wire protocol spoken by a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    /// Parse a protocol identifier
    pub fn parse(id: &str) -> Result<Self, ConnectionError> {
        match id.to_ascii_lowercase().as_str() {
            "http" | "http1" | "http/1.1" => Ok(Protocol::Http1),
            "h2" | "http2" | "grpc" => Ok(Protocol::Http2),
            _ => Err(ConnectionError::UnsupportedProtocol(id.to_string())),
        }
    }
}

/// Channel for issuing calls to one node
#[derive(Clone)]
pub struct RpcChannel {
    address: String,
    authority: Authority,
    protocol: Protocol,
    call_timeout: Option<Duration>,
    retry: Retry,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl RpcChannel {
    /// Create a channel for `address` (`host:port`, optionally `http://host:port`)
    pub fn new(address: &str, options: &ChannelOptions) -> Result<Self, ConnectionError> {
        let protocol = Protocol::parse(&options.protocol)?;
        let authority = parse_authority(address)?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(options.connect_timeout);
        connector.set_keepalive(Some(Duration::from_secs(30)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .http2_only(protocol == Protocol::Http2)
            .build::<_, Full<Bytes>>(connector);

        debug!("Created {:?} channel to {}", protocol, authority);

        Ok(Self {
            address: address.to_string(),
            authority,
            protocol,
            call_timeout: options.call_timeout,
            retry: Retry::from_options(options),
            client,
        })
    }

    /// Address this channel was created for
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Build the URI for `path` on this channel's node
    pub fn uri_for(&self, path: &str) -> Result<Uri, ChannelError> {
        let separator = if path.starts_with('/') { "" } else { "/" };
        format!("http://{}{}{}", self.authority, separator, path)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| ChannelError::InvalidRequest(e.to_string()))
    }

    /// Send a call and collect the response.
    ///
    /// Transport failures, timeouts and retryable statuses are retried up to
    /// the configured budget with exponential backoff. The last retryable
    /// response is returned as-is once the budget is spent.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> Result<Response<Bytes>, ChannelError> {
        let uri = self.uri_for(path)?;
        let mut attempt = 0;

        loop {
            let request = Request::builder()
                .method(method.clone())
                .uri(uri.clone())
                .body(Full::new(body.clone()))
                .map_err(|e| ChannelError::InvalidRequest(e.to_string()))?;

            let exhausted = attempt >= self.retry.max_retries;
            match self.send(request).await {
                Ok(response) if exhausted || !Retry::is_retryable(response.status()) => {
                    return Ok(response);
                }
                Err(e) if exhausted => {
                    warn!("Call {} {} failed after {} attempts: {}", method, uri, attempt + 1, e);
                    return Err(e);
                }
                Ok(response) => {
                    debug!("Retrying {} {} after status {}", method, uri, response.status());
                }
                Err(e) => {
                    debug!("Retrying {} {} after error: {}", method, uri, e);
                }
            }

            time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, ChannelError> {
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ChannelError::Transport(e.to_string()))?;

            let (parts, body) = response.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| ChannelError::Body(e.to_string()))?
                .to_bytes();
            Ok::<_, ChannelError>(Response::from_parts(parts, bytes))
        };

        match self.call_timeout {
            Some(timeout) => time::timeout(timeout, exchange)
                .await
                .map_err(|_| ChannelError::Timeout {
                    address: self.address.clone(),
                    timeout,
                })?,
            None => exchange.await,
        }
    }
}

/// Retry budget of a channel, taken from its options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Retry {
    max_retries: u32,
    backoff: Duration,
}

impl Retry {
    fn from_options(options: &ChannelOptions) -> Self {
        Self {
            max_retries: options.max_retries,
            backoff: options.retry_backoff,
        }
    }

    fn is_retryable(status: StatusCode) -> bool {
        RETRYABLE_STATUSES.contains(&status)
    }

    /// Delay before retry number `retry` (zero-based)
    fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
    }
}

fn parse_authority(address: &str) -> Result<Authority, ConnectionError> {
    let invalid = |reason: String| ConnectionError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let authority = if address.contains("://") {
        let uri = Uri::from_str(address).map_err(|e| invalid(e.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid("only http:// addresses are supported".to_string()));
        }
        uri.authority()
            .cloned()
            .ok_or_else(|| invalid("missing host".to_string()))?
    } else {
        Authority::from_str(address).map_err(|e| invalid(e.to_string()))?
    };

    if authority.port_u16().is_none() {
        return Err(invalid("missing port".to_string()));
    }
    Ok(authority)
}

/// Builds [`RpcChannel`]s for connection pools
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcChannelFactory;

impl ConnectionFactory for RpcChannelFactory {
    type Connection = RpcChannel;

    fn connect(&self, address: &str, options: &ChannelOptions) -> Result<RpcChannel, ConnectionError> {
        RpcChannel::new(address, options)
    }
}
