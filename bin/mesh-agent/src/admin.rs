//! Admin HTTP listener: health, metrics and pooled membership

use http_body_util::Full;
use hyper::{
    body::Bytes, header, server::conn::http1, service::service_fn, Method, Request, Response,
    StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use mesh_core::{ConnectionFactory, ServiceRegistry};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ServiceEntry {
    service: String,
    addresses: Vec<String>,
}

/// Serve admin requests on `listener` until the task is dropped
pub async fn serve<F: ConnectionFactory>(listener: TcpListener, registry: Arc<ServiceRegistry<F>>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Error accepting admin connection: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = route(req.method(), req.uri().path(), &registry);
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving admin connection from {}: {}", peer_addr, e);
            }
        });
    }
}

fn route<F: ConnectionFactory>(
    method: &Method,
    path: &str,
    registry: &ServiceRegistry<F>,
) -> Response<Full<Bytes>> {
    debug!("{} {}", method, path);

    if method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
    }

    match path {
        "/healthz" => text(StatusCode::OK, "OK\n"),
        "/metrics" => match registry.metrics().gather() {
            Ok(metrics) => {
                let mut response = text(StatusCode::OK, metrics);
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
            }
        },
        "/services" => {
            let entries: Vec<ServiceEntry> = registry
                .services()
                .into_iter()
                .map(|(service, addresses)| ServiceEntry { service, addresses })
                .collect();
            match serde_json::to_vec(&entries) {
                Ok(body) => {
                    let mut response = text(StatusCode::OK, body);
                    response.headers_mut().insert(
                        header::CONTENT_TYPE,
                        header::HeaderValue::from_static("application/json"),
                    );
                    response
                }
                Err(e) => {
                    warn!("Failed to encode services: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode services\n")
                }
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found\n"),
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
