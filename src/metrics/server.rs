//! Prometheus metrics HTTP server.
//!
//! Serves the registry on the configured path and a liveness probe on
//! `/health`.

use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    listener: TcpListener,
    path: Arc<str>,
    collector: MetricsCollector,
}

impl MetricsServer {
    /// Bind the metrics listener.
    pub async fn bind(
        address: SocketAddr,
        path: impl Into<String>,
        collector: MetricsCollector,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            path: Arc::from(path.into()),
            collector,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let address = self.local_addr().ok();
        info!(address = ?address, path = %self.path, "metrics server started");

        let collector = Arc::new(self.collector);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                            continue;
                        }
                    };
                    let collector = Arc::clone(&collector);
                    let path = Arc::clone(&self.path);
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                            let response = respond(req.method(), req.uri().path(), &collector, &path);
                            async move { Ok::<_, Infallible>(response) }
                        });
                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            debug!(error = %e, "metrics connection error");
                        }
                    });
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Route one request.
fn respond(
    method: &Method,
    path: &str,
    collector: &MetricsCollector,
    metrics_path: &str,
) -> Response<Full<Bytes>> {
    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
    }

    if path == metrics_path {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, collector.registry()) {
            error!(error = %e, "failed to encode metrics");
            return text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n");
        }
        let mut response = text(StatusCode::OK, buffer);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_TEXT));
        response
    } else if path == "/health" || path == "/healthz" {
        text(StatusCode::OK, "OK\n")
    } else {
        text(StatusCode::NOT_FOUND, "Not found\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::Health;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_routes() {
        let collector = MetricsCollector::new();
        let get = Method::GET;

        assert_eq!(respond(&get, "/health", &collector, "/metrics").status(), StatusCode::OK);
        assert_eq!(
            respond(&get, "/nope", &collector, "/metrics").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            respond(&Method::POST, "/metrics", &collector, "/metrics").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );

        let metrics = respond(&get, "/metrics", &collector, "/metrics");
        assert_eq!(metrics.status(), StatusCode::OK);
        assert_eq!(metrics.headers()[CONTENT_TYPE], PROMETHEUS_TEXT);
    }

    #[tokio::test]
    async fn test_serves_registry_over_http() {
        let collector = MetricsCollector::new();
        collector.set_backend_health("rtsp", "10.0.0.1:554".parse().unwrap(), Health::Up);

        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), "/metrics", collector)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(server.run(rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("sessionlb_backend_health"));

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
