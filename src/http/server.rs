//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::GuardState;
use super::router;
use crate::error::{RatewardenError, Result};

/// HTTP server fronting the protected handler.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state, including the rate limiter
    state: GuardState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: GuardState) -> Self {
        Self { addr, state }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Starting HTTP server with graceful shutdown");

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                RatewardenError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::ratelimit::{LimitPolicy, RateLimiter};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryStore::new()),
            LimitPolicy::new(1, 10, Duration::from_secs(5)),
        ));
        let state =
            GuardState::new(limiter, &ServerConfig::default(), CancellationToken::new()).unwrap();

        // Reserve a free port, then hand it to the server
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let server = tokio::spawn(HttpServer::new(addr, state).serve_with_shutdown(async move {
            signal.cancelled().await;
        }));

        let mut statuses = Vec::new();
        for _ in 0..2 {
            let mut stream = loop {
                match tokio::net::TcpStream::connect(addr).await {
                    Ok(stream) => break stream,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            statuses.push(response.lines().next().unwrap_or_default().to_string());
        }

        assert!(statuses[0].contains("200"));
        assert!(statuses[1].contains("429"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
