//! HTTP server implementation

use crate::shutdown::ShutdownSignal;
use crate::RuntimeState;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use squeeze_compression::CompressionMonitor;
use squeeze_core::{wrap, Body, Error, HandlerFn, Middleware, Result};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::task::TaskTracker;

/// Default listen address
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Default bound on connection draining and monitor shutdown
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP server
pub struct Server {
    listen: SocketAddr,
    shutdown_timeout: Duration,
    handler: Arc<HandlerFn>,
    monitor: Arc<CompressionMonitor>,
    middleware_count: usize,
    state: Arc<RwLock<RuntimeState>>,
    shutdown: ShutdownSignal,
    request_count: Arc<AtomicUsize>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("listen", &self.listen)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("middleware_count", &self.middleware_count)
            .field("state", &*self.state.read())
            .field("request_count", &self.request_count)
            .finish()
    }
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Get the current state
    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    /// Get listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    /// Get request count
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Get shutdown signal
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Get the compression monitor
    pub fn monitor(&self) -> &Arc<CompressionMonitor> {
        &self.monitor
    }

    /// Bind the listen address and run until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|e| Error::Runtime(format!("Failed to bind to {}: {}", self.listen, e)))?;

        self.serve(listener).await
    }

    /// Run on an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        *self.state.write() = RuntimeState::Running;

        tracing::info!(
            listen = %local,
            middleware = self.middleware_count,
            "Server listening"
        );

        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::trace!("Accepted connection from {}", addr);
                            connections.spawn(self.connection(stream));
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                _ = self.shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        *self.state.write() = RuntimeState::ShuttingDown;
        drop(listener);

        let start = Instant::now();
        connections.close();

        tracing::info!(
            connections = connections.len(),
            timeout_secs = self.shutdown_timeout.as_secs(),
            "Waiting for open connections to drain"
        );

        if tokio::time::timeout(self.shutdown_timeout, connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                connections = connections.len(),
                "Shutdown timeout reached, abandoning open connections"
            );
        }

        let stopped = self.monitor.shutdown(self.shutdown_timeout).await;
        self.report();

        *self.state.write() = RuntimeState::Stopped;

        tracing::info!(
            shutdown_duration_ms = start.elapsed().as_millis() as u64,
            requests = self.request_count(),
            "Server stopped"
        );

        stopped
    }

    /// Serve one connection, closing it gracefully on shutdown
    fn connection(&self, stream: tokio::net::TcpStream) -> impl std::future::Future<Output = ()> {
        let handler = Arc::clone(&self.handler);
        let request_count = Arc::clone(&self.request_count);
        let shutdown = self.shutdown.token();

        async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = Arc::clone(&handler);
                request_count.fetch_add(1, Ordering::Relaxed);
                async move { Ok::<_, Infallible>(dispatch(&handler, req).await) }
            });

            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };

            if let Err(e) = result {
                tracing::debug!("HTTP connection error: {}", e);
            }
        }
    }

    /// Log the monitor's final totals
    fn report(&self) {
        let snapshot = self.monitor.snapshot();
        tracing::info!(
            total_requests = snapshot.total_requests,
            total_failures = snapshot.total_failures,
            original_bytes = snapshot.total_original_bytes,
            compressed_bytes = snapshot.total_compressed_bytes,
            overall_ratio = snapshot.overall_ratio,
            tracked_paths = snapshot.tracked_paths,
            "Final compression statistics"
        );

        if snapshot.failure_reasons.is_empty() {
            return;
        }
        match serde_json::to_string(&snapshot.failure_reasons) {
            Ok(reasons) => tracing::info!(%reasons, "Compression failure breakdown"),
            Err(e) => tracing::debug!("Failed to encode failure breakdown: {}", e),
        }
    }
}

/// Buffer the incoming body and run the wrapped handler
async fn dispatch(handler: &HandlerFn, req: Request<Incoming>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("Failed to read request body: {}", e);
            return error_response(StatusCode::BAD_REQUEST, "Error: unreadable request body");
        }
    };

    match handler(Request::from_parts(parts, Full::new(body))).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Request handler error: {}", e);
            error_response(e.to_status_code(), format!("Error: {}", e))
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

/// Server builder
pub struct ServerBuilder {
    listen: Option<SocketAddr>,
    shutdown_timeout: Duration,
    handler: Option<HandlerFn>,
    monitor: Option<Arc<CompressionMonitor>>,
    middleware: Vec<Arc<dyn Middleware>>,
    shutdown: Option<ShutdownSignal>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("listen", &self.listen)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("has_handler", &self.handler.is_some())
            .field("has_monitor", &self.monitor.is_some())
            .field("middleware", &self.middleware)
            .finish()
    }
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self {
            listen: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            handler: None,
            monitor: None,
            middleware: Vec::new(),
            shutdown: None,
        }
    }

    /// Set listen address
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Set the bound on draining connections and stopping the monitor
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the final request handler
    pub fn handler(mut self, handler: HandlerFn) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the compression monitor stopped on shutdown
    pub fn monitor(mut self, monitor: Arc<CompressionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Append a middleware; the first added runs outermost
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Share an existing shutdown signal
    pub fn shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Build the server
    pub fn build(self) -> Result<Server> {
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("handler is required".to_string()))?;
        let monitor = self
            .monitor
            .ok_or_else(|| Error::Config("monitor is required".to_string()))?;
        let listen = match self.listen {
            Some(addr) => addr,
            None => DEFAULT_LISTEN
                .parse()
                .map_err(|e| Error::Config(format!("Invalid listen address: {}", e)))?,
        };

        let middleware_count = self.middleware.len();
        let stack: Arc<[Arc<dyn Middleware>]> = Arc::from(self.middleware);

        tracing::info!(
            listen = %listen,
            middleware = middleware_count,
            shutdown_timeout_secs = self.shutdown_timeout.as_secs(),
            "Server components initialized"
        );

        Ok(Server {
            listen,
            shutdown_timeout: self.shutdown_timeout,
            handler: Arc::new(wrap(stack, handler)),
            monitor,
            middleware_count,
            state: Arc::new(RwLock::new(RuntimeState::Initializing)),
            shutdown: self.shutdown.unwrap_or_default(),
            request_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squeeze_compression::{AdaptiveCompression, AdaptiveConfig};
    use squeeze_core::handler_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn catalogue() -> String {
        "{\"title\":\"Dune\",\"author\":\"Frank Herbert\"},".repeat(100)
    }

    fn test_server(signal: &ShutdownSignal) -> Server {
        let monitor = Arc::new(CompressionMonitor::new(signal.token()));
        let compression =
            AdaptiveCompression::with_config(Arc::clone(&monitor), AdaptiveConfig::default())
                .unwrap();

        ServerBuilder::new()
            .listen("127.0.0.1:0".parse().unwrap())
            .shutdown_timeout(Duration::from_secs(2))
            .monitor(monitor)
            .middleware(Arc::new(compression))
            .shutdown_signal(signal.clone())
            .handler(handler_fn(|req: Request<Body>| async move {
                if req.uri().path() == "/boom" {
                    return Err(Error::Internal("handler exploded".to_string()));
                }
                Ok(Response::builder()
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(catalogue()))?)
            }))
            .build()
            .unwrap()
    }

    async fn roundtrip(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        String::from_utf8_lossy(&raw).to_lowercase()
    }

    #[test]
    fn test_server_builder() {
        let signal = ShutdownSignal::new();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();

        let server = test_server(&signal);
        assert_eq!(server.listen_addr(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(server.request_count(), 0);
        assert_eq!(server.state(), RuntimeState::Initializing);
    }

    #[test]
    fn test_server_builder_requires_handler_and_monitor() {
        let result = ServerBuilder::new().build();
        assert!(matches!(result, Err(Error::Config(_))));

        let result = ServerBuilder::new()
            .handler(handler_fn(|_req| async { Ok(Response::new(Body::default())) }))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serves_compressed_responses_and_stops_monitor() {
        let signal = ShutdownSignal::new();
        let server = Arc::new(test_server(&signal));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let response = roundtrip(addr, "/api/v1/books").await;
        assert!(response.starts_with("http/1.1 200"));
        assert!(response.contains("content-encoding: gzip"));
        assert!(response.contains("vary: accept-encoding"));

        let failed = roundtrip(addr, "/boom").await;
        assert!(failed.starts_with("http/1.1 500"));
        assert!(failed.contains("handler exploded"));

        signal.trigger();
        running.await.unwrap().unwrap();

        assert_eq!(server.state(), RuntimeState::Stopped);
        assert_eq!(server.request_count(), 2);
        assert!(server.monitor().is_shut_down());

        let stats = server.monitor().path_statistics("/api/v1/books").unwrap();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.original_bytes, catalogue().len() as u64);
    }
}
