//! Adaptive compression middleware

use crate::compressor::{GzipCompressor, GZIP_ENCODING};
use crate::config::AdaptiveConfig;
use crate::decorator::ResponseDecorator;
use crate::monitor::{CompressionMonitor, PathLevelConfig};
use crate::panic_message;
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use http::response::Parts;
use http::{header, HeaderValue, Request, Response};
use http_body_util::BodyExt;
use squeeze_core::{Body, Middleware, Next, Result};
use std::backtrace::Backtrace;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Gzip middleware that tunes its level per path
///
/// Every compressed response is recorded in the shared
/// [`CompressionMonitor`]; in adaptive mode the monitor then re-evaluates
/// the level for that path. Faults inside the compression layer are
/// recorded and the client gets the uncompressed response instead.
#[derive(Debug, Clone)]
pub struct AdaptiveCompression {
    monitor: Arc<CompressionMonitor>,
    config: Arc<AdaptiveConfig>,
}

impl AdaptiveCompression {
    /// Create the middleware with configuration taken from the environment
    pub fn new(monitor: Arc<CompressionMonitor>) -> Result<Self> {
        Self::with_config(monitor, AdaptiveConfig::from_env())
    }

    /// Create the middleware with an explicit configuration
    ///
    /// Fails if the configuration does not validate.
    pub fn with_config(monitor: Arc<CompressionMonitor>, config: AdaptiveConfig) -> Result<Self> {
        config.validate()?;

        info!(
            level = config.level,
            min_size = config.min_size,
            adaptive = config.adaptive,
            "Adaptive compression enabled"
        );

        Ok(Self {
            monitor,
            config: Arc::new(config),
        })
    }

    /// The validated configuration
    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// The shared monitor
    pub fn monitor(&self) -> &Arc<CompressionMonitor> {
        &self.monitor
    }

    async fn serve(&self, req: Request<Body>, next: Next, path: &str) -> Result<Response<Body>> {
        if !is_eligible(&req) {
            return next.run(req).await;
        }

        let decorator = ResponseDecorator::new(Vec::new());
        let level = self
            .monitor
            .level_config_with(path, self.config.min_size, self.config.level);

        let response = next.run(req).await?;
        if !is_compressible_response(&response) {
            return Ok(response);
        }

        let (parts, body) = response.into_parts();
        let chunks = collect_chunks(body).await;

        let size: usize = chunks.iter().map(Bytes::len).sum();
        if size < level.min_size {
            debug!(path, size, min_size = level.min_size, "Response below compression threshold");
            return Ok(Response::from_parts(parts, Body::new(concat(&chunks))));
        }

        Ok(self.complete(path, &level, decorator, parts, chunks))
    }

    /// Encode the collected body and record the outcome
    fn complete<W>(
        &self,
        path: &str,
        level: &PathLevelConfig,
        mut decorator: ResponseDecorator<W>,
        mut parts: Parts,
        chunks: Vec<Bytes>,
    ) -> Response<Body>
    where
        W: Write + Into<Bytes>,
    {
        if let Err(e) = GzipCompressor::compress_into(&chunks, level.level, &mut decorator) {
            let reason = match decorator.write_error() {
                Some(write_error) => format!("write: {write_error}"),
                None => format!("encode: {e}"),
            };
            warn!(path, reason = %reason, "Compression failed, serving uncompressed");
            self.monitor.record_failure(path, &reason);
            return Response::from_parts(parts, Body::new(concat(&chunks)));
        }

        let compressed_bytes = decorator.bytes_written();
        let original_bytes = decorator.original_size();
        let elapsed = decorator.elapsed();
        let compressed: Bytes = decorator.into_inner().into();

        parts
            .headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static(GZIP_ENCODING));
        parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(compressed.len()));
        parts.headers.remove(header::ACCEPT_RANGES);
        parts.headers.remove(header::TRANSFER_ENCODING);
        parts
            .headers
            .append(header::VARY, HeaderValue::from_static("accept-encoding"));

        self.monitor
            .record_observation(path, compressed_bytes, original_bytes, elapsed);

        if self.config.adaptive {
            if let Some(new_level) = self.monitor.adjust(path, &self.config) {
                debug!(path, from = level.level, to = new_level, "Level adapted");
            }
        }

        debug!(
            path,
            level = level.level,
            original_bytes,
            compressed_bytes,
            "Response compressed"
        );

        Response::from_parts(parts, Body::new(compressed))
    }
}

#[async_trait]
impl Middleware for AdaptiveCompression {
    async fn call(&self, req: Request<Body>, next: Next) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();
        let replay = replay_request(&req);
        let fallback = next.clone();

        match AssertUnwindSafe(self.serve(req, next, &path))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(&*panic);
                // The stack has unwound by now; the panic hook reports the
                // originating frames, this trace shows where it was caught
                error!(
                    path = %path,
                    panic = %detail,
                    recovered_at = %Backtrace::force_capture(),
                    "Compression layer panicked, serving uncompressed"
                );
                self.monitor.record_failure(&path, &format!("panic: {detail}"));
                fallback.run(replay).await
            }
        }
    }
}

/// Check whether a request may receive a gzip response
///
/// The client must accept gzip, and a request Content-Type, when present,
/// must be `text/*` or `application/json`.
pub fn is_eligible(req: &Request<Body>) -> bool {
    let accept = req
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());
    if !GzipCompressor::accepts_gzip(accept) {
        return false;
    }

    match req.headers().get(header::CONTENT_TYPE) {
        None => true,
        Some(ct) => ct.to_str().map(is_compressible_content_type).unwrap_or(false),
    }
}

/// Check a Content-Type against the compressible allow-list
pub fn is_compressible_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    media_type.starts_with("text/") || media_type == "application/json"
}

fn is_compressible_response(response: &Response<Body>) -> bool {
    if !response.status().is_success() {
        return false;
    }

    if response.headers().contains_key(header::CONTENT_ENCODING) {
        return false;
    }

    match response.headers().get(header::CONTENT_TYPE) {
        None => true,
        Some(ct) => ct.to_str().map(is_compressible_content_type).unwrap_or(false),
    }
}

async fn collect_chunks(mut body: Body) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(never) => match never {},
        };
        if let Ok(data) = frame.into_data() {
            if !data.is_empty() {
                chunks.push(data);
            }
        }
    }
    chunks
}

fn concat(chunks: &[Bytes]) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => Bytes::from(many.concat()),
    }
}

/// Copy of a request for re-serving it after a fault
fn replay_request(req: &Request<Body>) -> Request<Body> {
    let mut replay = Request::new(req.body().clone());
    *replay.method_mut() = req.method().clone();
    *replay.uri_mut() = req.uri().clone();
    *replay.version_mut() = req.version();
    *replay.headers_mut() = req.headers().clone();
    replay
}
