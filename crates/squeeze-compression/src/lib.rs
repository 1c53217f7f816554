//! Adaptive response compression for Squeeze
//!
//! Gzip middleware that measures, per URL path, how much compression saves
//! and what it costs in latency, and feeds those measurements back into the
//! level used for that path.
//!
//! - [`AdaptiveConfig`]: tunables, loaded from the environment and validated
//! - [`CompressionMonitor`]: shared per-path ledger with background eviction
//! - [`ResponseDecorator`]: per-request byte and time accounting
//! - [`AdaptiveCompression`]: the middleware tying them together

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod compressor;
pub mod config;
pub mod decorator;
pub mod middleware;
pub mod monitor;

pub use compressor::GzipCompressor;
pub use config::AdaptiveConfig;
pub use decorator::ResponseDecorator;
pub use middleware::AdaptiveCompression;
pub use monitor::{CompressionMonitor, CompressionSnapshot, PathLevelConfig, PathStatistics};

use std::any::Any;

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
