//! # Squeeze Core
//!
//! Foundational abstractions shared by the Squeeze crates:
//! - Middleware trait and the `Next` chain
//! - Error types

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod middleware;

pub use error::{Error, Result};
pub use middleware::{handler_fn, wrap, Body, HandlerFn, HandlerFuture, Middleware, Next};

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::middleware::{handler_fn, Body, HandlerFn, Middleware, Next};
}
