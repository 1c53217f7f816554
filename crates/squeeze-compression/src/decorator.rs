//! Per-request response decorator
//!
//! Sits between the gzip encoder and the outgoing response stream, counting
//! what actually goes out and how long the request has been running.

use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Byte and time accounting around an outgoing response stream
#[derive(Debug)]
pub struct ResponseDecorator<W> {
    inner: W,
    started: Instant,
    bytes_written: u64,
    original_size: u64,
    write_error: Option<String>,
}

impl<W: Write> ResponseDecorator<W> {
    /// Wrap a stream, starting the request clock now
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            started: Instant::now(),
            bytes_written: 0,
            original_size: 0,
            write_error: None,
        }
    }

    /// Note the size of a chunk handed to the encoder
    ///
    /// Sizes are summed over the whole response, so multi-chunk bodies
    /// report their full uncompressed length.
    pub fn observe_input(&mut self, len: usize) {
        self.original_size += len as u64;
    }

    /// Bytes that reached the inner stream
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Uncompressed bytes seen so far
    pub fn original_size(&self) -> u64 {
        self.original_size
    }

    /// Time since the decorator was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// First write error seen, if any
    pub fn write_error(&self) -> Option<&str> {
        self.write_error.as_deref()
    }

    /// Borrow the wrapped stream
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Unwrap the stream
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn note_error(&mut self, err: &io::Error) {
        if self.write_error.is_none() {
            self.write_error = Some(err.to_string());
        }
    }
}

impl<W: Write> Write for ResponseDecorator<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => {
                self.bytes_written += n as u64;
                Ok(n)
            }
            Err(err) => {
                self.note_error(&err);
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|err| {
            self.note_error(&err);
            err
        })
    }
}
