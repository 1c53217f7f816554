//! Gzip encoding and Accept-Encoding negotiation

use crate::config::{MAX_GZIP_LEVEL, MIN_GZIP_LEVEL};
use crate::decorator::ResponseDecorator;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Write};

/// Content-Encoding value for gzip
pub const GZIP_ENCODING: &str = "gzip";

/// Gzip encoder for response bodies
#[derive(Debug)]
pub struct GzipCompressor;

impl GzipCompressor {
    /// Encode body chunks at `level`, writing the gzip stream through `out`
    ///
    /// Every chunk is reported to the decorator as original input before it
    /// is handed to the encoder.
    pub fn compress_into<W: Write>(
        chunks: &[Bytes],
        level: u32,
        out: &mut ResponseDecorator<W>,
    ) -> io::Result<()> {
        let level = level.clamp(MIN_GZIP_LEVEL, MAX_GZIP_LEVEL);
        let mut encoder = GzEncoder::new(out, Compression::new(level));

        for chunk in chunks {
            encoder.get_mut().observe_input(chunk.len());
            encoder.write_all(chunk)?;
        }

        encoder.finish()?;
        Ok(())
    }

    /// Check whether an Accept-Encoding header allows gzip
    ///
    /// Handles `gzip`, `x-gzip` and `*`, honouring `q=0` as a refusal.
    pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
        let Some(accept) = accept_encoding else {
            return false;
        };

        accept.split(',').any(|entry| {
            let mut parts = entry.split(';');
            let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
            if coding != "gzip" && coding != "x-gzip" && coding != "*" {
                return false;
            }

            let quality = parts
                .filter_map(|param| param.split_once('='))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("q"))
                .and_then(|(_, value)| value.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            quality > 0.0
        })
    }
}
