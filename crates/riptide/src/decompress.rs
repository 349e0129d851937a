//! Transparent response decompression.

use bytes::Bytes;
use flate2::{Decompress, FlushDecompress, Status};

use riptide_core::{HttpError, HttpResult};

/// Content encodings the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    /// RFC 1952 gzip.
    Gzip,
    /// RFC 1950 zlib, the common meaning of HTTP `deflate`.
    Deflate,
}

impl ContentEncoding {
    /// Maps a `Content-Encoding` value to a supported encoding.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }
}

/// Streaming gzip/deflate decoder sitting between the HTTP codec and the
/// message handler.
///
/// Chunks are fed in wire order; each call returns whatever decoded
/// bytes became available.
pub struct ContentDecoder {
    inner: Decompress,
}

impl std::fmt::Debug for ContentDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDecoder")
            .field("bytes_in", &self.inner.total_in())
            .field("bytes_out", &self.inner.total_out())
            .finish()
    }
}

impl ContentDecoder {
    /// Creates a decoder for `encoding`.
    pub fn new(encoding: ContentEncoding) -> Self {
        let inner = match encoding {
            ContentEncoding::Gzip => Decompress::new_gzip(15),
            ContentEncoding::Deflate => Decompress::new(true),
        };
        Self { inner }
    }

    /// Decodes one wire chunk, returning the decoded bytes.
    pub fn feed(&mut self, input: &[u8]) -> HttpResult<Bytes> {
        let mut decoded = Vec::with_capacity(input.len().saturating_mul(3));
        let mut consumed = 0;
        let mut scratch = [0u8; 8 * 1024];

        while consumed < input.len() {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();

            let status = self
                .inner
                .decompress(&input[consumed..], &mut scratch, FlushDecompress::None)
                .map_err(|e| HttpError::Codec(format!("decompression failed: {e}")))?;

            let read = (self.inner.total_in() - before_in) as usize;
            let wrote = (self.inner.total_out() - before_out) as usize;
            consumed += read;
            decoded.extend_from_slice(&scratch[..wrote]);

            match status {
                Status::StreamEnd => break,
                // No progress means the stream needs more input.
                _ if read == 0 && wrote == 0 => break,
                _ => {}
            }
        }

        Ok(Bytes::from(decoded))
    }
}
