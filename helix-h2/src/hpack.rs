//! HPACK header compression (RFC 7541).
//!
//! Thin wrapper over `fluke_hpack` that speaks `HeaderField` and maps decode
//! failures to a connection-level COMPRESSION_ERROR.

use crate::error::H2Error;

/// A single header name-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Pseudo-headers start with a colon (`:method`, `:status`, ...).
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }
}

/// HPACK encoder holding the outbound dynamic table.
pub struct Encoder {
    inner: fluke_hpack::Encoder<'static>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Encoder::new(),
        }
    }

    /// Encode a complete header list into one header block.
    pub fn encode(&mut self, headers: &[HeaderField]) -> Vec<u8> {
        self.inner.encode(
            headers
                .iter()
                .map(|h| (h.name.as_slice(), h.value.as_slice())),
        )
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// HPACK decoder holding the inbound dynamic table.
pub struct Decoder {
    inner: fluke_hpack::Decoder<'static>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            inner: fluke_hpack::Decoder::new(),
        }
    }

    /// Decode one complete header block. Any failure corrupts the shared
    /// dynamic table, so the caller must treat it as fatal for the connection.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, H2Error> {
        let fields = self
            .inner
            .decode(block)
            .map_err(|_| H2Error::CompressionError)?;
        Ok(fields
            .into_iter()
            .map(|(name, value)| HeaderField { name, value })
            .collect())
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
