//! Decoders turn the fetched bytes into the objects handed out to subscribers.

use bytes::Bytes;
use thiserror::Error;

/// The reason a [`Decoder`] rejected its input.
///
/// It reaches subscribers as [`FetchError::DataInvalid`](crate::error::FetchError::DataInvalid).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Converts fetched bytes into a domain object.
///
/// Decoding is considered CPU-bound, the coordinator runs it on the blocking thread pool.
pub trait Decoder: Send + Sync + 'static {
    /// The decoded object that is cached and delivered to subscribers.
    type Output: Send + Sync + 'static;

    /// Decodes `bytes` into an object.
    fn decode(&self, bytes: Bytes) -> Result<Self::Output, DecodeError>;

    /// The "cost" of keeping `output` in the object cache.
    ///
    /// Defaults to the size of the `raw` bytes it was decoded from.
    fn weight(&self, output: &Self::Output, raw: &Bytes) -> u32 {
        let _ = output;
        u32::try_from(raw.len()).unwrap_or(u32::MAX)
    }
}

/// A decoder that hands out the fetched bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Output = Bytes;

    fn decode(&self, bytes: Bytes) -> Result<Self::Output, DecodeError> {
        Ok(bytes)
    }
}

/// A decoder for UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Decoder;

impl Decoder for Utf8Decoder {
    type Output = String;

    fn decode(&self, bytes: Bytes) -> Result<Self::Output, DecodeError> {
        String::from_utf8(bytes.into()).map_err(|e| DecodeError::new(e.to_string()))
    }
}
