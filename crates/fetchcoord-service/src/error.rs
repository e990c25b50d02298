use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

/// The terminal failure delivered to a subscriber instead of a decoded object.
///
/// Every receipt resolves exactly once, either with an object or with one of these.
/// None of them are retried by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request was cancelled by its caller, either by receipt or for the whole key.
    #[error("cancelled")]
    Cancelled,
    /// The transport finished successfully but did not yield any bytes.
    #[error("data missing")]
    DataMissing,
    /// Bytes were fetched, but the decoder could not turn them into an object.
    ///
    /// The attached string contains the decoder's reason.
    #[error("data invalid: {0}")]
    DataInvalid(String),
    /// The fetch failed on the transport level, like connection loss, DNS resolution,
    /// a timeout, or a non-success server response.
    ///
    /// The attached string contains the underlying cause.
    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// Creates a [`Transport`](Self::Transport) error from the root cause of `error`.
    pub fn transport(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Transport(error_string)
    }

    /// A short name for this kind of error, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::DataMissing => "data_missing",
            Self::DataInvalid(_) => "data_invalid",
            Self::Transport(_) => "transport",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::transport(&error)
    }
}

/// The outcome of one fetch request.
///
/// Successful objects are shared between all subscribers of the same key and the cache.
pub type FetchResult<T> = Result<Arc<T>, FetchError>;
