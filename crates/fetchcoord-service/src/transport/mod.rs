//! The transports that perform the actual byte fetches for a
//! [`Coordinator`](crate::coordinator::Coordinator).

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;

use crate::error::FetchError;

mod http;

pub use self::http::{HttpTransport, create_client};

/// Performs one outbound fetch for a URL.
///
/// The coordinator calls [`fetch`](Self::fetch) at most once per URL at any time, and spawns the
/// returned future as its own task. Cancelling a fetch aborts that task, which only takes effect at
/// the next await point, so implementations do not need any cancellation support of their own.
///
/// Timeouts are the transport's responsibility, the coordinator never gives up on its own.
pub trait Transport: Send + Sync + 'static {
    /// Starts fetching `url`.
    ///
    /// This should be cheap, as it is called while holding the coordinator's lock. All the actual
    /// work has to happen inside the returned future.
    ///
    /// Resolves to `Ok(None)` if the transport succeeded without yielding any bytes.
    fn fetch(&self, url: &Url) -> BoxFuture<'static, Result<Option<Bytes>, FetchError>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, Result<Option<Bytes>, FetchError>> {
        (**self).fetch(url)
    }
}
