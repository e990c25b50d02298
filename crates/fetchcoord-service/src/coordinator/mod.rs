//! # Fetch coordination
//!
//! The [`Coordinator`] guarantees that, no matter how many callers ask for the same URL at once,
//! only a single fetch of that URL is ever running. A request goes through these steps, each of
//! which short-circuits the following ones:
//!
//! - If the decoded object is in the [`ObjectCache`], the completion handler is called right away,
//!   within the same [`fetch`](Coordinator::fetch) call.
//! - If a fetch of the URL is already in flight, the request subscribes to it and is notified
//!   once it completes.
//! - Otherwise a new fetch is registered with the request as its only subscriber, and the
//!   [`Transport`] is started on its own task.
//!
//! When the transport completes, the bytes are decoded on the blocking thread pool, a successful
//! object is put into the cache, and only then are all subscribers notified with the same result.
//! This order means a request made right after completion, even from within a completion handler,
//! is served from the cache instead of starting another fetch.
//!
//! All bookkeeping of in-flight fetches happens behind one lock. Neither the transport, nor
//! decoding, nor any completion handler ever runs while that lock is held, so handlers are free to
//! call back into the coordinator.
//!
//! ## Cancellation
//!
//! There are two ways of cancelling, and they intentionally behave differently:
//!
//! - [`cancel_receipt`](Coordinator::cancel_receipt) cancels a single subscriber. The fetch keeps
//!   running for everybody else, and is only aborted once its last subscriber is gone.
//! - [`cancel_all`](Coordinator::cancel_all) aborts the fetch of a URL and cancels all of its
//!   subscribers at once.
//!
//! Cancelled subscribers are notified synchronously, within the cancelling call. Aborting a fetch
//! is cooperative, and a fetch that completes after its entry was torn down is discarded.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Instant;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use url::Url;

use crate::caching::{MemoryPressure, ObjectCache};
use crate::config::Config;
use crate::decode::{DecodeError, Decoder, RawDecoder};
use crate::error::{FetchError, FetchResult};
use crate::transport::{HttpTransport, Transport};
use crate::utils::futures::CallOnDrop;

use self::delivery::DeliveryContext;
use self::registry::{Registry, Subscriber};

mod delivery;
mod receipt;
mod registry;

pub use self::receipt::{Receipt, ReceiptSink, ReceiptSlot};

/// Called exactly once with the outcome of a request, and the request's receipt.
pub type CompletionHandler<T> = Box<dyn FnOnce(FetchResult<T>, Receipt) + Send + 'static>;

type TransportResult = Result<Option<Bytes>, FetchError>;

/// Which subscribers of a URL a completion resolves.
#[derive(Clone, Copy, Debug)]
enum Scope<'a> {
    /// Only the subscriber holding this receipt.
    Receipt(&'a Receipt),
    /// Every subscriber, tearing down the fetch.
    Key,
    /// Every subscriber of the fetch with this generation, if it is still the registered one.
    Fetch(u64),
}

struct Inner<Tr, D: Decoder> {
    transport: Tr,
    decoder: Arc<D>,
    cache: Arc<ObjectCache<D::Output>>,
    registry: Mutex<Registry<D::Output>>,
    delivery: DeliveryContext,
    runtime: Handle,
    /// The task listening for memory pressure, if started.
    pressure: Mutex<Option<AbortHandle>>,
}

impl<Tr, D: Decoder> Drop for Inner<Tr, D> {
    fn drop(&mut self) {
        self.registry
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();

        let pressure = self
            .pressure
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pressure) = pressure {
            pressure.abort();
        }
    }
}

impl<Tr: Transport, D: Decoder> Inner<Tr, D> {
    fn registry(&self) -> MutexGuard<'_, Registry<D::Output>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completes the request right away if its object is cached.
    ///
    /// Hands the handler back on a cache miss.
    fn complete_from_cache(
        &self,
        url: &Url,
        receipt: &Receipt,
        handler: CompletionHandler<D::Output>,
    ) -> Result<(), CompletionHandler<D::Output>> {
        match self.cache.get(url) {
            Some(object) => {
                tracing::trace!(%url, "Serving from memory cache");
                metric!(counter("fetch.cache.hit") += 1);
                handler(Ok(object), receipt.clone());
                Ok(())
            }
            None => Err(handler),
        }
    }

    /// Subscribes to the in-flight fetch of `url`, or starts a new one.
    ///
    /// If the object was cached by a fetch that completed in the meantime, nothing is
    /// registered and the subscriber is handed back together with the object.
    fn join_or_start(
        self: &Arc<Self>,
        url: Url,
        subscriber: Subscriber<D::Output>,
    ) -> Option<(Subscriber<D::Output>, Arc<D::Output>)> {
        let mut registry = self.registry();

        if let Some(object) = self.cache.get(&url) {
            return Some((subscriber, object));
        }

        let subscriber = match registry.join(&url, subscriber) {
            Ok(()) => {
                tracing::trace!(%url, "Joined in-flight fetch");
                metric!(counter("fetch.inflight.join") += 1);
                return None;
            }
            Err(subscriber) => subscriber,
        };

        metric!(counter("fetch.cache.miss") += 1);
        metric!(counter("fetch.transport.start") += 1);
        tracing::debug!(%url, "Starting fetch");

        let generation = registry.start(url.clone(), subscriber);
        let fetch = self.transport.fetch(&url);
        let task = run_fetch(Arc::downgrade(self), url.clone(), generation, fetch)
            .bind_hub(Hub::new_from_top(Hub::current()));
        let handle = self.runtime.spawn(task).abort_handle();
        registry.set_handle(&url, generation, handle);

        None
    }

    /// Turns the transport's result into the result delivered to subscribers.
    ///
    /// Successfully decoded objects are put into the cache.
    async fn decode(&self, url: &Url, fetched: TransportResult) -> FetchResult<D::Output> {
        let bytes = fetched?.ok_or(FetchError::DataMissing)?;

        let decoder = Arc::clone(&self.decoder);
        let decoded = self
            .runtime
            .spawn_blocking(move || {
                let output = decoder.decode(bytes.clone())?;
                let weight = decoder.weight(&output, &bytes);
                Ok::<_, DecodeError>((output, weight))
            })
            .await;

        let (output, weight) = match decoded {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(err)) => {
                tracing::debug!(%url, error = %err, "Failed to decode");
                return Err(FetchError::DataInvalid(err.0));
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %url,
                    "Decoder panicked"
                );
                return Err(FetchError::DataInvalid("decoder panicked".into()));
            }
        };

        let object = Arc::new(output);
        self.cache.put(url.clone(), Arc::clone(&object), weight);
        Ok(object)
    }

    /// Resolves the subscribers of `url` selected by `scope` with `result`.
    ///
    /// Results of fetches are delivered on the delivery context, cancellations right away.
    /// Either way, handlers only run after the lock was released.
    fn complete(&self, url: &Url, scope: Scope<'_>, result: FetchResult<D::Output>) {
        let (mut subscribers, teardown) = {
            let mut registry = self.registry();
            match scope {
                Scope::Receipt(receipt) => match registry.remove_subscriber(url, receipt) {
                    Some(removed) => (vec![removed.subscriber], removed.emptied),
                    None => (Vec::new(), None),
                },
                Scope::Key => (Vec::new(), registry.remove(url)),
                Scope::Fetch(generation) => match registry.remove_generation(url, generation) {
                    Some(entry) => (entry.into_subscribers(), None),
                    None => {
                        tracing::debug!(%url, generation, "Discarding late completion");
                        metric!(counter("fetch.late_completion") += 1);
                        return;
                    }
                },
            }
        };

        if let Some(entry) = teardown {
            tracing::debug!(%url, "Cancelling fetch");
            entry.cancel();
            subscribers.extend(entry.into_subscribers());
        }

        for Subscriber { receipt, handler } in subscribers {
            let result = result.clone();
            match scope {
                Scope::Fetch(_) => self.delivery.deliver(move || handler(result, receipt)),
                Scope::Receipt(_) | Scope::Key => handler(result, receipt),
            }
        }
    }
}

/// The task performing one fetch, from transport to notifying subscribers.
async fn run_fetch<Tr: Transport, D: Decoder>(
    inner: Weak<Inner<Tr, D>>,
    url: Url,
    generation: u64,
    fetch: BoxFuture<'static, TransportResult>,
) {
    let start = Instant::now();
    let fetched = fetch.await;
    metric!(timer("fetch.transport.duration") = start.elapsed());

    // Nobody is left to care about the result.
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let result = inner.decode(&url, fetched).await;
    if let Err(err) = &result {
        metric!(counter("fetch.failed") += 1, "kind" => err.kind());
    }
    inner.complete(&url, Scope::Fetch(generation), result);
}

/// Coordinates fetching and caching of decoded objects by URL.
///
/// Concurrent requests for the same URL are coalesced into a single [`Transport`] fetch, see the
/// [module docs](self) for the details. This is a cheap handle, clones share the same cache and
/// in-flight fetches.
pub struct Coordinator<Tr, D: Decoder> {
    inner: Arc<Inner<Tr, D>>,
}

// https://github.com/rust-lang/rust/issues/26925
impl<Tr, D: Decoder> Clone for Coordinator<Tr, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Tr: Transport, D: Decoder> fmt::Debug for Coordinator<Tr, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .inner
            .registry
            .try_lock()
            .map(|r| r.len())
            .unwrap_or_default();
        f.debug_struct("Coordinator")
            .field("cache", &self.inner.cache)
            .field("in-flight fetches", &in_flight)
            .finish()
    }
}

impl<Tr: Transport, D: Decoder> Coordinator<Tr, D> {
    /// Creates a new coordinator running its fetches on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn new(transport: Tr, decoder: D, config: &Config) -> Self {
        Self::with_runtime(transport, decoder, config, Handle::current())
    }

    /// Creates a new coordinator running its fetches on the given `runtime`.
    pub fn with_runtime(transport: Tr, decoder: D, config: &Config, runtime: Handle) -> Self {
        let inner = Inner {
            transport,
            decoder: Arc::new(decoder),
            cache: Arc::new(ObjectCache::new(config.in_memory_capacity)),
            registry: Default::default(),
            delivery: DeliveryContext::spawn(&runtime),
            runtime,
            pressure: Default::default(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Requests the object for `url`.
    ///
    /// `handler` is called exactly once with the outcome: right away on a cache hit, on the
    /// delivery context once the fetch completes, or within the cancelling call if the request
    /// is cancelled. If a `sink` is given, the returned receipt is stored in it before anything
    /// else happens.
    ///
    /// This starts a new fetch only if the object is not cached and no fetch of `url` is already
    /// in flight.
    pub fn fetch<F>(&self, url: Url, sink: Option<&dyn ReceiptSink>, handler: F) -> Receipt
    where
        F: FnOnce(FetchResult<D::Output>, Receipt) + Send + 'static,
    {
        let receipt = Receipt::new(url.clone());
        if let Some(sink) = sink {
            sink.store(Some(receipt.clone()));
        }

        let Err(handler) = self.inner.complete_from_cache(&url, &receipt, Box::new(handler)) else {
            return receipt;
        };

        let subscriber = Subscriber {
            receipt: receipt.clone(),
            handler,
        };
        if let Some((subscriber, object)) = self.inner.join_or_start(url, subscriber) {
            tracing::trace!(url = %receipt.url(), "Serving from memory cache");
            metric!(counter("fetch.cache.hit") += 1);
            (subscriber.handler)(Ok(object), subscriber.receipt);
        }

        receipt
    }

    /// Fetches the object for `url`.
    ///
    /// This is [`fetch`](Self::fetch) as a future. Dropping the future before it resolves
    /// cancels just this request.
    pub async fn get(&self, url: Url) -> FetchResult<D::Output> {
        let (sender, receiver) = oneshot::channel();
        let receipt = self.fetch(url, None, move |result, _receipt| {
            sender.send(result).ok();
        });

        let cancel_on_drop = CallOnDrop::new(|| self.cancel_receipt(&receipt));
        let result = receiver.await.unwrap_or(Err(FetchError::Cancelled));
        cancel_on_drop.disarm();

        result
    }

    /// Cancels pending requests for `url`.
    ///
    /// With a `receipt`, this is [`cancel_receipt`](Self::cancel_receipt) restricted to `url`,
    /// otherwise it is [`cancel_all`](Self::cancel_all).
    pub fn cancel(&self, url: &Url, receipt: Option<&Receipt>) {
        let scope = match receipt {
            Some(receipt) => Scope::Receipt(receipt),
            None => Scope::Key,
        };
        metric!(
            counter("fetch.cancel") += 1,
            "mode" => if receipt.is_some() { "receipt" } else { "key" },
        );
        self.inner.complete(url, scope, Err(FetchError::Cancelled));
    }

    /// Cancels the single request identified by `receipt`.
    ///
    /// Its handler is called with [`FetchError::Cancelled`] before this returns. The fetch keeps
    /// running for the other subscribers of the same URL, and is aborted only if this was the
    /// last one. Does nothing if the request was already resolved.
    pub fn cancel_receipt(&self, receipt: &Receipt) {
        self.cancel(receipt.url(), Some(receipt));
    }

    /// Aborts the fetch of `url` and cancels every request waiting for it.
    ///
    /// All handlers are called with [`FetchError::Cancelled`] before this returns. Does nothing if
    /// no fetch of `url` is in flight.
    pub fn cancel_all(&self, url: &Url) {
        self.cancel(url, None);
    }

    /// Whether a fetch of `url` is currently in flight.
    pub fn is_in_flight(&self, url: &Url) -> bool {
        self.inner.registry().contains(url)
    }

    /// The number of requests waiting for the in-flight fetch of `url`.
    pub fn active_subscribers(&self, url: &Url) -> usize {
        self.inner.registry().subscriber_count(url)
    }

    /// The number of fetches currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.registry().len()
    }

    /// The cache holding decoded objects.
    pub fn cache(&self) -> &ObjectCache<D::Output> {
        &self.inner.cache
    }

    /// Changes the capacity of the object cache, evicting objects right away if it shrinks.
    pub fn set_cache_capacity(&self, capacity: u64) {
        tracing::debug!(capacity, "Resizing memory cache");
        self.inner.cache.set_capacity(capacity);
    }

    pub fn cache_capacity(&self) -> u64 {
        self.inner.cache.capacity()
    }

    /// Starts clearing the object cache whenever `pressure` is signalled.
    ///
    /// Replaces any previous subscription. Clearing only affects the cache, fetches in flight
    /// complete normally.
    pub fn start(&self, pressure: &MemoryPressure) {
        let mut receiver = pressure.subscribe();
        let cache = Arc::clone(&self.inner.cache);

        let task = self.inner.runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => cache.clear(),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let previous = self
            .inner
            .pressure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stops listening for memory pressure.
    ///
    /// This also happens automatically once the last handle to this coordinator is dropped,
    /// which aborts all fetches still in flight as well.
    pub fn stop(&self) {
        let pressure = self
            .inner
            .pressure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pressure) = pressure {
            pressure.abort();
        }
    }
}

impl Coordinator<HttpTransport, RawDecoder> {
    /// A process-wide default coordinator, fetching raw bytes over HTTP with the default config.
    ///
    /// It is created on first use and runs its fetches on the runtime of that first caller.
    /// Prefer constructing and passing around an explicit coordinator where possible.
    ///
    /// # Panics
    ///
    /// Panics if first called outside of a tokio runtime, or if the HTTP client cannot be created.
    pub fn shared() -> &'static Self {
        static SHARED: OnceLock<Coordinator<HttpTransport, RawDecoder>> = OnceLock::new();

        SHARED.get_or_init(|| {
            let config = Config::default();
            let transport = HttpTransport::new(&config).expect("failed to create HTTP client");
            Coordinator::new(transport, RawDecoder, &config)
        })
    }
}
