//! Bookkeeping of the fetches that are currently in flight.
//!
//! The registry itself is not synchronized, it lives behind the coordinator's lock.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tokio::task::AbortHandle;
use url::Url;

use super::{CompletionHandler, Receipt};

/// A subscriber waiting for the result of an in-flight fetch.
pub(super) struct Subscriber<T> {
    pub receipt: Receipt,
    pub handler: CompletionHandler<T>,
}

/// The outstanding fetch of one URL, and everybody waiting for it.
pub(super) struct InFlight<T> {
    /// Distinguishes this fetch from earlier, already torn down fetches of the same URL.
    generation: u64,
    /// Aborts the spawned fetch task.
    handle: Option<AbortHandle>,
    /// Subscribers in the order they subscribed.
    subscribers: Vec<Subscriber<T>>,
}

impl<T> InFlight<T> {
    /// Requests the underlying fetch to stop.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    pub fn into_subscribers(self) -> Vec<Subscriber<T>> {
        self.subscribers
    }
}

/// What is left to do after removing a single subscriber.
pub(super) struct Removed<T> {
    pub subscriber: Subscriber<T>,
    /// The torn down entry, if that was its last subscriber.
    pub emptied: Option<InFlight<T>>,
}

pub(super) struct Registry<T> {
    entries: HashMap<Url, InFlight<T>>,
    next_generation: u64,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 0,
        }
    }
}

impl<T> Registry<T> {
    /// Adds a subscriber to the in-flight fetch of `url`.
    ///
    /// Hands the subscriber back if there is nothing in flight to join.
    pub fn join(&mut self, url: &Url, subscriber: Subscriber<T>) -> Result<(), Subscriber<T>> {
        match self.entries.get_mut(url) {
            Some(entry) => {
                entry.subscribers.push(subscriber);
                Ok(())
            }
            None => Err(subscriber),
        }
    }

    /// Registers a new in-flight fetch for `url` with `subscriber` as its only subscriber.
    ///
    /// Returns the generation identifying this fetch. There must not be another fetch of `url`
    /// in flight.
    pub fn start(&mut self, url: Url, subscriber: Subscriber<T>) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let evicted = self.entries.insert(
            url,
            InFlight {
                generation,
                handle: None,
                subscribers: vec![subscriber],
            },
        );
        debug_assert!(evicted.is_none());

        generation
    }

    /// Attaches the handle of the spawned fetch task to its entry.
    pub fn set_handle(&mut self, url: &Url, generation: u64, handle: AbortHandle) {
        match self.entries.get_mut(url) {
            Some(entry) if entry.generation == generation => entry.handle = Some(handle),
            // The entry was torn down in the meantime, so the task is not needed anymore.
            _ => handle.abort(),
        }
    }

    /// Removes the subscriber holding `receipt` from the entry of `url`.
    ///
    /// The entry is removed as well if this was its last subscriber.
    pub fn remove_subscriber(&mut self, url: &Url, receipt: &Receipt) -> Option<Removed<T>> {
        let entry = self.entries.get_mut(url)?;
        let position = entry
            .subscribers
            .iter()
            .position(|s| &s.receipt == receipt)?;
        let subscriber = entry.subscribers.remove(position);

        let emptied = if entry.subscribers.is_empty() {
            self.entries.remove(url)
        } else {
            None
        };

        Some(Removed {
            subscriber,
            emptied,
        })
    }

    /// Removes the entry of `url`, whichever fetch it belongs to.
    pub fn remove(&mut self, url: &Url) -> Option<InFlight<T>> {
        self.entries.remove(url)
    }

    /// Removes the entry of `url`, but only if it still belongs to the fetch `generation`.
    pub fn remove_generation(&mut self, url: &Url, generation: u64) -> Option<InFlight<T>> {
        match self.entries.entry(url.clone()) {
            Entry::Occupied(entry) if entry.get().generation == generation => {
                Some(entry.remove())
            }
            _ => None,
        }
    }

    /// Aborts every fetch in flight, dropping their subscribers.
    pub fn abort_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.cancel();
        }
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.entries.contains_key(url)
    }

    /// The number of subscribers waiting for `url`.
    pub fn subscriber_count(&self, url: &Url) -> usize {
        self.entries.get(url).map_or(0, |e| e.subscribers.len())
    }

    /// The number of fetches in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
