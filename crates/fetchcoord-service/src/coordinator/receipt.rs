use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use url::Url;
use uuid::Uuid;

use crate::decode::Decoder;
use crate::error::FetchResult;
use crate::transport::Transport;

use super::Coordinator;

/// A handle identifying one subscriber's pending request for one URL.
///
/// A fresh receipt is created for every [`Coordinator::fetch`] call and never reused. Receipts
/// compare and hash by their unique id only, so two requests for the same URL have distinct
/// receipts that can be cancelled independently.
#[derive(Clone, Debug)]
pub struct Receipt {
    id: Uuid,
    url: Url,
}

impl Receipt {
    pub(super) fn new(url: Url) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The URL this receipt's request was made for.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl PartialEq for Receipt {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Receipt {}

impl Hash for Receipt {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Somewhere a requester keeps the receipt of its current request.
///
/// The coordinator [`store`](Self::store)s the new receipt before it does anything else, so it is
/// already in place when the completion handler runs, even for cache hits. Implementations are
/// expected to discard the receipt once they are notified of its completion. The coordinator never
/// holds on to a sink.
pub trait ReceiptSink: Send + Sync {
    fn store(&self, receipt: Option<Receipt>);

    fn current(&self) -> Option<Receipt>;
}

/// A [`ReceiptSink`] holding at most one pending receipt.
///
/// This is what an embedding layer, like a view that displays one image at a time, attaches to
/// each of its requesters.
#[derive(Debug, Default)]
pub struct ReceiptSlot {
    receipt: Mutex<Option<Receipt>>,
}

impl ReceiptSink for ReceiptSlot {
    fn store(&self, receipt: Option<Receipt>) {
        *self.receipt.lock().unwrap_or_else(PoisonError::into_inner) = receipt;
    }

    fn current(&self) -> Option<Receipt> {
        self.receipt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ReceiptSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards the stored receipt, but only if it is `receipt`.
    ///
    /// Returns whether the slot was cleared. A slot that was already reused for a newer
    /// request keeps that newer receipt.
    pub fn clear_if(&self, receipt: &Receipt) -> bool {
        let mut current = self.receipt.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref() == Some(receipt) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Cancels the request whose receipt is stored in this slot.
    ///
    /// Only that one subscriber is cancelled, other requests for the same URL keep going.
    /// Does nothing and returns `false` if no receipt is stored.
    pub fn cancel_pending<Tr, D>(&self, coordinator: &Coordinator<Tr, D>) -> bool
    where
        Tr: Transport,
        D: Decoder,
    {
        let pending = self
            .receipt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(receipt) => {
                coordinator.cancel_receipt(&receipt);
                true
            }
            None => false,
        }
    }

    /// Replaces this slot's request with a fetch of `url`.
    ///
    /// Any request still pending in the slot is cancelled first. The slot holds the new receipt
    /// until `handler` has been called for it.
    pub fn fetch<Tr, D, F>(
        self: &Arc<Self>,
        coordinator: &Coordinator<Tr, D>,
        url: Url,
        handler: F,
    ) -> Receipt
    where
        Tr: Transport,
        D: Decoder,
        F: FnOnce(FetchResult<D::Output>, Receipt) + Send + 'static,
    {
        self.cancel_pending(coordinator);

        let slot = Arc::clone(self);
        coordinator.fetch(url, Some(&**self), move |result, receipt| {
            slot.clear_if(&receipt);
            handler(result, receipt);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        "https://images.example.com/img1".parse().unwrap()
    }

    #[test]
    fn test_receipts_are_unique() {
        let first = Receipt::new(url());
        let second = Receipt::new(url());

        assert_ne!(first, second);
        assert_eq!(first, first.clone());
        assert_eq!(first.url(), second.url());
    }

    #[test]
    fn test_slot_clear_if() {
        let slot = ReceiptSlot::new();
        let old = Receipt::new(url());
        let new = Receipt::new(url());

        slot.store(Some(new.clone()));
        assert!(!slot.clear_if(&old));
        assert_eq!(slot.current(), Some(new.clone()));

        assert!(slot.clear_if(&new));
        assert_eq!(slot.current(), None);
    }
}
