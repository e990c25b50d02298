use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The single context completion handlers of finished fetches run on.
///
/// Jobs are run one after the other, in the order they were submitted, on a dedicated task.
/// The task ends once every handle to the context is dropped.
#[derive(Clone, Debug)]
pub(super) struct DeliveryContext {
    sender: mpsc::UnboundedSender<Job>,
}

impl DeliveryContext {
    pub fn spawn(runtime: &Handle) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                // keep delivering after a panicking handler
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("A completion handler panicked");
                }
            }
        });

        Self { sender }
    }

    pub fn deliver<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(Box::new(job)).is_err() {
            tracing::warn!("Delivery context is gone, dropping completion");
        }
    }
}
