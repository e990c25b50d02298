use tokio::sync::broadcast;

/// A process-wide "low memory" signal.
///
/// Coordinators subscribe to it via [`Coordinator::start`](crate::coordinator::Coordinator::start)
/// and drop their whole object cache whenever it fires. The embedding application decides when
/// memory is scarce and calls [`notify`](Self::notify).
#[derive(Clone, Debug)]
pub struct MemoryPressure {
    sender: broadcast::Sender<()>,
}

impl MemoryPressure {
    pub fn new() -> Self {
        // Signals carry no data, so subscribers lagging behind lose nothing.
        let (sender, _) = broadcast::channel(8);
        Self { sender }
    }

    /// Fires the signal, returning the number of subscribers that will observe it.
    pub fn notify(&self) -> usize {
        let receivers = self.sender.send(()).unwrap_or_default();
        tracing::debug!(receivers, "Memory pressure signalled");
        receivers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// The number of currently subscribed coordinators.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryPressure {
    fn default() -> Self {
        Self::new()
    }
}
