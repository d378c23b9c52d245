use std::fmt;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Opaque handle naming one subscription of one [`EventBus`](super::EventBus).
///
/// The default value is the "zero" handle: it was never handed out by any
/// bus and is rejected by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubscriptionId {
    bus: u64,
    seq: u64,
}

impl SubscriptionId {
    pub(crate) fn new(bus: u64, seq: u64) -> Self {
        Self { bus, seq }
    }

    pub(crate) fn bus(&self) -> u64 {
        self.bus
    }

    pub fn is_initialized(&self) -> bool {
        self.bus != 0 && self.seq != 0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.seq)
    }
}

/// One queued value, with the signal its publisher waits on.
pub(crate) struct Envelope<T> {
    pub(crate) event: T,
    taken: oneshot::Sender<()>,
}

impl<T> Envelope<T> {
    pub(crate) fn new(event: T) -> (Self, oneshot::Receiver<()>) {
        let (taken, rx) = oneshot::channel();
        (Self { event, taken }, rx)
    }
}

/// The receiving end of a subscription.
///
/// Once the subscription is closed (by `unsubscribe`, `unsubscribe_all` or
/// the bus going away), `recv` returns `None` and nothing else is delivered.
/// Values still queued at that point were never taken, so their publishers
/// do not count them as delivered.
pub struct Subscription<T> {
    id: SubscriptionId,
    rx: mpsc::Receiver<Envelope<T>>,
    closed: CancellationToken,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        id: SubscriptionId,
        rx: mpsc::Receiver<Envelope<T>>,
        closed: CancellationToken,
    ) -> Self {
        Self { id, rx, closed }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait for the next event. `None` means the subscription is closed.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let envelope = tokio::select! {
                biased;
                () = self.closed.cancelled() => return None,
                envelope = self.rx.recv() => envelope?,
            };

            // The publisher gave up on values it stopped waiting for.
            if envelope.taken.send(()).is_ok() {
                return Some(envelope.event);
            }
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
