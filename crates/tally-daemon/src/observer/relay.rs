//! Forward a subscription somewhere else until either side goes away.
//!
//! Both gRPC stream handlers and daemon components follow the same loop:
//! subscribe, forward every value, stop when the bus closes the subscription
//! or the consumer goes away, and always unsubscribe on the way out. [`Relay`]
//! is that loop.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::{EventBus, Subscription, SubscriptionError, SubscriptionId};

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The bus closed the subscription.
    Closed,
    /// The consumer asked to stop.
    Cancelled,
}

/// A subscription bound to the bus it came from.
///
/// Dropping a relay unsubscribes it, whether or not [`Relay::run`] was ever
/// called, so a relay that exits early never leaves a dead subscriber behind.
pub struct Relay<T> {
    bus: Arc<EventBus<T>>,
    subscription: Subscription<T>,
}

impl<T> Relay<T> {
    /// Subscribe right away. Values published from this point on are relayed.
    pub fn subscribe(bus: Arc<EventBus<T>>) -> Self {
        let subscription = bus.subscribe();
        Self { bus, subscription }
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Forward every value to `forward` until the subscription closes or
    /// `cancel` resolves.
    ///
    /// A forwarding error stops the relay and is returned to the caller.
    pub async fn run<C, F, Fut, E>(mut self, cancel: C, mut forward: F) -> Result<RelayEnd, E>
    where
        C: Future<Output = ()>,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        tokio::pin!(cancel);

        loop {
            let event = tokio::select! {
                biased;
                () = &mut cancel => return Ok(RelayEnd::Cancelled),
                event = self.subscription.recv() => event,
            };

            match event {
                Some(event) => forward(event).await?,
                None => return Ok(RelayEnd::Closed),
            }
        }
    }
}

impl<T> Drop for Relay<T> {
    fn drop(&mut self) {
        let id = self.subscription.id();
        match self.bus.unsubscribe(id) {
            Ok(()) => {}
            Err(SubscriptionError::AlreadyUnsubscribed) => {
                tracing::debug!(observer = self.bus.name(), subscription = %id, "already unsubscribed");
            }
            Err(e) => {
                tracing::warn!(observer = self.bus.name(), subscription = %id, error = %e, "failed to unsubscribe");
            }
        }
    }
}

impl<T> fmt::Debug for Relay<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("observer", &self.bus.name())
            .field("subscription", &self.subscription.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[tokio::test]
    async fn forwards_until_the_bus_closes() {
        let bus = Arc::new(EventBus::drop_after("test", Duration::from_secs(1)));
        let relay = Relay::subscribe(bus.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(relay.run(std::future::pending(), move |event: u32| {
            let tx = tx.clone();
            async move {
                tx.send(event).ok();
                Ok::<_, Infallible>(())
            }
        }));

        bus.publish(1).await;
        bus.publish(2).await;
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));

        bus.unsubscribe_all();
        assert_eq!(task.await.unwrap(), Ok(RelayEnd::Closed));
    }

    #[tokio::test]
    async fn cancel_unsubscribes() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::wait_for_all("test"));
        let relay = Relay::subscribe(bus.clone());
        let id = relay.id();
        assert_eq!(bus.subscriber_count(), 1);

        let token = CancellationToken::new();
        let task = {
            let token = token.clone();
            tokio::spawn(async move {
                relay
                    .run(token.cancelled(), |_| async { Ok::<_, Infallible>(()) })
                    .await
            })
        };

        token.cancel();
        assert_eq!(task.await.unwrap(), Ok(RelayEnd::Cancelled));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(
            bus.unsubscribe(id),
            Err(SubscriptionError::AlreadyUnsubscribed)
        );
    }

    #[tokio::test]
    async fn forward_error_stops_and_unsubscribes() {
        let bus = Arc::new(EventBus::drop_after("test", Duration::from_secs(1)));
        let relay = Relay::subscribe(bus.clone());

        let task = tokio::spawn(relay.run(std::future::pending(), |event: u32| async move {
            if event == 2 { Err("consumer gone") } else { Ok(()) }
        }));

        bus.publish(1).await;
        bus.publish(2).await;

        assert_eq!(task.await.unwrap(), Err("consumer gone"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_all_ends_every_waiting_relay() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::wait_for_all("test"));
        let relays: Vec<_> = (0..8)
            .map(|_| {
                let relay = Relay::subscribe(bus.clone());
                tokio::spawn(relay.run(std::future::pending(), |_| async {
                    Ok::<_, Infallible>(())
                }))
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.unsubscribe_all();

        for relay in relays {
            let end = tokio::time::timeout(Duration::from_secs(1), relay)
                .await
                .expect("relay did not notice the bus closing")
                .unwrap();
            assert_eq!(end, Ok(RelayEnd::Closed));
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_an_unstarted_relay_unsubscribes() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::wait_for_all("test"));
        let relay = Relay::subscribe(bus.clone());
        assert_eq!(bus.subscriber_count(), 1);

        drop(relay);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
