//! In-process publish/subscribe.
//!
//! An [`EventBus`] fans every published value out to all of its live
//! subscribers. Each subscriber has its own queue, so a slow subscriber never
//! holds up delivery to the others, and one subscriber sees values in the
//! order they were published. A value only counts as delivered once the
//! subscriber has taken it off its queue. What happens when a subscriber does
//! not keep up is decided by the bus's [`DeliveryPolicy`]:
//!
//! - [`DeliveryPolicy::DropAfter`]: the subscriber gets a fixed amount of
//!   time to take the value, then it is dropped for that subscriber and a
//!   warning is logged. `publish` returns once the value is queued for every
//!   subscriber; the waiting happens in the background.
//! - [`DeliveryPolicy::WaitForAll`]: `publish` does not return until every
//!   subscriber took the value, or was unsubscribed while it waited.
//!
//! Subscriptions are closed with [`EventBus::unsubscribe`] or
//! [`EventBus::unsubscribe_all`]. A closed subscription reports end of
//! stream to its receiver and any delivery still waiting on it is released.
//! A subscription whose receiver was dropped is pruned on the next publish.

mod relay;
mod subscription;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use subscription::Envelope;

pub use relay::{Relay, RelayEnd};
pub use subscription::{Subscription, SubscriptionId};

/// How long a drop-after bus waits on one subscriber unless told otherwise.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Values queued for one subscriber before a drop-after bus starts dropping.
pub const SUBSCRIBER_BACKLOG: usize = 128;

static NEXT_BUS_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Give up on a subscriber that has not taken a value within the
    /// duration.
    DropAfter(Duration),
    /// Block the publisher until every subscriber has taken the value.
    WaitForAll,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::DropAfter(DEFAULT_PUBLISH_TIMEOUT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscription was already closed")]
    AlreadyUnsubscribed,

    #[error("subscription handle was never initialized")]
    SubscriptionNotInitialized,

    #[error("subscription was not issued by the {0} observer")]
    UnsupportedSubscriptionType(&'static str),
}

struct Slot<T> {
    id: SubscriptionId,
    tx: mpsc::Sender<Envelope<T>>,
    closed: CancellationToken,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// A typed publish/subscribe channel.
///
/// Subscribe, unsubscribe and publish may be called concurrently from any
/// task. The subscriber list is only locked long enough to copy it, so a
/// publish never holds the lock while waiting on a subscriber.
pub struct EventBus<T> {
    name: &'static str,
    id: u64,
    policy: DeliveryPolicy,
    next_seq: AtomicU64,
    slots: RwLock<Vec<Slot<T>>>,
}

impl<T> EventBus<T> {
    pub fn new(name: &'static str, policy: DeliveryPolicy) -> Self {
        Self {
            name,
            id: NEXT_BUS_ID.fetch_add(1, Ordering::Relaxed),
            policy,
            next_seq: AtomicU64::new(1),
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn drop_after(name: &'static str, timeout: Duration) -> Self {
        Self::new(name, DeliveryPolicy::DropAfter(timeout))
    }

    pub fn wait_for_all(name: &'static str) -> Self {
        Self::new(name, DeliveryPolicy::WaitForAll)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    /// Register a new subscriber.
    ///
    /// The subscriber sees every value published after this call returns.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BACKLOG);
        let closed = CancellationToken::new();
        let id = SubscriptionId::new(self.id, self.next_seq.fetch_add(1, Ordering::Relaxed));

        self.write().push(Slot {
            id,
            tx,
            closed: closed.clone(),
        });

        tracing::trace!(observer = self.name, subscription = %id, "subscribed");
        Subscription::new(id, rx, closed)
    }

    /// Close one subscription.
    ///
    /// The remaining subscribers keep their relative order.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
        if !id.is_initialized() {
            return Err(SubscriptionError::SubscriptionNotInitialized);
        }
        if id.bus() != self.id {
            return Err(SubscriptionError::UnsupportedSubscriptionType(self.name));
        }

        let slot = {
            let mut slots = self.write();
            let idx = slots
                .iter()
                .position(|slot| slot.id == id)
                .ok_or(SubscriptionError::AlreadyUnsubscribed)?;
            slots.remove(idx)
        };
        slot.closed.cancel();

        tracing::trace!(observer = self.name, subscription = %id, "unsubscribed");
        Ok(())
    }

    /// Close every subscription. Calling it on an empty bus is a no-op.
    pub fn unsubscribe_all(&self) {
        let slots = std::mem::take(&mut *self.write());
        if slots.is_empty() {
            return;
        }

        tracing::debug!(observer = self.name, count = slots.len(), "closing all subscriptions");
        for slot in slots {
            slot.closed.cancel();
        }
    }

    /// Snapshot of the subscribers, after dropping the ones whose receiver
    /// is gone.
    fn live_slots(&self) -> Vec<Slot<T>> {
        let slots = self.read().clone();
        if !slots.iter().any(|slot| slot.tx.is_closed()) {
            return slots;
        }

        let mut registry = self.write();
        registry.retain(|slot| {
            if !slot.tx.is_closed() {
                return true;
            }
            tracing::debug!(
                observer = self.name,
                subscription = %slot.id,
                "subscriber dropped its receiver, pruning"
            );
            slot.closed.cancel();
            false
        });
        registry.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Slot<T>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot<T>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> EventBus<T>
where
    T: Clone + fmt::Debug + Send + 'static,
{
    /// Deliver `event` to every current subscriber, following the bus's
    /// delivery policy.
    ///
    /// A subscriber that closes while a delivery is waiting on it is skipped.
    pub async fn publish(&self, event: T) {
        let slots = self.live_slots();
        if slots.is_empty() {
            tracing::trace!(observer = self.name, ?event, "no subscribers");
            return;
        }

        match self.policy {
            DeliveryPolicy::DropAfter(timeout) => {
                for slot in slots {
                    if let Some(taken) = self.enqueue(&slot, event.clone()) {
                        tokio::spawn(settle(self.name, slot, taken, Some(timeout), event.clone()));
                    }
                }
            }
            DeliveryPolicy::WaitForAll => {
                let mut deliveries = JoinSet::new();
                for slot in slots {
                    deliveries.spawn(hand_over(self.name, slot, event.clone()));
                }

                while let Some(res) = deliveries.join_next().await {
                    if let Err(e) = res {
                        tracing::warn!(observer = self.name, error = %e, "delivery task failed");
                    }
                }
            }
        }
    }

    /// Queue the value without waiting. Returns the signal that fires once the
    /// subscriber takes it, or `None` if it could not be queued.
    fn enqueue(&self, slot: &Slot<T>, event: T) -> Option<oneshot::Receiver<()>> {
        if slot.closed.is_cancelled() {
            return None;
        }

        let (envelope, taken) = Envelope::new(event);
        match slot.tx.try_send(envelope) {
            Ok(()) => Some(taken),
            Err(TrySendError::Full(envelope)) => {
                tracing::warn!(
                    observer = self.name,
                    subscription = %slot.id,
                    backlog = SUBSCRIBER_BACKLOG,
                    event = ?envelope.event,
                    "subscriber backlog is full, dropping event"
                );
                None
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(
                    observer = self.name,
                    subscription = %slot.id,
                    "subscriber dropped its receiver, skipping"
                );
                None
            }
        }
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("policy", &self.policy)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Queue `event` for a wait-for-all subscriber, waiting for room if needed,
/// then wait until it is taken.
async fn hand_over<T>(observer: &'static str, slot: Slot<T>, event: T)
where
    T: Clone + fmt::Debug + Send + 'static,
{
    let permit = tokio::select! {
        biased;
        () = slot.closed.cancelled() => return,
        permit = slot.tx.reserve() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(observer, subscription = %slot.id, "subscriber dropped its receiver, skipping");
                return;
            }
        },
    };

    let (envelope, taken) = Envelope::new(event.clone());
    permit.send(envelope);
    settle(observer, slot, taken, None, event).await;
}

/// Wait until the subscriber takes a queued value, the subscription closes,
/// or the timeout passes. A value left behind after a timeout is skipped by
/// the subscriber.
async fn settle<T>(
    observer: &'static str,
    slot: Slot<T>,
    mut taken: oneshot::Receiver<()>,
    timeout: Option<Duration>,
    event: T,
) where
    T: fmt::Debug,
{
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        res = &mut taken => {
            if res.is_err() {
                tracing::debug!(observer, subscription = %slot.id, "subscriber went away before taking event");
            }
        }
        () = slot.closed.cancelled() => {
            tracing::trace!(observer, subscription = %slot.id, "subscriber closed while delivering");
        }
        () = deadline => {
            taken.close();
            if taken.try_recv().is_err() {
                tracing::warn!(
                    observer,
                    subscription = %slot.id,
                    ?timeout,
                    ?event,
                    "timed out sending event to subscriber, dropping it"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::drop_after("test", Duration::from_secs(1));
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(1).await;
        assert_eq!(a.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(1));

        bus.publish(2).await;
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn events_reach_a_subscriber_in_publish_order() {
        let bus = EventBus::drop_after("test", Duration::from_secs(5));
        let mut sub = bus.subscribe();

        for i in 0..20 {
            bus.publish(i).await;
        }

        for i in 0..20 {
            assert_eq!(sub.recv().await, Some(i));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_subscriber_keeps_publish_order_across_threads() {
        for _ in 0..20 {
            let bus = EventBus::drop_after("test", Duration::from_secs(5));
            let mut sub = bus.subscribe();

            for i in 0..50 {
                bus.publish(i).await;
            }

            let mut seen = Vec::new();
            for _ in 0..50 {
                tokio::time::sleep(Duration::from_micros(50)).await;
                seen.push(sub.recv().await.unwrap());
            }
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_returns() {
        let bus: EventBus<u32> = EventBus::wait_for_all("test");
        tokio::time::timeout(Duration::from_millis(100), bus.publish(1))
            .await
            .expect("publish to an empty bus should not block");
    }

    #[tokio::test(start_paused = true)]
    async fn drop_after_gives_up_on_stalled_subscriber() {
        let bus = EventBus::drop_after("test", Duration::from_millis(50));
        let mut stalled = bus.subscribe();
        let mut live = bus.subscribe();

        bus.publish(1).await;
        bus.publish(2).await;
        assert_eq!(live.recv().await, Some(1));
        assert_eq!(live.recv().await, Some(2));

        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both values timed out, so the stalled subscriber never sees them.
        bus.publish(3).await;
        assert_eq!(stalled.recv().await, Some(3));
        assert_eq!(live.recv().await, Some(3));
    }

    #[tokio::test]
    async fn drop_after_publish_does_not_wait_for_slow_subscriber() {
        let bus = EventBus::drop_after("test", Duration::from_secs(60));
        let _slow = bus.subscribe();

        tokio::time::timeout(Duration::from_millis(200), async {
            bus.publish(1).await;
            bus.publish(2).await;
            bus.publish(3).await;
        })
        .await
        .expect("drop-after publish should hand slow deliveries to the background");
    }

    #[tokio::test]
    async fn wait_for_all_blocks_until_taken() {
        let bus = Arc::new(EventBus::wait_for_all("test"));
        let mut sub = bus.subscribe();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(1).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished(), "publish returned before delivery");

        assert_eq!(sub.recv().await, Some(1));
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .expect("publisher was not released once the value was taken")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_for_all_value_is_not_lost_to_a_later_close() {
        let bus = Arc::new(EventBus::wait_for_all("test"));
        let mut sub = bus.subscribe();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(1).await })
        };
        assert_eq!(sub.recv().await, Some(1));
        publisher.await.unwrap();

        bus.unsubscribe_all();
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn unsubscribe_releases_blocked_publisher() {
        let bus = Arc::new(EventBus::wait_for_all("test"));
        let sub = bus.subscribe();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(1).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publisher.is_finished());
        bus.unsubscribe(sub.id()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .expect("publisher was not released")
            .unwrap();
    }

    #[tokio::test]
    async fn closed_subscription_ends_stream() {
        let bus = EventBus::drop_after("test", Duration::from_secs(1));
        let mut sub = bus.subscribe();

        bus.publish(1).await;
        bus.unsubscribe(sub.id()).unwrap();

        assert!(sub.is_closed());
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(2).await;
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_the_others() {
        let bus = EventBus::drop_after("test", Duration::from_secs(1));
        let mut a = bus.subscribe();
        let b = bus.subscribe();
        let mut c = bus.subscribe();

        bus.unsubscribe(b.id()).unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish("hello").await;
        assert_eq!(a.recv().await, Some("hello"));
        assert_eq!(c.recv().await, Some("hello"));
    }

    #[tokio::test]
    async fn unsubscribe_errors() {
        let bus: EventBus<u8> = EventBus::drop_after("test", Duration::from_secs(1));
        let other: EventBus<u8> = EventBus::drop_after("other", Duration::from_secs(1));

        assert_eq!(
            bus.unsubscribe(SubscriptionId::default()),
            Err(SubscriptionError::SubscriptionNotInitialized)
        );

        let foreign = other.subscribe();
        assert_eq!(
            bus.unsubscribe(foreign.id()),
            Err(SubscriptionError::UnsupportedSubscriptionType("test"))
        );

        let sub = bus.subscribe();
        assert_eq!(bus.unsubscribe(sub.id()), Ok(()));
        assert_eq!(
            bus.unsubscribe(sub.id()),
            Err(SubscriptionError::AlreadyUnsubscribed)
        );
    }

    #[tokio::test]
    async fn unsubscribe_all_is_idempotent() {
        let bus: EventBus<u8> = EventBus::drop_after("test", Duration::from_secs(1));
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.unsubscribe_all();
        bus.unsubscribe_all();

        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert_eq!(
            bus.unsubscribe(a.id()),
            Err(SubscriptionError::AlreadyUnsubscribed)
        );
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = Arc::new(EventBus::wait_for_all("test"));
        let gone = bus.subscribe();
        let gone_id = gone.id();
        let mut kept = bus.subscribe();
        drop(gone);

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(7).await })
        };
        assert_eq!(kept.recv().await, Some(7));
        tokio::time::timeout(Duration::from_millis(200), publisher)
            .await
            .expect("publish should skip a dropped receiver")
            .unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(
            bus.unsubscribe(gone_id),
            Err(SubscriptionError::AlreadyUnsubscribed)
        );
    }
}
