use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tally_common::{Changed, Entry, EventKind};

use crate::observer::{EventBus, Relay};
use crate::repository::Task;

/// Change notifications for one kind of record.
///
/// Every value carries a snapshot of the record and what happened to it.
/// Slow listeners get the bus's publish timeout and are then skipped.
pub struct ChangeFeed<T> {
    bus: Arc<EventBus<Changed<T>>>,
}

/// Entry changes as the outside world sees them.
pub type EntryEvents = ChangeFeed<Entry>;

/// Row changes straight from the repository.
pub type TaskEvents = ChangeFeed<Task>;

impl<T> ChangeFeed<T> {
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            bus: Arc::new(EventBus::drop_after(name, timeout)),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus<Changed<T>>> {
        &self.bus
    }

    pub fn subscribe(&self) -> Relay<Changed<T>> {
        Relay::subscribe(self.bus.clone())
    }

    pub fn unsubscribe_all(&self) {
        self.bus.unsubscribe_all();
    }
}

impl<T> ChangeFeed<T>
where
    T: Clone + fmt::Debug + Send + 'static,
{
    pub async fn publish(&self, snapshot: T, kind: EventKind) {
        self.bus.publish(Changed::new(snapshot, kind)).await;
    }

    pub async fn publish_changed(&self, changed: Changed<T>) {
        self.bus.publish(changed).await;
    }
}

impl<T> Clone for ChangeFeed<T> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
        }
    }
}

impl<T> fmt::Debug for ChangeFeed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChangeFeed").field(&self.bus).finish()
    }
}
