//! The alert store.
//!
//! Only two alerts can exist at a time: one saying the user is away right
//! now, and one saying the user was away and has come back. Raising one
//! clears the other.

use std::sync::{Arc, Mutex, PoisonError};

use tally_common::{Alert, AlertKind, Changed, Entry, EventKind};
use time::OffsetDateTime;

use crate::observer::{EventBus, Relay};

pub type AlertEvent = Changed<Alert>;

#[derive(Debug, Default)]
struct AlertState {
    /// The entry that was running when the user went away.
    afk_active_entry: Option<Entry>,
    afk: Option<Alert>,
    formerly_afk: Option<Alert>,
}

/// Keeps the alert slots and tells listeners about every change.
///
/// Listeners are waited on: a raised or cleared alert is never dropped for a
/// slow listener.
#[derive(Debug)]
pub struct AlertStore {
    bus: Arc<EventBus<AlertEvent>>,
    last_id: Mutex<u64>,
    state: tokio::sync::Mutex<AlertState>,
}

impl AlertStore {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(EventBus::wait_for_all("alerts")),
            last_id: Mutex::new(0),
            state: tokio::sync::Mutex::new(AlertState::default()),
        }
    }

    pub fn subscribe(&self) -> Relay<AlertEvent> {
        Relay::subscribe(self.bus.clone())
    }

    pub fn unsubscribe_all(&self) {
        self.bus.unsubscribe_all();
    }

    /// All current alerts, the AFK alert first.
    pub async fn alerts(&self) -> Vec<Alert> {
        let state = self.state.lock().await;
        state
            .afk
            .iter()
            .chain(state.formerly_afk.iter())
            .cloned()
            .collect()
    }

    /// Raise the AFK alert for `active_entry`.
    ///
    /// Clears a formerly-AFK alert first. Does nothing more if an AFK alert
    /// already exists.
    pub async fn set_afk(&self, active_entry: Entry) {
        let mut state = self.state.lock().await;

        if let Some(id) = state.formerly_afk.as_ref().map(|alert| alert.id) {
            self.delete_locked(&mut state, id).await;
        }
        if state.afk.is_some() {
            return;
        }

        let now = OffsetDateTime::now_utc();
        let alert = Alert {
            id: self.next_id(),
            created_at: now,
            updated_at: now,
            kind: AlertKind::Afk {
                active_entry: active_entry.clone(),
            },
        };

        tracing::info!(alert = alert.id, entry = active_entry.id, "user is away");
        state.afk_active_entry = Some(active_entry);
        state.afk = Some(alert.clone());

        self.bus
            .publish(Changed::new(alert, EventKind::Created))
            .await;
    }

    /// Replace the AFK alert with a formerly-AFK alert.
    ///
    /// Needs an active entry captured by [`AlertStore::set_afk`]. The captured
    /// entry is used up, so coming back twice from one absence only alerts
    /// once.
    pub async fn set_formerly_afk(&self, afk_since: OffsetDateTime) {
        let mut state = self.state.lock().await;

        if let Some(id) = state.afk.as_ref().map(|alert| alert.id) {
            self.delete_locked(&mut state, id).await;
        }
        if state.formerly_afk.is_some() {
            return;
        }
        let Some(active_entry) = state.afk_active_entry.take() else {
            tracing::debug!("no entry was running while the user was away");
            return;
        };

        let now = OffsetDateTime::now_utc();
        let alert = Alert {
            id: self.next_id(),
            created_at: now,
            updated_at: now,
            kind: AlertKind::FormerlyAfk {
                afk_since,
                active_entry,
            },
        };

        tracing::info!(alert = alert.id, %afk_since, "user is back");
        state.formerly_afk = Some(alert.clone());

        self.bus
            .publish(Changed::new(alert, EventKind::Created))
            .await;
    }

    /// Remove the alert with `id`. Returns `None` when no alert has that id.
    pub async fn delete(&self, id: u64) -> Option<Alert> {
        let mut state = self.state.lock().await;
        self.delete_locked(&mut state, id).await
    }

    async fn delete_locked(&self, state: &mut AlertState, id: u64) -> Option<Alert> {
        let slot = if state.afk.as_ref().is_some_and(|alert| alert.id == id) {
            &mut state.afk
        } else if state.formerly_afk.as_ref().is_some_and(|alert| alert.id == id) {
            &mut state.formerly_afk
        } else {
            return None;
        };

        let alert = slot.take()?;
        tracing::debug!(alert = alert.id, kind = alert.kind.as_str(), "alert deleted");

        self.bus
            .publish(Changed::new(alert.clone(), EventKind::Deleted))
            .await;
        Some(alert)
    }

    fn next_id(&self) -> u64 {
        let mut last_id = self.last_id.lock().unwrap_or_else(PoisonError::into_inner);
        *last_id += 1;
        *last_id
    }
}

impl Default for AlertStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use pretty_assertions::assert_eq;
    use time::macros::datetime;
    use tokio::sync::mpsc;

    use super::*;

    fn entry() -> Entry {
        let at = datetime!(2026-03-01 09:00 UTC);
        Entry {
            id: 42,
            created_at: at,
            updated_at: at,
            name: "review".to_string(),
            start: at,
            end: None,
        }
    }

    /// Collect every alert event into a channel.
    fn listen(store: &AlertStore) -> mpsc::UnboundedReceiver<(EventKind, &'static str, u64)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = store.subscribe();
        tokio::spawn(relay.run(std::future::pending(), move |changed: AlertEvent| {
            let tx = tx.clone();
            async move {
                tx.send((changed.kind, changed.snapshot.kind.as_str(), changed.snapshot.id))
                    .ok();
                Ok::<_, Infallible>(())
            }
        }));
        rx
    }

    #[tokio::test]
    async fn afk_then_back() {
        let store = AlertStore::new();
        let mut events = listen(&store);
        let since = datetime!(2026-03-01 10:00 UTC);

        store.set_afk(entry()).await;
        store.set_formerly_afk(since).await;

        assert_eq!(events.recv().await, Some((EventKind::Created, "afk", 1)));
        assert_eq!(events.recv().await, Some((EventKind::Deleted, "afk", 1)));
        assert_eq!(
            events.recv().await,
            Some((EventKind::Created, "formerly-afk", 2))
        );

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(
            alerts[0].kind,
            AlertKind::FormerlyAfk {
                afk_since: since,
                active_entry: entry(),
            }
        );
    }

    #[tokio::test]
    async fn set_afk_twice_keeps_one_alert() {
        let store = AlertStore::new();
        store.set_afk(entry()).await;
        store.set_afk(entry()).await;

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].id, 1);
    }

    #[tokio::test]
    async fn going_away_again_clears_formerly_afk() {
        let store = AlertStore::new();
        store.set_afk(entry()).await;
        store.set_formerly_afk(datetime!(2026-03-01 10:00 UTC)).await;
        store.set_afk(entry()).await;

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind.as_str(), "afk");
        assert_eq!(alerts[0].id, 3);
    }

    #[tokio::test]
    async fn formerly_afk_needs_a_captured_entry() {
        let store = AlertStore::new();
        store.set_formerly_afk(datetime!(2026-03-01 10:00 UTC)).await;
        assert!(store.alerts().await.is_empty());

        store.set_afk(entry()).await;
        store.set_formerly_afk(datetime!(2026-03-01 10:00 UTC)).await;
        store.delete(2).await.unwrap();

        // The captured entry was used by the first return.
        store.set_formerly_afk(datetime!(2026-03-01 11:00 UTC)).await;
        assert!(store.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_an_error() {
        let store = AlertStore::new();
        let mut events = listen(&store);

        store.set_afk(entry()).await;
        assert_eq!(store.delete(99).await, None);

        let deleted = store.delete(1).await.unwrap();
        assert_eq!(deleted.id, 1);
        assert!(store.alerts().await.is_empty());

        assert_eq!(events.recv().await, Some((EventKind::Created, "afk", 1)));
        assert_eq!(events.recv().await, Some((EventKind::Deleted, "afk", 1)));
    }

    #[tokio::test]
    async fn deleting_twice_publishes_once() {
        let store = AlertStore::new();
        let mut events = listen(&store);

        store.set_afk(entry()).await;
        let id = store.alerts().await[0].id;

        assert_eq!(store.delete(id).await.map(|alert| alert.id), Some(id));
        assert!(store.alerts().await.is_empty());
        assert_eq!(store.delete(id).await, None);

        // Every taken event reaches the channel before the listener ends.
        store.unsubscribe_all();
        assert_eq!(events.recv().await, Some((EventKind::Created, "afk", id)));
        assert_eq!(events.recv().await, Some((EventKind::Deleted, "afk", id)));
        assert_eq!(events.recv().await, None);
    }
}
