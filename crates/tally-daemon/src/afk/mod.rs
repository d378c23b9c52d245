//! AFK ("away from keyboard") detection.
//!
//! The [`Detector`] polls its hooks on a fixed interval. Each hook reports
//! how long the user has been idle, and the shortest report wins. Going over
//! the threshold marks the user as away, coming back under it marks them as
//! back. Only changes of state are published; repeated reports of the same
//! state are ignored.

mod hooks;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tally_common::settings;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::observer::{EventBus, Relay};

pub use hooks::{AfkHook, HookError, HookRegisterer, platform_hooks};

/// A change in the user's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfkEvent {
    /// The user went away at `at`.
    Started { at: OffsetDateTime },
    /// The user came back after being away since `afk_since`.
    Stopped { afk_since: OffsetDateTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfkState {
    Active,
    Afk { since: OffsetDateTime },
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("afk detector is already running")]
    AlreadyRunning,

    #[error("afk poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("failed to register afk hook")]
    Register(#[source] HookError),

    #[error(
        "failed to unregister afk hooks: {}",
        .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    Unregister(Vec<HookError>),
}

/// Watches user activity and publishes [`AfkEvent`]s.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Detector {
    inner: Arc<Inner>,
}

struct Inner {
    poll_interval: Duration,
    threshold: Duration,
    registerers: Vec<Box<dyn HookRegisterer>>,
    state: Mutex<AfkState>,
    events: Arc<EventBus<AfkEvent>>,
    hooks: tokio::sync::Mutex<Vec<Box<dyn AfkHook>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
    /// Held from a state change until its event is published.
    transition: tokio::sync::Mutex<()>,
}

impl Detector {
    pub fn new(
        poll_interval: Duration,
        threshold: Duration,
        registerers: Vec<Box<dyn HookRegisterer>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                poll_interval,
                threshold,
                registerers,
                state: Mutex::new(AfkState::Active),
                events: Arc::new(EventBus::wait_for_all("afk")),
                hooks: tokio::sync::Mutex::new(Vec::new()),
                ticker: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn from_settings(settings: &settings::Afk, registerers: Vec<Box<dyn HookRegisterer>>) -> Self {
        Self::new(settings.poll_interval(), settings.threshold(), registerers)
    }

    pub fn state(&self) -> AfkState {
        *self.state_lock()
    }

    pub fn is_running(&self) -> bool {
        self.ticker_lock().is_some()
    }

    pub fn subscribe(&self) -> Relay<AfkEvent> {
        Relay::subscribe(self.inner.events.clone())
    }

    /// Register every hook and start polling.
    ///
    /// If any hook fails to register, the ones already registered are torn
    /// down again and the error is returned.
    pub async fn start_detecting(&self) -> Result<(), DetectorError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Err(DetectorError::AlreadyRunning);
        }
        if self.inner.poll_interval.is_zero() {
            return Err(DetectorError::ZeroPollInterval);
        }

        let mut hooks = Vec::with_capacity(self.inner.registerers.len());
        for registerer in &self.inner.registerers {
            match registerer.register(self) {
                Ok(Some(hook)) => {
                    tracing::debug!(hook = registerer.name(), "registered afk hook");
                    hooks.push(hook);
                }
                Ok(None) => {
                    tracing::debug!(hook = registerer.name(), "afk hook not available");
                }
                Err(e) => {
                    *self.inner.hooks.lock().await = hooks;
                    if let Err(stop) = self.stop_locked().await {
                        tracing::warn!(error = %stop, "failed to roll back afk hooks");
                    }
                    return Err(DetectorError::Register(e));
                }
            }
        }

        if hooks.is_empty() {
            tracing::warn!("no afk hooks available, the user will never be reported as away");
        }
        *self.inner.hooks.lock().await = hooks;

        let detector = self.clone();
        let poll_interval = self.inner.poll_interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                detector.tick().await;
            }
        });
        *self.ticker_lock() = Some(ticker);

        tracing::info!(?poll_interval, threshold = ?self.inner.threshold, "afk detection started");
        Ok(())
    }

    /// Stop polling, unregister every hook and close every subscription.
    ///
    /// All hooks are unregistered even if some fail; the failures are
    /// returned together.
    pub async fn stop_detecting(&self) -> Result<(), DetectorError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.stop_locked().await
    }

    async fn stop_locked(&self) -> Result<(), DetectorError> {
        if let Some(ticker) = self.ticker_lock().take() {
            ticker.abort();
        }

        let mut errors = Vec::new();
        for mut hook in self.inner.hooks.lock().await.drain(..) {
            if let Err(e) = hook.unregister() {
                tracing::error!(hook = hook.name(), error = %e, "failed to unregister afk hook");
                errors.push(e);
            }
        }

        self.inner.events.unsubscribe_all();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DetectorError::Unregister(errors))
        }
    }

    /// Poll every hook once and update the state from the shortest idle time.
    ///
    /// Nothing changes when no hook reported anything.
    pub async fn tick(&self) {
        let idle = {
            let mut hooks = self.inner.hooks.lock().await;
            let mut idle: Option<Duration> = None;
            for hook in hooks.iter_mut() {
                match hook.tick() {
                    Ok(Some(sample)) => idle = Some(idle.map_or(sample, |idle| idle.min(sample))),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(hook = hook.name(), error = %e, "afk hook tick failed"),
                }
            }
            idle
        };

        let Some(idle) = idle else {
            return;
        };

        if idle > self.inner.threshold {
            self.mark_as_afk().await;
        } else {
            self.mark_as_no_longer_afk().await;
        }
    }

    /// Mark the user as away. A no-op if they already are.
    pub async fn mark_as_afk(&self) {
        let _transition = self.inner.transition.lock().await;
        let now = OffsetDateTime::now_utc();
        {
            let mut state = self.state_lock();
            if matches!(*state, AfkState::Afk { .. }) {
                return;
            }
            *state = AfkState::Afk { since: now };
        }

        tracing::debug!("user is now afk");
        self.inner.events.publish(AfkEvent::Started { at: now }).await;
    }

    /// Mark the user as back. A no-op if they were not away.
    pub async fn mark_as_no_longer_afk(&self) {
        let _transition = self.inner.transition.lock().await;
        let afk_since = {
            let mut state = self.state_lock();
            match *state {
                AfkState::Afk { since } => {
                    *state = AfkState::Active;
                    since
                }
                AfkState::Active => return,
            }
        };

        tracing::debug!(%afk_since, "user is no longer afk");
        self.inner
            .events
            .publish(AfkEvent::Stopped { afk_since })
            .await;
    }

    fn state_lock(&self) -> MutexGuard<'_, AfkState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ticker_lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("state", &self.state())
            .field("poll_interval", &self.inner.poll_interval)
            .field("threshold", &self.inner.threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;

    /// Reports whatever idle time the test last set.
    #[derive(Clone, Default)]
    struct ScriptedIdle {
        idle: Arc<Mutex<Option<Duration>>>,
        unregistered: Arc<AtomicBool>,
    }

    impl ScriptedIdle {
        fn set(&self, idle: Option<Duration>) {
            *self.idle.lock().unwrap() = idle;
        }
    }

    impl HookRegisterer for ScriptedIdle {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn register(&self, _detector: &Detector) -> Result<Option<Box<dyn AfkHook>>, HookError> {
            Ok(Some(Box::new(self.clone())))
        }
    }

    impl AfkHook for ScriptedIdle {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn tick(&mut self) -> Result<Option<Duration>, HookError> {
            Ok(*self.idle.lock().unwrap())
        }

        fn unregister(&mut self) -> Result<(), HookError> {
            self.unregistered.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Unavailable;

    impl HookRegisterer for Unavailable {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        fn register(&self, _detector: &Detector) -> Result<Option<Box<dyn AfkHook>>, HookError> {
            Ok(None)
        }
    }

    struct Broken {
        registered: Arc<AtomicUsize>,
    }

    impl HookRegisterer for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn register(&self, _detector: &Detector) -> Result<Option<Box<dyn AfkHook>>, HookError> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            Err(HookError::new("broken", "no display"))
        }
    }

    fn listen(detector: &Detector) -> mpsc::UnboundedReceiver<AfkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = detector.subscribe();
        tokio::spawn(relay.run(std::future::pending(), move |event| {
            let tx = tx.clone();
            async move {
                tx.send(event).ok();
                Ok::<_, Infallible>(())
            }
        }));
        rx
    }

    fn detector(hooks: Vec<Box<dyn HookRegisterer>>) -> Detector {
        Detector::new(Duration::from_secs(1), Duration::from_secs(5), hooks)
    }

    #[tokio::test]
    async fn transitions_are_edge_triggered() {
        let detector = detector(Vec::new());
        let mut events = listen(&detector);

        detector.mark_as_afk().await;
        detector.mark_as_afk().await;
        let since = match detector.state() {
            AfkState::Afk { since } => since,
            AfkState::Active => panic!("expected to be afk"),
        };

        detector.mark_as_no_longer_afk().await;
        detector.mark_as_no_longer_afk().await;
        assert_eq!(detector.state(), AfkState::Active);

        assert_eq!(events.recv().await, Some(AfkEvent::Started { at: since }));
        assert_eq!(
            events.recv().await,
            Some(AfkEvent::Stopped { afk_since: since })
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn tick_follows_shortest_idle_time() {
        let busy = ScriptedIdle::default();
        let idle = ScriptedIdle::default();
        let detector = detector(vec![Box::new(busy.clone()), Box::new(idle.clone())]);
        detector.start_detecting().await.unwrap();

        idle.set(Some(Duration::from_secs(60)));
        busy.set(Some(Duration::from_secs(1)));
        detector.tick().await;
        assert_eq!(detector.state(), AfkState::Active);

        busy.set(Some(Duration::from_secs(10)));
        detector.tick().await;
        assert!(matches!(detector.state(), AfkState::Afk { .. }));

        busy.set(None);
        idle.set(None);
        detector.tick().await;
        assert!(matches!(detector.state(), AfkState::Afk { .. }));

        busy.set(Some(Duration::ZERO));
        detector.tick().await;
        assert_eq!(detector.state(), AfkState::Active);

        detector.stop_detecting().await.unwrap();
    }

    #[tokio::test]
    async fn staying_idle_reports_once() {
        let scripted = ScriptedIdle::default();
        let detector = detector(vec![Box::new(scripted.clone())]);
        let mut events = listen(&detector);
        detector.start_detecting().await.unwrap();

        scripted.set(Some(Duration::from_secs(60)));
        for _ in 0..10 {
            detector.tick().await;
        }
        detector.stop_detecting().await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(AfkEvent::Started { .. })
        ));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn starts_without_hooks() {
        let detector = detector(vec![Box::new(Unavailable)]);
        detector.start_detecting().await.unwrap();
        assert!(detector.is_running());

        assert!(matches!(
            detector.start_detecting().await,
            Err(DetectorError::AlreadyRunning)
        ));

        detector.stop_detecting().await.unwrap();
        assert!(!detector.is_running());
    }

    #[tokio::test]
    async fn zero_poll_interval_is_rejected() {
        let scripted = ScriptedIdle::default();
        let detector = Detector::new(
            Duration::ZERO,
            Duration::from_secs(5),
            vec![Box::new(scripted.clone())],
        );

        assert!(matches!(
            detector.start_detecting().await,
            Err(DetectorError::ZeroPollInterval)
        ));
        assert!(!detector.is_running());
        assert!(!scripted.unregistered.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_publish_in_order() {
        let detector = detector(Vec::new());
        let mut events = listen(&detector);

        for _ in 0..50 {
            let away = {
                let detector = detector.clone();
                tokio::spawn(async move { detector.mark_as_afk().await })
            };
            let back = {
                let detector = detector.clone();
                tokio::spawn(async move { detector.mark_as_no_longer_afk().await })
            };
            away.await.unwrap();
            back.await.unwrap();
            detector.mark_as_no_longer_afk().await;
        }
        detector.inner.events.unsubscribe_all();

        // Whatever the interleaving, the stream alternates and every
        // `Stopped` refers to the `Started` just before it.
        let mut afk_since = None;
        while let Some(event) = events.recv().await {
            match event {
                AfkEvent::Started { at } => {
                    assert_eq!(afk_since, None, "two starts in a row");
                    afk_since = Some(at);
                }
                AfkEvent::Stopped { afk_since: since } => {
                    assert_eq!(afk_since.take(), Some(since), "stop without its start");
                }
            }
        }
        assert_eq!(afk_since, None);
    }

    #[tokio::test]
    async fn failed_registration_rolls_back() {
        let scripted = ScriptedIdle::default();
        let registered = Arc::new(AtomicUsize::new(0));
        let detector = detector(vec![
            Box::new(scripted.clone()),
            Box::new(Broken {
                registered: registered.clone(),
            }),
        ]);
        let mut events = listen(&detector);

        let err = detector.start_detecting().await.unwrap_err();
        assert!(matches!(err, DetectorError::Register(ref e) if e.hook == "broken"));
        assert_eq!(registered.load(Ordering::SeqCst), 1);
        assert!(scripted.unregistered.load(Ordering::SeqCst));
        assert!(!detector.is_running());

        // Listeners were closed as part of the roll back.
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn stop_closes_listeners() {
        let scripted = ScriptedIdle::default();
        let detector = detector(vec![Box::new(scripted.clone())]);
        let mut events = listen(&detector);

        detector.start_detecting().await.unwrap();
        detector.stop_detecting().await.unwrap();

        assert!(scripted.unregistered.load(Ordering::SeqCst));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_polls_hooks() {
        let scripted = ScriptedIdle::default();
        let detector = detector(vec![Box::new(scripted.clone())]);
        let mut events = listen(&detector);

        scripted.set(Some(Duration::from_secs(30)));
        detector.start_detecting().await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(AfkEvent::Started { .. })
        ));

        scripted.set(Some(Duration::from_secs(2)));
        assert!(matches!(
            events.recv().await,
            Some(AfkEvent::Stopped { .. })
        ));

        detector.stop_detecting().await.unwrap();
    }
}
