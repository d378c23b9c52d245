//! Core daemon infrastructure.
//!
//! - [`DaemonHandle`]: a cheap, cloneable handle to the shared state
//! - [`Component`]: a trait for the parts the daemon is made of
//! - [`Daemon`]: runs the components and the event loop
//! - [`DaemonBuilder`]: builds a [`Daemon`]

use std::sync::Arc;

use eyre::{Context, Result};
use tally_common::Settings;
use tokio::sync::broadcast;

use crate::events::DaemonEvent;
use crate::repository::Repository;

/// Shared state owned by the daemon.
pub struct DaemonState {
    event_tx: broadcast::Sender<DaemonEvent>,
    repository: Repository,
}

/// A lightweight handle to the daemon's shared state.
///
/// Components, gRPC services and spawned tasks use it to emit events and
/// reach the repository. Cloning only bumps a reference count.
#[derive(Clone)]
pub struct DaemonHandle {
    state: Arc<DaemonState>,
}

impl DaemonHandle {
    /// Emit an event to the daemon's event bus.
    ///
    /// Fire and forget: without receivers the event is dropped.
    pub fn emit(&self, event: DaemonEvent) {
        if let Err(e) = self.state.event_tx.send(event) {
            tracing::warn!("failed to emit event (no receivers?): {e}");
        }
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.state.event_tx.subscribe()
    }

    /// Request graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        self.emit(DaemonEvent::ShutdownRequested);
    }

    pub fn repository(&self) -> &Repository {
        &self.state.repository
    }
}

impl std::fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonHandle").finish_non_exhaustive()
    }
}

/// A part of the daemon that owns one concern.
///
/// # Lifecycle
///
/// 1. `start()` is called once with a [`DaemonHandle`]
/// 2. `handle_event()` is called for every event on the bus
/// 3. `stop()` is called on shutdown and must close every subscription the
///    component handed out
#[tonic::async_trait]
pub trait Component: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    async fn start(&mut self, handle: DaemonHandle) -> Result<()>;

    /// Handle an incoming event. Events emitted from here are processed in
    /// later iterations of the loop.
    async fn handle_event(&mut self, event: &DaemonEvent) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

/// The main daemon orchestrator.
///
/// The event loop waits for an event, hands it to every component in
/// registration order and repeats until `ShutdownRequested` arrives.
pub struct Daemon {
    components: Vec<Box<dyn Component>>,
    handle: DaemonHandle,
}

impl Daemon {
    pub fn builder(settings: Settings) -> DaemonBuilder {
        DaemonBuilder::new(settings)
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// Start all components. Must be called before `run_event_loop()`.
    pub async fn start_components(&mut self) -> Result<()> {
        for component in &mut self.components {
            tracing::info!(component = component.name(), "starting component");
            component
                .start(self.handle.clone())
                .await
                .with_context(|| format!("failed to start component: {}", component.name()))?;
        }
        Ok(())
    }

    /// Process events until a `ShutdownRequested` event is received.
    pub async fn run_event_loop(&mut self) -> Result<()> {
        let mut event_rx = self.handle.subscribe();
        loop {
            match event_rx.recv().await {
                Ok(DaemonEvent::ShutdownRequested) => {
                    tracing::info!("shutdown requested, stopping daemon");
                    break;
                }
                Ok(event) => {
                    tracing::debug!(?event, "processing event");
                    self.dispatch_event(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        skipped = n,
                        "event receiver lagged, some events were dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event bus closed, stopping daemon");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Stop all components, in reverse registration order.
    pub async fn stop_components(&mut self) {
        for component in self.components.iter_mut().rev() {
            tracing::info!(component = component.name(), "stopping component");
            if let Err(e) = component.stop().await {
                tracing::error!(
                    component = component.name(),
                    error = ?e,
                    "error stopping component"
                );
            }
        }
        tracing::info!("all components stopped");
    }

    /// Start the components, run the event loop and stop the components.
    pub async fn run(mut self) -> Result<()> {
        self.start_components().await?;
        self.run_event_loop().await?;
        self.stop_components().await;
        tracing::info!("daemon stopped");
        Ok(())
    }

    async fn dispatch_event(&mut self, event: &DaemonEvent) {
        for component in &mut self.components {
            if let Err(e) = component.handle_event(event).await {
                tracing::error!(
                    component = component.name(),
                    error = ?e,
                    "error handling event"
                );
            }
        }
    }
}

/// Builder for constructing a [`Daemon`].
///
/// ```ignore
/// let daemon = Daemon::builder(settings)
///     .component(EntriesComponent::new(timeout))
///     .component(AlertsComponent::new())
///     .build();
///
/// daemon.run().await?;
/// ```
pub struct DaemonBuilder {
    settings: Settings,
    repository: Option<Repository>,
    components: Vec<Box<dyn Component>>,
}

impl DaemonBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            repository: None,
            components: Vec::new(),
        }
    }

    /// Use an existing repository instead of an empty one.
    pub fn repository(mut self, repository: Repository) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Register a component.
    ///
    /// Components are started in registration order and stopped in reverse order.
    pub fn component(mut self, component: impl Component + 'static) -> Self {
        self.components.push(Box::new(component));
        self
    }

    pub fn build(self) -> Daemon {
        let repository = self
            .repository
            .unwrap_or_else(|| Repository::new(self.settings.daemon.publish_timeout()));

        let (event_tx, _) = broadcast::channel(64);

        let state = Arc::new(DaemonState {
            event_tx,
            repository,
        });

        Daemon {
            components: self.components,
            handle: DaemonHandle { state },
        }
    }
}
