use eyre::Result;
use tally_common::Settings;

pub mod afk;
pub mod alerter;
pub mod client;
pub mod components;
pub mod daemon;
pub mod entries;
pub mod events;
pub mod observer;
pub mod repository;
pub mod server;
pub mod stores;

pub use daemon::{Component, Daemon, DaemonBuilder, DaemonHandle};
pub use events::DaemonEvent;

pub use components::{AfkComponent, AlertsComponent, EntriesComponent};

pub use client::{AlerterClient, EntriesClient};

/// Boot the daemon.
///
/// Creates the standard components, starts the gRPC server with their
/// services and runs the event loop until shutdown is requested.
pub async fn boot(settings: Settings) -> Result<()> {
    let entries_component = EntriesComponent::new(settings.daemon.publish_timeout());
    let alerts_component = AlertsComponent::new();
    let afk_component = AfkComponent::new(&settings.afk, afk::platform_hooks());

    // The services share state with their components.
    let entries_service = entries_component.grpc_service();
    let alerter_service = alerts_component.grpc_service();

    let mut daemon = Daemon::builder(settings.clone())
        .component(entries_component)
        .component(alerts_component)
        .component(afk_component)
        .build();

    let handle = daemon.handle();

    daemon.start_components().await?;

    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "failed to listen for shutdown signals");
            return;
        }
        tracing::info!("received shutdown signal");
        signal_handle.shutdown();
    });

    server::run_grpc_server(settings, entries_service, alerter_service, handle).await?;

    daemon.run_event_loop().await?;

    daemon.stop_components().await;

    tracing::info!("daemon shut down complete");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = int.recv() => {},
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
