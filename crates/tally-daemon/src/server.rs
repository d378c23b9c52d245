use eyre::Result;
use tally_common::Settings;
use tonic::transport::Server;

use crate::alerter::alerter_server::AlerterServer;
use crate::components::alerts::AlerterGrpcService;
use crate::components::entries::EntriesGrpcService;
use crate::daemon::DaemonHandle;
use crate::entries::entries_server::EntriesServer;
use crate::events::DaemonEvent;

/// Resolve once the daemon asks to shut down.
async fn shutdown_requested(handle: DaemonHandle) {
    let mut rx = handle.subscribe();
    loop {
        match rx.recv().await {
            Ok(DaemonEvent::ShutdownRequested) => break,
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Run the gRPC server with the given services.
///
/// This starts the server in the background and returns once the socket is
/// bound. The server shuts down when a ShutdownRequested event is received.
#[cfg(unix)]
pub async fn run_grpc_server(
    settings: Settings,
    entries_service: EntriesServer<EntriesGrpcService>,
    alerter_service: AlerterServer<AlerterGrpcService>,
    handle: DaemonHandle,
) -> Result<()> {
    use tokio::net::UnixListener;
    use tokio_stream::wrappers::UnixListenerStream;

    let socket_path = settings.daemon.socket_path.clone();

    if let Some(parent) = std::path::Path::new(&socket_path).parent() {
        fs_err::create_dir_all(parent)?;
    }
    tracing::info!(socket = %socket_path, "listening on unix socket");
    let uds = UnixListener::bind(&socket_path)?;

    let uds_stream = UnixListenerStream::new(uds);

    let shutdown_signal = async move {
        shutdown_requested(handle).await;
        tracing::debug!("removing socket");
        if let Err(e) = fs_err::remove_file(&socket_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("failed to remove socket: {e}");
        }
        tracing::info!("shutting down gRPC server");
    };

    tokio::spawn(async move {
        if let Err(e) = Server::builder()
            .add_service(entries_service)
            .add_service(alerter_service)
            .serve_with_incoming_shutdown(uds_stream, shutdown_signal)
            .await
        {
            tracing::error!("gRPC server error: {e}");
        }
    });

    Ok(())
}

/// Run the gRPC server with the given services (TCP version).
#[cfg(not(unix))]
pub async fn run_grpc_server(
    settings: Settings,
    entries_service: EntriesServer<EntriesGrpcService>,
    alerter_service: AlerterServer<AlerterGrpcService>,
    handle: DaemonHandle,
) -> Result<()> {
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;

    let port = settings.daemon.tcp_port;
    let url = format!("127.0.0.1:{port}");
    let tcp = TcpListener::bind(&url).await?;
    let tcp_stream = TcpListenerStream::new(tcp);

    tracing::info!("listening on tcp port {port}");

    let shutdown_signal = async move {
        shutdown_requested(handle).await;
        tracing::info!("shutting down gRPC server");
    };

    tokio::spawn(async move {
        if let Err(e) = Server::builder()
            .add_service(entries_service)
            .add_service(alerter_service)
            .serve_with_incoming_shutdown(tcp_stream, shutdown_signal)
            .await
        {
            tracing::error!("gRPC server error: {e}");
        }
    });

    Ok(())
}
