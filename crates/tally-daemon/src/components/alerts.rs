//! Alerts component.
//!
//! Raises and clears the AFK alerts as presence events come in, and serves
//! the Alerter gRPC service.

use std::pin::Pin;
use std::sync::Arc;

use eyre::Result;
use tally_common::Entry;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{Level, instrument};

use crate::{
    alerter::{
        self as proto, DeleteAlertReply, DeleteAlertRequest, GetAlertListReply,
        GetAlertListRequest, StreamAlertReply, StreamAlertRequest,
        alerter_server::{Alerter as AlerterSvc, AlerterServer},
    },
    daemon::{Component, DaemonHandle},
    entries,
    events::DaemonEvent,
    observer::RelayEnd,
    stores::{AlertEvent, AlertStore},
};

pub struct AlertsComponent {
    store: Arc<AlertStore>,
    handle: Option<DaemonHandle>,
}

impl AlertsComponent {
    pub fn new() -> Self {
        Self {
            store: Arc::new(AlertStore::new()),
            handle: None,
        }
    }

    pub fn store(&self) -> &Arc<AlertStore> {
        &self.store
    }

    pub fn grpc_service(&self) -> AlerterServer<AlerterGrpcService> {
        AlerterServer::new(AlerterGrpcService {
            store: self.store.clone(),
        })
    }
}

impl Default for AlertsComponent {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Component for AlertsComponent {
    fn name(&self) -> &'static str {
        "alerts"
    }

    async fn start(&mut self, handle: DaemonHandle) -> Result<()> {
        self.handle = Some(handle);
        tracing::info!("alerts component started");
        Ok(())
    }

    async fn handle_event(&mut self, event: &DaemonEvent) -> Result<()> {
        let Some(handle) = &self.handle else {
            return Ok(());
        };

        match event {
            DaemonEvent::AfkStarted { at } => match handle.repository().active().await {
                Some(task) => self.store.set_afk(Entry::from(task)).await,
                None => tracing::debug!(%at, "user went away with nothing running"),
            },
            DaemonEvent::AfkStopped { afk_since } => {
                self.store.set_formerly_afk(*afk_since).await;
            }
            DaemonEvent::ShutdownRequested => {}
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.store.unsubscribe_all();
        tracing::info!("alerts component stopped");
        Ok(())
    }
}

pub struct AlerterGrpcService {
    store: Arc<AlertStore>,
}

#[tonic::async_trait]
impl AlerterSvc for AlerterGrpcService {
    #[instrument(skip_all, level = Level::INFO)]
    async fn get_alert_list(
        &self,
        _request: Request<GetAlertListRequest>,
    ) -> Result<Response<GetAlertListReply>, Status> {
        let alerts = self.store.alerts().await;
        Ok(Response::new(GetAlertListReply {
            alerts: alerts.iter().map(proto::Alert::from).collect(),
        }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn delete_alert(
        &self,
        request: Request<DeleteAlertRequest>,
    ) -> Result<Response<DeleteAlertReply>, Status> {
        let id = request.into_inner().id;
        let deleted = self.store.delete(id).await;
        if deleted.is_none() {
            tracing::debug!(id, "no alert to delete");
        }

        Ok(Response::new(DeleteAlertReply {
            deleted: deleted.as_ref().map(proto::Alert::from),
        }))
    }

    type StreamAlertStream = Pin<Box<dyn Stream<Item = Result<StreamAlertReply, Status>> + Send>>;

    #[instrument(skip_all, level = Level::INFO)]
    async fn stream_alert(
        &self,
        _request: Request<StreamAlertRequest>,
    ) -> Result<Response<Self::StreamAlertStream>, Status> {
        let relay = self.store.subscribe();
        let id = relay.id();
        let (tx, rx) = mpsc::channel::<Result<StreamAlertReply, Status>>(16);

        tokio::spawn(async move {
            let sink = tx.clone();
            let end = relay
                .run(tx.closed(), |changed: AlertEvent| {
                    let sink = sink.clone();
                    async move {
                        let reply = StreamAlertReply {
                            alert: Some(proto::Alert::from(&changed.snapshot)),
                            event: entries::Event::from(changed.kind).into(),
                        };
                        sink.send(Ok(reply)).await
                    }
                })
                .await;

            match end {
                Ok(RelayEnd::Closed) => tracing::debug!(subscription = %id, "alert stream closed by daemon"),
                Ok(RelayEnd::Cancelled) => tracing::debug!(subscription = %id, "alert stream client went away"),
                Err(e) => tracing::debug!(subscription = %id, error = %e, "failed to forward alert event"),
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
