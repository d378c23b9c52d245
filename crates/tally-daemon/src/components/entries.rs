//! Entries component.
//!
//! Turns repository row changes into entry events and serves the Entries
//! gRPC service.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tally_common::{Changed, Entry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{Level, instrument};

use crate::{
    daemon::{Component, DaemonHandle},
    entries::{
        self as proto, CreateEntryReply, CreateEntryRequest, DeleteEntryReply, DeleteEntryRequest,
        GetActiveEntryReply, GetActiveEntryRequest, GetEntryListReply, GetEntryListRequest,
        GetEntryReply, GetEntryRequest, ShutdownReply, ShutdownRequest, StatusReply,
        StatusRequest, StopActiveEntryReply, StopActiveEntryRequest, StreamEntryReply,
        StreamEntryRequest, UpdateEntryReply, UpdateEntryRequest,
        entries_server::{Entries as EntriesSvc, EntriesServer},
        from_nanos_opt,
    },
    events::DaemonEvent,
    observer::RelayEnd,
    repository::{EditTask, NewTask, Task, TaskFilter},
    stores::EntryEvents,
};

pub const DAEMON_PROTOCOL_VERSION: u32 = 1;

/// Entries component.
///
/// Every change the repository commits is republished on [`EntryEvents`] as
/// an [`Entry`] snapshot. Stream subscribers listen there.
pub struct EntriesComponent {
    inner: Arc<EntriesComponentInner>,
    pump: Option<(CancellationToken, JoinHandle<()>)>,
}

struct EntriesComponentInner {
    events: EntryEvents,

    /// Handle to the daemon (set during start).
    handle: tokio::sync::RwLock<Option<DaemonHandle>>,
}

impl EntriesComponent {
    pub fn new(publish_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(EntriesComponentInner {
                events: EntryEvents::new("entries", publish_timeout),
                handle: tokio::sync::RwLock::new(None),
            }),
            pump: None,
        }
    }

    pub fn events(&self) -> &EntryEvents {
        &self.inner.events
    }

    pub fn grpc_service(&self) -> EntriesServer<EntriesGrpcService> {
        EntriesServer::new(EntriesGrpcService {
            inner: self.inner.clone(),
        })
    }
}

#[tonic::async_trait]
impl Component for EntriesComponent {
    fn name(&self) -> &'static str {
        "entries"
    }

    async fn start(&mut self, handle: DaemonHandle) -> Result<()> {
        let relay = handle.repository().events().subscribe();
        let events = self.inner.events.clone();
        let token = CancellationToken::new();

        let cancel = token.clone();
        let pump = tokio::spawn(async move {
            let end = relay
                .run(cancel.cancelled(), |changed: Changed<Task>| {
                    let events = events.clone();
                    async move {
                        events.publish_changed(changed.map(Entry::from)).await;
                        Ok::<_, Infallible>(())
                    }
                })
                .await;

            match end {
                Ok(RelayEnd::Closed) => tracing::debug!("repository stopped publishing"),
                Ok(RelayEnd::Cancelled) => tracing::debug!("entry pump cancelled"),
                Err(never) => match never {},
            }
        });

        self.pump = Some((token, pump));
        *self.inner.handle.write().await = Some(handle);

        tracing::info!("entries component started");
        Ok(())
    }

    async fn handle_event(&mut self, _event: &DaemonEvent) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some((token, pump)) = self.pump.take() {
            token.cancel();
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "entry pump ended abnormally");
            }
        }
        self.inner.events.unsubscribe_all();

        tracing::info!("entries component stopped");
        Ok(())
    }
}

/// The gRPC service implementation.
///
/// A thin wrapper that delegates to the repository through the daemon handle.
pub struct EntriesGrpcService {
    inner: Arc<EntriesComponentInner>,
}

impl EntriesGrpcService {
    async fn handle(&self) -> Result<DaemonHandle, Status> {
        self.inner
            .handle
            .read()
            .await
            .clone()
            .ok_or_else(|| Status::internal("component not initialized"))
    }
}

fn to_proto(task: Task) -> proto::Entry {
    proto::Entry::from(&Entry::from(task))
}

#[tonic::async_trait]
impl EntriesSvc for EntriesGrpcService {
    #[instrument(skip_all, level = Level::INFO)]
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusReply>, Status> {
        let reply = StatusReply {
            healthy: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            protocol: DAEMON_PROTOCOL_VERSION,
        };

        Ok(Response::new(reply))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn shutdown(
        &self,
        _request: Request<ShutdownRequest>,
    ) -> Result<Response<ShutdownReply>, Status> {
        self.handle().await?.shutdown();
        Ok(Response::new(ShutdownReply { accepted: true }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn get_active_entry(
        &self,
        _request: Request<GetActiveEntryRequest>,
    ) -> Result<Response<GetActiveEntryReply>, Status> {
        let entry = self.handle().await?.repository().active().await;
        Ok(Response::new(GetActiveEntryReply {
            entry: entry.map(to_proto),
        }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn get_entry(
        &self,
        request: Request<GetEntryRequest>,
    ) -> Result<Response<GetEntryReply>, Status> {
        let id = request.into_inner().id;
        let task = self.handle().await?.repository().get(id).await?;
        Ok(Response::new(GetEntryReply {
            entry: Some(to_proto(task)),
        }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn get_entry_list(
        &self,
        request: Request<GetEntryListRequest>,
    ) -> Result<Response<GetEntryListReply>, Status> {
        let req = request.into_inner();
        let filter = TaskFilter {
            start: from_nanos_opt(req.start)?,
            end: from_nanos_opt(req.end)?,
            limit: usize::try_from(req.limit).unwrap_or(usize::MAX),
            name_contains: Some(req.name_contains).filter(|s| !s.is_empty()),
        };

        let tasks = self.handle().await?.repository().list(&filter).await;
        Ok(Response::new(GetEntryListReply {
            entries: tasks.into_iter().map(to_proto).collect(),
        }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn create_entry(
        &self,
        request: Request<CreateEntryRequest>,
    ) -> Result<Response<CreateEntryReply>, Status> {
        let req = request.into_inner();
        let new = NewTask {
            name: req.name,
            start: from_nanos_opt(req.start)?,
            end: from_nanos_opt(req.end)?,
            chain: req.chain.map(Into::into).unwrap_or_default(),
        };

        let created = self.handle().await?.repository().create(new).await?;
        tracing::info!(id = created.started.id, "entry started");

        Ok(Response::new(CreateEntryReply {
            started: Some(to_proto(created.started)),
            stopped: created.stopped.map(to_proto),
        }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn update_entry(
        &self,
        request: Request<UpdateEntryRequest>,
    ) -> Result<Response<UpdateEntryReply>, Status> {
        let req = request.into_inner();
        let edit = EditTask {
            id: Some(req.id).filter(|id| *id != 0),
            name: req.name,
            append_name: req.append_name,
            start: from_nanos_opt(req.start)?,
            end: from_nanos_opt(req.end)?,
            chain: req.chain.map(Into::into).unwrap_or_default(),
        };

        let updated = self.handle().await?.repository().update(edit).await?;
        Ok(Response::new(UpdateEntryReply {
            before: Some(to_proto(updated.before)),
            after: Some(to_proto(updated.after)),
        }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn delete_entry(
        &self,
        request: Request<DeleteEntryRequest>,
    ) -> Result<Response<DeleteEntryReply>, Status> {
        let id = request.into_inner().id;
        let deleted = self.handle().await?.repository().delete(id).await?;
        tracing::info!(id, "entry deleted");

        Ok(Response::new(DeleteEntryReply {
            deleted: Some(to_proto(deleted)),
        }))
    }

    #[instrument(skip_all, level = Level::INFO)]
    async fn stop_active_entry(
        &self,
        request: Request<StopActiveEntryRequest>,
    ) -> Result<Response<StopActiveEntryReply>, Status> {
        let end = from_nanos_opt(request.into_inner().end)?;
        let stopped = self.handle().await?.repository().stop_active(end).await?;

        Ok(Response::new(StopActiveEntryReply {
            stopped: stopped.map(to_proto),
        }))
    }

    type StreamEntryStream = Pin<Box<dyn Stream<Item = Result<StreamEntryReply, Status>> + Send>>;

    #[instrument(skip_all, level = Level::INFO)]
    async fn stream_entry(
        &self,
        _request: Request<StreamEntryRequest>,
    ) -> Result<Response<Self::StreamEntryStream>, Status> {
        // Subscribe before replying so no change made after the reply is missed.
        let relay = self.inner.events.subscribe();
        let id = relay.id();
        let (tx, rx) = mpsc::channel::<Result<StreamEntryReply, Status>>(16);

        tokio::spawn(async move {
            let sink = tx.clone();
            let end = relay
                .run(tx.closed(), |changed: Changed<Entry>| {
                    let sink = sink.clone();
                    async move {
                        let reply = StreamEntryReply {
                            entry: Some(proto::Entry::from(&changed.snapshot)),
                            event: proto::Event::from(changed.kind).into(),
                        };
                        sink.send(Ok(reply)).await
                    }
                })
                .await;

            match end {
                Ok(RelayEnd::Closed) => tracing::debug!(subscription = %id, "entry stream closed by daemon"),
                Ok(RelayEnd::Cancelled) => tracing::debug!(subscription = %id, "entry stream client went away"),
                Err(e) => tracing::debug!(subscription = %id, error = %e, "failed to forward entry event"),
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
