//! Typed clients for the daemon's gRPC services.

use eyre::{Result, WrapErr};
use hyper_util::rt::TokioIo;
use tally_common::{Alert, Entry, Settings};
use time::OffsetDateTime;
use tonic::Code;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

#[cfg(not(unix))]
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::alerter::{
    DeleteAlertRequest, GetAlertListRequest, StreamAlertReply, StreamAlertRequest,
    alerter_client::AlerterClient as AlerterServiceClient,
};
pub use crate::repository::Chain;

use crate::entries::{
    CreateEntryRequest, DeleteEntryRequest, GetActiveEntryRequest, GetEntryListRequest,
    GetEntryRequest, ShutdownRequest, StatusReply, StatusRequest, StopActiveEntryRequest,
    StreamEntryReply, StreamEntryRequest, UpdateEntryRequest,
    entries_client::EntriesClient as EntriesServiceClient, entry_opt, entry_required, to_nanos,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DaemonClientErrorKind {
    Connect,
    Unavailable,
    Unimplemented,
    Other,
}

#[must_use]
pub fn classify_error(error: &eyre::Report) -> DaemonClientErrorKind {
    for cause in error.chain() {
        if cause.downcast_ref::<tonic::transport::Error>().is_some() {
            return DaemonClientErrorKind::Connect;
        }

        if let Some(status) = cause.downcast_ref::<tonic::Status>() {
            return match status.code() {
                Code::Unavailable => DaemonClientErrorKind::Unavailable,
                Code::Unimplemented => DaemonClientErrorKind::Unimplemented,
                _ => DaemonClientErrorKind::Other,
            };
        }
    }

    DaemonClientErrorKind::Other
}

#[cfg(unix)]
async fn connect(path: String) -> Result<Channel> {
    let log_path = path.clone();
    Endpoint::try_from("http://tally_local_daemon:0")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();

            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .wrap_err_with(|| {
            format!("failed to connect to local tally daemon at {log_path}. Is it running?")
        })
}

#[cfg(not(unix))]
async fn connect(port: u64) -> Result<Channel> {
    Endpoint::try_from("http://tally_local_daemon:0")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let url = format!("127.0.0.1:{port}");

            async move { Ok::<_, std::io::Error>(TokioIo::new(TcpStream::connect(url).await?)) }
        }))
        .await
        .wrap_err_with(|| {
            format!("failed to connect to local tally daemon at 127.0.0.1:{port}. Is it running?")
        })
}

#[cfg(unix)]
async fn connect_with_settings(settings: &Settings) -> Result<Channel> {
    connect(settings.daemon.socket_path.clone()).await
}

#[cfg(not(unix))]
async fn connect_with_settings(settings: &Settings) -> Result<Channel> {
    connect(settings.daemon.tcp_port).await
}

/// What to list. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub limit: u64,
    pub name_contains: String,
}

/// Changes to make to an entry. `id: None` edits the active entry, or the
/// latest one if none is active.
#[derive(Debug, Clone, Default)]
pub struct EntryEdit {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub append_name: bool,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub chain: Chain,
}

/// A new entry. Without a start it starts now.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub name: String,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub chain: Chain,
}

impl NewEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedEntry {
    pub started: Entry,
    pub stopped: Option<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedEntry {
    pub before: Entry,
    pub after: Entry,
}

pub struct EntriesClient {
    client: EntriesServiceClient<Channel>,
}

impl EntriesClient {
    #[cfg(unix)]
    pub async fn new(path: String) -> Result<Self> {
        Ok(EntriesClient {
            client: EntriesServiceClient::new(connect(path).await?),
        })
    }

    #[cfg(not(unix))]
    pub async fn new(port: u64) -> Result<Self> {
        Ok(EntriesClient {
            client: EntriesServiceClient::new(connect(port).await?),
        })
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(EntriesClient {
            client: EntriesServiceClient::new(connect_with_settings(settings).await?),
        })
    }

    pub async fn status(&mut self) -> Result<StatusReply> {
        Ok(self.client.status(StatusRequest {}).await?.into_inner())
    }

    pub async fn shutdown(&mut self) -> Result<bool> {
        let resp = self.client.shutdown(ShutdownRequest {}).await?.into_inner();
        Ok(resp.accepted)
    }

    pub async fn active_entry(&mut self) -> Result<Option<Entry>> {
        let resp = self
            .client
            .get_active_entry(GetActiveEntryRequest {})
            .await?
            .into_inner();
        Ok(entry_opt(resp.entry)?)
    }

    pub async fn entry(&mut self, id: u64) -> Result<Entry> {
        let resp = self
            .client
            .get_entry(GetEntryRequest { id })
            .await?
            .into_inner();
        Ok(entry_required(resp.entry, "entry")?)
    }

    pub async fn entries(&mut self, query: EntryQuery) -> Result<Vec<Entry>> {
        let req = GetEntryListRequest {
            start: query.start.map(to_nanos),
            end: query.end.map(to_nanos),
            limit: query.limit,
            name_contains: query.name_contains,
        };

        let resp = self.client.get_entry_list(req).await?.into_inner();
        resp.entries
            .into_iter()
            .map(|entry| Entry::try_from(entry).map_err(Into::into))
            .collect()
    }

    pub async fn create_entry(&mut self, new: NewEntry) -> Result<StartedEntry> {
        let req = CreateEntryRequest {
            name: new.name,
            start: new.start.map(to_nanos),
            end: new.end.map(to_nanos),
            chain: Some(new.chain.into()),
        };

        let resp = self.client.create_entry(req).await?.into_inner();
        Ok(StartedEntry {
            started: entry_required(resp.started, "started")?,
            stopped: entry_opt(resp.stopped)?,
        })
    }

    pub async fn update_entry(&mut self, edit: EntryEdit) -> Result<UpdatedEntry> {
        let req = UpdateEntryRequest {
            id: edit.id.unwrap_or(0),
            name: edit.name,
            start: edit.start.map(to_nanos),
            end: edit.end.map(to_nanos),
            append_name: edit.append_name,
            chain: Some(edit.chain.into()),
        };

        let resp = self.client.update_entry(req).await?.into_inner();
        Ok(UpdatedEntry {
            before: entry_required(resp.before, "before")?,
            after: entry_required(resp.after, "after")?,
        })
    }

    pub async fn delete_entry(&mut self, id: u64) -> Result<Entry> {
        let resp = self
            .client
            .delete_entry(DeleteEntryRequest { id })
            .await?
            .into_inner();
        Ok(entry_required(resp.deleted, "deleted")?)
    }

    pub async fn stop_active_entry(&mut self, end: Option<OffsetDateTime>) -> Result<Option<Entry>> {
        let req = StopActiveEntryRequest {
            end: end.map(to_nanos),
        };

        let resp = self.client.stop_active_entry(req).await?.into_inner();
        Ok(entry_opt(resp.stopped)?)
    }

    /// Open a stream of entry changes. Changes made after this returns are
    /// never missed.
    pub async fn stream_entries(&mut self) -> Result<tonic::Streaming<StreamEntryReply>> {
        Ok(self
            .client
            .stream_entry(StreamEntryRequest {})
            .await?
            .into_inner())
    }
}

pub struct AlerterClient {
    client: AlerterServiceClient<Channel>,
}

impl AlerterClient {
    #[cfg(unix)]
    pub async fn new(path: String) -> Result<Self> {
        Ok(AlerterClient {
            client: AlerterServiceClient::new(connect(path).await?),
        })
    }

    #[cfg(not(unix))]
    pub async fn new(port: u64) -> Result<Self> {
        Ok(AlerterClient {
            client: AlerterServiceClient::new(connect(port).await?),
        })
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(AlerterClient {
            client: AlerterServiceClient::new(connect_with_settings(settings).await?),
        })
    }

    pub async fn alerts(&mut self) -> Result<Vec<Alert>> {
        let resp = self
            .client
            .get_alert_list(GetAlertListRequest {})
            .await?
            .into_inner();
        resp.alerts
            .into_iter()
            .map(|alert| Alert::try_from(alert).map_err(Into::into))
            .collect()
    }

    /// Delete an alert. `Ok(None)` if no alert had that id.
    pub async fn delete_alert(&mut self, id: u64) -> Result<Option<Alert>> {
        let resp = self
            .client
            .delete_alert(DeleteAlertRequest { id })
            .await?
            .into_inner();
        Ok(resp.deleted.map(Alert::try_from).transpose()?)
    }

    pub async fn stream_alerts(&mut self) -> Result<tonic::Streaming<StreamAlertReply>> {
        Ok(self
            .client
            .stream_alert(StreamAlertRequest {})
            .await?
            .into_inner())
    }
}
