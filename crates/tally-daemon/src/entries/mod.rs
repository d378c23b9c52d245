//! Generated types for the `entries` gRPC service, and conversions to and
//! from the domain models.
//!
//! Timestamps travel as nanoseconds since the unix epoch.

use tally_common::{EventKind, models};
use thiserror::Error;
use time::OffsetDateTime;

tonic::include_proto!("entries");

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("timestamp is out of range")]
    Timestamp(#[from] time::error::ComponentRange),

    #[error("missing field: {0}")]
    Missing(&'static str),
}

impl From<ConvertError> for tonic::Status {
    fn from(e: ConvertError) -> Self {
        tonic::Status::invalid_argument(e.to_string())
    }
}

pub fn to_nanos(t: OffsetDateTime) -> i64 {
    // i64 nanoseconds cover every date up to the year 2262.
    t.unix_timestamp_nanos() as i64
}

pub fn from_nanos(nanos: i64) -> Result<OffsetDateTime, ConvertError> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))?)
}

/// Parse an optional timestamp field.
pub fn from_nanos_opt(nanos: Option<i64>) -> Result<Option<OffsetDateTime>, ConvertError> {
    nanos.map(from_nanos).transpose()
}

impl From<&models::Entry> for Entry {
    fn from(entry: &models::Entry) -> Self {
        Entry {
            id: entry.id,
            created: to_nanos(entry.created_at),
            updated: to_nanos(entry.updated_at),
            name: entry.name.clone(),
            start: to_nanos(entry.start),
            end: entry.end.map(to_nanos),
        }
    }
}

impl TryFrom<Entry> for models::Entry {
    type Error = ConvertError;

    fn try_from(entry: Entry) -> Result<Self, Self::Error> {
        Ok(models::Entry {
            id: entry.id,
            created_at: from_nanos(entry.created)?,
            updated_at: from_nanos(entry.updated)?,
            name: entry.name,
            start: from_nanos(entry.start)?,
            end: from_nanos_opt(entry.end)?,
        })
    }
}

/// Convert an optional message field, keeping `None` as `None`.
pub fn entry_opt(entry: Option<Entry>) -> Result<Option<models::Entry>, ConvertError> {
    entry.map(models::Entry::try_from).transpose()
}

/// Convert a message field the server always sets.
pub fn entry_required(entry: Option<Entry>, field: &'static str) -> Result<models::Entry, ConvertError> {
    entry_opt(entry)?.ok_or(ConvertError::Missing(field))
}

impl From<crate::repository::Chain> for Chain {
    fn from(chain: crate::repository::Chain) -> Self {
        Chain {
            start_after_id: chain.start_after_id,
            start_after_last: chain.start_after_last,
            end_before_id: chain.end_before_id,
        }
    }
}

impl From<Chain> for crate::repository::Chain {
    fn from(chain: Chain) -> Self {
        crate::repository::Chain {
            start_after_id: chain.start_after_id,
            start_after_last: chain.start_after_last,
            end_before_id: chain.end_before_id,
        }
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Unspecified => Event::Unspecified,
            EventKind::Created => Event::Created,
            EventKind::Updated => Event::Updated,
            EventKind::Deleted => Event::Deleted,
        }
    }
}

impl From<Event> for EventKind {
    fn from(event: Event) -> Self {
        match event {
            Event::Unspecified => EventKind::Unspecified,
            Event::Created => EventKind::Created,
            Event::Updated => EventKind::Updated,
            Event::Deleted => EventKind::Deleted,
        }
    }
}
