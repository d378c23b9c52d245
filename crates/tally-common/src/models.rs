//! Domain models.
//!
//! These are the values that flow between the repository, the daemon's event
//! stores and the CLI. Every event published by the daemon carries an owned
//! snapshot of one of these, so later edits to the underlying record never
//! change an event that was already delivered.

use std::fmt;

use time::{Duration, OffsetDateTime};

/// A time tracked entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Unique identifier. Never reused within one daemon.
    pub id: u64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub name: String,
    pub start: OffsetDateTime,
    /// End of the entry, or `None` while it is still being tracked.
    pub end: Option<OffsetDateTime>,
}

impl Entry {
    /// Whether the entry is still running.
    pub fn is_active(&self) -> bool {
        self.end.is_none()
    }

    /// Time between start and end. Active entries are measured up to now.
    pub fn elapsed(&self) -> Duration {
        let end = self.end.unwrap_or_else(OffsetDateTime::now_utc);
        end - self.start
    }
}

/// What happened to the subject of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventKind {
    /// The peer sent a kind this version does not know about.
    #[default]
    Unspecified,
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Unspecified => "unspecified",
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A snapshot of `T` together with what happened to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changed<T> {
    pub snapshot: T,
    pub kind: EventKind,
}

impl<T> Changed<T> {
    pub fn new(snapshot: T, kind: EventKind) -> Self {
        Self { snapshot, kind }
    }

    /// Convert the snapshot while keeping the event kind.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Changed<U> {
        Changed {
            snapshot: f(self.snapshot),
            kind: self.kind,
        }
    }
}

/// An alert raised by the daemon that the user should act upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub id: u64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub kind: AlertKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    /// The user went away while `active_entry` was being tracked.
    Afk { active_entry: Entry },

    /// The user came back after being away since `afk_since`, and
    /// `active_entry` kept running the whole time.
    FormerlyAfk {
        afk_since: OffsetDateTime,
        active_entry: Entry,
    },
}

impl AlertKind {
    pub fn active_entry(&self) -> &Entry {
        match self {
            AlertKind::Afk { active_entry } | AlertKind::FormerlyAfk { active_entry, .. } => {
                active_entry
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Afk { .. } => "afk",
            AlertKind::FormerlyAfk { .. } => "formerly-afk",
        }
    }
}
