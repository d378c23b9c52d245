//! In-memory storage of tracked entries.
//!
//! The repository owns the rows and publishes a [`TaskEvents`] change for
//! every mutation once the write lock has been released, so a listener that
//! reads the repository back always sees the committed state.

use std::collections::BTreeMap;
use std::time::Duration;

use tally_common::{Entry, EventKind};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::stores::TaskEvents;

/// A stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub name: String,
    pub start: OffsetDateTime,
    pub end: Option<OffsetDateTime>,
}

impl From<Task> for Entry {
    fn from(task: Task) -> Self {
        Entry {
            id: task.id,
            created_at: task.created_at,
            updated_at: task.updated_at,
            name: task.name,
            start: task.start,
            end: task.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("entry {0} not found")]
    NotFound(u64),

    #[error("there is no entry to edit")]
    NoEntryToEdit,

    #[error("there is no entry to start after")]
    NoEntryToFollow,

    #[error("entry name cannot be empty")]
    NameEmpty,

    #[error("entry cannot end before it starts")]
    EndBeforeStart,
}

impl From<StoreError> for tonic::Status {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) | StoreError::NoEntryToEdit | StoreError::NoEntryToFollow => {
                tonic::Status::not_found(e.to_string())
            }
            StoreError::NameEmpty | StoreError::EndBeforeStart => {
                tonic::Status::invalid_argument(e.to_string())
            }
        }
    }
}

/// Place a row next to existing ones instead of giving explicit times.
///
/// A chained time wins over an explicit `start` or `end`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chain {
    /// Start when this row ends, or now if it is still running.
    pub start_after_id: Option<u64>,
    /// Start when the latest row ends, or now if it is still running.
    /// Ignored when `start_after_id` is set.
    pub start_after_last: bool,
    /// End when this row starts.
    pub end_before_id: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    /// Defaults to now.
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub chain: Chain,
}

#[derive(Debug, Clone, Default)]
pub struct EditTask {
    /// `None` edits the active entry, or the latest one if none is active.
    pub id: Option<u64>,
    pub name: Option<String>,
    /// Append `name` to the current name instead of replacing it.
    pub append_name: bool,
    pub start: Option<OffsetDateTime>,
    pub end: Option<OffsetDateTime>,
    pub chain: Chain,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Only rows still running at or after this point.
    pub start: Option<OffsetDateTime>,
    /// Only rows that started before this point.
    pub end: Option<OffsetDateTime>,
    /// Keep at most this many of the latest rows. Zero means no limit.
    pub limit: usize,
    /// Case insensitive substring match on the name.
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedTask {
    pub started: Task,
    /// The previously active row, if creating this one stopped it.
    pub stopped: Option<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatedTask {
    pub before: Task,
    pub after: Task,
}

#[derive(Debug, Default)]
struct Tables {
    tasks: BTreeMap<u64, Task>,
    last_id: u64,
}

impl Tables {
    fn active(&self) -> Option<&Task> {
        self.tasks.values().find(|task| task.end.is_none())
    }

    fn latest(&self) -> Option<&Task> {
        self.tasks.values().max_by_key(|task| (task.start, task.id))
    }

    fn get(&self, id: u64) -> Result<&Task, StoreError> {
        self.tasks.get(&id).ok_or(StoreError::NotFound(id))
    }

    /// The start time `chain` asks for, if any.
    fn chained_start(
        &self,
        chain: Chain,
        now: OffsetDateTime,
    ) -> Result<Option<OffsetDateTime>, StoreError> {
        let anchor = match chain.start_after_id {
            Some(id) => self.get(id)?,
            None if chain.start_after_last => self.latest().ok_or(StoreError::NoEntryToFollow)?,
            None => return Ok(None),
        };
        Ok(Some(anchor.end.unwrap_or(now)))
    }

    /// The end time `chain` asks for, if any.
    fn chained_end(&self, chain: Chain) -> Result<Option<OffsetDateTime>, StoreError> {
        chain
            .end_before_id
            .map(|id| self.get(id).map(|task| task.start))
            .transpose()
    }

    fn stop_active(
        &mut self,
        end: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<Option<Task>, StoreError> {
        let Some(task) = self.tasks.values_mut().find(|task| task.end.is_none()) else {
            return Ok(None);
        };
        if end < task.start {
            return Err(StoreError::EndBeforeStart);
        }

        task.end = Some(end);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }
}

#[derive(Debug)]
pub struct Repository {
    tables: RwLock<Tables>,
    events: TaskEvents,
}

impl Repository {
    pub fn new(publish_timeout: Duration) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            events: TaskEvents::new("tasks", publish_timeout),
        }
    }

    pub fn events(&self) -> &TaskEvents {
        &self.events
    }

    pub async fn active(&self) -> Option<Task> {
        self.tables.read().await.active().cloned()
    }

    pub async fn get(&self, id: u64) -> Result<Task, StoreError> {
        self.tables
            .read()
            .await
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Rows matching `filter`, oldest first.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let needle = filter
            .name_contains
            .as_deref()
            .filter(|needle| !needle.is_empty())
            .map(str::to_lowercase);

        let tables = self.tables.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|task| {
                filter
                    .start
                    .is_none_or(|start| task.end.is_none_or(|end| end >= start))
            })
            .filter(|task| filter.end.is_none_or(|end| task.start < end))
            .filter(|task| {
                needle
                    .as_deref()
                    .is_none_or(|needle| task.name.to_lowercase().contains(needle))
            })
            .cloned()
            .collect();
        drop(tables);

        tasks.sort_by_key(|task| (task.start, task.id));
        if filter.limit > 0 && tasks.len() > filter.limit {
            tasks.drain(..tasks.len() - filter.limit);
        }
        tasks
    }

    /// Start a new row, stopping the active one at the new row's start.
    pub async fn create(&self, new: NewTask) -> Result<StartedTask, StoreError> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::NameEmpty);
        }

        let now = OffsetDateTime::now_utc();

        let created = {
            let mut tables = self.tables.write().await;
            let start = tables
                .chained_start(new.chain, now)?
                .or(new.start)
                .unwrap_or(now);
            let end = tables.chained_end(new.chain)?.or(new.end);
            if end.is_some_and(|end| end < start) {
                return Err(StoreError::EndBeforeStart);
            }

            let stopped = tables.stop_active(start, now)?;

            tables.last_id += 1;
            let task = Task {
                id: tables.last_id,
                created_at: now,
                updated_at: now,
                name,
                start,
                end,
            };
            tables.tasks.insert(task.id, task.clone());

            StartedTask {
                started: task,
                stopped,
            }
        };

        tracing::debug!(id = created.started.id, stopped = ?created.stopped.as_ref().map(|t| t.id), "task created");

        if let Some(stopped) = &created.stopped {
            self.events.publish(stopped.clone(), EventKind::Updated).await;
        }
        self.events
            .publish(created.started.clone(), EventKind::Created)
            .await;

        Ok(created)
    }

    pub async fn update(&self, edit: EditTask) -> Result<UpdatedTask, StoreError> {
        let now = OffsetDateTime::now_utc();

        let updated = {
            let mut tables = self.tables.write().await;
            let id = match edit.id {
                Some(id) => id,
                None => {
                    tables
                        .active()
                        .or_else(|| tables.latest())
                        .ok_or(StoreError::NoEntryToEdit)?
                        .id
                }
            };

            let start = tables.chained_start(edit.chain, now)?.or(edit.start);
            let end = tables.chained_end(edit.chain)?.or(edit.end);

            let task = tables.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let before = task.clone();
            let mut after = before.clone();

            if let Some(name) = edit.name {
                let name = name.trim();
                if name.is_empty() {
                    return Err(StoreError::NameEmpty);
                }
                after.name = if edit.append_name {
                    format!("{} {name}", after.name)
                } else {
                    name.to_string()
                };
            }
            if let Some(start) = start {
                after.start = start;
            }
            if let Some(end) = end {
                after.end = Some(end);
            }
            if after.end.is_some_and(|end| end < after.start) {
                return Err(StoreError::EndBeforeStart);
            }

            if after != before {
                after.updated_at = now;
                *task = after.clone();
            }
            UpdatedTask { before, after }
        };

        if updated.before != updated.after {
            tracing::debug!(id = updated.after.id, "task updated");
            self.events
                .publish(updated.after.clone(), EventKind::Updated)
                .await;
        }

        Ok(updated)
    }

    pub async fn delete(&self, id: u64) -> Result<Task, StoreError> {
        let deleted = self
            .tables
            .write()
            .await
            .tasks
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;

        tracing::debug!(id, "task deleted");
        self.events
            .publish(deleted.clone(), EventKind::Deleted)
            .await;
        Ok(deleted)
    }

    /// Stop the active row at `end`, or now. `Ok(None)` if nothing was running.
    pub async fn stop_active(
        &self,
        end: Option<OffsetDateTime>,
    ) -> Result<Option<Task>, StoreError> {
        let now = OffsetDateTime::now_utc();
        let stopped = self
            .tables
            .write()
            .await
            .stop_active(end.unwrap_or(now), now)?;

        if let Some(stopped) = &stopped {
            tracing::debug!(id = stopped.id, "task stopped");
            self.events.publish(stopped.clone(), EventKind::Updated).await;
        }
        Ok(stopped)
    }
}
