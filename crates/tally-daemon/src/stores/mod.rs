//! Typed event stores built on the [`observer`](crate::observer) bus.
//!
//! - [`EntryEvents`] / [`TaskEvents`]: record changes, slow listeners are skipped
//!   after the publish timeout.
//! - [`AlertStore`]: the AFK alert slots, listeners are always waited on.
//!
//! AFK transitions themselves are published by the
//! [`Detector`](crate::afk::Detector).

mod alerts;
mod changes;

pub use alerts::{AlertEvent, AlertStore};
pub use changes::{ChangeFeed, EntryEvents, TaskEvents};
