//! Daemon components.
//!
//! - [`entries::EntriesComponent`]: entry changes and the Entries gRPC service
//! - [`alerts::AlertsComponent`]: AFK alerts and the Alerter gRPC service
//! - [`afk::AfkComponent`]: AFK detection

pub mod afk;
pub mod alerts;
pub mod entries;

pub use afk::AfkComponent;
pub use alerts::AlertsComponent;
pub use entries::EntriesComponent;
