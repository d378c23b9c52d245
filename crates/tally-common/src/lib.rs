#![forbid(unsafe_code)]

//! Types shared by the tally CLI and daemon.

pub mod models;
pub mod settings;
pub mod utils;

pub use models::{Alert, AlertKind, Changed, Entry, EventKind};
pub use settings::Settings;
