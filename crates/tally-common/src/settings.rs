//! Settings shared by the CLI and the daemon.
//!
//! Values are layered: built-in defaults, then `config.toml` in the tally
//! config directory, then `TALLY_*` environment variables (nested keys are
//! separated by `__`, e.g. `TALLY_AFK__THRESHOLD=300`).

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use eyre::{Context, Result};
use serde::Deserialize;

use crate::utils;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The level as an `EnvFilter` directive.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Daemon {
    /// Unix socket the daemon listens on.
    pub socket_path: String,

    /// TCP port used instead of the socket on platforms without unix sockets.
    pub tcp_port: u64,

    /// Seconds a live-stream delivery may wait on a slow subscriber before
    /// the event is dropped for that subscriber.
    pub publish_timeout: u64,
}

impl Daemon {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Afk {
    pub enabled: bool,

    /// Milliseconds between idle-time polls.
    pub poll_interval: u64,

    /// Seconds of inactivity after which the user counts as away.
    pub threshold: u64,
}

impl Afk {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Logs {
    pub dir: String,
    pub file: String,
    pub level: LogLevel,

    /// Days to keep rotated log files around.
    pub retention: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub daemon: Daemon,
    pub afk: Afk,
    pub logs: Logs,
}

impl Settings {
    /// A builder holding only the built-in defaults.
    pub fn default_builder() -> Result<ConfigBuilder<DefaultState>> {
        let data_dir = utils::data_dir();
        let socket_path = data_dir.join("tally.sock");
        let log_dir = data_dir.join("logs");

        Ok(Config::builder()
            .set_default("daemon.socket_path", socket_path.to_string_lossy().to_string())?
            .set_default("daemon.tcp_port", 8889)?
            .set_default("daemon.publish_timeout", 10)?
            .set_default("afk.enabled", true)?
            .set_default("afk.poll_interval", 1000)?
            .set_default("afk.threshold", 5)?
            .set_default("logs.dir", log_dir.to_string_lossy().to_string())?
            .set_default("logs.file", "daemon.log")?
            .set_default("logs.level", "info")?
            .set_default("logs.retention", 4)?)
    }

    /// Defaults plus the config file and environment overrides.
    pub fn builder() -> Result<ConfigBuilder<DefaultState>> {
        let config_file = Self::config_path();

        Ok(Self::default_builder()?
            .add_source(
                File::new(&config_file.to_string_lossy(), FileFormat::Toml).required(false),
            )
            .add_source(
                Environment::with_prefix("TALLY")
                    .prefix_separator("_")
                    .separator("__"),
            ))
    }

    pub fn new() -> Result<Self> {
        let config_dir = utils::config_dir();
        fs_err::create_dir_all(&config_dir)
            .wrap_err_with(|| format!("could not create dir {config_dir:?}"))?;

        Self::builder()?
            .build()
            .wrap_err("could not load config")?
            .try_deserialize()
            .wrap_err("could not deserialize config")
    }

    pub fn config_path() -> PathBuf {
        utils::config_dir().join(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_deserialize() {
        let settings: Settings = Settings::default_builder()
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.daemon.publish_timeout(), Duration::from_secs(10));
        assert_eq!(settings.afk.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.afk.threshold(), Duration::from_secs(5));
        assert_eq!(settings.logs.level, LogLevel::Info);
        assert!(settings.daemon.socket_path.ends_with("tally.sock"));
    }

    #[test]
    fn overrides_win_over_defaults() {
        let settings: Settings = Settings::default_builder()
            .unwrap()
            .set_override("afk.threshold", 300)
            .unwrap()
            .set_override("logs.level", "debug")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.afk.threshold(), Duration::from_secs(300));
        assert_eq!(settings.logs.level.as_directive(), "debug");
    }
}
