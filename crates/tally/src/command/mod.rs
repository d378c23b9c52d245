use std::path::{Path, PathBuf};

use clap::Subcommand;
use eyre::{Result, WrapErr};
use tally_common::Settings;
use time::OffsetDateTime;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{Layer, filter::EnvFilter, fmt, prelude::*};

mod alerts;
mod daemon;
mod entry;
mod stream;

const LOG_ENV: &str = "TALLY_LOG";

#[derive(Subcommand, Debug)]
#[command(infer_subcommands = true)]
pub enum Cmd {
    /// Start tracking a new entry, stopping the active one
    In(entry::In),

    /// Stop the active entry
    Out(entry::Out),

    /// Change an entry, the active one by default
    Edit(entry::Edit),

    /// Delete an entry
    #[command(alias = "rm")]
    Remove(entry::Remove),

    /// List entries
    #[command(alias = "ls")]
    List(entry::List),

    /// Show the daemon's status and the active entry
    Status,

    /// List or dismiss alerts
    #[command(subcommand)]
    Alerts(alerts::Cmd),

    /// Follow changes as they happen
    #[command(subcommand)]
    Stream(stream::Cmd),

    /// Run the daemon in the foreground
    Daemon(daemon::Cmd),
}

impl Cmd {
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .wrap_err("could not start the async runtime")?;

        let settings = Settings::new().wrap_err("could not load settings")?;
        let res = runtime.block_on(self.run_inner(settings));

        runtime.shutdown_timeout(std::time::Duration::from_millis(50));

        res
    }

    async fn run_inner(self, settings: Settings) -> Result<()> {
        match &self {
            Self::Daemon(cmd) => init_daemon_logging(&settings, cmd.show_logs())?,
            _ => init_console_logging(),
        }

        tracing::trace!(command = ?self, "client command");

        match self {
            Self::In(cmd) => cmd.run(&settings).await,
            Self::Out(cmd) => cmd.run(&settings).await,
            Self::Edit(cmd) => cmd.run(&settings).await,
            Self::Remove(cmd) => cmd.run(&settings).await,
            Self::List(cmd) => cmd.run(&settings).await,
            Self::Status => entry::status(&settings).await,
            Self::Alerts(cmd) => cmd.run(&settings).await,
            Self::Stream(cmd) => cmd.run(&settings).await,
            Self::Daemon(cmd) => cmd.run(settings).await,
        }
    }
}

/// Client commands only log when asked to through `TALLY_LOG`.
fn init_console_logging() {
    if std::env::var(LOG_ENV).is_err() {
        return;
    }

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_env(LOG_ENV)),
        )
        .init();
}

fn init_daemon_logging(settings: &Settings, show_logs: bool) -> Result<()> {
    let log_dir = PathBuf::from(&settings.logs.dir);
    fs_err::create_dir_all(&log_dir)?;

    cleanup_old_logs(&log_dir, &settings.logs.file, settings.logs.retention);

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, &settings.logs.file);

    // TALLY_LOG overrides the configured level
    let file_filter = if std::env::var(LOG_ENV).is_ok() {
        EnvFilter::from_env(LOG_ENV)
    } else {
        EnvFilter::default().add_directive(settings.logs.level.as_directive().parse()?)
    };

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(file_filter);

    let console_layer = show_logs.then(|| {
        let filter = if std::env::var(LOG_ENV).is_ok() {
            EnvFilter::from_env(LOG_ENV)
        } else {
            EnvFilter::new("info")
        };
        fmt::layer().with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(())
}

/// Remove rotated log files older than `retention_days`.
fn cleanup_old_logs(log_dir: &Path, prefix: &str, retention_days: u64) {
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(retention_days * 24 * 60 * 60);

    let Ok(entries) = fs_err::read_dir(log_dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        // Rotated files look like "daemon.log.2026-02-23"
        if !name.starts_with(prefix) || name == prefix {
            continue;
        }

        if let Ok(metadata) = entry.metadata()
            && let Ok(modified) = metadata.modified()
            && modified < cutoff
        {
            let _ = fs_err::remove_file(&path);
        }
    }
}

/// Parse a human time like "10:30" or "yesterday 9am".
pub(crate) fn parse_time(s: &str) -> Result<OffsetDateTime, String> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    interim::parse_date_string(s, now, interim::Dialect::Uk).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(subcommand)]
        cmd: Cmd,
    }

    #[test]
    fn parses_relative_times() {
        let before = OffsetDateTime::now_utc();
        let parsed = parse_time("yesterday").unwrap();
        assert!(parsed < before);
        assert!(before - parsed < time::Duration::days(2));
    }

    #[test]
    fn rejects_nonsense_times() {
        assert!(parse_time("not a time at all").is_err());
    }

    #[test]
    fn parses_commands() {
        let cli = Cli::try_parse_from(["tally", "in", "write", "the", "docs"]).unwrap();
        assert!(matches!(cli.cmd, Cmd::In(_)));

        let cli = Cli::try_parse_from(["tally", "ls", "--limit", "3"]).unwrap();
        assert!(matches!(cli.cmd, Cmd::List(_)));

        let cli = Cli::try_parse_from(["tally", "stream", "alerts", "--timeout", "10"]).unwrap();
        assert!(matches!(cli.cmd, Cmd::Stream(_)));

        assert!(Cli::try_parse_from(["tally", "in"]).is_err());
    }
}
