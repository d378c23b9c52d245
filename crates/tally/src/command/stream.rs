use std::time::Duration;

use clap::Subcommand;
use colored::Colorize;
use eyre::{Result, WrapErr};
use tally_common::{Alert, Entry, EventKind, Settings};
use tally_daemon::client::{AlerterClient, EntriesClient};

use super::alerts::print_alert;
use super::entry::print_entry;

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Print entry changes until interrupted
    Entries {
        /// Stop after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print alert changes until interrupted
    Alerts {
        /// Stop after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn print_kind(kind: EventKind) {
    let label = match kind {
        EventKind::Created => "created".green(),
        EventKind::Updated => "updated".yellow(),
        EventKind::Deleted => "deleted".red(),
        EventKind::Unspecified => "unknown".dimmed(),
    };
    print!("{label:>8} ");
}

/// Resolves on Ctrl-C, or once `timeout` seconds have passed.
///
/// Create it once per stream: the Ctrl-C listener is registered on the first
/// poll and keeps interrupts that arrive while an event is being printed.
async fn interrupted(timeout: Option<u64>) {
    let deadline = async {
        match timeout {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::warn!(error = %e, "cannot listen for ctrl-c");
                deadline.await;
            }
        }
        () = &mut deadline => {}
    }
}

impl Cmd {
    pub async fn run(self, settings: &Settings) -> Result<()> {
        match self {
            Self::Entries { timeout } => stream_entries(settings, timeout).await,
            Self::Alerts { timeout } => stream_alerts(settings, timeout).await,
        }
    }
}

async fn stream_entries(settings: &Settings, timeout: Option<u64>) -> Result<()> {
    let mut client = EntriesClient::from_settings(settings).await?;
    let mut stream = client.stream_entries().await?;
    let stop = interrupted(timeout);
    tokio::pin!(stop);

    loop {
        let reply = tokio::select! {
            reply = stream.message() => reply.wrap_err("entry stream failed")?,
            () = &mut stop => break,
        };

        let Some(reply) = reply else {
            println!("{}", "daemon closed the stream".dimmed());
            break;
        };

        let kind = EventKind::from(reply.event());
        let Some(entry) = reply.entry else {
            tracing::warn!("entry event without an entry");
            continue;
        };

        print_kind(kind);
        print_entry(&Entry::try_from(entry)?);
    }

    Ok(())
}

async fn stream_alerts(settings: &Settings, timeout: Option<u64>) -> Result<()> {
    let mut client = AlerterClient::from_settings(settings).await?;
    let mut stream = client.stream_alerts().await?;
    let stop = interrupted(timeout);
    tokio::pin!(stop);

    loop {
        let reply = tokio::select! {
            reply = stream.message() => reply.wrap_err("alert stream failed")?,
            () = &mut stop => break,
        };

        let Some(reply) = reply else {
            println!("{}", "daemon closed the stream".dimmed());
            break;
        };

        let kind = EventKind::from(reply.event());
        let Some(alert) = reply.alert else {
            tracing::warn!("alert event without an alert");
            continue;
        };

        print_kind(kind);
        print_alert(&Alert::try_from(alert)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::interrupted;

    #[tokio::test(start_paused = true)]
    async fn timeout_ends_the_stream() {
        tokio::time::timeout(Duration::from_secs(6), interrupted(Some(5)))
            .await
            .expect("stream outlived its timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interrupt_between_polls_is_kept() {
        let stop = interrupted(None);
        tokio::pin!(stop);

        // The first poll registers the listener, like the first pass of the
        // stream loop.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut stop)
                .await
                .is_err()
        );

        // Interrupt while nothing is polling, as if an event were printing.
        let status = std::process::Command::new("kill")
            .args(["-INT", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(2), &mut stop)
            .await
            .expect("interrupt was missed");
    }
}
