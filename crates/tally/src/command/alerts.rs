use clap::Subcommand;
use colored::Colorize;
use eyre::Result;
use tally_common::{
    Alert, AlertKind, Settings,
    utils::{format_duration, format_time},
};
use tally_daemon::client::AlerterClient;

pub(crate) fn print_alert(alert: &Alert) {
    let id = format!("#{}", alert.id);
    match &alert.kind {
        AlertKind::Afk { active_entry } => println!(
            "{:>4}  {}  you went away while tracking {}",
            id.dimmed(),
            "AFK".yellow().bold(),
            active_entry.name.bold(),
        ),
        AlertKind::FormerlyAfk {
            afk_since,
            active_entry,
        } => println!(
            "{:>4}  {}  you were away since {} ({}) while tracking {}",
            id.dimmed(),
            "BACK".cyan().bold(),
            format_time(*afk_since),
            format_duration(alert.created_at - *afk_since),
            active_entry.name.bold(),
        ),
    }
}

#[derive(Subcommand, Debug)]
#[command(infer_subcommands = true)]
pub enum Cmd {
    /// List the current alerts
    List,

    /// Dismiss an alert
    Delete { id: u64 },
}

impl Cmd {
    pub async fn run(self, settings: &Settings) -> Result<()> {
        let mut client = AlerterClient::from_settings(settings).await?;

        match self {
            Self::List => {
                let alerts = client.alerts().await?;
                if alerts.is_empty() {
                    println!("No alerts");
                }
                for alert in &alerts {
                    print_alert(alert);
                }
            }
            Self::Delete { id } => match client.delete_alert(id).await? {
                Some(alert) => {
                    println!("{}", "Dismissed:".dimmed());
                    print_alert(&alert);
                }
                None => println!("No alert with id {id}"),
            },
        }

        Ok(())
    }
}
