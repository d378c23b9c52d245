use clap::Args;
use colored::Colorize;
use eyre::Result;
use tally_common::{
    Entry, Settings,
    utils::{format_duration, format_time},
};
use tally_daemon::client::{
    Chain, DaemonClientErrorKind, EntriesClient, EntryEdit, EntryQuery, NewEntry, classify_error,
};
use time::OffsetDateTime;

use super::parse_time;

pub(crate) fn print_entry(entry: &Entry) {
    let end = match entry.end {
        Some(end) => format_time(end),
        None => "now".green().to_string(),
    };

    println!(
        "{:>4}  {}  {} - {}  {}",
        format!("#{}", entry.id).dimmed(),
        entry.name.bold(),
        format_time(entry.start),
        end,
        format_duration(entry.elapsed()).cyan(),
    );
}

/// Take start or end times from neighbouring entries.
#[derive(Args, Debug)]
pub struct ChainArgs {
    /// Start when the entry with this id ended, overrides --start
    #[arg(long, short = 'a', conflicts_with = "after_last")]
    after_id: Option<u64>,

    /// Start when the latest entry ended, overrides --start
    #[arg(long, short = 'L')]
    after_last: bool,

    /// End when the entry with this id started, overrides --end
    #[arg(long, short = 'b')]
    before_id: Option<u64>,
}

impl From<ChainArgs> for Chain {
    fn from(args: ChainArgs) -> Self {
        Chain {
            start_after_id: args.after_id,
            start_after_last: args.after_last,
            end_before_id: args.before_id,
        }
    }
}

#[derive(Args, Debug)]
pub struct In {
    /// Name of the new entry
    #[arg(required = true, num_args = 1..)]
    name: Vec<String>,

    /// When the entry started, defaults to now
    #[arg(long, short, value_parser = parse_time)]
    start: Option<OffsetDateTime>,

    /// When the entry ended, for logging past work
    #[arg(long, short, value_parser = parse_time)]
    end: Option<OffsetDateTime>,

    #[command(flatten)]
    chain: ChainArgs,
}

impl In {
    pub async fn run(self, settings: &Settings) -> Result<()> {
        let mut client = EntriesClient::from_settings(settings).await?;
        let created = client
            .create_entry(NewEntry {
                name: self.name.join(" "),
                start: self.start,
                end: self.end,
                chain: self.chain.into(),
            })
            .await?;

        if let Some(stopped) = &created.stopped {
            println!("{}", "Stopped:".yellow());
            print_entry(stopped);
        }
        println!("{}", "Started:".green());
        print_entry(&created.started);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct Out {
    /// When the entry ended, defaults to now
    #[arg(long, short, value_parser = parse_time)]
    end: Option<OffsetDateTime>,
}

impl Out {
    pub async fn run(self, settings: &Settings) -> Result<()> {
        let mut client = EntriesClient::from_settings(settings).await?;
        match client.stop_active_entry(self.end).await? {
            Some(stopped) => {
                println!("{}", "Stopped:".yellow());
                print_entry(&stopped);
            }
            None => println!("No active entry"),
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct Edit {
    /// Entry to change, defaults to the active or latest entry
    #[arg(long)]
    id: Option<u64>,

    /// New name
    #[arg(long, short)]
    name: Option<String>,

    /// Append to the current name instead of replacing it
    #[arg(long, short = 'z', requires = "name")]
    append: bool,

    #[arg(long, short, value_parser = parse_time)]
    start: Option<OffsetDateTime>,

    #[arg(long, short, value_parser = parse_time)]
    end: Option<OffsetDateTime>,

    #[command(flatten)]
    chain: ChainArgs,
}

impl Edit {
    pub async fn run(self, settings: &Settings) -> Result<()> {
        let mut client = EntriesClient::from_settings(settings).await?;
        let updated = client
            .update_entry(EntryEdit {
                id: self.id,
                name: self.name,
                append_name: self.append,
                start: self.start,
                end: self.end,
                chain: self.chain.into(),
            })
            .await?;

        if updated.before == updated.after {
            println!("Nothing changed");
            print_entry(&updated.after);
            return Ok(());
        }

        println!("{}", "Before:".dimmed());
        print_entry(&updated.before);
        println!("{}", "After:".green());
        print_entry(&updated.after);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct Remove {
    /// Entry to delete
    id: u64,
}

impl Remove {
    pub async fn run(self, settings: &Settings) -> Result<()> {
        let mut client = EntriesClient::from_settings(settings).await?;
        let deleted = client.delete_entry(self.id).await?;

        println!("{}", "Deleted:".red());
        print_entry(&deleted);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct List {
    /// Only entries running at or after this time
    #[arg(long, value_parser = parse_time)]
    since: Option<OffsetDateTime>,

    /// Only entries that started before this time
    #[arg(long, value_parser = parse_time)]
    until: Option<OffsetDateTime>,

    /// Show at most this many of the latest entries
    #[arg(long, short, default_value_t = 0)]
    limit: u64,

    /// Only entries whose name contains this text
    #[arg(long)]
    search: Option<String>,
}

impl List {
    pub async fn run(self, settings: &Settings) -> Result<()> {
        let mut client = EntriesClient::from_settings(settings).await?;
        let entries = client
            .entries(EntryQuery {
                start: self.since,
                end: self.until,
                limit: self.limit,
                name_contains: self.search.unwrap_or_default(),
            })
            .await?;

        if entries.is_empty() {
            println!("No entries");
            return Ok(());
        }

        let total = entries
            .iter()
            .fold(time::Duration::ZERO, |total, entry| total + entry.elapsed());
        for entry in &entries {
            print_entry(entry);
        }
        println!("{} {}", "Total:".bold(), format_duration(total));
        Ok(())
    }
}

pub async fn status(settings: &Settings) -> Result<()> {
    let mut client = match EntriesClient::from_settings(settings).await {
        Ok(client) => client,
        Err(e) if classify_error(&e) == DaemonClientErrorKind::Connect => {
            println!("Daemon: {}", "not running".red());
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let status = client.status().await?;
    println!(
        "Daemon: {} (version {}, pid {})",
        "running".green(),
        status.version,
        status.pid
    );

    match client.active_entry().await? {
        Some(entry) => print_entry(&entry),
        None => println!("No active entry"),
    }
    Ok(())
}
