use clap::Args;
use eyre::Result;
use tally_common::Settings;

#[derive(Args, Debug)]
pub struct Cmd {
    /// Also print logs to the console
    #[arg(long)]
    show_logs: bool,
}

impl Cmd {
    pub fn show_logs(&self) -> bool {
        self.show_logs
    }

    pub async fn run(self, settings: Settings) -> Result<()> {
        tracing::info!(
            socket = %settings.daemon.socket_path,
            publish_timeout = settings.daemon.publish_timeout,
            afk = settings.afk.enabled,
            "starting daemon"
        );
        tally_daemon::boot(settings).await
    }
}
