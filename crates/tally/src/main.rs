#![forbid(unsafe_code)]

use clap::Parser;
use eyre::Result;

mod command;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Track where your time goes.
#[derive(Parser)]
#[command(author = "tally contributors", version = VERSION)]
struct Tally {
    #[command(subcommand)]
    tally: command::Cmd,
}

impl Tally {
    fn run(self) -> Result<()> {
        self.tally.run()
    }
}

fn main() -> Result<()> {
    Tally::parse().run()
}
