use clap::Parser;

use incentive_app::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    incentive_observability::init(&cli.logging());

    match cli.command {
        Command::Worker(args) => incentive_app::worker::run(&cli.common, args).await,
        Command::Publish(args) => incentive_app::publish::run(&cli.common, args).await,
    }
}
