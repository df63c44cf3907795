//! CLI entrypoint for the doortray daemon.

use clap::Parser as _;
use eyre::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = doortray_daemon::cli::Cli::parse();
    doortray_daemon::inner_main(invocation).await
}
