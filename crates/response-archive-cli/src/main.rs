use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = response_archive_cli::Cli::parse();
    response_archive_cli::init_logging(cli.log_format());
    response_archive_cli::run_cli(cli)
}
