use anyhow::Result;
use clap::Parser;
use devstack::{cli::Cli, commands, init_tracing};

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    commands::run(cli)
}
