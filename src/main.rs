use anyhow::Result;
use clap::Parser;
use shellcue::cli::{client_main, register_tracing, server_main, Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Daemon(options) => server_main(cli.config, options), // tracing is registered later
        command => {
            register_tracing(false)?;
            client_main(cli.config, command)
        }
    }
}
