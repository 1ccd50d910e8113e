use clap::Parser;
use stratum_cli::Cli;

fn main() -> miette::Result<()> {
    Cli::parse().run()
}
