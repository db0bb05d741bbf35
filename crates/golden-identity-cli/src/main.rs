use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = golden_identity_cli::Cli::parse();
    golden_identity_cli::run_cli(cli)
}
