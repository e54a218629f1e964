//! `kernelprobe` executable.

use anyhow::Result;
use clap::Parser;
use kernelprobe_validator::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
