use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
#[allow(unused_imports)]
use tracing::*;
use tracing_subscriber::prelude::*;

use crate::config::Configuration;

mod config;
mod credits;
mod error;
mod ledger;
mod model;
mod month;
mod parsing;
mod prepare;
mod process;
mod register;
mod subsidy;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Applies credits and subsidies to a month of usage.
    Process(process::Command),
    /// Shows each PI's credit standing.
    Ledger(register::Command),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    fn get_rust_log(verbose: u8) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| {
            match verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
            .into()
        })
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(get_rust_log(cli.verbose)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => Configuration::load(path)?,
        None => Configuration::default(),
    };

    match &cli.command {
        Some(Commands::Process(cmd)) => process::execute_command(&config, cmd),
        Some(Commands::Ledger(cmd)) => register::execute_command(&config, cmd),
        None => Ok(()),
    }
}
