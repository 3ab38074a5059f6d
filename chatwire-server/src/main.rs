#![cfg_attr(not(test), forbid(unsafe_code))]

//! Command line entry point for the chatwire server.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use server::{commands::spec::generate_spec, server::run};
use shared::config::server::Config;

#[derive(Parser, Debug)]
#[command(name = "chatwire")]
#[command(about = "Chat delivery server: durable threads and live relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the server
    Serve {
        /// Port to bind; overrides the config file and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Configuration file (.yaml, .yml, .json or .toml)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print or write the OpenAPI document
    Spec {
        /// `json`, `yaml`, or an output file path
        output: Option<String>,
    },
}

async fn handle_serve_command(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, port).context("failed to load configuration")?;
    run(resolved).await.context("server exited with an error")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
        Commands::Spec { output } => generate_spec(output.as_deref()),
    }
}
