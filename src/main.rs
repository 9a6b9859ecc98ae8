mod cli;
mod config;
mod providers;
mod registry;
mod router;
mod server;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use cli::{list::list_cmd, serve::serve_cmd};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "andy-broker")]
#[command(
    about = "Routes text-generation requests across a pool of volunteer Ollama nodes",
    version = "0.0.1"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Serve(ServeArgs),
    /// List the providers or models of a running broker
    List(ListArgs),
}

#[derive(Parser, Default)]
pub(crate) struct ServeArgs {
    /// Read the configuration from this file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address to listen on, overrides the configuration
    #[arg(short, long)]
    listen: Option<String>,
}

/// Possible listings
#[derive(Subcommand)]
pub(crate) enum ListObject {
    /// Distinct models offered by the pool
    Models,
    /// Registered providers
    Providers,
}

/// Output formats
#[derive(
    Parser, ValueEnum, Default, Clone, Copy, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum ListingFormat {
    /// Format the output as a table
    #[default]
    Table,
    /// Format the output as JSON
    Json,
    /// Format the output as a table without a header
    HeaderlessTable,
}

#[derive(Parser)]
pub(crate) struct ListArgs {
    /// Output the listing with the specified format
    #[arg(short, long, default_value_t = ListingFormat::default())]
    format: ListingFormat,
    /// Base URL of the broker
    #[arg(short, long, default_value = "http://127.0.0.1:5000")]
    url: String,
    /// List the specified object
    #[command(subcommand)]
    object: ListObject,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "andy_broker=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Serve(args)) => serve_cmd(args).await,
        Some(Commands::List(args)) => list_cmd(args).await,
        None => serve_cmd(&ServeArgs::default()).await,
    }
}
