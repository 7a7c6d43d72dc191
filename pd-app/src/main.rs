//! pdfdesk main binary: a Telegram bot that converts and transforms documents.

mod commands;
mod config;
mod gateway;
mod pipeline;
mod routes;
mod server;
mod session;
mod telemetry;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use telemetry::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "pdfdesk", version, about = "pdfdesk document conversion bot")]
struct Cli {
    /// Config file. Default: ~/.pdfdesk/config.toml (optional).
    #[arg(long, global = true, env = "PDFDESK_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(
        long,
        global = true,
        env = "PDFDESK_LOG_FORMAT",
        value_enum,
        ignore_case = true,
        default_value_t = LogFormat::Json
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bot and the HTTP server (default).
    Serve,
    /// Validate config and check that backend programs are installed.
    Doctor,
    /// List the operations the current config enables.
    Operations,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(cli.log_format)?;
    telemetry::install_panic_hook();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(cli.config).await,
        Command::Doctor => server::doctor(cli.config).await,
        Command::Operations => server::operations(cli.config).await,
    }
}
