mod admission;
mod config;
mod engine;
mod failure_memo;
mod handlers;
mod launch;
mod metrics;
mod output;
mod reaper;
mod routes;
mod secrets;
mod server;
mod single_request;
mod slack;

#[cfg(test)]
mod testing;

use clap::Parser;
use launch::LaunchHandler;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub launcher: Arc<LaunchHandler>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = config::Cli::parse();
    server::init_tracing(&cli.log_level, cli.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "k6 webhook server booting...");

    server::serve(cli).await
}
