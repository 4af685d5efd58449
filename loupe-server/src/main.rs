// Loupe debugger server
//
// Launches the configured program under the debugger engine and exposes it to
// clients as newline-delimited JSON-RPC over stdio or TCP.

use anyhow::{Context, Result};
use loupe_core::{Debugger, SimLauncher};
use std::sync::Arc;
use tracing::info;

mod config;
mod handlers;
mod protocol;
mod server;
mod session;

use config::ServerConfig;
use handlers::RequestHandler;

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout carries the protocol in stdio mode
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("loupe=info".parse()?)
                .add_directive("loupe_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ServerConfig::load(std::env::args().nth(1))?;
    info!("Starting loupe for {} ({:?})", config.program, config.transport);

    let debugger = Debugger::launch(
        Arc::new(SimLauncher::new()),
        config.program.clone(),
        config.args.clone(),
        config.debugger.clone(),
    )
    .with_context(|| format!("launching {}", config.program))?;

    let handler = RequestHandler::new(debugger, config.accept_multi_client);

    info!("Loupe ready, waiting for requests...");
    server::run(&config, handler).await?;
    info!("Loupe stopped");
    Ok(())
}
