//! line-echo: a line-oriented TCP request/response service
//!
//! Two roles share one wire protocol (UTF-8 lines terminated by `\n`):
//! - `server`: accepts concurrent clients and answers each line with an
//!   echo, the current time, or a farewell followed by a close
//! - `client`: relays console input to a server while printing its replies
//!
//! Configuration via CLI arguments or TOML file.

mod client;
mod codec;
mod command;
mod config;
mod error;
mod net;
mod registry;
mod server;
mod session;

use client::{Client, ClientExit, Console};
use config::{ClientConfig, Config, ProtocolConfig, Role, ServerConfig};
use server::Server;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Grace period for blocking tasks (such as a pending stdin read) when
/// the runtime shuts down.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match config.role {
        Role::Server(_) => subscriber.init(),
        // Keep stdout for the console.
        Role::Client(_) => subscriber.with_writer(std::io::stderr).init(),
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let result = match config.role {
        Role::Server(server) => runtime.block_on(run_server(server, config.protocol)),
        Role::Client(client) => runtime.block_on(run_client(client, config.protocol)),
    };

    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

/// Serve until Ctrl-C.
async fn run_server(
    config: ServerConfig,
    protocol: ProtocolConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config, &protocol).await?;

    info!(
        port = server.local_addr().port(),
        max_line_length = protocol.max_line_length,
        "Starting line-echo server, waiting for clients"
    );

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Server stopped");
    Ok(())
}

/// Connect and bridge stdin to the server until the connection closes.
async fn run_client(
    config: ClientConfig,
    protocol: ProtocolConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::connect(&config, &protocol).await?;
    info!(server = %config.server_addr(), "Connected");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let exit = client.run(stdin, Console::stdout()).await;
    info!(?exit, "Client terminated");

    match exit {
        ClientExit::QuitAcknowledged | ClientExit::ServerClosed => Ok(()),
        ClientExit::ConnectionLost(e) => Err(e.into()),
    }
}
