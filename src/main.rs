//! suffix-echo: a single-threaded TCP echo server
//!
//! Every chunk a client sends is echoed back with one trailing newline
//! removed and a fixed suffix appended (`"hello\n"` becomes
//! `"hello Received\n"`).
//!
//! Features:
//! - One connection served at a time, to completion
//! - Socket faults classified as transient, resource, or fatal
//! - Bounded backoff on socket creation, fixed backoff on accept
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod error;
mod fault;
mod listener;
mod server;
mod transform;

use config::Config;
use error::ServerError;
use server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        chunk_size = config.chunk_size,
        suffix = ?config.suffix,
        send_mode = ?config.send_mode,
        idle_timeout = ?config.idle_timeout,
        "Starting suffix-echo server"
    );

    exit_status(&run(&config))
}

fn run(config: &Config) -> Result<(), ServerError> {
    let server = Server::bind(config)?;
    server.run()
}

/// Log a fatal error and map the server result to the process exit code.
fn exit_status(result: &Result<(), ServerError>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(fault = %e.fault(), "{e}");
            ExitCode::FAILURE
        }
    }
}
