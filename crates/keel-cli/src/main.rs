//! keel-cli: one-shot command-line client for the keel control protocol.
//!
//! Connects to a keel server, optionally identifies itself, sends one
//! request and pretty-prints the reply.

mod commands;
mod format;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use keel_core::{PagePool, PoolConfig};
use keel_net::{ControlClient, RetryPolicy};
use keel_protocol::NodeRole;

use crate::commands::Request;

/// Command-line client for a keel server.
#[derive(Parser)]
#[command(name = "keel-cli", version, about)]
struct Args {
    /// Server hostname.
    #[arg(short = 'H', long, default_value = "127.0.0.1", env = "KEEL_HOST")]
    host: String,

    /// Server port.
    #[arg(short, long, default_value_t = 7700, env = "KEEL_PORT")]
    port: u16,

    /// Connect attempts before giving up.
    #[arg(long, default_value_t = keel_net::DEFAULT_CONNECT_ATTEMPTS)]
    attempts: u32,

    /// Role announced with `identify` before the request.
    #[arg(long)]
    role: Option<NodeRole>,

    #[command(subcommand)]
    request: Request,
}

fn fail(msg: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}", msg.to_string().red());
    ExitCode::FAILURE
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| format!("could not resolve {host}:{port}: {e}"))?;
    addrs
        .next()
        .ok_or_else(|| format!("no address found for {host}:{port}"))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return fail(format!("failed to create runtime: {e}")),
    };

    rt.block_on(async {
        let addr = match resolve(&args.host, args.port).await {
            Ok(addr) => addr,
            Err(e) => return fail(e),
        };

        // one session needs exactly two pages
        let pool = match PagePool::new(PoolConfig {
            page_count: 2,
            ..PoolConfig::default()
        }) {
            Ok(pool) => pool,
            Err(e) => return fail(e),
        };
        let retry = RetryPolicy {
            max_attempts: args.attempts,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        };

        let mut client = match ControlClient::connect(addr, &retry, &pool).await {
            Ok(c) => c,
            Err(e) => return fail(format!("could not connect to {addr}: {e}")),
        };

        if let Some(role) = args.role {
            if let Err(e) = client.identify(role).await {
                client.close().await;
                return fail(format!("identify failed: {e}"));
            }
        }

        let exit_code = match commands::execute(&mut client, &args.request).await {
            Ok(output) => {
                println!("{}", format::format_output(&output));
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", format::format_error(&e));
                ExitCode::FAILURE
            }
        };

        client.close().await;
        exit_code
    })
}
