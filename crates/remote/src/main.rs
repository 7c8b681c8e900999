// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! tether-remote: WebSocket relay server for tether clients.
//!
//! Applies commands at most once per scope, answers queries with the applied
//! commands, and broadcasts every newly applied command to the scope.

mod server;
mod state;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// tether-remote: command relay server
#[derive(Parser, Debug)]
#[command(name = "tether-remote")]
#[command(about = "WebSocket relay server for tether sync clients")]
struct Args {
    /// Address to bind the server to
    #[arg(short, long, default_value = "0.0.0.0:7890")]
    bind: SocketAddr,

    /// Directory for the relay database
    #[arg(short, long, default_value = ".")]
    data: PathBuf,

    /// Require clients to present this token
    #[arg(long, env = "TETHER_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting tether-remote server");
    info!("  Bind address: {}", args.bind);
    info!("  Data directory: {}", args.data.display());
    if args.token.is_some() {
        info!("  Token required");
    }

    let state = state::ServerState::new(&args.data, args.token)?;
    server::run(args.bind, state).await?;

    Ok(())
}
