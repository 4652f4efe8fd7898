//! Rendezvous relay server -- room-based signaling for peer-to-peer setup.
//!
//! An axum WebSocket server that fans negotiation messages (offers, answers,
//! ICE candidates) out to the other members of a room. Payloads are
//! forwarded verbatim and never stored.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3000
//! cargo run --bin rendezvous-relay
//!
//! # Run on custom address
//! cargo run --bin rendezvous-relay -- --bind 127.0.0.1:8080
//!
//! # Or only change the port
//! PORT=8080 cargo run --bin rendezvous-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use rendezvous_relay::config::{RelayCliArgs, RelayConfig};
use rendezvous_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting rendezvous relay");

    let state = Arc::new(RelayState::with_config(
        config.max_message_size,
        config.outbound_buffer,
    ));

    match relay::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "relay server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
