//! `taskflow-broker`: local STOMP-over-WebSocket broker.
//!
//! # Usage
//!
//! ```bash
//! # Listen on 127.0.0.1:8080, endpoint /ws (and /ws/websocket)
//! cargo run --bin taskflow-broker
//!
//! # Custom address, heart-beats off
//! cargo run --bin taskflow-broker -- --bind 0.0.0.0:61614 --heart-beat-ms 0
//! ```

use std::sync::Arc;

use clap::Parser;
use taskflow_broker::broker::{self, BrokerState};
use taskflow_broker::config::{BrokerCliArgs, BrokerConfig};

#[tokio::main]
async fn main() {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting taskflow broker");

    let state = Arc::new(BrokerState::with_config(
        config.heart_beat,
        config.max_payload_size,
    ));

    match broker::start_server_with_state(&config.bind_addr.to_string(), state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    }
}
