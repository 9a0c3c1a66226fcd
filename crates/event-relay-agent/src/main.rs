// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_relay::{
    config::RelayConfig,
    relay::{mapper_from_config, RunningRelay},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("could not parse log level in configuration: {e}");
            EnvFilter::new("h2=off,hyper=off,rustls=off,info")
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    debug!("Logging subsystem enabled");

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    let mapper = match mapper_from_config(&config) {
        Ok(mapper) => mapper,
        Err(e) => {
            error!("Failed to load mapping rules: {}", e);
            return;
        }
    };

    let running = match RunningRelay::start(&config, mapper) {
        Ok(running) => running,
        Err(e) => {
            error!("Failed to start relay: {}", e);
            return;
        }
    };
    info!("Relaying events to {}", config.data_plane_url);

    let relay = running.relay();
    let mut lines = BufReader::new(stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str(&line) {
                        Ok(event) => relay.process_event(&event),
                        Err(e) => warn!("Skipping malformed event: {}", e),
                    }
                }
                Ok(None) => {
                    debug!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt");
                break;
            }
        }
    }

    info!("Shutting down relay");
    running.shutdown(SHUTDOWN_GRACE).await;
}
