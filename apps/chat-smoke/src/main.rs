//! Runs a chat engine against the in-memory service: connect, send, watch a
//! few poll cycles, shut down.

mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use chat_core::{ChatError, ChatEvent, PollBatch, SystemClock};
use chat_engine::ChatEngine;
use chat_loopback::InMemoryTransport;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use crate::config::SmokeConfig;

const SMOKE_TOKEN: &str = "smoke-token";
const PEER: &str = "smoke_peer";

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = %err.code, message = %err.message, "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SmokeConfig) -> Result<(), ChatError> {
    let service = InMemoryTransport::new(SystemClock).with_pass(&config.pass, SMOKE_TOKEN);
    service.join_channel(&config.user, &config.channel)?;
    service.join_channel(PEER, &config.channel)?;

    let engine = ChatEngine::new(Arc::new(service), config.engine.clone())?;
    let mut events = engine.subscribe();

    engine.connect_password(&config.pass).await?;
    info!(user = %config.user, channel = %config.channel, "connected to loopback service");

    engine
        .send_channel(&config.user, &config.channel, "hello from chat-smoke")
        .await?;
    engine
        .send_tell(&config.user, PEER, "and a tell for the peer")
        .await?;

    let mut observed = 0;
    while observed < config.cycles {
        match events.recv().await {
            Ok(ChatEvent::MessagesReceived { batch }) => {
                observed += 1;
                print_batch(observed, &batch);
            }
            Ok(ChatEvent::PollFailed { error }) => {
                observed += 1;
                warn!(code = %error.code, message = %error.message, "poll cycle failed");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
            Err(RecvError::Closed) => break,
        }
    }

    engine.dispose().await;
    Ok(())
}

fn print_batch(cycle: u32, batch: &PollBatch) {
    let mut users: Vec<&String> = batch.keys().collect();
    users.sort_unstable();

    println!("cycle {cycle}:");
    for user in users {
        for message in &batch[user] {
            let place = if message.is_direct() {
                "tell"
            } else {
                message.channel.as_deref().unwrap_or_default()
            };
            println!("  {user} <- [{place}] {}: {}", message.sender, message.text);
        }
    }
}
