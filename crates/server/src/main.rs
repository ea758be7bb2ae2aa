mod config;
mod hub;
mod metrics;
mod transport;
mod util;

use config::load_configuration;
use convo_store::MemoryStore;
use hub::{call_timeout_worker, metrics_worker, HubState};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::var("CONVO_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("convo.toml"));
    let config = match load_configuration(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %config_path.display(), error = %err, "configuration failed");
            std::process::exit(1);
        }
    };

    // Standalone mode: membership and history live in memory, seeded
    // from the environment. A deployment fronted by a real user
    // service plugs its own ChatStore/Directory in here instead.
    let store = Arc::new(MemoryStore::new());
    seed_store(&store).await;
    let state = HubState::new(config, store.clone(), store.clone());

    tokio::spawn(call_timeout_worker(Arc::clone(&state)));
    tokio::spawn(metrics_worker(Arc::clone(&state)));

    tokio::select! {
        result = transport::serve(Arc::clone(&state)) => {
            if let Err(err) = result {
                error!(error = %err, "listener failed");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
}

/// `CONVO_USERS=alice,bob` registers users; `CONVO_CHATS=c1=alice,bob`
/// (semicolon-separated) registers conversations.
async fn seed_store(store: &MemoryStore) {
    if let Ok(users) = env::var("CONVO_USERS") {
        for user in users.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            store.add_user(user).await;
        }
    }
    if let Ok(chats) = env::var("CONVO_CHATS") {
        for entry in chats.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let Some((chat_id, members)) = entry.split_once('=') else {
                warn!(chat = entry, "ignoring malformed chat seed");
                continue;
            };
            let members: Vec<&str> = members
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .collect();
            if members.is_empty() {
                warn!(chat = chat_id, "ignoring chat seed without members");
                continue;
            }
            store
                .add_conversation(chat_id.trim(), &members, members.len() > 2)
                .await;
        }
    }
}
