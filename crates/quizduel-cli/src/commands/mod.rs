//! Command handlers

pub mod config;
pub mod duel;
pub mod login;
pub mod queue;
pub mod status;

use std::sync::Arc;

use quizduel_core::{
    Config, CredentialCache, DuelEngine, FileCredentialStore, WebSocketConnector,
};

/// Start an engine wired to the configured server and credential file
pub fn spawn_engine(config: &Config) -> DuelEngine {
    let store = FileCredentialStore::new(config.credentials_path());
    let credentials = Arc::new(CredentialCache::new(Arc::new(store)));
    DuelEngine::spawn(
        config.engine_config(),
        Arc::new(WebSocketConnector),
        credentials,
    )
}
