//! Credential command handlers

use anyhow::{Context, Result};

use quizduel_core::credentials::{TOKEN_KEYS, USER_ID_KEY};
use quizduel_core::{Config, FileCredentialStore, UserId};

use crate::output::Output;

/// Store the user id and auth token used to connect
pub async fn login(config: &Config, user_id: UserId, token: String, output: &Output) -> Result<()> {
    let store = FileCredentialStore::new(config.credentials_path());

    store
        .set(USER_ID_KEY, &user_id.to_string())
        .await
        .context("Failed to save user id")?;
    store
        .set(TOKEN_KEYS[0], token.trim())
        .await
        .context("Failed to save auth token")?;

    output.success(&format!(
        "Logged in as user {} ({})",
        user_id,
        store.path().display()
    ));
    Ok(())
}

/// Remove every stored credential
pub async fn logout(config: &Config, output: &Output) -> Result<()> {
    let store = FileCredentialStore::new(config.credentials_path());

    let mut removed = store
        .remove(USER_ID_KEY)
        .await
        .context("Failed to remove user id")?;
    for key in TOKEN_KEYS {
        removed |= store
            .remove(key)
            .await
            .context("Failed to remove auth token")?;
    }

    if removed {
        output.success("Logged out");
    } else {
        output.message("No stored credentials");
    }
    Ok(())
}
