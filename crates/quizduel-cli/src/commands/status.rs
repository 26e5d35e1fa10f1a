//! Status command handler

use std::sync::Arc;

use anyhow::Result;

use quizduel_core::{Config, CredentialCache, FileCredentialStore};

use crate::output::{Output, OutputFormat};

/// Show where the client connects and whether credentials are stored
pub async fn show(config: &Config, output: &Output) -> Result<()> {
    let credentials_path = config.credentials_path();
    let cache = CredentialCache::new(Arc::new(FileCredentialStore::new(credentials_path.clone())));
    let user_id = cache.user_id().await;
    let has_token = cache.auth_token().await.is_some();

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "server_url": config.server_url,
                    "api_url": config.api_url,
                    "credentials": {
                        "path": credentials_path,
                        "user_id": user_id,
                        "has_token": has_token
                    },
                    "connect_timeout_secs": config.connect_timeout_secs,
                    "max_retries": config.max_retries
                })
            );
        }
        OutputFormat::Quiet => {
            println!(
                "{}",
                if user_id.is_some() && has_token {
                    "ready"
                } else {
                    "logged-out"
                }
            );
        }
        OutputFormat::Human => {
            println!("QuizDuel Status");
            println!("===============");
            println!();
            println!("Server:");
            println!("  Duels:    {}", config.server_url);
            println!(
                "  Metadata: {}",
                config.api_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  Timeout:  {}s, {} retries",
                config.connect_timeout_secs, config.max_retries
            );
            println!();
            println!("Credentials:");
            println!("  Location: {}", credentials_path.display());
            match user_id {
                Some(id) => println!("  User:     {}", id),
                None => println!("  User:     (not set)"),
            }
            println!(
                "  Token:    {}",
                if has_token { "stored" } else { "(not set)" }
            );
            if user_id.is_none() || !has_token {
                println!();
                println!("Log in with: quizduel login --user-id <ID> --token <TOKEN>");
            }
        }
    }

    Ok(())
}
