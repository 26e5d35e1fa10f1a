//! Duel metadata lookups
//!
//! Read-only REST client used to show who the opponent is before the room
//! fills up. Nothing here feeds the duel state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DuelError, DuelResult};
use crate::net::protocol::Opponent;
use crate::net::DuelId;

/// Request timeout
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Summary of a duel as the REST API reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelSummary {
    pub id: DuelId,
    #[serde(default)]
    pub course_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub opponent: Option<Opponent>,
}

impl DuelSummary {
    /// Name to show for the opponent
    pub fn opponent_name(&self) -> &str {
        self.opponent
            .as_ref()
            .map_or(Opponent::UNKNOWN_NAME, |o| o.username.as_str())
    }
}

/// REST client for duel metadata
#[derive(Debug, Clone)]
pub struct DuelDirectory {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl DuelDirectory {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> DuelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("quizduel/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Endpoint for one duel
    pub fn duel_url(&self, duel_id: DuelId) -> String {
        format!("{}/duels/{}", self.base_url, duel_id)
    }

    /// Fetch the summary of `duel_id`
    pub async fn fetch_duel(&self, duel_id: DuelId) -> DuelResult<DuelSummary> {
        let url = self.duel_url(duel_id);
        debug!("Fetching duel metadata from {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DuelError::Api(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        Ok(response.json().await?)
    }

    /// Opponent display name, degrading to a placeholder on any failure
    pub async fn opponent_name(&self, duel_id: DuelId) -> String {
        match self.fetch_duel(duel_id).await {
            Ok(summary) => summary.opponent_name().to_string(),
            Err(e) => {
                debug!("Duel metadata lookup failed: {}", e);
                Opponent::UNKNOWN_NAME.to_string()
            }
        }
    }
}
