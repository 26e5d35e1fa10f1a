//! Live duel synchronization
//!
//! ## Architecture
//!
//! - [`DuelSession`] is the pure state machine for one duel
//! - [`score`] validates round results and derives score deltas
//! - [`ListenerRegistry`] routes inbound events to their consumer
//! - [`DuelEngine`] owns the socket, timers and retry policy in one task
//!   and publishes coalesced snapshots to the UI

mod engine;
mod registry;
pub mod score;
mod session;

use std::time::Duration;

use crate::net::RetryPolicy;

pub use engine::{Diagnostics, DuelEngine};
pub use registry::{ListenerRegistry, RegistrationToken, Scope};
pub use session::{
    ActiveQuestion, Applied, AnswerSubmission, DuelOutcome, DuelSession, FinalResults, Phase,
    PlayerTotals, RoomState, Stage,
};

/// Timing and endpoint settings for a [`DuelEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WebSocket endpoint of the duel server
    pub server_url: String,
    /// Upper bound on a single connection attempt
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Snapshot publication tick; events within one tick share one update
    pub flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000/duels".to_string(),
            connect_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            flush_interval: Duration::from_millis(16),
        }
    }
}
