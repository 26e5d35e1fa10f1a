//! QuizDuel Core Library
//!
//! This crate keeps a client in sync with a live two-player quiz duel and
//! coordinates the quick match queue that pairs players (or a bot) up.
//!
//! # Architecture
//!
//! - **Engine task**: a single tokio task owns the socket, timers and state;
//!   the UI holds a cheap [`DuelEngine`] handle
//! - **Snapshots**: duel and quick match state are published through
//!   `watch` channels, coalesced per tick
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let store = FileCredentialStore::new(config.credentials_path());
//! let credentials = Arc::new(CredentialCache::new(Arc::new(store)));
//! let engine = DuelEngine::spawn(config.engine_config(), Arc::new(WebSocketConnector), credentials);
//!
//! engine.open_duel(42).await?;
//! let mut updates = engine.subscribe();
//! while updates.changed().await.is_ok() {
//!     // render updates.borrow()
//! }
//! ```
//!
//! # Modules
//!
//! - `duel`: session state machine, scoring and the engine
//! - `quick_match`: matchmaking queue state
//! - `net`: wire protocol, transport and retry policy
//! - `credentials`: persisted user id and auth token with a TTL cache
//! - `api`: read-only duel metadata lookups
//! - `config`: Application configuration

pub mod api;
pub mod config;
pub mod credentials;
pub mod duel;
pub mod error;
pub mod net;
pub mod quick_match;

pub use api::{DuelDirectory, DuelSummary};
pub use config::Config;
pub use credentials::{CredentialCache, CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use duel::{AnswerSubmission, Diagnostics, DuelEngine, DuelSession, EngineConfig, Phase, Stage};
pub use error::{DuelError, DuelResult};
pub use net::{DuelId, UserId, WebSocketConnector};
pub use quick_match::{QuickMatchState, QuickMatchStatus};
