//! Quick match coordinator
//!
//! Tracks a matchmaking request from the moment the user enters the queue
//! until the server pairs them with a human or substitutes a bot:
//!
//! ```text
//! idle -> searching -> found | timeout | error | cancelled
//! ```
//!
//! The engine owns the ticker and the socket; this module is the pure
//! state that both feed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::net::protocol::{MatchedDuel, Opponent};
use crate::net::ServerMessage;

/// Where a quick match request stands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickMatchStatus {
    #[default]
    Idle,
    Searching,
    Found,
    /// No human was found in time; the server paired a bot
    Timeout,
    Error,
    Cancelled,
}

impl QuickMatchStatus {
    /// Whether a duel is ready to be opened
    pub fn has_match(&self) -> bool {
        matches!(self, QuickMatchStatus::Found | QuickMatchStatus::Timeout)
    }

    /// Whether the request has reached an end state
    pub fn is_settled(&self) -> bool {
        !matches!(self, QuickMatchStatus::Idle | QuickMatchStatus::Searching)
    }
}

/// Snapshot of the quick match flow
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickMatchState {
    pub status: QuickMatchStatus,
    pub course_id: Option<i64>,
    pub matched_duel: Option<MatchedDuel>,
    pub opponent: Option<Opponent>,
    pub search_start_time: Option<DateTime<Utc>>,
    /// Whole seconds spent in the queue
    pub time_in_queue: u64,
    pub message: Option<String>,
    #[serde(skip)]
    started_at: Option<Instant>,
}

/// Effect of an inbound quick match event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickMatchUpdate {
    /// State changed, search continues
    Updated,
    /// The request settled; the queue ticker must stop
    Settled,
    /// Not applicable in the current status
    Skipped,
}

impl QuickMatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the queue for `course_id`
    pub fn begin(&mut self, course_id: i64) {
        *self = Self {
            status: QuickMatchStatus::Searching,
            course_id: Some(course_id),
            search_start_time: Some(Utc::now()),
            started_at: Some(Instant::now()),
            ..Self::default()
        };
        info!("Searching quick match for course {}", course_id);
    }

    /// Refresh the time spent in the queue
    ///
    /// Returns whether the visible value changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.status != QuickMatchStatus::Searching {
            return false;
        }
        let Some(started_at) = self.started_at else {
            return false;
        };

        let elapsed = now.saturating_duration_since(started_at).as_secs();
        if elapsed == self.time_in_queue {
            return false;
        }
        self.time_in_queue = elapsed;
        true
    }

    /// Apply one inbound server event
    pub fn apply(&mut self, message: &ServerMessage) -> QuickMatchUpdate {
        if self.status != QuickMatchStatus::Searching {
            debug!(
                "Ignoring {} while quick match is {:?}",
                message.kind(),
                self.status
            );
            return QuickMatchUpdate::Skipped;
        }

        match message {
            ServerMessage::QuickMatchSearching(p) => {
                self.message = p.message.clone();
                QuickMatchUpdate::Updated
            }
            ServerMessage::QuickMatchFound(p) => {
                let opponent = p.opponent.clone().unwrap_or_else(Opponent::unknown);
                info!(
                    "Quick match found duel {} against {}",
                    p.duel.id, opponent.username
                );
                self.settle(QuickMatchStatus::Found, None);
                self.matched_duel = Some(p.duel.clone());
                self.opponent = Some(opponent);
                QuickMatchUpdate::Settled
            }
            ServerMessage::QuickMatchTimeout(p) => {
                info!("Quick match timed out, paired with a bot in duel {}", p.duel.id);
                self.settle(QuickMatchStatus::Timeout, p.message.clone());
                self.matched_duel = Some(p.duel.clone());
                self.opponent = Some(Opponent::bot());
                QuickMatchUpdate::Settled
            }
            ServerMessage::QuickMatchError(p) => {
                self.settle(QuickMatchStatus::Error, p.message.clone());
                QuickMatchUpdate::Settled
            }
            ServerMessage::QuickMatchCancelled(p) => {
                self.settle(QuickMatchStatus::Cancelled, p.message.clone());
                QuickMatchUpdate::Settled
            }
            _ => QuickMatchUpdate::Skipped,
        }
    }

    /// Fail the search for a local reason (e.g. the transport dropped)
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        if self.status == QuickMatchStatus::Searching {
            self.settle(QuickMatchStatus::Error, Some(message.into()));
        }
    }

    /// Return to idle, clearing every field
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn settle(&mut self, status: QuickMatchStatus, message: Option<String>) {
        if let Some(started_at) = self.started_at {
            self.time_in_queue = started_at.elapsed().as_secs();
        }
        self.status = status;
        self.matched_duel = None;
        self.opponent = None;
        self.message = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn event(value: serde_json::Value) -> ServerMessage {
        ServerMessage::decode(&value.to_string()).unwrap()
    }

    fn searching(course_id: i64) -> QuickMatchState {
        let mut state = QuickMatchState::new();
        state.begin(course_id);
        state
    }

    #[test]
    fn test_begin_starts_search() {
        let state = searching(5);

        assert_eq!(state.status, QuickMatchStatus::Searching);
        assert_eq!(state.course_id, Some(5));
        assert!(state.search_start_time.is_some());
        assert_eq!(state.time_in_queue, 0);
    }

    #[test]
    fn test_tick_counts_whole_seconds() {
        let mut state = searching(5);
        let start = state.started_at.unwrap();

        assert!(!state.tick(start + Duration::from_millis(400)));
        assert!(state.tick(start + Duration::from_millis(2100)));
        assert_eq!(state.time_in_queue, 2);
    }

    #[test]
    fn test_searching_refreshes_message() {
        let mut state = searching(5);
        let update = state.apply(&event(json!({
            "event": "quick_match_searching",
            "data": {"message": "Looking for an opponent"}
        })));

        assert_eq!(update, QuickMatchUpdate::Updated);
        assert_eq!(state.message.as_deref(), Some("Looking for an opponent"));
    }

    #[test]
    fn test_found_settles_and_freezes_queue_time() {
        let mut state = searching(5);
        let update = state.apply(&event(json!({
            "event": "quick_match_found",
            "data": {"duel": {"id": 77, "courseId": 5}, "opponent": {"username": "ada", "userId": 2}}
        })));

        assert_eq!(update, QuickMatchUpdate::Settled);
        assert_eq!(state.status, QuickMatchStatus::Found);
        assert_eq!(state.matched_duel.as_ref().map(|d| d.id), Some(77));
        assert_eq!(state.opponent.as_ref().map(|o| o.username.as_str()), Some("ada"));

        let later = Instant::now() + Duration::from_secs(30);
        assert!(!state.tick(later));
    }

    #[test]
    fn test_found_without_opponent_still_settles() {
        let mut state = searching(5);
        let update = state.apply(&event(json!({
            "event": "quick_match_found",
            "data": {"duel": {"id": 79}}
        })));

        assert_eq!(update, QuickMatchUpdate::Settled);
        assert_eq!(state.status, QuickMatchStatus::Found);
        assert_eq!(state.opponent, Some(Opponent::unknown()));
    }

    #[test]
    fn test_timeout_pairs_bot() {
        let mut state = searching(5);
        state.apply(&event(json!({
            "event": "quick_match_timeout",
            "data": {"duel": {"id": 78}, "message": "No players available"}
        })));

        assert_eq!(state.status, QuickMatchStatus::Timeout);
        assert!(state.status.has_match());
        let opponent = state.opponent.unwrap();
        assert!(opponent.is_bot);
        assert_eq!(opponent.username, Opponent::BOT_NAME);
    }

    #[test]
    fn test_error_and_cancel_clear_match_data() {
        let mut state = searching(5);
        state.apply(&event(json!({"event": "quick_match_error", "data": {"message": "Queue unavailable"}})));
        assert_eq!(state.status, QuickMatchStatus::Error);
        assert!(state.matched_duel.is_none());
        assert_eq!(state.message.as_deref(), Some("Queue unavailable"));

        let mut state = searching(5);
        state.apply(&event(json!({"event": "quick_match_cancelled", "data": {}})));
        assert_eq!(state.status, QuickMatchStatus::Cancelled);
        assert!(state.status.is_settled());
    }

    #[test]
    fn test_events_ignored_when_not_searching() {
        let mut state = QuickMatchState::new();
        let update = state.apply(&event(json!({
            "event": "quick_match_found",
            "data": {"duel": {"id": 1}, "opponent": {"username": "x"}}
        })));

        assert_eq!(update, QuickMatchUpdate::Skipped);
        assert_eq!(state, QuickMatchState::default());
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut state = searching(5);
        state.fail("Connection lost");
        assert_eq!(state.status, QuickMatchStatus::Error);

        state.reset();
        assert_eq!(state, QuickMatchState::default());
    }
}
