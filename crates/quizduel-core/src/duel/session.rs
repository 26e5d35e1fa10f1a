//! Duel session state machine
//!
//! A [`DuelSession`] models one live duel from the client's side:
//!
//! ```text
//! connecting -> lobby -> countdown -> question <-> results -> final
//!      \___________________\__________\______________\_______-> error
//! ```
//!
//! Per-question data only exists inside [`Stage::Question`], so answered
//! flags cannot leak out of the question they belong to. Every inbound
//! event is checked against the session's duel id before it can mutate
//! anything.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::score::{parse_round_result, score_round, RoundResult};
use crate::net::protocol::{DuelCompleted, PlayerTotalsPayload, Question, QuestionPresented};
use crate::net::{ConnectionState, DuelId, ServerMessage, UserId};

/// Coarse phase of a duel, for display and matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Lobby,
    Countdown,
    Question,
    Results,
    Final,
    Error,
}

/// The question currently open for answers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveQuestion {
    pub question: Question,
    pub question_index: u32,
    /// Whole seconds left to answer
    pub time_left: u32,
    pub has_answered: bool,
    pub opponent_answered: bool,
    pub server_end_time: Option<i64>,
}

/// Final totals for one participant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerTotals {
    pub user_id: UserId,
    pub score: u32,
    /// Milliseconds
    pub total_time: u64,
    pub accuracy: f64,
}

impl From<Option<&PlayerTotalsPayload>> for PlayerTotals {
    fn from(payload: Option<&PlayerTotalsPayload>) -> Self {
        let Some(p) = payload else {
            return Self::default();
        };
        Self {
            user_id: p.user_id.unwrap_or(0),
            score: non_negative(p.score) as u32,
            total_time: non_negative(p.total_time) as u64,
            accuracy: non_negative(p.accuracy),
        }
    }
}

/// How the duel ended for a given participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelOutcome {
    Won,
    Lost,
    Draw,
}

/// Result of a completed duel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResults {
    /// `None` means a draw
    pub winner_id: Option<UserId>,
    pub user1: PlayerTotals,
    pub user2: PlayerTotals,
}

impl FinalResults {
    pub fn outcome_for(&self, user_id: UserId) -> DuelOutcome {
        match self.winner_id {
            None => DuelOutcome::Draw,
            Some(winner) if winner == user_id => DuelOutcome::Won,
            Some(_) => DuelOutcome::Lost,
        }
    }

    /// Totals for `user_id`, if they took part
    pub fn totals_of(&self, user_id: UserId) -> Option<&PlayerTotals> {
        [&self.user1, &self.user2]
            .into_iter()
            .find(|totals| totals.user_id == user_id)
    }
}

impl From<&DuelCompleted> for FinalResults {
    fn from(payload: &DuelCompleted) -> Self {
        Self {
            winner_id: payload.winner_id,
            user1: PlayerTotals::from(payload.user1.as_ref()),
            user2: PlayerTotals::from(payload.user2.as_ref()),
        }
    }
}

/// Stage of a duel together with the data that only exists in that stage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Stage {
    Connecting,
    Lobby,
    Countdown {
        seconds: u32,
    },
    Question(ActiveQuestion),
    Results {
        question_index: u32,
        /// `None` when the broadcast result was malformed
        round: Option<RoundResult>,
    },
    Final(FinalResults),
    Error {
        message: String,
    },
}

impl Stage {
    pub fn phase(&self) -> Phase {
        match self {
            Stage::Connecting => Phase::Connecting,
            Stage::Lobby => Phase::Lobby,
            Stage::Countdown { .. } => Phase::Countdown,
            Stage::Question(_) => Phase::Question,
            Stage::Results { .. } => Phase::Results,
            Stage::Final(_) => Phase::Final,
            Stage::Error { .. } => Phase::Error,
        }
    }
}

/// Room membership as reported by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub is_in_room: bool,
    pub room_error: Option<String>,
    pub session: Option<Value>,
}

/// What happened to an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The session changed
    Updated,
    /// The event belongs to another duel and was dropped
    ForeignDuel(DuelId),
    /// The event does not apply in the current stage
    Skipped,
}

/// Why a local answer was not sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerSubmission {
    /// The answer went out to the server
    Sent,
    /// No question is open
    NoQuestion,
    /// An answer for this question was already sent
    AlreadyAnswered,
}

/// Client-side model of one live duel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelSession {
    duel_id: DuelId,
    local_user_id: Option<UserId>,
    stage: Stage,
    total_questions: u32,
    user_score: u32,
    opponent_score: u32,
    /// Question indexes already counted towards the scores
    #[serde(skip)]
    scored_rounds: BTreeSet<u32>,
    connection: ConnectionState,
    room: RoomState,
}

impl DuelSession {
    /// A fresh session in the connecting phase
    pub fn new(duel_id: DuelId, max_retries: u32) -> Self {
        Self {
            duel_id,
            local_user_id: None,
            stage: Stage::Connecting,
            total_questions: 0,
            user_score: 0,
            opponent_score: 0,
            scored_rounds: BTreeSet::new(),
            connection: ConnectionState::new(max_retries),
            room: RoomState::default(),
        }
    }

    pub fn duel_id(&self) -> DuelId {
        self.duel_id
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        self.local_user_id
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn phase(&self) -> Phase {
        self.stage.phase()
    }

    pub fn active_question(&self) -> Option<&ActiveQuestion> {
        match &self.stage {
            Stage::Question(active) => Some(active),
            _ => None,
        }
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.active_question().map(|active| &active.question)
    }

    pub fn question_index(&self) -> Option<u32> {
        match &self.stage {
            Stage::Question(active) => Some(active.question_index),
            Stage::Results { question_index, .. } => Some(*question_index),
            _ => None,
        }
    }

    pub fn total_questions(&self) -> u32 {
        self.total_questions
    }

    /// Seconds left on the open question; zero outside the question phase
    pub fn time_left(&self) -> u32 {
        self.active_question().map_or(0, |active| active.time_left)
    }

    pub fn has_answered(&self) -> bool {
        self.active_question().is_some_and(|active| active.has_answered)
    }

    pub fn opponent_answered(&self) -> bool {
        self.active_question()
            .is_some_and(|active| active.opponent_answered)
    }

    pub fn user_score(&self) -> u32 {
        self.user_score
    }

    pub fn opponent_score(&self) -> u32 {
        self.opponent_score
    }

    pub fn round_result(&self) -> Option<&RoundResult> {
        match &self.stage {
            Stage::Results { round, .. } => round.as_ref(),
            _ => None,
        }
    }

    pub fn final_results(&self) -> Option<&FinalResults> {
        match &self.stage {
            Stage::Final(results) => Some(results),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.stage {
            Stage::Error { message } => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    pub fn room(&self) -> &RoomState {
        &self.room
    }

    pub(crate) fn set_local_user_id(&mut self, user_id: Option<UserId>) {
        self.local_user_id = user_id;
    }

    pub(crate) fn set_connection(&mut self, connection: &ConnectionState) {
        if self.connection != *connection {
            self.connection = connection.clone();
        }
    }

    /// Move to the error phase for a local reason (e.g. retries exhausted)
    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.stage = Stage::Error {
            message: message.into(),
        };
    }

    /// Check that an answer may be sent, returning the question id to send
    pub fn answer_target(&self) -> Result<Option<i64>, AnswerSubmission> {
        match &self.stage {
            Stage::Question(active) if active.has_answered => Err(AnswerSubmission::AlreadyAnswered),
            Stage::Question(active) => Ok(active.question.id),
            _ => Err(AnswerSubmission::NoQuestion),
        }
    }

    /// Record that the local answer went out
    ///
    /// Correctness is never judged locally; the next `round_result` decides.
    pub(crate) fn mark_answered(&mut self) {
        if let Stage::Question(active) = &mut self.stage {
            active.has_answered = true;
        }
    }

    /// Apply one inbound server event
    pub fn apply(&mut self, message: &ServerMessage) -> Applied {
        if let Some(event_duel) = message.duel_id() {
            if event_duel != self.duel_id {
                info!(
                    "Dropping {} for duel {} (active duel {})",
                    message.kind(),
                    event_duel,
                    self.duel_id
                );
                return Applied::ForeignDuel(event_duel);
            }
        }

        let applied = match message {
            ServerMessage::RoomJoined(p) => {
                self.room = RoomState {
                    is_in_room: true,
                    room_error: None,
                    session: p.session.clone(),
                };
                if self.stage == Stage::Connecting {
                    self.stage = Stage::Lobby;
                }
                Applied::Updated
            }
            ServerMessage::RoomError(p) => {
                let message = p
                    .message
                    .clone()
                    .unwrap_or_else(|| "Failed to join duel room".to_string());
                self.room.is_in_room = false;
                self.room.room_error = Some(message.clone());
                self.stage = Stage::Error { message };
                Applied::Updated
            }
            ServerMessage::DuelStarting(p) => match self.stage {
                Stage::Connecting | Stage::Lobby | Stage::Countdown { .. } => {
                    self.stage = Stage::Countdown {
                        seconds: p.countdown,
                    };
                    Applied::Updated
                }
                _ => Applied::Skipped,
            },
            ServerMessage::QuestionPresented(p) => self.present_question(p),
            ServerMessage::TimerUpdate(p) => match &mut self.stage {
                Stage::Question(active) if active.question_index == p.question_index => {
                    active.time_left = whole_seconds(p.time_remaining);
                    Applied::Updated
                }
                _ => Applied::Skipped,
            },
            ServerMessage::OpponentAnswered(_) => match &mut self.stage {
                Stage::Question(active) => {
                    active.opponent_answered = true;
                    Applied::Updated
                }
                _ => Applied::Skipped,
            },
            ServerMessage::RoundResult(p) => {
                if matches!(self.stage, Stage::Final(_)) {
                    return Applied::Skipped;
                }
                let current_index = self.question_index();
                let fallback_index = current_index.unwrap_or(0);
                let round_index = p.question_index.unwrap_or(fallback_index);
                if current_index.is_some_and(|current| round_index < current) {
                    info!(
                        "Dropping stale round result {} for duel {} (question {})",
                        round_index,
                        self.duel_id,
                        fallback_index
                    );
                    return Applied::Skipped;
                }
                if self.scored_rounds.contains(&round_index) && self.phase() == Phase::Results {
                    return Applied::Skipped;
                }
                match parse_round_result(p, fallback_index) {
                    Ok(round) => {
                        self.score(&round);
                        self.stage = Stage::Results {
                            question_index: round.question_index,
                            round: Some(round),
                        };
                    }
                    Err(e) => {
                        // Still advance so the UI cannot stall in the question phase
                        warn!("Malformed round result for duel {}: {}", self.duel_id, e);
                        self.stage = Stage::Results {
                            question_index: p.question_index.unwrap_or(fallback_index),
                            round: None,
                        };
                    }
                }
                Applied::Updated
            }
            ServerMessage::DuelCompleted(p) => {
                self.stage = Stage::Final(FinalResults::from(p));
                Applied::Updated
            }
            ServerMessage::DuelError(p) => {
                self.fail(p.message.clone().unwrap_or_else(|| "Duel error".to_string()));
                Applied::Updated
            }
            ServerMessage::ConnectionLost(p) => {
                self.fail(with_reason("Connection lost", p.reason.as_deref()));
                Applied::Updated
            }
            ServerMessage::DuelCancelled(p) => {
                self.fail(with_reason("Duel cancelled", p.reason.as_deref()));
                Applied::Updated
            }
            ServerMessage::QuickMatchSearching(_)
            | ServerMessage::QuickMatchFound(_)
            | ServerMessage::QuickMatchTimeout(_)
            | ServerMessage::QuickMatchError(_)
            | ServerMessage::QuickMatchCancelled(_) => Applied::Skipped,
        };

        if applied == Applied::Skipped {
            debug!(
                "Ignoring {} in {:?} phase of duel {}",
                message.kind(),
                self.phase(),
                self.duel_id
            );
        }
        applied
    }

    fn present_question(&mut self, p: &QuestionPresented) -> Applied {
        if matches!(self.stage, Stage::Final(_)) {
            return Applied::Skipped;
        }

        self.total_questions = p.total_questions;
        self.stage = Stage::Question(ActiveQuestion {
            question: p.question.clone(),
            question_index: p.question_index,
            time_left: p.time_limit.div_ceil(1000) as u32,
            has_answered: false,
            opponent_answered: false,
            server_end_time: p.server_end_time,
        });
        Applied::Updated
    }

    fn score(&mut self, round: &RoundResult) {
        if self.scored_rounds.contains(&round.question_index) {
            debug!(
                "Round {} of duel {} already scored",
                round.question_index, self.duel_id
            );
            return;
        }
        let Some(local_user) = self.local_user_id else {
            warn!(
                "Local user id unknown, cannot attribute round {} of duel {}",
                round.question_index, self.duel_id
            );
            return;
        };

        let delta = score_round(round, local_user);
        self.user_score += delta.user;
        self.opponent_score += delta.opponent;
        self.scored_rounds.insert(round.question_index);
    }
}

fn whole_seconds(seconds: f64) -> u32 {
    if seconds.is_finite() && seconds > 0.0 {
        seconds.ceil() as u32
    } else {
        0
    }
}

fn non_negative(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(0.0)
}

fn with_reason(prefix: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) if !reason.is_empty() => format!("{}: {}", prefix, reason),
        _ => prefix.to_string(),
    }
}
