//! Duel protocol message types
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<snake_case name>", "data": {...}}` with camelCase payload
//! fields. Inbound frames are decoded exactly once, here, into the closed
//! [`ServerMessage`] sum type; unknown event names fail to decode.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DuelError;

/// Server-assigned duel identifier
pub type DuelId = i64;

/// Server-assigned user identifier
pub type UserId = i64;

/// Messages sent to the duel server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Join the room of a duel
    JoinDuelRoom { duel_id: DuelId },
    /// Leave the current duel room
    LeaveDuelRoom,
    /// Tell the server this participant is ready to start
    SignalReady,
    /// Answer the current question
    SubmitAnswer {
        question_id: Option<i64>,
        selected_answer: String,
        #[serde(rename = "timeTaken")]
        time_taken_ms: u64,
    },
    /// Enter the quick match queue for a course
    JoinQuickMatch { course_id: i64 },
    /// Leave the quick match queue
    LeaveQuickMatch,
}

impl ClientMessage {
    /// Encode message to a JSON text frame
    pub fn encode(&self) -> Result<String, DuelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Event name used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::JoinDuelRoom { .. } => "join_duel_room",
            ClientMessage::LeaveDuelRoom => "leave_duel_room",
            ClientMessage::SignalReady => "signal_ready",
            ClientMessage::SubmitAnswer { .. } => "submit_answer",
            ClientMessage::JoinQuickMatch { .. } => "join_quick_match",
            ClientMessage::LeaveQuickMatch => "leave_quick_match",
        }
    }
}

/// Messages received from the duel server
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomJoined(RoomJoined),
    RoomError(ErrorNotice),
    DuelStarting(DuelStarting),
    QuestionPresented(QuestionPresented),
    TimerUpdate(TimerUpdate),
    OpponentAnswered(OpponentAnswered),
    RoundResult(RoundResultPayload),
    DuelCompleted(DuelCompleted),
    DuelError(ErrorNotice),
    ConnectionLost(Interruption),
    DuelCancelled(Interruption),
    QuickMatchSearching(QuickMatchNotice),
    QuickMatchFound(QuickMatchFound),
    QuickMatchTimeout(QuickMatchTimeout),
    QuickMatchError(QuickMatchNotice),
    QuickMatchCancelled(QuickMatchNotice),
}

impl ServerMessage {
    /// Decode a JSON text frame
    ///
    /// A frame without `data` decodes as an empty payload, so events whose
    /// fields are all optional may omit it.
    pub fn decode(text: &str) -> Result<Self, DuelError> {
        let mut frame: Value = serde_json::from_str(text)?;
        if let Some(object) = frame.as_object_mut() {
            if object.get("data").map_or(true, Value::is_null) {
                object.insert("data".to_string(), Value::Object(serde_json::Map::new()));
            }
        }
        Ok(serde_json::from_value(frame)?)
    }

    /// The kind of event, used for listener routing
    pub fn kind(&self) -> EventKind {
        match self {
            ServerMessage::RoomJoined(_) => EventKind::RoomJoined,
            ServerMessage::RoomError(_) => EventKind::RoomError,
            ServerMessage::DuelStarting(_) => EventKind::DuelStarting,
            ServerMessage::QuestionPresented(_) => EventKind::QuestionPresented,
            ServerMessage::TimerUpdate(_) => EventKind::TimerUpdate,
            ServerMessage::OpponentAnswered(_) => EventKind::OpponentAnswered,
            ServerMessage::RoundResult(_) => EventKind::RoundResult,
            ServerMessage::DuelCompleted(_) => EventKind::DuelCompleted,
            ServerMessage::DuelError(_) => EventKind::DuelError,
            ServerMessage::ConnectionLost(_) => EventKind::ConnectionLost,
            ServerMessage::DuelCancelled(_) => EventKind::DuelCancelled,
            ServerMessage::QuickMatchSearching(_) => EventKind::QuickMatchSearching,
            ServerMessage::QuickMatchFound(_) => EventKind::QuickMatchFound,
            ServerMessage::QuickMatchTimeout(_) => EventKind::QuickMatchTimeout,
            ServerMessage::QuickMatchError(_) => EventKind::QuickMatchError,
            ServerMessage::QuickMatchCancelled(_) => EventKind::QuickMatchCancelled,
        }
    }

    /// Duel the event claims to belong to, when the server tagged it
    pub fn duel_id(&self) -> Option<DuelId> {
        match self {
            ServerMessage::RoomJoined(p) => p.duel_id,
            ServerMessage::RoomError(p) | ServerMessage::DuelError(p) => p.duel_id,
            ServerMessage::DuelStarting(p) => p.duel_id,
            ServerMessage::QuestionPresented(p) => p.duel_id,
            ServerMessage::TimerUpdate(p) => p.duel_id,
            ServerMessage::OpponentAnswered(p) => p.duel_id,
            ServerMessage::RoundResult(p) => p.duel_id,
            ServerMessage::DuelCompleted(p) => p.duel_id,
            ServerMessage::ConnectionLost(p) | ServerMessage::DuelCancelled(p) => p.duel_id,
            ServerMessage::QuickMatchSearching(_)
            | ServerMessage::QuickMatchFound(_)
            | ServerMessage::QuickMatchTimeout(_)
            | ServerMessage::QuickMatchError(_)
            | ServerMessage::QuickMatchCancelled(_) => None,
        }
    }
}

/// Inbound event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    RoomJoined,
    RoomError,
    DuelStarting,
    QuestionPresented,
    TimerUpdate,
    OpponentAnswered,
    RoundResult,
    DuelCompleted,
    DuelError,
    ConnectionLost,
    DuelCancelled,
    QuickMatchSearching,
    QuickMatchFound,
    QuickMatchTimeout,
    QuickMatchError,
    QuickMatchCancelled,
}

impl EventKind {
    /// Events handled by a duel session
    pub const DUEL: [EventKind; 11] = [
        EventKind::RoomJoined,
        EventKind::RoomError,
        EventKind::DuelStarting,
        EventKind::QuestionPresented,
        EventKind::TimerUpdate,
        EventKind::OpponentAnswered,
        EventKind::RoundResult,
        EventKind::DuelCompleted,
        EventKind::DuelError,
        EventKind::ConnectionLost,
        EventKind::DuelCancelled,
    ];

    /// Events handled by the quick match coordinator
    pub const QUICK_MATCH: [EventKind; 5] = [
        EventKind::QuickMatchSearching,
        EventKind::QuickMatchFound,
        EventKind::QuickMatchTimeout,
        EventKind::QuickMatchError,
        EventKind::QuickMatchCancelled,
    ];

    /// Event name used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RoomJoined => "room_joined",
            EventKind::RoomError => "room_error",
            EventKind::DuelStarting => "duel_starting",
            EventKind::QuestionPresented => "question_presented",
            EventKind::TimerUpdate => "timer_update",
            EventKind::OpponentAnswered => "opponent_answered",
            EventKind::RoundResult => "round_result",
            EventKind::DuelCompleted => "duel_completed",
            EventKind::DuelError => "duel_error",
            EventKind::ConnectionLost => "connection_lost",
            EventKind::DuelCancelled => "duel_cancelled",
            EventKind::QuickMatchSearching => "quick_match_searching",
            EventKind::QuickMatchFound => "quick_match_found",
            EventKind::QuickMatchTimeout => "quick_match_timeout",
            EventKind::QuickMatchError => "quick_match_error",
            EventKind::QuickMatchCancelled => "quick_match_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `room_joined`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    /// Opaque room session description from the server
    #[serde(default)]
    pub session: Option<Value>,
    pub duel_id: Option<DuelId>,
}

/// `room_error` and `duel_error`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub message: Option<String>,
    pub duel_id: Option<DuelId>,
}

/// `duel_starting`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelStarting {
    #[serde(default)]
    pub countdown: u32,
    pub duel_id: Option<DuelId>,
}

/// A question as presented to both participants
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// `question_presented`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPresented {
    pub question_index: u32,
    #[serde(default)]
    pub total_questions: u32,
    #[serde(default)]
    pub question: Question,
    /// Answer window in milliseconds
    #[serde(default)]
    pub time_limit: u64,
    pub server_start_time: Option<i64>,
    pub server_end_time: Option<i64>,
    pub duel_id: Option<DuelId>,
}

/// `timer_update`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerUpdate {
    /// Seconds left on the active question; may be negative near the deadline
    pub time_remaining: f64,
    pub server_time: Option<i64>,
    pub question_index: u32,
    pub duel_id: Option<DuelId>,
}

/// `opponent_answered`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpponentAnswered {
    pub duel_id: Option<DuelId>,
}

/// `round_result`
///
/// The nested fields stay loosely typed; [`crate::duel::score`] validates
/// them so a malformed round can still advance the session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResultPayload {
    pub question_index: Option<u32>,
    pub question: Option<Value>,
    pub answers: Option<Value>,
    pub duel_id: Option<DuelId>,
}

/// Per-participant totals inside `duel_completed`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerTotalsPayload {
    pub user_id: Option<UserId>,
    pub score: Option<f64>,
    pub total_time: Option<f64>,
    pub accuracy: Option<f64>,
}

/// `duel_completed`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelCompleted {
    pub winner_id: Option<UserId>,
    pub user1: Option<PlayerTotalsPayload>,
    pub user2: Option<PlayerTotalsPayload>,
    pub duel_id: Option<DuelId>,
}

/// `connection_lost` and `duel_cancelled`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interruption {
    pub reason: Option<String>,
    pub duel_id: Option<DuelId>,
}

/// `quick_match_searching`, `quick_match_error` and `quick_match_cancelled`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickMatchNotice {
    pub message: Option<String>,
}

/// The duel a quick match produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedDuel {
    pub id: DuelId,
    #[serde(default)]
    pub course_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// The participant on the other side of a duel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opponent {
    pub username: String,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub is_bot: bool,
}

impl Opponent {
    /// Display name used when the server substitutes a bot
    pub const BOT_NAME: &'static str = "Dr. Bot";

    /// Display name used when the server does not say who the opponent is
    pub const UNKNOWN_NAME: &'static str = "unknown opponent";

    /// Placeholder opponent for a bot-backed duel
    pub fn bot() -> Self {
        Self {
            username: Self::BOT_NAME.to_string(),
            user_id: None,
            is_bot: true,
        }
    }

    /// Placeholder for a match reported without an opponent
    pub fn unknown() -> Self {
        Self {
            username: Self::UNKNOWN_NAME.to_string(),
            user_id: None,
            is_bot: false,
        }
    }
}

/// `quick_match_found`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickMatchFound {
    pub duel: MatchedDuel,
    #[serde(default)]
    pub opponent: Option<Opponent>,
}

/// `quick_match_timeout`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickMatchTimeout {
    pub duel: MatchedDuel,
    pub message: Option<String>,
}
