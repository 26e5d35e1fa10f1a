//! Round result validation and score derivation
//!
//! The server is the scoring authority. The client only counts, per round,
//! whether each side's broadcast answer was marked correct.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::protocol::RoundResultPayload;
use crate::net::UserId;

/// The question a round result refers to, with its answer revealed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundQuestion {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// One participant's answer in a round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnswerEntry {
    pub user_id: Option<UserId>,
    pub selected_answer: Option<String>,
    pub is_correct: bool,
    /// Milliseconds
    pub time_taken: f64,
}

/// A validated `round_result`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResult {
    pub question_index: u32,
    pub question: RoundQuestion,
    pub answers: Vec<AnswerEntry>,
}

impl RoundResult {
    /// The local user's answer, if it was broadcast
    pub fn answer_of(&self, user_id: UserId) -> Option<&AnswerEntry> {
        self.answers.iter().find(|a| a.user_id == Some(user_id))
    }
}

/// Why a round result could not be used
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MalformedRound {
    #[error("round result has no question")]
    MissingQuestion,
    #[error("round result answers are not a list")]
    AnswersNotArray,
    #[error("round result question is invalid: {0}")]
    InvalidQuestion(String),
    #[error("round result answers are invalid: {0}")]
    InvalidAnswers(String),
}

/// Points gained by each side in one round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreDelta {
    pub user: u32,
    pub opponent: u32,
}

/// Validate a `round_result` payload
///
/// `fallback_index` is used when the server omits the question index.
pub fn parse_round_result(
    payload: &RoundResultPayload,
    fallback_index: u32,
) -> Result<RoundResult, MalformedRound> {
    let question = match &payload.question {
        None | Some(serde_json::Value::Null) => return Err(MalformedRound::MissingQuestion),
        Some(value) => serde_json::from_value::<RoundQuestion>(value.clone())
            .map_err(|e| MalformedRound::InvalidQuestion(e.to_string()))?,
    };

    let answers = match &payload.answers {
        Some(value @ serde_json::Value::Array(_)) => {
            serde_json::from_value::<Vec<AnswerEntry>>(value.clone())
                .map_err(|e| MalformedRound::InvalidAnswers(e.to_string()))?
        }
        _ => return Err(MalformedRound::AnswersNotArray),
    };

    Ok(RoundResult {
        question_index: payload.question_index.unwrap_or(fallback_index),
        question,
        answers,
    })
}

/// Score a round from the local user's point of view
///
/// The first entry for the local user and the first entry for anyone else
/// each contribute one point when marked correct.
pub fn score_round(round: &RoundResult, local_user: UserId) -> ScoreDelta {
    let point = |entry: Option<&AnswerEntry>| u32::from(entry.is_some_and(|a| a.is_correct));

    ScoreDelta {
        user: point(round.answer_of(local_user)),
        opponent: point(
            round
                .answers
                .iter()
                .find(|a| a.user_id.is_some_and(|id| id != local_user)),
        ),
    }
}
