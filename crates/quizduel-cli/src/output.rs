//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use quizduel_core::duel::{DuelOutcome, FinalResults, Stage};
use quizduel_core::{DuelSession, QuickMatchState, QuickMatchStatus, UserId};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print a duel snapshot after a phase change
    pub fn print_stage(&self, session: &DuelSession) {
        match self.format {
            OutputFormat::Human => {
                for line in describe_stage(session) {
                    println!("{}", line);
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(session).unwrap_or_default());
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print the final result of a duel
    pub fn print_final(&self, session: &DuelSession, results: &FinalResults) {
        match self.format {
            OutputFormat::Human => {
                println!();
                println!("── Duel {} finished ──", session.duel_id());
                for line in describe_final(results, session.local_user_id()) {
                    println!("{}", line);
                }
            }
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(results).unwrap_or_default());
            }
            OutputFormat::Quiet => {
                let outcome = session
                    .local_user_id()
                    .map(|user| results.outcome_for(user));
                println!("{}", outcome.map_or("unknown", outcome_label));
            }
        }
    }

    /// Print a quick match snapshot
    pub fn print_queue(&self, state: &QuickMatchState) {
        match self.format {
            OutputFormat::Human => println!("{}", describe_queue(state)),
            OutputFormat::Json => {
                println!("{}", serde_json::to_string(state).unwrap_or_default());
            }
            OutputFormat::Quiet => {
                if let Some(duel) = &state.matched_duel {
                    println!("{}", duel.id);
                }
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Human-readable lines for the current stage
fn describe_stage(session: &DuelSession) -> Vec<String> {
    match session.stage() {
        Stage::Connecting => {
            let connection = session.connection();
            if connection.retry_count > 0 {
                vec![format!(
                    "Reconnecting (attempt {}/{})...",
                    connection.retry_count + 1,
                    connection.max_retries
                )]
            } else {
                vec!["Connecting...".to_string()]
            }
        }
        Stage::Lobby => vec!["Joined the duel room, waiting for your opponent...".to_string()],
        Stage::Countdown { seconds } => vec![format!("Duel starts in {}s", seconds)],
        Stage::Question(active) => {
            let mut lines = vec![
                String::new(),
                format!(
                    "Question {}/{} ({}s)",
                    active.question_index + 1,
                    session.total_questions().max(active.question_index + 1),
                    active.time_left
                ),
                active.question.text.clone(),
            ];
            lines.extend(
                active
                    .question
                    .options
                    .iter()
                    .enumerate()
                    .map(|(i, option)| format!("  [{}] {}", i + 1, option)),
            );
            lines
        }
        Stage::Results { round, .. } => {
            let mut lines = Vec::new();
            match round {
                Some(round) => {
                    if let Some(correct) = &round.question.correct_answer {
                        lines.push(format!("Correct answer: {}", correct));
                    }
                    let mine = session
                        .local_user_id()
                        .and_then(|user| round.answer_of(user));
                    lines.push(match mine {
                        Some(answer) if answer.is_correct => "You were right!".to_string(),
                        Some(_) => "You were wrong.".to_string(),
                        None => "You did not answer.".to_string(),
                    });
                }
                None => lines.push("Round finished.".to_string()),
            }
            lines.push(format!(
                "Score: you {} - {} opponent",
                session.user_score(),
                session.opponent_score()
            ));
            lines
        }
        Stage::Final(_) => Vec::new(),
        Stage::Error { message } => vec![format!("Error: {}", message)],
    }
}

fn describe_final(results: &FinalResults, local_user: Option<UserId>) -> Vec<String> {
    let mut lines = Vec::new();
    match local_user {
        Some(user) => {
            lines.push(match results.outcome_for(user) {
                DuelOutcome::Won => "You won!".to_string(),
                DuelOutcome::Lost => "You lost.".to_string(),
                DuelOutcome::Draw => "It's a draw.".to_string(),
            });
        }
        None => lines.push(match results.winner_id {
            Some(winner) => format!("Winner: user {}", winner),
            None => "It's a draw.".to_string(),
        }),
    }

    for totals in [&results.user1, &results.user2] {
        let label = if Some(totals.user_id) == local_user {
            "You".to_string()
        } else {
            format!("User {}", totals.user_id)
        };
        lines.push(format!(
            "  {:<10} score {:>3}  accuracy {:>5.1}%  time {:.1}s",
            label,
            totals.score,
            totals.accuracy,
            totals.total_time as f64 / 1000.0
        ));
    }
    lines
}

fn describe_queue(state: &QuickMatchState) -> String {
    match state.status {
        QuickMatchStatus::Idle => "Not in queue".to_string(),
        QuickMatchStatus::Searching => format!(
            "Searching for an opponent... {}",
            format_queue_time(state.time_in_queue)
        ),
        QuickMatchStatus::Found | QuickMatchStatus::Timeout => {
            let opponent = state
                .opponent
                .as_ref()
                .map_or("unknown opponent", |o| o.username.as_str());
            let duel = state
                .matched_duel
                .as_ref()
                .map_or_else(|| "?".to_string(), |d| d.id.to_string());
            format!("Matched against {} (duel {})", opponent, duel)
        }
        QuickMatchStatus::Error => format!(
            "Quick match failed: {}",
            state.message.as_deref().unwrap_or("unknown error")
        ),
        QuickMatchStatus::Cancelled => "Quick match cancelled".to_string(),
    }
}

fn outcome_label(outcome: DuelOutcome) -> &'static str {
    match outcome {
        DuelOutcome::Won => "won",
        DuelOutcome::Lost => "lost",
        DuelOutcome::Draw => "draw",
    }
}

/// Format whole seconds as m:ss
fn format_queue_time(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
