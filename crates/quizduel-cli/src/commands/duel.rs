//! Duel command handler

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Instant;
use tracing::debug;

use quizduel_core::{
    AnswerSubmission, Config, CredentialCache, DuelDirectory, DuelEngine, DuelId, DuelSession,
    FileCredentialStore, Phase,
};

use crate::output::Output;

/// Open a duel and play it to the end
pub async fn run(config: &Config, duel_id: DuelId, ready: bool, output: &Output) -> Result<()> {
    let engine = super::spawn_engine(config);
    announce_opponent(config, duel_id, output).await;

    let result = play(&engine, duel_id, ready, output).await;
    if let Err(e) = engine.shutdown().await {
        debug!("Engine shutdown: {}", e);
    }
    result
}

/// Follow `duel_id` on `engine` until it finishes, fails or the user quits
///
/// Answers are read from stdin as option numbers (or the option text).
pub async fn play(engine: &DuelEngine, duel_id: DuelId, ready: bool, output: &Output) -> Result<()> {
    if let Err(e) = engine.open_duel(duel_id).await {
        if !e.is_retryable() {
            return Err(e).with_context(|| format!("Failed to open duel {}", duel_id));
        }
        output.message(&format!("{}, retrying...", e));
    }

    let mut updates = engine.subscribe();
    let mut answers = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut shown = None;
    let mut ready_sent = false;
    let mut question_shown_at = Instant::now();

    loop {
        let snapshot = updates.borrow_and_update().clone();

        if let Some(session) = &snapshot {
            let key = (session.phase(), session.question_index());
            if shown != Some(key) {
                shown = Some(key);
                if session.phase() == Phase::Question {
                    question_shown_at = Instant::now();
                }
                output.print_stage(session);
            }

            match session.phase() {
                Phase::Lobby if ready && !ready_sent => {
                    engine
                        .signal_ready()
                        .await
                        .context("Failed to signal ready")?;
                    ready_sent = true;
                    output.message("Ready!");
                }
                Phase::Final => {
                    if let Some(results) = session.final_results() {
                        output.print_final(session, results);
                    }
                    return Ok(());
                }
                Phase::Error => {
                    bail!("{}", session.error_message().unwrap_or("Duel failed"));
                }
                _ => {}
            }
        }

        let answering = snapshot
            .as_ref()
            .is_some_and(|s| s.phase() == Phase::Question && !s.has_answered());

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    bail!("Duel engine stopped");
                }
            }
            line = answers.next_line(), if stdin_open && answering => match line? {
                Some(line) => {
                    if let Some(session) = &snapshot {
                        submit(engine, session, &line, question_shown_at.elapsed(), output).await?;
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                output.message("Leaving duel");
                engine.close_duel().await?;
                return Ok(());
            }
        }
    }
}

async fn submit(
    engine: &DuelEngine,
    session: &DuelSession,
    line: &str,
    elapsed: Duration,
    output: &Output,
) -> Result<()> {
    let options = session
        .current_question()
        .map(|q| q.options.as_slice())
        .unwrap_or_default();
    let Some(choice) = parse_choice(line, options) else {
        output.message(&format!("Enter a number between 1 and {}", options.len()));
        return Ok(());
    };

    let submission = engine
        .submit_answer(choice, elapsed)
        .await
        .context("Failed to submit answer")?;
    match submission {
        AnswerSubmission::Sent => output.message("Answer sent, waiting for the round result..."),
        AnswerSubmission::AlreadyAnswered => output.message("Already answered this question"),
        AnswerSubmission::NoQuestion => output.message("No question is open"),
    }
    Ok(())
}

/// Resolve user input to one of `options`
///
/// Accepts a 1-based option number or the option text (case-insensitive).
fn parse_choice(input: &str, options: &[String]) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(n) = input.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| options.get(i))
            .cloned();
    }

    options
        .iter()
        .find(|option| option.eq_ignore_ascii_case(input))
        .cloned()
}

/// Print the opponent's name when the metadata API is configured
async fn announce_opponent(config: &Config, duel_id: DuelId, output: &Output) {
    let Some(api_url) = &config.api_url else {
        return;
    };

    let store = FileCredentialStore::new(config.credentials_path());
    let Some(token) = CredentialCache::new(Arc::new(store)).auth_token().await else {
        return;
    };

    match DuelDirectory::new(api_url.as_str(), token) {
        Ok(directory) => {
            let name = directory.opponent_name(duel_id).await;
            output.message(&format!("Opponent: {}", name));
        }
        Err(e) => debug!("Metadata client unavailable: {}", e),
    }
}
