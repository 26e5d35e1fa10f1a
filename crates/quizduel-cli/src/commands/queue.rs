//! Quick match command handler

use anyhow::{bail, Context, Result};
use tracing::debug;

use quizduel_core::{Config, DuelEngine, DuelId, QuickMatchStatus};

use crate::output::Output;

/// Seconds between progress lines while searching
const PROGRESS_EVERY: u64 = 5;

/// Queue for a course and play the matched duel
pub async fn run(config: &Config, course_id: i64, ready: bool, output: &Output) -> Result<()> {
    let engine = super::spawn_engine(config);

    let result = match find_match(&engine, course_id, output).await {
        Ok(Some(duel_id)) => super::duel::play(&engine, duel_id, ready, output).await,
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };

    if let Err(e) = engine.shutdown().await {
        debug!("Engine shutdown: {}", e);
    }
    result
}

/// Wait in the queue; `None` means the user or server gave up on the search
async fn find_match(engine: &DuelEngine, course_id: i64, output: &Output) -> Result<Option<DuelId>> {
    engine
        .connect()
        .await
        .context("Failed to connect to the duel server")?;
    engine
        .join_quick_match(course_id)
        .await
        .context("Failed to join the quick match queue")?;

    let mut updates = engine.subscribe_quick_match();
    let mut shown = None;

    loop {
        let state = updates.borrow_and_update().clone();

        let key = (state.status, state.time_in_queue / PROGRESS_EVERY);
        let visible = !output.is_quiet() || state.status.is_settled();
        if state.status != QuickMatchStatus::Idle && shown != Some(key) && visible {
            shown = Some(key);
            output.print_queue(&state);
        }

        match state.status {
            QuickMatchStatus::Found | QuickMatchStatus::Timeout => {
                let duel = state
                    .matched_duel
                    .context("Server reported a match without a duel")?;
                return Ok(Some(duel.id));
            }
            QuickMatchStatus::Error => bail!(
                "Quick match failed: {}",
                state.message.as_deref().unwrap_or("unknown error")
            ),
            QuickMatchStatus::Cancelled => return Ok(None),
            QuickMatchStatus::Idle | QuickMatchStatus::Searching => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    bail!("Duel engine stopped");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                engine.leave_quick_match().await?;
                output.message("Left the queue");
                return Ok(None);
            }
        }
    }
}
