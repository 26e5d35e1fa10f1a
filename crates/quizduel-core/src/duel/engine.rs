//! Duel engine task
//!
//! One tokio task owns the transport, the active [`DuelSession`], the quick
//! match state, the listener registry and every timer. Callers talk to it
//! through a [`DuelEngine`] handle and observe state through `watch`
//! channels. State changes are published at most once per flush tick, so a
//! burst of events produces a single update.

use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::registry::{ListenerRegistry, RegistrationToken, Scope};
use super::session::{Applied, AnswerSubmission, DuelSession, Phase};
use super::EngineConfig;
use crate::credentials::CredentialCache;
use crate::error::{DuelError, DuelResult};
use crate::net::{
    ClientMessage, ConnectionState, Connector, DuelId, EventKind, RetryDecision, ServerMessage,
    Transport, UserId,
};
use crate::quick_match::{QuickMatchState, QuickMatchStatus, QuickMatchUpdate};

/// Queue ticker period
const QUEUE_TICK: Duration = Duration::from_secs(1);

/// Resource counts, for leak checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Registered event listeners
    pub listeners: usize,
    /// Scheduled timers (attempt timeout, backoff, queue ticker, flush)
    pub timers: usize,
}

/// Commands sent to the engine task
enum Command {
    OpenDuel {
        duel_id: DuelId,
        reply: oneshot::Sender<DuelResult<()>>,
    },
    Connect {
        reply: oneshot::Sender<DuelResult<()>>,
    },
    SubmitAnswer {
        selected_answer: String,
        time_taken: Duration,
        reply: oneshot::Sender<DuelResult<AnswerSubmission>>,
    },
    SignalReady {
        reply: oneshot::Sender<DuelResult<()>>,
    },
    CloseDuel {
        reply: oneshot::Sender<()>,
    },
    JoinQuickMatch {
        course_id: i64,
        reply: oneshot::Sender<DuelResult<()>>,
    },
    LeaveQuickMatch {
        reply: oneshot::Sender<()>,
    },
    ResetQuickMatch {
        reply: oneshot::Sender<()>,
    },
    Diagnostics {
        reply: oneshot::Sender<Diagnostics>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running duel engine
///
/// Cloning shares the engine. When the last handle is dropped the engine
/// tears everything down and stops.
#[derive(Clone)]
pub struct DuelEngine {
    command_tx: mpsc::Sender<Command>,
    duel_rx: watch::Receiver<Option<DuelSession>>,
    quick_match_rx: watch::Receiver<QuickMatchState>,
}

impl DuelEngine {
    /// Spawn the engine task on the current runtime
    pub fn spawn(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<CredentialCache>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (duel_tx, duel_rx) = watch::channel(None);
        let (quick_match_tx, quick_match_rx) = watch::channel(QuickMatchState::default());

        let task = EngineTask::new(config, connector, credentials, duel_tx, quick_match_tx);
        tokio::spawn(task.run(command_rx));

        Self {
            command_tx,
            duel_rx,
            quick_match_rx,
        }
    }

    /// Open `duel_id` and connect to it
    ///
    /// Opening a different duel tears the current one down first. Opening
    /// the current duel again joins the in-flight attempt, if any. Resolves
    /// when the attempt completes; a failed attempt may still be retried in
    /// the background.
    pub async fn open_duel(&self, duel_id: DuelId) -> DuelResult<()> {
        self.request(|reply| Command::OpenDuel { duel_id, reply })
            .await?
    }

    /// Connect the transport without changing the open duel
    ///
    /// Re-arms a session that ended in error.
    pub async fn connect(&self) -> DuelResult<()> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Answer the open question
    ///
    /// Returns [`AnswerSubmission::NoQuestion`] or
    /// [`AnswerSubmission::AlreadyAnswered`] without touching the network when
    /// the answer cannot be accepted.
    pub async fn submit_answer(
        &self,
        selected_answer: impl Into<String>,
        time_taken: Duration,
    ) -> DuelResult<AnswerSubmission> {
        let selected_answer = selected_answer.into();
        self.request(|reply| Command::SubmitAnswer {
            selected_answer,
            time_taken,
            reply,
        })
        .await?
    }

    /// Tell the server this participant is ready
    pub async fn signal_ready(&self) -> DuelResult<()> {
        self.request(|reply| Command::SignalReady { reply }).await?
    }

    /// Leave the duel and release every resource
    pub async fn close_duel(&self) -> DuelResult<()> {
        self.request(|reply| Command::CloseDuel { reply }).await
    }

    /// Enter the quick match queue; needs an open transport
    pub async fn join_quick_match(&self, course_id: i64) -> DuelResult<()> {
        self.request(|reply| Command::JoinQuickMatch { course_id, reply })
            .await?
    }

    /// Leave the queue; local state resets even if the server is unreachable
    pub async fn leave_quick_match(&self) -> DuelResult<()> {
        self.request(|reply| Command::LeaveQuickMatch { reply })
            .await
    }

    /// Force the quick match state back to idle without notifying the server
    pub async fn reset_quick_match(&self) -> DuelResult<()> {
        self.request(|reply| Command::ResetQuickMatch { reply })
            .await
    }

    pub async fn diagnostics(&self) -> DuelResult<Diagnostics> {
        self.request(|reply| Command::Diagnostics { reply }).await
    }

    /// Latest published duel snapshot
    pub fn snapshot(&self) -> Option<DuelSession> {
        self.duel_rx.borrow().clone()
    }

    /// Watch duel snapshots
    pub fn subscribe(&self) -> watch::Receiver<Option<DuelSession>> {
        self.duel_rx.clone()
    }

    /// Latest published quick match snapshot
    pub fn quick_match(&self) -> QuickMatchState {
        self.quick_match_rx.borrow().clone()
    }

    /// Watch quick match snapshots
    pub fn subscribe_quick_match(&self) -> watch::Receiver<QuickMatchState> {
        self.quick_match_rx.clone()
    }

    /// Tear down and stop the engine
    pub async fn shutdown(self) -> DuelResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> DuelResult<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| DuelError::EngineStopped)?;
        response.await.map_err(|_| DuelError::EngineStopped)
    }
}

/// Outcome of a successful connection attempt
struct Connected {
    transport: Box<dyn Transport>,
    user_id: Option<UserId>,
}

type ConnectAttempt = Pin<Box<dyn Future<Output = DuelResult<Connected>> + Send>>;

/// State owned by the engine task
struct EngineTask {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<CredentialCache>,
    duel_tx: watch::Sender<Option<DuelSession>>,
    quick_match_tx: watch::Sender<QuickMatchState>,

    session: Option<DuelSession>,
    quick_match: QuickMatchState,
    connection: ConnectionState,
    local_user_id: Option<UserId>,
    registry: ListenerRegistry,
    duel_listeners: Option<RegistrationToken>,
    quick_match_listeners: Option<RegistrationToken>,
    transport: Option<Box<dyn Transport>>,

    /// The single in-flight connection attempt and everyone awaiting it
    attempt: Option<ConnectAttempt>,
    waiters: Vec<oneshot::Sender<DuelResult<()>>>,
    retry_at: Option<Instant>,
    queue_ticker: Option<Interval>,
    flush_at: Option<Instant>,
    duel_dirty: bool,
    quick_match_dirty: bool,
}

impl EngineTask {
    fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<CredentialCache>,
        duel_tx: watch::Sender<Option<DuelSession>>,
        quick_match_tx: watch::Sender<QuickMatchState>,
    ) -> Self {
        let connection = ConnectionState::new(config.retry.max_retries);
        Self {
            config,
            connector,
            credentials,
            duel_tx,
            quick_match_tx,
            session: None,
            quick_match: QuickMatchState::default(),
            connection,
            local_user_id: None,
            registry: ListenerRegistry::new(),
            duel_listeners: None,
            quick_match_listeners: None,
            transport: None,
            attempt: None,
            waiters: Vec::new(),
            retry_at: None,
            queue_ticker: None,
            flush_at: None,
            duel_dirty: false,
            quick_match_dirty: false,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.teardown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All engine handles dropped");
                        self.teardown().await;
                        break;
                    }
                },
                result = next_attempt_result(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt_finished(result).await;
                }
                _ = sleep_until_deadline(self.retry_at) => {
                    self.retry_at = None;
                    debug!("Backoff elapsed, reconnecting");
                    self.start_attempt();
                }
                frame = next_frame(&mut self.transport) => self.on_frame(frame).await,
                _ = next_tick(&mut self.queue_ticker) => {
                    if self.quick_match.tick(Instant::now()) {
                        self.mark_quick_match_dirty();
                    }
                }
                _ = sleep_until_deadline(self.flush_at) => self.flush(),
            }
        }
        debug!("Duel engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenDuel { duel_id, reply } => self.open_duel(duel_id, reply).await,
            Command::Connect { reply } => {
                if self.transport.is_none() && self.phase() == Some(Phase::Error) {
                    self.rearm_session();
                }
                self.ensure_connected(reply);
            }
            Command::SubmitAnswer {
                selected_answer,
                time_taken,
                reply,
            } => {
                let result = self.submit_answer(selected_answer, time_taken).await;
                let _ = reply.send(result);
            }
            Command::SignalReady { reply } => {
                let _ = reply.send(self.send(ClientMessage::SignalReady).await);
            }
            Command::CloseDuel { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::JoinQuickMatch { course_id, reply } => {
                let _ = reply.send(self.join_quick_match(course_id).await);
            }
            Command::LeaveQuickMatch { reply } => {
                self.leave_quick_match().await;
                let _ = reply.send(());
            }
            Command::ResetQuickMatch { reply } => {
                self.stop_quick_match();
                let _ = reply.send(());
            }
            Command::Diagnostics { reply } => {
                let _ = reply.send(self.diagnostics());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn phase(&self) -> Option<Phase> {
        self.session.as_ref().map(DuelSession::phase)
    }

    async fn open_duel(&mut self, duel_id: DuelId, reply: oneshot::Sender<DuelResult<()>>) {
        match self.session.as_ref().map(DuelSession::duel_id) {
            Some(current) if current == duel_id => {
                debug!("Duel {} already open", duel_id);
                self.ensure_connected(reply);
                return;
            }
            Some(current) => {
                info!("Switching from duel {} to duel {}", current, duel_id);
                self.teardown().await;
            }
            None => {}
        }

        info!("Opening duel {}", duel_id);
        let mut session = DuelSession::new(duel_id, self.config.retry.max_retries);
        session.set_local_user_id(self.local_user_id);
        self.session = Some(session);
        // A transport kept open by the quick match stays connected
        if self.transport.is_none() {
            self.connection = ConnectionState::new(self.config.retry.max_retries);
        }
        self.mark_duel_dirty();

        if self.transport.is_some() {
            self.join_room().await;
            let _ = reply.send(Ok(()));
        } else {
            self.ensure_connected(reply);
        }
    }

    /// Replace an errored session with a fresh one for the same duel
    fn rearm_session(&mut self) {
        let Some(duel_id) = self.session.as_ref().map(DuelSession::duel_id) else {
            return;
        };
        info!("Re-arming duel {}", duel_id);
        let mut session = DuelSession::new(duel_id, self.config.retry.max_retries);
        session.set_local_user_id(self.local_user_id);
        self.session = Some(session);
        self.connection = ConnectionState::new(self.config.retry.max_retries);
        self.mark_duel_dirty();
    }

    /// Resolve `reply` once a transport is open, starting an attempt if needed
    fn ensure_connected(&mut self, reply: oneshot::Sender<DuelResult<()>>) {
        if self.transport.is_some() {
            let _ = reply.send(Ok(()));
            return;
        }
        self.waiters.push(reply);
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        if self.attempt.is_some() {
            debug!("Connection attempt already in flight");
            return;
        }

        self.retry_at = None;
        self.connection.begin_attempt();
        self.mark_duel_dirty();

        info!(
            "Connecting to {} (retry {}/{})",
            self.config.server_url, self.connection.retry_count, self.connection.max_retries
        );
        self.attempt = Some(Box::pin(open_transport(
            Arc::clone(&self.connector),
            Arc::clone(&self.credentials),
            self.config.server_url.clone(),
            self.config.connect_timeout,
        )));
    }

    async fn on_attempt_finished(&mut self, result: DuelResult<Connected>) {
        match result {
            Ok(connected) => {
                info!("Connected to {}", self.config.server_url);
                self.connection.on_success();
                self.transport = Some(connected.transport);
                self.local_user_id = connected.user_id;
                if let Some(session) = self.session.as_mut() {
                    session.set_local_user_id(connected.user_id);
                }
                self.mark_duel_dirty();

                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.join_room().await;
            }
            Err(e) => {
                warn!("Connection attempt failed: {}", e);
                self.on_connection_failure(e.to_string(), e.is_retryable());
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    fn on_connection_failure(&mut self, message: String, retryable: bool) {
        match self
            .connection
            .on_failure(message.clone(), retryable, &self.config.retry)
        {
            RetryDecision::RetryAfter(delay) => {
                info!(
                    "Retrying connection in {}ms ({}/{})",
                    delay.as_millis(),
                    self.connection.retry_count,
                    self.connection.max_retries
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            RetryDecision::GiveUp => {
                if self.connection.is_exhausted() {
                    warn!(
                        "Giving up after {} attempts: {}",
                        self.connection.retry_count, message
                    );
                } else {
                    warn!("Giving up on connection: {}", message);
                }
                if let Some(session) = self.session.as_mut() {
                    session.fail(message);
                }
            }
        }
        self.mark_duel_dirty();
    }

    /// Register the session's listeners and join its room
    async fn join_room(&mut self) {
        let Some(duel_id) = self.session.as_ref().map(DuelSession::duel_id) else {
            return;
        };

        self.duel_listeners = Some(
            self.registry
                .subscribe(Scope::Duel(duel_id), &EventKind::DUEL),
        );
        if let Err(e) = self.send(ClientMessage::JoinDuelRoom { duel_id }).await {
            warn!("Failed to join room for duel {}: {}", duel_id, e);
            self.on_transport_lost(e.to_string()).await;
        }
    }

    async fn on_frame(&mut self, frame: Option<DuelResult<String>>) {
        match frame {
            Some(Ok(text)) => match ServerMessage::decode(&text) {
                Ok(message) => self.dispatch(message),
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            },
            Some(Err(DuelError::Protocol(e))) => warn!("Dropping malformed frame: {}", e),
            Some(Err(e)) => self.on_transport_lost(e.to_string()).await,
            None => {
                self.on_transport_lost("Server closed the connection".to_string())
                    .await
            }
        }
    }

    fn dispatch(&mut self, message: ServerMessage) {
        let kind = message.kind();
        match self.registry.route(kind) {
            Some(Scope::Duel(duel_id)) => {
                let Some(session) = self.session.as_mut() else {
                    debug!("No session for {} on duel {}", kind, duel_id);
                    return;
                };
                if session.apply(&message) == Applied::Updated {
                    self.mark_duel_dirty();
                }
            }
            Some(Scope::QuickMatch) => match self.quick_match.apply(&message) {
                QuickMatchUpdate::Updated => self.mark_quick_match_dirty(),
                QuickMatchUpdate::Settled => {
                    self.queue_ticker = None;
                    self.mark_quick_match_dirty();
                }
                QuickMatchUpdate::Skipped => {}
            },
            None => debug!("No listener for {}", kind),
        }
    }

    async fn on_transport_lost(&mut self, reason: String) {
        warn!("Connection lost: {}", reason);
        self.transport = None;

        if self.quick_match.status == QuickMatchStatus::Searching {
            self.quick_match.fail(format!("Connection lost: {}", reason));
            self.queue_ticker = None;
            self.mark_quick_match_dirty();
        }

        match self.phase() {
            Some(Phase::Final) | Some(Phase::Error) | None => {
                self.connection.on_disconnect();
                self.mark_duel_dirty();
            }
            Some(_) => self.on_connection_failure(reason, true),
        }
    }

    async fn submit_answer(
        &mut self,
        selected_answer: String,
        time_taken: Duration,
    ) -> DuelResult<AnswerSubmission> {
        let target = match self.session.as_ref() {
            Some(session) => session.answer_target(),
            None => Err(AnswerSubmission::NoQuestion),
        };
        let question_id = match target {
            Ok(question_id) => question_id,
            Err(rejection) => {
                warn!("Ignoring answer: {:?}", rejection);
                return Ok(rejection);
            }
        };

        self.send(ClientMessage::SubmitAnswer {
            question_id,
            selected_answer,
            time_taken_ms: u64::try_from(time_taken.as_millis()).unwrap_or(u64::MAX),
        })
        .await?;

        if let Some(session) = self.session.as_mut() {
            session.mark_answered();
        }
        self.mark_duel_dirty();
        Ok(AnswerSubmission::Sent)
    }

    async fn join_quick_match(&mut self, course_id: i64) -> DuelResult<()> {
        if self.transport.is_none() {
            return Err(DuelError::NotConnected);
        }

        self.quick_match_listeners = Some(
            self.registry
                .subscribe(Scope::QuickMatch, &EventKind::QUICK_MATCH),
        );
        if let Err(e) = self.send(ClientMessage::JoinQuickMatch { course_id }).await {
            self.registry.unsubscribe(&Scope::QuickMatch);
            self.quick_match_listeners = None;
            return Err(e);
        }

        self.quick_match.begin(course_id);
        let mut ticker = interval_at(Instant::now() + QUEUE_TICK, QUEUE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.queue_ticker = Some(ticker);
        self.mark_quick_match_dirty();
        Ok(())
    }

    async fn leave_quick_match(&mut self) {
        if self.transport.is_some() {
            if let Err(e) = self.send(ClientMessage::LeaveQuickMatch).await {
                warn!("Failed to notify server about leaving the queue: {}", e);
            }
        } else {
            warn!("Not connected, leaving quick match locally");
        }
        self.stop_quick_match();
    }

    /// Stop the ticker, drop the listeners and return to idle
    fn stop_quick_match(&mut self) {
        self.queue_ticker = None;
        if let Some(token) = self.quick_match_listeners.take() {
            self.registry.unsubscribe_token(token);
        }
        self.quick_match.reset();
        self.mark_quick_match_dirty();
    }

    async fn send(&mut self, message: ClientMessage) -> DuelResult<()> {
        let transport = self.transport.as_mut().ok_or(DuelError::NotConnected)?;
        let text = message.encode()?;
        debug!("Sending {}", message.name());
        transport.send(text).await
    }

    /// Release every resource the engine holds
    async fn teardown(&mut self) {
        if self.session.is_some() && self.transport.is_some() {
            if let Err(e) = self.send(ClientMessage::LeaveDuelRoom).await {
                debug!("Failed to leave duel room: {}", e);
            }
        }

        for token in [self.duel_listeners.take(), self.quick_match_listeners.take()]
            .into_iter()
            .flatten()
        {
            self.registry.unsubscribe_token(token);
        }
        if !self.registry.is_empty() {
            warn!("{} listeners left after teardown", self.registry.len());
        }

        self.retry_at = None;
        if self.attempt.take().is_some() {
            debug!("Abandoning in-flight connection attempt");
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(DuelError::Cancelled));
        }
        self.queue_ticker = None;

        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Failed to close transport: {}", e);
            }
        }
        self.connection = ConnectionState::new(self.config.retry.max_retries);

        if let Some(duel_id) = self.session.take().map(|s| s.duel_id()) {
            info!("Closed duel {}", duel_id);
        }
        self.quick_match.reset();
        self.duel_dirty = true;
        self.quick_match_dirty = true;
        self.flush();
    }

    fn diagnostics(&self) -> Diagnostics {
        let timers = [
            self.attempt.is_some(),
            self.retry_at.is_some(),
            self.queue_ticker.is_some(),
            self.flush_at.is_some(),
        ];
        Diagnostics {
            listeners: self.registry.len(),
            timers: timers.iter().filter(|armed| **armed).count(),
        }
    }

    fn mark_duel_dirty(&mut self) {
        self.duel_dirty = true;
        self.schedule_flush();
    }

    fn mark_quick_match_dirty(&mut self) {
        self.quick_match_dirty = true;
        self.schedule_flush();
    }

    fn schedule_flush(&mut self) {
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.config.flush_interval);
        }
    }

    /// Publish pending changes
    fn flush(&mut self) {
        self.flush_at = None;

        if std::mem::take(&mut self.duel_dirty) {
            if let Some(session) = self.session.as_mut() {
                session.set_connection(&self.connection);
            }
            self.duel_tx.send_replace(self.session.clone());
        }
        if std::mem::take(&mut self.quick_match_dirty) {
            self.quick_match_tx.send_replace(self.quick_match.clone());
        }
    }
}

/// Open and authenticate one transport
async fn open_transport(
    connector: Arc<dyn Connector>,
    credentials: Arc<CredentialCache>,
    url: String,
    connect_timeout: Duration,
) -> DuelResult<Connected> {
    let token = credentials
        .auth_token()
        .await
        .ok_or(DuelError::MissingToken)?;

    let transport = tokio::time::timeout(connect_timeout, connector.connect(&url, &token))
        .await
        .map_err(|_| DuelError::ConnectTimeout(connect_timeout))??;

    let user_id = credentials.user_id().await;
    if user_id.is_none() {
        warn!("No local user id stored; round scores cannot be attributed");
    }
    Ok(Connected { transport, user_id })
}

async fn next_attempt_result(attempt: &mut Option<ConnectAttempt>) -> DuelResult<Connected> {
    match attempt {
        Some(attempt) => attempt.await,
        None => pending().await,
    }
}

async fn next_frame(transport: &mut Option<Box<dyn Transport>>) -> Option<DuelResult<String>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{MemoryCredentialStore, USER_ID_KEY};
    use crate::net::protocol::Opponent;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// What the next connection attempt does
    enum Outcome {
        Refuse,
        Hang,
        Accept,
    }

    /// Server side of one accepted mock connection
    struct MockServer {
        inbound: Option<mpsc::UnboundedSender<String>>,
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        fail_sends: Arc<AtomicBool>,
    }

    impl MockServer {
        fn push(&self, event: Value) {
            if let Some(inbound) = &self.inbound {
                inbound.send(event.to_string()).unwrap();
            }
        }

        /// Drop the connection from the server side
        fn hang_up(&mut self) {
            self.inbound = None;
        }

        fn sent(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }

        fn sent_events(&self) -> Vec<String> {
            self.sent()
                .iter()
                .map(|v| v["event"].as_str().unwrap().to_string())
                .collect()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct MockTransport {
        inbound: mpsc::UnboundedReceiver<String>,
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
        fail_sends: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, text: String) -> Result<(), DuelError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(DuelError::Transport("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, DuelError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), DuelError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockConnector {
        outcomes: Mutex<VecDeque<Outcome>>,
        attempts: Mutex<Vec<Instant>>,
        servers: mpsc::UnboundedSender<MockServer>,
    }

    impl MockConnector {
        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str, token: &str) -> Result<Box<dyn Transport>, DuelError> {
            assert_eq!(token, "secret");
            self.attempts.lock().unwrap().push(Instant::now());

            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::Accept);
            match outcome {
                Outcome::Refuse => Err(DuelError::Transport("connection refused".into())),
                Outcome::Hang => pending().await,
                Outcome::Accept => {
                    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                    let sent = Arc::new(Mutex::new(Vec::new()));
                    let closed = Arc::new(AtomicBool::new(false));
                    let fail_sends = Arc::new(AtomicBool::new(false));
                    self.servers
                        .send(MockServer {
                            inbound: Some(inbound_tx),
                            sent: sent.clone(),
                            closed: closed.clone(),
                            fail_sends: fail_sends.clone(),
                        })
                        .unwrap();
                    Ok(Box::new(MockTransport {
                        inbound: inbound_rx,
                        sent,
                        closed,
                        fail_sends,
                    }))
                }
            }
        }
    }

    struct Harness {
        engine: DuelEngine,
        connector: Arc<MockConnector>,
        servers: mpsc::UnboundedReceiver<MockServer>,
    }

    impl Harness {
        async fn server(&mut self) -> MockServer {
            self.servers.recv().await.unwrap()
        }

        fn snapshot(&self) -> DuelSession {
            self.engine.snapshot().unwrap()
        }
    }

    fn harness(outcomes: Vec<Outcome>) -> Harness {
        harness_with_store(
            outcomes,
            MemoryCredentialStore::new()
                .with("authToken", "secret")
                .with(USER_ID_KEY, "1"),
        )
    }

    fn harness_with_store(outcomes: Vec<Outcome>, store: MemoryCredentialStore) -> Harness {
        let (servers_tx, servers) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            outcomes: Mutex::new(outcomes.into()),
            attempts: Mutex::new(Vec::new()),
            servers: servers_tx,
        });
        let credentials = Arc::new(CredentialCache::new(Arc::new(store)));
        let engine = DuelEngine::spawn(EngineConfig::default(), connector.clone(), credentials);

        Harness {
            engine,
            connector,
            servers,
        }
    }

    /// Let the engine drain its queues and publish
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn question(index: u32, duel_id: DuelId) -> Value {
        json!({
            "event": "question_presented",
            "data": {
                "questionIndex": index,
                "totalQuestions": 3,
                "question": {"id": 500 + index, "text": "Q?", "options": ["a", "b"]},
                "timeLimit": 30000,
                "duelId": duel_id
            }
        })
    }

    fn round_result(index: u32, duel_id: DuelId) -> Value {
        json!({
            "event": "round_result",
            "data": {
                "questionIndex": index,
                "question": {"text": "Q?", "options": ["a", "b"], "correctAnswer": "a"},
                "answers": [
                    {"userId": 1, "selectedAnswer": "a", "isCorrect": true, "timeTaken": 900},
                    {"userId": 2, "selectedAnswer": "b", "isCorrect": false, "timeTaken": 1200}
                ],
                "duelId": duel_id
            }
        })
    }

    /// Open `duel_id` and walk it into its first question
    async fn in_question(h: &mut Harness, duel_id: DuelId) -> MockServer {
        h.engine.open_duel(duel_id).await.unwrap();
        let server = h.server().await;
        server.push(json!({"event": "room_joined", "data": {"session": {}, "duelId": duel_id}}));
        server.push(json!({"event": "duel_starting", "data": {"countdown": 3, "duelId": duel_id}}));
        server.push(question(0, duel_id));
        settle().await;
        server
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_duel_joins_room() {
        let mut h = harness(vec![]);
        h.engine.open_duel(42).await.unwrap();

        let server = h.server().await;
        settle().await;

        let sent = server.sent();
        assert_eq!(sent[0]["event"], "join_duel_room");
        assert_eq!(sent[0]["data"]["duelId"], 42);

        let snapshot = h.snapshot();
        assert_eq!(snapshot.phase(), Phase::Connecting);
        assert!(snapshot.connection().is_connected);
        assert_eq!(snapshot.local_user_id(), Some(1));

        let diagnostics = h.engine.diagnostics().await.unwrap();
        assert_eq!(diagnostics.listeners, EventKind::DUEL.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_sequence_and_scoring() {
        let mut h = harness(vec![]);
        let server = in_question(&mut h, 42).await;

        let snapshot = h.snapshot();
        assert_eq!(snapshot.phase(), Phase::Question);
        assert_eq!(snapshot.time_left(), 30);
        assert!(snapshot.room().is_in_room);

        let sent = h
            .engine
            .submit_answer("a", Duration::from_millis(900))
            .await
            .unwrap();
        assert_eq!(sent, AnswerSubmission::Sent);
        let again = h
            .engine
            .submit_answer("b", Duration::from_millis(950))
            .await
            .unwrap();
        assert_eq!(again, AnswerSubmission::AlreadyAnswered);

        let answers: Vec<Value> = server
            .sent()
            .into_iter()
            .filter(|v| v["event"] == "submit_answer")
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["data"]["questionId"], 500);
        assert_eq!(answers[0]["data"]["timeTaken"], 900);

        server.push(round_result(0, 42));
        settle().await;

        let snapshot = h.snapshot();
        assert_eq!(snapshot.phase(), Phase::Results);
        assert_eq!(snapshot.user_score(), 1);
        assert_eq!(snapshot.opponent_score(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_published_once_per_tick() {
        let mut h = harness(vec![]);
        h.engine.open_duel(42).await.unwrap();
        let server = h.server().await;
        settle().await;

        let mut rx = h.engine.subscribe();
        rx.borrow_and_update();

        server.push(json!({"event": "room_joined", "data": {}}));
        server.push(json!({"event": "duel_starting", "data": {"countdown": 3}}));
        server.push(question(0, 42));
        h.engine.diagnostics().await.unwrap();
        assert!(!rx.has_changed().unwrap());

        settle().await;
        assert!(rx.has_changed().unwrap());
        let published = rx.borrow_and_update().clone().unwrap();
        assert_eq!(published.phase(), Phase::Question);

        settle().await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_duel_events_are_dropped() {
        let mut h = harness(vec![]);
        let server = in_question(&mut h, 42).await;
        let before = h.snapshot();

        server.push(round_result(0, 41));
        server.push(json!({"event": "duel_error", "data": {"message": "stale", "duelId": 41}}));
        settle().await;

        assert_eq!(h.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_errors() {
        let h = harness(vec![Outcome::Refuse, Outcome::Refuse, Outcome::Refuse]);

        let err = h.engine.open_duel(7).await.unwrap_err();
        assert!(matches!(err, DuelError::Transport(_)));

        tokio::time::sleep(Duration::from_secs(60)).await;

        let attempts = h.connector.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[1] - attempts[0], Duration::from_millis(2000));
        assert_eq!(attempts[2] - attempts[1], Duration::from_millis(4000));

        let snapshot = h.snapshot();
        assert_eq!(snapshot.phase(), Phase::Error);
        assert_eq!(snapshot.connection().retry_count, 3);
        assert!(snapshot.connection().connection_error.is_some());

        let diagnostics = h.engine.diagnostics().await.unwrap();
        assert_eq!(diagnostics.timers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_is_retried() {
        let mut h = harness(vec![Outcome::Hang, Outcome::Accept]);

        let err = h.engine.open_duel(3).await.unwrap_err();
        assert!(matches!(err, DuelError::ConnectTimeout(_)));

        let server = h.server().await;
        settle().await;

        assert_eq!(server.sent_events(), vec!["join_duel_room"]);
        let attempts = h.connector.attempts();
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(15 + 2));

        let connection = h.snapshot().connection().clone();
        assert!(connection.is_connected);
        assert_eq!(connection.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_fails_without_retry() {
        let h = harness_with_store(vec![], MemoryCredentialStore::new().with(USER_ID_KEY, "1"));

        let err = h.engine.open_duel(9).await.unwrap_err();
        assert!(matches!(err, DuelError::MissingToken));

        settle().await;
        assert!(h.connector.attempts().is_empty());
        let snapshot = h.snapshot();
        assert_eq!(snapshot.phase(), Phase::Error);
        assert_eq!(snapshot.connection().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_opens_share_one_attempt() {
        let mut h = harness(vec![]);

        let (first, second) = tokio::join!(h.engine.open_duel(5), h.engine.open_duel(5));
        first.unwrap();
        second.unwrap();

        h.server().await;
        settle().await;
        assert_eq!(h.connector.attempts().len(), 1);
        assert_eq!(
            h.engine.diagnostics().await.unwrap().listeners,
            EventKind::DUEL.len()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_duels_tears_down_previous() {
        let mut h = harness(vec![]);
        let first = in_question(&mut h, 1).await;

        h.engine.open_duel(2).await.unwrap();
        let second = h.server().await;
        settle().await;

        assert!(first.sent_events().contains(&"leave_duel_room".to_string()));
        assert!(first.is_closed());
        assert_eq!(second.sent()[0]["data"]["duelId"], 2);

        let snapshot = h.snapshot();
        assert_eq!(snapshot.duel_id(), 2);
        assert_eq!(snapshot.phase(), Phase::Connecting);
        assert_eq!(snapshot.user_score(), 0);
        assert_eq!(
            h.engine.diagnostics().await.unwrap().listeners,
            EventKind::DUEL.len()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_duel_releases_everything() {
        let mut h = harness(vec![]);
        let server = in_question(&mut h, 42).await;
        h.engine.join_quick_match(5).await.unwrap();

        h.engine.close_duel().await.unwrap();

        assert_eq!(
            h.engine.diagnostics().await.unwrap(),
            Diagnostics {
                listeners: 0,
                timers: 0
            }
        );
        assert!(h.engine.snapshot().is_none());
        assert_eq!(h.engine.quick_match().status, QuickMatchStatus::Idle);
        assert!(server.is_closed());

        // Idempotent
        h.engine.close_duel().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_in_flight_attempt() {
        let h = harness(vec![Outcome::Hang]);

        let engine = h.engine.clone();
        let opening = tokio::spawn(async move { engine.open_duel(8).await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        h.engine.close_duel().await.unwrap();
        let result = opening.await.unwrap();
        assert!(matches!(result, Err(DuelError::Cancelled)));
        assert_eq!(h.engine.diagnostics().await.unwrap(), Diagnostics::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_answer_without_question_is_ignored() {
        let mut h = harness(vec![]);
        h.engine.open_duel(42).await.unwrap();
        let server = h.server().await;

        let result = h
            .engine
            .submit_answer("a", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, AnswerSubmission::NoQuestion);
        assert_eq!(server.sent_events(), vec!["join_duel_room"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_transport_rejects_actions_and_retries() {
        let mut h = harness(vec![]);
        let mut server = in_question(&mut h, 42).await;

        server.hang_up();
        settle().await;

        let err = h
            .engine
            .submit_answer("a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DuelError::NotConnected));
        assert!(matches!(
            h.engine.signal_ready().await,
            Err(DuelError::NotConnected)
        ));
        assert!(!h.snapshot().has_answered());
        assert_eq!(h.snapshot().connection().retry_count, 1);

        let reconnected = h.server().await;
        settle().await;
        assert_eq!(reconnected.sent_events(), vec!["join_duel_room"]);
        assert!(h.snapshot().connection().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_ready() {
        let mut h = harness(vec![]);
        assert!(matches!(
            h.engine.signal_ready().await,
            Err(DuelError::NotConnected)
        ));

        h.engine.open_duel(42).await.unwrap();
        let server = h.server().await;
        h.engine.signal_ready().await.unwrap();
        assert_eq!(server.sent_events(), vec!["join_duel_room", "signal_ready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_match_found_stops_ticker() {
        let mut h = harness(vec![]);
        h.engine.connect().await.unwrap();
        let server = h.server().await;

        h.engine.join_quick_match(5).await.unwrap();
        assert_eq!(server.sent()[0]["data"]["courseId"], 5);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        let state = h.engine.quick_match();
        assert_eq!(state.status, QuickMatchStatus::Searching);
        assert_eq!(state.time_in_queue, 3);

        server.push(json!({
            "event": "quick_match_found",
            "data": {"duel": {"id": 77, "courseId": 5}, "opponent": {"username": "ada", "userId": 2}}
        }));
        settle().await;
        let found = h.engine.quick_match();
        assert_eq!(found.status, QuickMatchStatus::Found);
        assert_eq!(found.matched_duel.as_ref().map(|d| d.id), Some(77));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.engine.quick_match().time_in_queue, found.time_in_queue);
        assert_eq!(h.engine.diagnostics().await.unwrap().timers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_match_timeout_pairs_bot() {
        let mut h = harness(vec![]);
        h.engine.connect().await.unwrap();
        let server = h.server().await;
        h.engine.join_quick_match(5).await.unwrap();

        tokio::time::sleep(Duration::from_secs(12)).await;
        server.push(json!({
            "event": "quick_match_timeout",
            "data": {"duel": {"id": 90, "courseId": 5}, "message": "Matched with a bot"}
        }));
        settle().await;

        let state = h.engine.quick_match();
        assert_eq!(state.status, QuickMatchStatus::Timeout);
        assert_eq!(state.opponent, Some(Opponent::bot()));
        assert_eq!(state.time_in_queue, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matched_duel_reuses_transport() {
        let mut h = harness(vec![]);
        h.engine.connect().await.unwrap();
        let server = h.server().await;
        h.engine.join_quick_match(5).await.unwrap();
        server.push(json!({
            "event": "quick_match_found",
            "data": {"duel": {"id": 77}, "opponent": {"username": "ada"}}
        }));
        settle().await;

        h.engine.open_duel(77).await.unwrap();
        settle().await;

        let connection = h.snapshot().connection().clone();
        assert!(connection.is_connected);
        assert!(!connection.is_connecting);
        assert_eq!(connection.retry_count, 0);
        assert_eq!(h.connector.attempts().len(), 1);
        assert_eq!(
            server.sent_events(),
            vec!["join_quick_match", "join_duel_room"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_quick_match_survives_failed_send() {
        let mut h = harness(vec![]);
        h.engine.connect().await.unwrap();
        let server = h.server().await;
        h.engine.join_quick_match(5).await.unwrap();

        server.fail_sends.store(true, Ordering::SeqCst);
        h.engine.leave_quick_match().await.unwrap();
        settle().await;

        assert_eq!(h.engine.quick_match(), QuickMatchState::default());
        assert_eq!(h.engine.diagnostics().await.unwrap(), Diagnostics::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_quick_match_requires_connection() {
        let h = harness(vec![]);
        assert!(matches!(
            h.engine.join_quick_match(5).await,
            Err(DuelError::NotConnected)
        ));
        assert_eq!(h.engine.quick_match().status, QuickMatchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_match_errors_when_transport_drops() {
        let mut h = harness(vec![]);
        h.engine.connect().await.unwrap();
        let mut server = h.server().await;
        h.engine.join_quick_match(5).await.unwrap();

        server.hang_up();
        settle().await;

        let state = h.engine.quick_match();
        assert_eq!(state.status, QuickMatchStatus::Error);
        assert!(state.message.unwrap().starts_with("Connection lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_tears_down() {
        let mut h = harness(vec![]);
        h.engine.open_duel(42).await.unwrap();
        let server = h.server().await;

        drop(h.engine);
        settle().await;

        assert_eq!(server.sent_events(), vec!["join_duel_room", "leave_duel_room"]);
        assert!(server.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_engine() {
        let h = harness(vec![]);
        let engine = h.engine.clone();
        h.engine.shutdown().await.unwrap();

        assert!(matches!(
            engine.diagnostics().await,
            Err(DuelError::EngineStopped)
        ));
    }
}
