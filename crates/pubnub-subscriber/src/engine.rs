//! The subscribe engine: long-poll loop, state machine, and public handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::entities::EntitySet;
use crate::listeners::{EventListener, ListenerId, ListenerRegistry};
use crate::protocol::{self, RawEnvelope};
use crate::retry::Backoff;
use crate::transport::{HttpTransport, Transport};
use crate::types::{
    Cursor, EngineState, Error, ErrorKind, PayloadCipher, PollOutcome, PollRequest, StatusChange,
    SubscribeConfig, SubscriptionEntry, TimingConfig,
};

/// Handle to a running subscribe engine.
///
/// All methods are safe to call from any thread; start/stop/reconnect are
/// idempotent. The engine's loop runs on its own spawned task and is the
/// sole writer of the engine state and cursor; callers interact only
/// through the thread-safe entity set and explicit commands.
///
/// Dropping the handle terminates the loop task and its listener workers.
pub struct SubscribeEngine {
    entities: Arc<EntitySet>,
    listeners: Arc<ListenerRegistry>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<EngineState>,
}

enum Command {
    Reconnect,
    Stop { ack: oneshot::Sender<()> },
}

impl SubscribeEngine {
    /// Create an engine backed by the production HTTP transport.
    pub fn new(config: SubscribeConfig) -> Result<Self, Error> {
        let transport = Arc::new(HttpTransport::from_config(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create an engine with a custom [`Transport`] (tests, alternative
    /// wire protocols).
    pub fn with_transport(config: SubscribeConfig, transport: Arc<dyn Transport>) -> Self {
        let timing = config.timing.clone().unwrap_or_default();
        let entities = Arc::new(EntitySet::new());
        let listeners = Arc::new(ListenerRegistry::new(timing.listener_queue_capacity));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::Stopped);

        let backoff = Backoff::new(timing.initial_retry_interval, timing.max_retry_interval);
        let runner = Runner {
            entities: entities.clone(),
            listeners: listeners.clone(),
            transport,
            cipher: config.cipher,
            timing,
            state_tx,
            cursor: Cursor::default(),
            backoff,
            consecutive_failures: 0,
            consecutive_malformed: 0,
            parked_version: entities.version(),
            parked_adds: entities.add_version(),
        };
        tokio::spawn(runner.run(cmd_rx));

        Self {
            entities,
            listeners,
            cmd_tx,
            state_rx,
        }
    }

    /// Add entries to the subscribed set. Starts the loop if it is stopped.
    /// Re-adding present entries is a no-op that still restarts the current
    /// poll so updated flags take effect promptly.
    pub fn subscribe(&self, entries: impl IntoIterator<Item = SubscriptionEntry>) {
        self.entities.add(entries);
    }

    /// Remove entries from the subscribed set. Removing the last entry
    /// idles the loop without stopping it.
    pub fn unsubscribe(&self, entries: impl IntoIterator<Item = SubscriptionEntry>) {
        self.entities.remove(entries);
    }

    /// Remove every entry. Any in-flight poll is abandoned unread.
    pub fn unsubscribe_all(&self) {
        self.entities.clear();
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.remove(id);
    }

    pub fn current_state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Re-arm the loop after `Disconnected` (or start it from `Stopped`).
    /// No-op while the loop is already running.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }

    /// Stop the loop, abandoning any in-flight poll or pending backoff.
    /// When this returns, all queued listener dispatch has completed and no
    /// further dispatch will occur until the engine is started again.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { ack: ack_tx }).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Loop runner
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Shutdown,
}

struct Runner {
    entities: Arc<EntitySet>,
    listeners: Arc<ListenerRegistry>,
    transport: Arc<dyn Transport>,
    cipher: Option<Arc<dyn PayloadCipher>>,
    timing: TimingConfig,
    state_tx: watch::Sender<EngineState>,
    cursor: Cursor,
    backoff: Backoff,
    consecutive_failures: u32,
    consecutive_malformed: u32,
    /// Entity-set versions captured when the loop parked, so wakeups can
    /// tell fresh mutations from ones already accounted for.
    parked_version: u64,
    parked_adds: u64,
}

impl Runner {
    fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let flow = match self.state() {
                EngineState::Stopped | EngineState::Disconnected => {
                    self.idle_parked(&mut cmd_rx).await
                }
                _ if self.entities.is_empty() => self.idle_empty(&mut cmd_rx).await,
                _ => self.poll_cycle(&mut cmd_rx).await,
            };
            if matches!(flow, Flow::Shutdown) {
                break;
            }
        }
        self.listeners.shutdown();
    }

    /// Move to `new`, notifying listeners. Same-state transitions are only
    /// re-notified when they carry an error (each failed retry, cursor
    /// resets); steady `Connected` polls stay quiet.
    async fn transition(&self, new: EngineState, error: Option<ErrorKind>) {
        let old = self.state();
        if old == new && error.is_none() {
            return;
        }
        self.state_tx.send_replace(new);
        tracing::debug!(%old, %new, ?error, "engine state transition");
        self.listeners
            .dispatch_status(StatusChange { old, new, error })
            .await;
    }

    /// Parked in `Stopped` or `Disconnected`: no polls until a command or a
    /// qualifying entity-set mutation re-arms the loop.
    async fn idle_parked(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Flow {
        tokio::select! {
            cmd = cmd_rx.recv() => self.handle_command(cmd).await,
            () = self.entities.changed(self.parked_version) => {
                self.parked_version = self.entities.version();
                let adds = self.entities.add_version();
                // A stopped engine restarts only on a subscribe; a
                // disconnected one re-arms on any mutation.
                let may_start = self.state() != EngineState::Stopped || adds != self.parked_adds;
                self.parked_adds = adds;
                if may_start {
                    self.rearm().await;
                }
                Flow::Continue
            }
        }
    }

    /// Running but the set is empty: poll nothing, keep the current state.
    async fn idle_empty(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Flow {
        let seen = self.entities.version();
        tokio::select! {
            cmd = cmd_rx.recv() => self.handle_command(cmd).await,
            () = self.entities.changed(seen) => Flow::Continue,
        }
    }

    async fn poll_cycle(&mut self, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> Flow {
        let (entities, version) = self.entities.snapshot();
        if entities.is_empty() {
            // Emptied out between the loop's check and the snapshot.
            return Flow::Continue;
        }
        let request = PollRequest {
            entities,
            cursor: self.cursor,
            timeout: self.timing.poll_timeout,
            heartbeat: self.timing.heartbeat_interval,
        };

        let outcome = tokio::select! {
            outcome = self.transport.poll_once(&request) => outcome,
            () = self.entities.changed(version) => {
                // Entity changes outrank a stale in-flight poll: its results
                // could attribute events to subscriptions that no longer
                // exist. Drop the request and rebuild immediately.
                tracing::debug!("entity set changed, restarting in-flight poll");
                return Flow::Continue;
            }
            cmd = cmd_rx.recv() => return self.handle_command(cmd).await,
        };
        self.handle_outcome(outcome, cmd_rx).await
    }

    async fn handle_outcome(
        &mut self,
        outcome: PollOutcome,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Flow {
        match outcome {
            PollOutcome::Events { cursor, envelopes } => {
                self.cursor = cursor;
                self.dispatch_envelopes(&envelopes);
                self.on_success().await;
                Flow::Continue
            }
            PollOutcome::Empty { cursor } => {
                self.cursor = cursor;
                self.on_success().await;
                Flow::Continue
            }
            PollOutcome::CursorInvalid => {
                tracing::warn!(cursor = %self.cursor, "stream position lost, resuming from now");
                self.cursor = Cursor::default();
                self.transition(EngineState::Connecting, Some(ErrorKind::CursorReset))
                    .await;
                Flow::Continue
            }
            PollOutcome::RateLimited { retry_after } => {
                tracing::warn!(?retry_after, "poll rate limited");
                self.on_failure(ErrorKind::RateLimited, retry_after, cmd_rx)
                    .await
            }
            PollOutcome::TransportError { kind, message } => {
                tracing::warn!(?kind, %message, "poll failed");
                if kind == ErrorKind::MalformedResponse {
                    self.consecutive_malformed += 1;
                    if self.consecutive_malformed > self.timing.malformed_body_budget {
                        return self
                            .fail_fatally(ErrorKind::MalformedResponse, message)
                            .await;
                    }
                }
                self.on_failure(kind, None, cmd_rx).await
            }
            PollOutcome::Fatal { kind, message } => self.fail_fatally(kind, message).await,
        }
    }

    async fn on_success(&mut self) {
        self.reset_failure_tracking();
        self.transition(EngineState::Connected, None).await;
    }

    async fn on_failure(
        &mut self,
        kind: ErrorKind,
        retry_after: Option<Duration>,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Flow {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.timing.max_retry_attempts {
            tracing::warn!(
                failures = self.consecutive_failures,
                "consecutive-failure threshold reached, parking"
            );
            self.parked_version = self.entities.version();
            self.transition(EngineState::Disconnected, Some(ErrorKind::RetriesExhausted))
                .await;
            return Flow::Continue;
        }

        self.transition(EngineState::Reconnecting, Some(kind)).await;
        let delay = retry_after.unwrap_or_else(|| self.backoff.next_delay());
        tracing::debug!(?delay, attempt = self.consecutive_failures, "backing off");
        tokio::select! {
            () = tokio::time::sleep(delay + Backoff::jitter(self.timing.retry_jitter)) => Flow::Continue,
            cmd = cmd_rx.recv() => self.handle_command(cmd).await,
        }
    }

    async fn fail_fatally(&mut self, kind: ErrorKind, message: String) -> Flow {
        tracing::error!(?kind, %message, "unrecoverable poll failure, stopping");
        self.enter_stopped(Some(kind)).await;
        Flow::Continue
    }

    async fn handle_command(&mut self, cmd: Option<Command>) -> Flow {
        match cmd {
            // Handle dropped: tear the loop down.
            None => Flow::Shutdown,
            Some(Command::Stop { ack }) => {
                self.enter_stopped(None).await;
                let _ = ack.send(());
                Flow::Continue
            }
            Some(Command::Reconnect) => {
                self.rearm().await;
                Flow::Continue
            }
        }
    }

    /// Start polling again from `Stopped` or `Disconnected`. No-op while
    /// running or while the entity set is empty.
    async fn rearm(&mut self) {
        if !matches!(
            self.state(),
            EngineState::Stopped | EngineState::Disconnected
        ) {
            return;
        }
        if self.entities.is_empty() {
            return;
        }
        if self.state() == EngineState::Stopped {
            // A fresh session starts from "now"; a re-arm after
            // `Disconnected` keeps the cursor to catch up at least once.
            self.cursor = Cursor::default();
        }
        self.reset_failure_tracking();
        self.transition(EngineState::Connecting, None).await;
    }

    async fn enter_stopped(&mut self, error: Option<ErrorKind>) {
        self.parked_version = self.entities.version();
        self.parked_adds = self.entities.add_version();
        self.transition(EngineState::Stopped, error).await;
        self.reset_failure_tracking();
        // Synchronize on queue drain: once a stop call returns, nothing
        // further reaches any listener.
        self.listeners.flush().await;
    }

    fn reset_failure_tracking(&mut self) {
        self.backoff.reset();
        self.consecutive_failures = 0;
        self.consecutive_malformed = 0;
    }

    fn dispatch_envelopes(&self, envelopes: &[RawEnvelope]) {
        for raw in envelopes {
            match protocol::decode_envelope(raw, self.cipher.as_deref()) {
                Ok(envelope) => self.listeners.dispatch_event(envelope),
                Err(e) => {
                    tracing::warn!(channel = %raw.channel, "skipping undecodable envelope: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
