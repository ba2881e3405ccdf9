//! Public types for the pubnub-subscriber crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::RawEnvelope;

/// A boxed error type for pluggable collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// A position in the server's event log: a 17-digit timetoken plus the
/// region of the datacenter that issued it.
///
/// Ordering is defined by `timetoken` alone; `region` is opaque routing data
/// that must be echoed back unchanged on the next poll. The default value is
/// the zero cursor, which asks the server to start the stream from "now".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cursor {
    pub timetoken: u64,
    pub region: u32,
}

impl Cursor {
    pub fn new(timetoken: u64, region: u32) -> Self {
        Self { timetoken, region }
    }

    /// True for the "start from now" cursor used on a fresh handshake.
    pub fn is_zero(&self) -> bool {
        self.timetoken == 0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timetoken)
    }
}

// ---------------------------------------------------------------------------
// Subscription entries
// ---------------------------------------------------------------------------

/// Whether a subscription names a single channel or a server-side channel
/// group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Channel,
    Group,
}

/// One subscribed entity. `(name, kind)` is the identity; `with_presence`
/// additionally subscribes to the entity's presence event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionEntry {
    pub name: String,
    pub kind: EntityKind,
    pub with_presence: bool,
}

impl SubscriptionEntry {
    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::Channel,
            with_presence: false,
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::Group,
            with_presence: false,
        }
    }

    /// Also receive join/leave/state-change events for this entity.
    pub fn with_presence(mut self) -> Self {
        self.with_presence = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Decoded events
// ---------------------------------------------------------------------------

/// The kind of a decoded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    Signal,
    Presence,
    ObjectUpdate,
    MessageAction,
}

/// A decoded event, delivered to listeners exactly once and then discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EventKind,
    /// Channel the event arrived on (presence suffix already stripped).
    pub channel: String,
    /// The channel group or wildcard that matched, when different from
    /// `channel`.
    pub subscription: Option<String>,
    /// Position at which the event was published.
    pub publish_cursor: Cursor,
    pub payload: serde_json::Value,
    /// Publisher's user id, when the server provides one.
    pub publisher: Option<String>,
    /// Publisher-supplied metadata (used server-side for filtering).
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Engine state and status notifications
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`SubscribeEngine`](crate::SubscribeEngine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Not polling. Initial state, and the terminal state after an explicit
    /// stop or a fatal error.
    Stopped,
    /// First poll of a session (or post-reset poll) is about to be issued.
    Connecting,
    /// The last poll succeeded.
    Connected,
    /// The last poll failed; retrying with backoff.
    Reconnecting,
    /// The consecutive-failure threshold was exceeded. No further polls
    /// until `reconnect()` or an entity-set mutation.
    Disconnected,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Stopped => "stopped",
            EngineState::Connecting => "connecting",
            EngineState::Connected => "connected",
            EngineState::Reconnecting => "reconnecting",
            EngineState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Classification of a failure, carried on status notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect/IO failure or server error; retried with backoff.
    Network,
    /// The poll exceeded its deadline; retried with backoff.
    Timeout,
    /// The response body could not be parsed.
    MalformedResponse,
    /// Server backpressure; retried after the server's hint or backoff.
    RateLimited,
    /// The stored cursor was rejected; the stream resumed from "now" with a
    /// gap in delivered history.
    CursorReset,
    /// Auth/permission failure. Fatal.
    PermissionDenied,
    /// The request itself was rejected as malformed. Fatal.
    BadRequest,
    /// The consecutive-failure threshold was reached.
    RetriesExhausted,
}

/// One state transition, as observed by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub old: EngineState,
    pub new: EngineState,
    pub error: Option<ErrorKind>,
}

// ---------------------------------------------------------------------------
// Poll request / outcome
// ---------------------------------------------------------------------------

/// One long-poll cycle's input, derived from the entity set and cursor at
/// issue time. Never stored.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub entities: Vec<SubscriptionEntry>,
    pub cursor: Cursor,
    pub timeout: Duration,
    /// Presence liveness window announced to the server, in seconds.
    pub heartbeat: u32,
}

/// The classified result of one long-poll cycle.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// The poll returned events. `cursor` supersedes the one sent.
    Events {
        cursor: Cursor,
        envelopes: Vec<RawEnvelope>,
    },
    /// The poll window closed with no events. The server still hands back a
    /// fresh cursor so the client does not re-read the same window.
    Empty { cursor: Cursor },
    /// The cursor was rejected; the engine must reset to the zero cursor.
    CursorInvalid,
    /// Server backpressure, optionally with a retry-after hint.
    RateLimited { retry_after: Option<Duration> },
    /// Recoverable failure; retried with backoff. `kind` is one of
    /// `Network`, `Timeout`, or `MalformedResponse`.
    TransportError { kind: ErrorKind, message: String },
    /// Unrecoverable failure; the engine stops. `kind` is one of
    /// `PermissionDenied` or `BadRequest`.
    Fatal { kind: ErrorKind, message: String },
}

// ---------------------------------------------------------------------------
// Payload cipher seam
// ---------------------------------------------------------------------------

/// Pluggable payload decryption. The engine base64-decodes string payloads
/// and hands the bytes here; it never implements cryptography itself.
pub trait PayloadCipher: Send + Sync {
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BoxError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`SubscribeEngine`](crate::SubscribeEngine).
///
/// An explicit value passed to the constructor rather than process-wide
/// state, so multiple independent engines can run in one process.
pub struct SubscribeConfig {
    pub subscribe_key: String,
    /// Identifies this client to the server (`uuid` query parameter).
    pub user_id: String,
    /// Service origin. Defaults to `"ps.pndsn.com"`; a `http://` or
    /// `https://` prefix is honored when present.
    pub origin: Option<String>,
    /// Access-manager token sent as the `auth` query parameter.
    pub auth_key: Option<String>,
    /// Server-side message filter expression.
    pub filter_expression: Option<String>,
    /// Decryption transform applied to message/signal payloads.
    pub cipher: Option<Arc<dyn PayloadCipher>>,
    pub timing: Option<TimingConfig>,
}

impl SubscribeConfig {
    pub fn new(subscribe_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            subscribe_key: subscribe_key.into(),
            user_id: user_id.into(),
            origin: None,
            auth_key: None,
            filter_expression: None,
            cipher: None,
            timing: None,
        }
    }
}

/// Timing and retry knobs, overridable for tests.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Outer deadline for one long-poll request. The server holds the poll
    /// open for up to ~280s, so this must comfortably exceed that.
    pub poll_timeout: Duration,
    /// Presence liveness window announced to the server, in seconds.
    pub heartbeat_interval: u32,
    pub initial_retry_interval: Duration,
    pub max_retry_interval: Duration,
    /// Consecutive failures before the engine parks in `Disconnected`.
    pub max_retry_attempts: u32,
    /// Upper bound on the wall-clock jitter added to each backoff sleep.
    pub retry_jitter: Duration,
    /// Consecutive malformed bodies tolerated before the failure is treated
    /// as fatal rather than transient corruption.
    pub malformed_body_budget: u32,
    /// Per-listener event queue depth; events beyond it are dropped for
    /// that listener only.
    pub listener_queue_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(310),
            heartbeat_interval: 300,
            initial_retry_interval: Duration::from_secs(2),
            max_retry_interval: Duration::from_secs(32),
            max_retry_attempts: 10,
            retry_jitter: Duration::from_secs(1),
            malformed_body_budget: 3,
            listener_queue_capacity: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by this crate's constructors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("config error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
