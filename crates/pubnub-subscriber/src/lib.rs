//! Subscribe-only client engine for a PubNub-style pub/sub service.
//!
//! Maintains live subscriptions to channels and channel groups over HTTP
//! long polling, delivers messages, presence events, and signals in receipt
//! order, and recovers from network failure without caller involvement.
//!
//! # Features
//! - Cursor-tracked long-poll loop with at-least-once delivery
//! - Thread-safe subscription set; changes restart the in-flight poll
//! - Exponential backoff with a disconnect threshold and re-arm
//! - Fan-out to any number of listeners, isolated from each other
//! - Pluggable payload decryption
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubnub_subscriber::Error> {
//! use std::sync::Arc;
//!
//! use pubnub_subscriber::{
//!     Envelope, EventListener, SubscribeConfig, SubscribeEngine, SubscriptionEntry,
//! };
//!
//! struct Printer;
//!
//! impl EventListener for Printer {
//!     fn on_message(&self, envelope: &Envelope) {
//!         println!("{}: {}", envelope.channel, envelope.payload);
//!     }
//! }
//!
//! let engine = SubscribeEngine::new(SubscribeConfig::new("sub-key", "reader-1"))?;
//! engine.add_listener(Arc::new(Printer));
//! engine.subscribe([SubscriptionEntry::channel("chat").with_presence()]);
//! # Ok(())
//! # }
//! ```

mod classify;
mod engine;
mod entities;
mod listeners;
mod protocol;
mod retry;
mod transport;
mod types;

pub use engine::SubscribeEngine;
pub use listeners::{EventListener, ListenerId};
pub use protocol::{DecodeError, RawEnvelope, WireCursor, decode_envelope};
pub use transport::{HttpTransport, Transport};
pub use types::{
    BoxError, Cursor, EngineState, EntityKind, Envelope, Error, ErrorKind, EventKind,
    PayloadCipher, PollOutcome, PollRequest, StatusChange, SubscribeConfig, SubscriptionEntry,
    TimingConfig,
};
