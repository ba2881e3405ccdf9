//! Subscribe to one or more channels and print events to stdout.
//!
//! ```sh
//! cargo run -p pubnub-subscriber --example subscribe -- <SUBSCRIBE_KEY> <CHANNEL>...
//! ```
//!
//! Or pass the key via environment variable:
//! ```sh
//! PUBSUB_SUBSCRIBE_KEY=sub-c-... cargo run -p pubnub-subscriber --example subscribe \
//!     -- <CHANNEL>...
//! ```
//!
//! Event payloads are printed as JSON (pipe to `jq` for formatting).

use std::sync::Arc;

use pubnub_subscriber::{
    Envelope, EventListener, StatusChange, SubscribeConfig, SubscribeEngine, SubscriptionEntry,
};

struct StdoutListener;

impl EventListener for StdoutListener {
    fn on_message(&self, envelope: &Envelope) {
        println!("[message] {}: {}", envelope.channel, envelope.payload);
    }

    fn on_signal(&self, envelope: &Envelope) {
        println!("[signal] {}: {}", envelope.channel, envelope.payload);
    }

    fn on_presence(&self, envelope: &Envelope) {
        println!("[presence] {}: {}", envelope.channel, envelope.payload);
    }

    fn on_status(&self, status: &StatusChange) {
        match status.error {
            Some(kind) => eprintln!("[status] {} -> {} ({kind:?})", status.old, status.new),
            None => eprintln!("[status] {} -> {}", status.old, status.new),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let subscribe_key = match std::env::var("PUBSUB_SUBSCRIBE_KEY") {
        Ok(key) => key,
        Err(_) => {
            if args.is_empty() {
                eprintln!("usage: subscribe <SUBSCRIBE_KEY> <CHANNEL>...");
                std::process::exit(2);
            }
            args.remove(0)
        }
    };
    if args.is_empty() {
        eprintln!("usage: subscribe <SUBSCRIBE_KEY> <CHANNEL>...");
        std::process::exit(2);
    }

    let user_id = format!("subscribe-example-{}", std::process::id());
    let engine = SubscribeEngine::new(SubscribeConfig::new(subscribe_key, user_id))?;
    engine.add_listener(Arc::new(StdoutListener));
    engine.subscribe(
        args.iter()
            .map(|name| SubscriptionEntry::channel(name.clone()).with_presence()),
    );

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down");
    engine.disconnect().await;
    Ok(())
}
