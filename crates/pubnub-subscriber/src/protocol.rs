//! Subscribe wire format: response parsing and envelope decoding.

use base64::Engine as _;
use serde::Deserialize;

use crate::types::{Cursor, Envelope, EventKind, PayloadCipher};

/// Presence events for `<name>` are delivered on `<name>-pnpres`.
pub(crate) const PRESENCE_SUFFIX: &str = "-pnpres";

// ---------------------------------------------------------------------------
// Wire types (JSON)
// ---------------------------------------------------------------------------

/// Successful subscribe response: next cursor plus a (possibly empty) batch
/// of envelopes, in server receipt order.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubscribeResponse {
    #[serde(rename = "t")]
    pub cursor: WireCursor,
    #[serde(rename = "m", default)]
    pub envelopes: Vec<RawEnvelope>,
}

/// A cursor as it appears on the wire: the timetoken is a decimal string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireCursor {
    #[serde(rename = "t")]
    pub timetoken: String,
    #[serde(rename = "r", default)]
    pub region: u32,
}

impl WireCursor {
    pub fn to_cursor(&self) -> Result<Cursor, DecodeError> {
        let timetoken = self
            .timetoken
            .parse::<u64>()
            .map_err(|_| DecodeError::InvalidTimetoken(self.timetoken.clone()))?;
        Ok(Cursor::new(timetoken, self.region))
    }
}

/// One entry of the response's `m` array, as delivered on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawEnvelope {
    /// Shard the message was routed through.
    #[serde(rename = "a")]
    pub shard: Option<String>,
    /// Concrete channel the event arrived on.
    #[serde(rename = "c")]
    pub channel: String,
    /// Channel group or wildcard the subscription matched on, if any.
    #[serde(rename = "b")]
    pub subscription: Option<String>,
    #[serde(rename = "d")]
    pub payload: serde_json::Value,
    /// 0/absent = message, 1 = signal, 2 = object update, 3 = message action.
    #[serde(rename = "e")]
    pub message_type: Option<i32>,
    /// Publisher's user id.
    #[serde(rename = "i")]
    pub publisher: Option<String>,
    #[serde(rename = "p")]
    pub publish_cursor: Option<WireCursor>,
    /// Publisher-supplied metadata.
    #[serde(rename = "u")]
    pub metadata: Option<serde_json::Value>,
    #[serde(rename = "f")]
    pub flags: Option<i32>,
}

/// Error body shape shared by all service endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ErrorBody {
    pub status: Option<u16>,
    pub error: bool,
    pub message: Option<String>,
    pub service: Option<String>,
}

impl ErrorBody {
    /// True when the body reports a rejected/expired timetoken, which must
    /// be handled as a cursor reset rather than a request failure.
    pub fn mentions_invalid_cursor(&self) -> bool {
        self.message
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains("timetoken"))
    }
}

/// Errors from [`decode_envelope`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid timetoken: {0:?}")]
    InvalidTimetoken(String),
}

// ---------------------------------------------------------------------------
// Envelope decoding
// ---------------------------------------------------------------------------

fn kind_for(message_type: Option<i32>, wire_channel: &str) -> EventKind {
    if wire_channel.ends_with(PRESENCE_SUFFIX) {
        return EventKind::Presence;
    }
    match message_type.unwrap_or(0) {
        1 => EventKind::Signal,
        2 => EventKind::ObjectUpdate,
        3 => EventKind::MessageAction,
        _ => EventKind::Message,
    }
}

fn strip_presence(name: &str) -> &str {
    name.strip_suffix(PRESENCE_SUFFIX).unwrap_or(name)
}

/// Decode one wire envelope into a typed event.
///
/// Fails only for structurally unusable entries (an unparseable publish
/// cursor); payload-level problems fall back to the raw payload so a single
/// odd message never breaks the stream.
pub fn decode_envelope(
    raw: &RawEnvelope,
    cipher: Option<&dyn PayloadCipher>,
) -> Result<Envelope, DecodeError> {
    let publish_cursor = raw
        .publish_cursor
        .as_ref()
        .map(WireCursor::to_cursor)
        .transpose()?
        .unwrap_or_default();

    let kind = kind_for(raw.message_type, &raw.channel);
    let channel = strip_presence(&raw.channel).to_string();
    let subscription = raw
        .subscription
        .as_deref()
        .map(strip_presence)
        .filter(|s| *s != channel)
        .map(str::to_string);

    let payload = match (kind, cipher) {
        (EventKind::Message | EventKind::Signal, Some(cipher)) => {
            decrypt_payload(raw.payload.clone(), cipher)
        }
        _ => raw.payload.clone(),
    };

    Ok(Envelope {
        kind,
        channel,
        subscription,
        publish_cursor,
        payload,
        publisher: raw.publisher.clone(),
        metadata: raw.metadata.clone(),
    })
}

/// Encrypted payloads travel as base64 strings. Non-string payloads and
/// strings that are not valid base64 pass through unchanged; decrypt
/// failures fall back to the raw payload rather than failing the message.
fn decrypt_payload(payload: serde_json::Value, cipher: &dyn PayloadCipher) -> serde_json::Value {
    let serde_json::Value::String(ref encoded) = payload else {
        return payload;
    };
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return payload;
    };
    match cipher.decrypt(&bytes) {
        Ok(plain) => match serde_json::from_slice(&plain) {
            Ok(value) => value,
            Err(_) => serde_json::Value::String(String::from_utf8_lossy(&plain).into_owned()),
        },
        Err(e) => {
            tracing::warn!("payload decrypt failed, passing raw payload through: {e}");
            payload
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoxError;

    fn raw(channel: &str, message_type: Option<i32>) -> RawEnvelope {
        RawEnvelope {
            channel: channel.to_string(),
            payload: serde_json::json!({"text": "hi"}),
            message_type,
            publish_cursor: Some(WireCursor {
                timetoken: "17000000000000000".to_string(),
                region: 7,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parse_subscribe_response() {
        let body = serde_json::json!({
            "t": {"t": "15628652479932717", "r": 4},
            "m": [{
                "a": "1",
                "c": "chat",
                "d": {"text": "hello"},
                "i": "user-1",
                "p": {"t": "15628652479933000", "r": 4},
            }]
        });
        let resp: SubscribeResponse = serde_json::from_value(body).unwrap();
        assert_eq!(
            resp.cursor.to_cursor().unwrap(),
            Cursor::new(15_628_652_479_932_717, 4)
        );
        assert_eq!(resp.envelopes.len(), 1);
        assert_eq!(resp.envelopes[0].channel, "chat");
    }

    #[test]
    fn parse_response_without_messages_field() {
        let resp: SubscribeResponse =
            serde_json::from_str(r#"{"t":{"t":"1000","r":0}}"#).unwrap();
        assert!(resp.envelopes.is_empty());
    }

    #[test]
    fn decode_message() {
        let env = decode_envelope(&raw("chat", None), None).unwrap();
        assert_eq!(env.kind, EventKind::Message);
        assert_eq!(env.channel, "chat");
        assert_eq!(env.publish_cursor, Cursor::new(17_000_000_000_000_000, 7));
        assert_eq!(env.payload, serde_json::json!({"text": "hi"}));
    }

    #[test]
    fn decode_signal_object_action() {
        assert_eq!(
            decode_envelope(&raw("chat", Some(1)), None).unwrap().kind,
            EventKind::Signal
        );
        assert_eq!(
            decode_envelope(&raw("chat", Some(2)), None).unwrap().kind,
            EventKind::ObjectUpdate
        );
        assert_eq!(
            decode_envelope(&raw("chat", Some(3)), None).unwrap().kind,
            EventKind::MessageAction
        );
    }

    #[test]
    fn decode_presence_strips_suffix() {
        let mut r = raw("chat-pnpres", None);
        r.payload = serde_json::json!({"action": "join", "uuid": "user-2", "occupancy": 3});
        let env = decode_envelope(&r, None).unwrap();
        assert_eq!(env.kind, EventKind::Presence);
        assert_eq!(env.channel, "chat");
    }

    #[test]
    fn presence_outranks_message_type() {
        // A presence channel is presence even if the type field says signal.
        let env = decode_envelope(&raw("chat-pnpres", Some(1)), None).unwrap();
        assert_eq!(env.kind, EventKind::Presence);
    }

    #[test]
    fn group_match_is_kept_channel_echo_is_dropped() {
        let mut r = raw("chat.eu", None);
        r.subscription = Some("regional-group".to_string());
        let env = decode_envelope(&r, None).unwrap();
        assert_eq!(env.subscription.as_deref(), Some("regional-group"));

        let mut r = raw("chat", None);
        r.subscription = Some("chat".to_string());
        let env = decode_envelope(&r, None).unwrap();
        assert!(env.subscription.is_none());
    }

    #[test]
    fn missing_publish_cursor_defaults_to_zero() {
        let mut r = raw("chat", None);
        r.publish_cursor = None;
        let env = decode_envelope(&r, None).unwrap();
        assert!(env.publish_cursor.is_zero());
    }

    #[test]
    fn garbage_timetoken_is_an_error() {
        let mut r = raw("chat", None);
        r.publish_cursor = Some(WireCursor {
            timetoken: "not-a-number".to_string(),
            region: 0,
        });
        assert!(matches!(
            decode_envelope(&r, None),
            Err(DecodeError::InvalidTimetoken(_))
        ));
    }

    #[test]
    fn error_body_cursor_detection() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"status":400,"error":true,"message":"Invalid Timetoken"}"#)
                .unwrap();
        assert!(body.mentions_invalid_cursor());

        let body: ErrorBody =
            serde_json::from_str(r#"{"status":400,"error":true,"message":"Invalid Key"}"#).unwrap();
        assert!(!body.mentions_invalid_cursor());
    }

    struct XorCipher;

    impl PayloadCipher for XorCipher {
        fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
            Ok(data.iter().map(|b| b ^ 0x42).collect())
        }
    }

    struct FailingCipher;

    impl PayloadCipher for FailingCipher {
        fn decrypt(&self, _data: &[u8]) -> Result<Vec<u8>, BoxError> {
            Err("bad key".into())
        }
    }

    #[test]
    fn cipher_applied_to_string_message_payloads() {
        let plain = br#"{"secret":1}"#;
        let scrambled: Vec<u8> = plain.iter().map(|b| b ^ 0x42).collect();
        let mut r = raw("chat", None);
        r.payload = serde_json::Value::String(
            base64::engine::general_purpose::STANDARD.encode(&scrambled),
        );
        let env = decode_envelope(&r, Some(&XorCipher)).unwrap();
        assert_eq!(env.payload, serde_json::json!({"secret": 1}));
    }

    #[test]
    fn cipher_skips_structured_payloads() {
        let env = decode_envelope(&raw("chat", None), Some(&XorCipher)).unwrap();
        assert_eq!(env.payload, serde_json::json!({"text": "hi"}));
    }

    #[test]
    fn cipher_failure_passes_raw_payload_through() {
        let mut r = raw("chat", None);
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"ciphertext");
        r.payload = serde_json::Value::String(encoded.clone());
        let env = decode_envelope(&r, Some(&FailingCipher)).unwrap();
        assert_eq!(env.payload, serde_json::Value::String(encoded));
    }

    #[test]
    fn cipher_never_touches_presence() {
        let mut r = raw("chat-pnpres", None);
        r.payload = serde_json::Value::String("am9pbg==".to_string());
        let env = decode_envelope(&r, Some(&XorCipher)).unwrap();
        assert_eq!(env.payload, serde_json::Value::String("am9pbg==".to_string()));
    }
}
