//! Poll response classification.
//!
//! Pure function of status code, headers, and body bytes; performs no I/O
//! and never touches engine state, so it is testable against canned server
//! responses. Request-level failures (connect errors, deadline overruns)
//! are mapped by the transport before this point.

use std::time::Duration;

use crate::protocol::{ErrorBody, SubscribeResponse};
use crate::types::{ErrorKind, PollOutcome};

pub(crate) fn classify(status: u16, retry_after: Option<Duration>, body: &[u8]) -> PollOutcome {
    match status {
        s if (200..300).contains(&s) => classify_success(body),
        400 | 413 => {
            let err = parse_error_body(body);
            if err.mentions_invalid_cursor() {
                return PollOutcome::CursorInvalid;
            }
            PollOutcome::Fatal {
                kind: ErrorKind::BadRequest,
                message: error_message(&err, "request rejected"),
            }
        }
        401 | 403 => {
            let err = parse_error_body(body);
            PollOutcome::Fatal {
                kind: ErrorKind::PermissionDenied,
                message: error_message(&err, "access denied"),
            }
        }
        429 => PollOutcome::RateLimited { retry_after },
        s if s >= 500 => PollOutcome::TransportError {
            kind: ErrorKind::Network,
            message: format!("server error: HTTP {s}"),
        },
        other => PollOutcome::TransportError {
            kind: ErrorKind::Network,
            message: format!("unexpected status: HTTP {other}"),
        },
    }
}

fn classify_success(body: &[u8]) -> PollOutcome {
    match serde_json::from_slice::<SubscribeResponse>(body) {
        Ok(resp) => match resp.cursor.to_cursor() {
            Ok(cursor) if resp.envelopes.is_empty() => PollOutcome::Empty { cursor },
            Ok(cursor) => PollOutcome::Events {
                cursor,
                envelopes: resp.envelopes,
            },
            Err(e) => PollOutcome::TransportError {
                kind: ErrorKind::MalformedResponse,
                message: e.to_string(),
            },
        },
        Err(parse_err) => {
            // Some server-side conditions (a cursor aged out of the event
            // log among them) arrive as an error body under an HTTP success
            // status. Only a body that says so is a reset; anything else is
            // transient corruption until it exceeds the retry budget.
            let err = parse_error_body(body);
            if err.error && err.mentions_invalid_cursor() {
                return PollOutcome::CursorInvalid;
            }
            PollOutcome::TransportError {
                kind: ErrorKind::MalformedResponse,
                message: format!("unparseable response body: {parse_err}"),
            }
        }
    }
}

fn parse_error_body(body: &[u8]) -> ErrorBody {
    serde_json::from_slice::<ErrorBody>(body).unwrap_or_default()
}

fn error_message(err: &ErrorBody, fallback: &str) -> String {
    match (&err.message, err.status, &err.service) {
        (Some(message), Some(status), Some(service)) => {
            format!("{service} {status}: {message}")
        }
        (Some(message), _, _) => message.clone(),
        _ => fallback.to_string(),
    }
}
