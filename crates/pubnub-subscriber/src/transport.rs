//! Transport seam: one long-poll cycle per call.

use std::time::Duration;

use async_trait::async_trait;

use crate::classify::classify;
use crate::protocol::PRESENCE_SUFFIX;
use crate::types::{
    EntityKind, Error, ErrorKind, PollOutcome, PollRequest, SubscribeConfig, SubscriptionEntry,
};

pub(crate) const DEFAULT_ORIGIN: &str = "ps.pndsn.com";

/// Executes one long-poll cycle and returns the classified outcome.
///
/// The engine only ever sees [`PollOutcome`] values; URLs, headers, and
/// verbs are the transport's concern. Implementations must be safe for
/// concurrent use by multiple independent engines.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn poll_once(&self, request: &PollRequest) -> PollOutcome;
}

// ---------------------------------------------------------------------------
// Production HTTP transport
// ---------------------------------------------------------------------------

/// The production transport: HTTPS long polls against the service origin.
pub struct HttpTransport {
    http: reqwest::Client,
    base: url::Url,
    subscribe_key: String,
    user_id: String,
    auth_key: Option<String>,
    filter_expression: Option<String>,
}

impl HttpTransport {
    pub fn from_config(config: &SubscribeConfig) -> Result<Self, Error> {
        if config.subscribe_key.is_empty() {
            return Err(Error::Config("subscribe_key must not be empty".to_string()));
        }
        if config.user_id.is_empty() {
            return Err(Error::Config("user_id must not be empty".to_string()));
        }
        let origin = config.origin.as_deref().unwrap_or(DEFAULT_ORIGIN);
        let base = if origin.contains("://") {
            url::Url::parse(origin)?
        } else {
            url::Url::parse(&format!("https://{origin}"))?
        };
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base,
            subscribe_key: config.subscribe_key.clone(),
            user_id: config.user_id.clone(),
            auth_key: config.auth_key.clone(),
            filter_expression: config.filter_expression.clone(),
        })
    }

    fn build_url(&self, request: &PollRequest) -> Result<url::Url, Error> {
        let (channels, groups) = partition_entities(&request.entities);
        let channel_segment = if channels.is_empty() {
            // The path always carries a channel segment; a lone comma means
            // "groups only".
            ",".to_string()
        } else {
            channels.join(",")
        };

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("origin {} cannot be a base URL", self.base)))?
            .push("v2")
            .push("subscribe")
            .push(&self.subscribe_key)
            .push(&channel_segment)
            .push("0");

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("tt", &request.cursor.timetoken.to_string());
            if !request.cursor.is_zero() {
                query.append_pair("tr", &request.cursor.region.to_string());
            }
            query.append_pair("uuid", &self.user_id);
            query.append_pair("heartbeat", &request.heartbeat.to_string());
            if !groups.is_empty() {
                query.append_pair("channel-group", &groups.join(","));
            }
            if let Some(ref auth) = self.auth_key {
                query.append_pair("auth", auth);
            }
            if let Some(ref expr) = self.filter_expression {
                query.append_pair("filter-expr", expr);
            }
            query.append_pair("requestid", &uuid::Uuid::new_v4().to_string());
        }
        Ok(url)
    }
}

/// Split a snapshot into channel and group name lists, expanding
/// presence-enabled entries into their `-pnpres` twins.
fn partition_entities(entities: &[SubscriptionEntry]) -> (Vec<String>, Vec<String>) {
    let mut channels = Vec::new();
    let mut groups = Vec::new();
    for entry in entities {
        let bucket = match entry.kind {
            EntityKind::Channel => &mut channels,
            EntityKind::Group => &mut groups,
        };
        bucket.push(entry.name.clone());
        if entry.with_presence {
            bucket.push(format!("{}{PRESENCE_SUFFIX}", entry.name));
        }
    }
    (channels, groups)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn poll_once(&self, request: &PollRequest) -> PollOutcome {
        let url = match self.build_url(request) {
            Ok(url) => url,
            Err(e) => {
                return PollOutcome::Fatal {
                    kind: ErrorKind::BadRequest,
                    message: format!("failed to build poll request: {e}"),
                };
            }
        };
        tracing::trace!(
            entities = request.entities.len(),
            cursor = %request.cursor,
            "issuing poll"
        );

        let response = match self.http.get(url).timeout(request.timeout).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return PollOutcome::TransportError {
                    kind: ErrorKind::Timeout,
                    message: format!("poll timed out: {e}"),
                };
            }
            Err(e) => {
                return PollOutcome::TransportError {
                    kind: ErrorKind::Network,
                    message: format!("poll failed: {e}"),
                };
            }
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => {
                return PollOutcome::TransportError {
                    kind: ErrorKind::Timeout,
                    message: format!("poll body read timed out: {e}"),
                };
            }
            Err(e) => {
                return PollOutcome::TransportError {
                    kind: ErrorKind::Network,
                    message: format!("poll body read failed: {e}"),
                };
            }
        };

        classify(status, retry_after, &body)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
