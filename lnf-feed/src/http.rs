use crate::traits::FeedClient;
use crate::types::{FeedMessage, MessageId, User};
use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

const HTTP_FEED_ID: &str = "http";
const FEED_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(60);
const FEED_RETRY_BASE_MS: u64 = 250;
const FEED_RETRY_MAX_MS: u64 = 30_000;

/// Client for a Twitter v1.1 compatible REST + filtered streaming API,
/// authenticated with a bearer token.
#[derive(Clone)]
pub struct HttpFeedAdapter {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    api_base: String,
    stream_base: String,
    token: String,
}

impl HttpFeedAdapter {
    pub fn new(api_base: &str, stream_base: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        // The filtered stream is a long-lived response; only bound the connect phase.
        let stream_http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            http,
            stream_http,
            api_base: api_base.trim_end_matches('/').to_string(),
            stream_base: stream_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base)
    }

    fn stream_url(&self, path: &str) -> String {
        format!("{}/{path}", self.stream_base)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        what: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            return Err(anyhow::anyhow!(
                "feed {what} failed: status={status} body={text}"
            ));
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("feed {what}: unexpected payload"))
    }
}

#[async_trait::async_trait]
impl FeedClient for HttpFeedAdapter {
    fn feed_id(&self) -> &str {
        HTTP_FEED_ID
    }

    async fn whoami(&self) -> Result<User> {
        let response = self
            .http
            .get(self.api_url("account/verify_credentials.json"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let raw: RawUser = Self::read_json("verify_credentials", response).await?;
        Ok(raw.into())
    }

    async fn lookup_user(&self, screen_name: &str) -> Result<User> {
        let screen_name = screen_name.trim().trim_start_matches('@');
        let response = self
            .http
            .get(self.api_url("users/lookup.json"))
            .bearer_auth(&self.token)
            .query(&[("screen_name", screen_name)])
            .send()
            .await?;
        let users: Vec<RawUser> = Self::read_json("users/lookup", response).await?;
        users
            .into_iter()
            .next()
            .map(User::from)
            .ok_or_else(|| anyhow::anyhow!("feed user not found: {screen_name}"))
    }

    async fn lookup_message(&self, id: &MessageId) -> Result<Option<FeedMessage>> {
        let response = self
            .http
            .get(self.api_url("statuses/lookup.json"))
            .bearer_auth(&self.token)
            .query(&[("id", id.as_str()), ("tweet_mode", "extended")])
            .send()
            .await?;
        let statuses: Vec<RawStatus> = Self::read_json("statuses/lookup", response).await?;
        Ok(statuses.into_iter().next().map(build_feed_message))
    }

    async fn post(&self, body: &str, reply_to: Option<&MessageId>) -> Result<MessageId> {
        let mut form = vec![("status", body.to_string())];
        if let Some(reply_to) = reply_to {
            form.push(("in_reply_to_status_id", reply_to.to_string()));
            form.push(("auto_populate_reply_metadata", "true".to_string()));
        }
        let response = self
            .http
            .post(self.api_url("statuses/update.json"))
            .bearer_auth(&self.token)
            .form(&form)
            .send()
            .await?;
        let posted: RawStatus = Self::read_json("statuses/update", response).await?;
        tracing::info!(message_id = %posted.id_str, reply_to = ?reply_to, "feed post acknowledged");
        Ok(posted.id_str.into())
    }

    async fn start(&self, track: &str, tx: mpsc::Sender<FeedMessage>) -> Result<()> {
        let adapter = self.clone();
        let track = track.to_string();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_stream_loop(&track, tx).await {
                tracing::error!(%e, "feed stream loop exited");
            }
        });
        Ok(())
    }
}

impl HttpFeedAdapter {
    #[tracing::instrument(level = "info", skip(self, tx))]
    async fn run_stream_loop(&self, track: &str, tx: mpsc::Sender<FeedMessage>) -> Result<()> {
        let mut consecutive_failures: u32 = 0;

        loop {
            let response = match self
                .stream_http
                .post(self.stream_url("statuses/filter.json"))
                .bearer_auth(&self.token)
                .form(&[("track", track), ("tweet_mode", "extended")])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "feed stream connect failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|error| format!("<failed to read feed error body: {error}>"));
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "feed stream transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?FEED_NON_TRANSIENT_DELAY,
                        "feed stream non-transient failure; keeping stream loop alive"
                    );
                    tokio::time::sleep(FEED_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            consecutive_failures = 0;
            tracing::info!("feed stream connected");

            let mut body = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(error) => {
                        tracing::warn!(%error, "feed stream read failed; reconnecting");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);
                for line in drain_lines(&mut buf) {
                    let Some(message) = parse_stream_line(&line) else {
                        continue;
                    };
                    tx.send(message)
                        .await
                        .map_err(|e| anyhow::anyhow!("feed inbound queue closed: {e}"))?;
                }
            }

            consecutive_failures += 1;
            let delay = transient_retry_delay(consecutive_failures);
            tracing::warn!(?delay, "feed stream ended; reconnecting");
            tokio::time::sleep(delay).await;
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((FEED_RETRY_BASE_MS * multiplier).min(FEED_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Split complete `\n`-terminated lines off the front of `buf`, leaving any partial
/// trailing line in place. Blank keep-alive lines are dropped.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let raw: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

fn parse_stream_line(line: &str) -> Option<FeedMessage> {
    match serde_json::from_str::<RawStatus>(line) {
        Ok(raw) => Some(build_feed_message(raw)),
        Err(error) => {
            // Delete notices, limit notices and other control frames land here.
            tracing::debug!(%error, "skipping non-status stream frame");
            None
        }
    }
}

fn build_feed_message(raw: RawStatus) -> FeedMessage {
    let is_reshare = raw.retweeted_status.is_some() || raw.retweet_count > 0;
    let (text, entities) = match (raw.truncated, raw.extended_tweet) {
        (true, Some(extended)) => (
            extended.full_text,
            extended.entities.unwrap_or(raw.entities),
        ),
        _ => (
            raw.full_text.or(raw.text).unwrap_or_default(),
            raw.entities,
        ),
    };

    FeedMessage {
        id: raw.id_str.into(),
        author: raw.user.into(),
        text,
        in_reply_to: raw
            .in_reply_to_status_id_str
            .filter(|id| !id.is_empty())
            .map(MessageId::from),
        mentions: entities.user_mentions.into_iter().map(User::from).collect(),
        is_reshare,
        received_at: Utc::now(),
    }
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    id_str: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    extended_tweet: Option<RawExtended>,
    user: RawUser,
    #[serde(default)]
    in_reply_to_status_id_str: Option<String>,
    #[serde(default)]
    retweet_count: u64,
    #[serde(default)]
    retweeted_status: Option<serde_json::Value>,
    #[serde(default)]
    entities: RawEntities,
}

#[derive(Debug, Deserialize)]
struct RawExtended {
    full_text: String,
    #[serde(default)]
    entities: Option<RawEntities>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntities {
    #[serde(default)]
    user_mentions: Vec<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id_str: String,
    screen_name: String,
}

impl From<RawUser> for User {
    fn from(raw: RawUser) -> Self {
        User::new(raw.id_str, raw.screen_name)
    }
}
