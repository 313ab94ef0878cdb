//! Bot account transport over the HTTP Bot API
//!
//! Live tailing shares one `getUpdates` long-poll loop between every
//! follower of this connection, since the platform only allows a single
//! update consumer per bot.

use super::transport::{MessageStream, Transport};
use crate::error::{RelayError, TransportError};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use relayman_types::{Message, MessageId};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

const POLL_TIMEOUT_SECS: u64 = 30;
const MAX_POLL_BACKOFF_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    channel_post: Option<ChannelPost>,
}

#[derive(Debug, Deserialize)]
struct ChannelPost {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<serde_json::Value>,
    document: Option<serde_json::Value>,
    video: Option<serde_json::Value>,
    audio: Option<serde_json::Value>,
    voice: Option<serde_json::Value>,
    animation: Option<serde_json::Value>,
}

impl ChannelPost {
    fn has_content(&self) -> bool {
        self.text.is_some()
            || self.caption.is_some()
            || self.photo.is_some()
            || self.document.is_some()
            || self.video.is_some()
            || self.audio.is_some()
            || self.voice.is_some()
            || self.animation.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    username: Option<String>,
}

/// Raw Bot API calls
struct BotApi {
    client: Client,
    base_url: String,
}

impl BotApi {
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TransportError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await?;

        let api_resp: ApiResponse<T> = resp.json().await?;
        if !api_resp.ok {
            let err = classify_failure(&api_resp);
            debug!("{method} failed: {err}");
            return Err(err);
        }

        api_resp
            .result
            .ok_or_else(|| TransportError::Failed(format!("{method} returned no result")))
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, TransportError> {
        let mut body = json!({
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["channel_post"],
        });
        if let Some(off) = offset {
            body["offset"] = json!(off);
        }
        self.call("getUpdates", body).await
    }
}

struct Follower {
    channel: String,
    after: Option<MessageId>,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Followers {
    list: Vec<Follower>,
    poller_running: bool,
}

/// Transport for the bot account connection class
pub struct BotApiTransport {
    api: Arc<BotApi>,
    followers: Arc<Mutex<Followers>>,
}

impl BotApiTransport {
    pub fn new(bot_token: &str) -> Result<Self, RelayError> {
        Self::with_base_url(bot_token, DEFAULT_BASE_URL)
    }

    /// Create a transport against a custom API endpoint
    pub fn with_base_url(bot_token: &str, base_url: &str) -> Result<Self, RelayError> {
        url::Url::parse(base_url)
            .map_err(|e| RelayError::Unknown(format!("Invalid Bot API URL {base_url}: {e}")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .build()?;

        Ok(Self {
            api: Arc::new(BotApi {
                client,
                base_url: format!("{}/bot{}", base_url.trim_end_matches('/'), bot_token),
            }),
            followers: Arc::new(Mutex::new(Followers::default())),
        })
    }
}

#[async_trait]
impl Transport for BotApiTransport {
    async fn forward(
        &self,
        source: &str,
        dest: &str,
        message_id: MessageId,
    ) -> Result<(), TransportError> {
        let body = json!({
            "chat_id": chat_ref(dest),
            "from_chat_id": chat_ref(source),
            "message_id": message_id,
        });
        self.api
            .call::<serde_json::Value>("forwardMessage", body)
            .await
            .map(|_| ())
    }

    fn enumerate_messages(&self, channel: &str, _after: Option<MessageId>) -> MessageStream<'_> {
        let channel = channel.to_string();
        futures::stream::once(async move {
            Err(TransportError::Failed(format!(
                "bot accounts cannot read the history of {channel}"
            )))
        })
        .boxed()
    }

    fn follow_messages(&self, channel: &str, after: Option<MessageId>) -> MessageStream<'_> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut followers = self.followers.lock();
        followers.list.push(Follower {
            channel: channel_key(channel),
            after,
            tx,
        });
        if !followers.poller_running {
            followers.poller_running = true;
            tokio::spawn(poll_loop(
                Arc::clone(&self.api),
                Arc::clone(&self.followers),
            ));
        }
        UnboundedReceiverStream::new(rx).map(Ok).boxed()
    }

    async fn is_ready(&self) -> bool {
        match self.api.call::<serde_json::Value>("getMe", json!({})).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Bot connection not ready: {}", e);
                false
            }
        }
    }
}

/// Long-poll `getUpdates` and fan channel posts out to followers.
/// Exits once every follower has gone away.
async fn poll_loop(api: Arc<BotApi>, followers: Arc<Mutex<Followers>>) {
    let mut offset: Option<i64> = None;
    let mut backoff_secs = 1u64;

    info!("Bot API poller started");

    loop {
        {
            let mut guard = followers.lock();
            guard.list.retain(|f| !f.tx.is_closed());
            if guard.list.is_empty() {
                guard.poller_running = false;
                info!("Bot API poller stopped, no followers left");
                return;
            }
        }

        match api.get_updates(offset).await {
            Ok(updates) => {
                backoff_secs = 1;
                let mut guard = followers.lock();
                for update in updates {
                    offset = Some(update.update_id + 1);
                    let Some(post) = update.channel_post else {
                        continue;
                    };
                    let message = Message {
                        id: post.message_id,
                        has_content: post.has_content(),
                    };
                    for follower in guard.list.iter_mut() {
                        if !channel_matches(&follower.channel, &post.chat) {
                            continue;
                        }
                        if follower.after.is_some_and(|after| message.id <= after) {
                            continue;
                        }
                        let _ = follower.tx.send(message);
                    }
                }
            }
            Err(TransportError::Throttle { seconds }) => {
                warn!("getUpdates throttled, waiting {}s", seconds);
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            Err(e) => {
                warn!("getUpdates failed, retrying in {}s: {}", backoff_secs, e);
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_POLL_BACKOFF_SECS);
            }
        }
    }
}

fn classify_failure<T>(resp: &ApiResponse<T>) -> TransportError {
    let retry_after = resp.parameters.as_ref().and_then(|p| p.retry_after);
    match (resp.error_code, retry_after) {
        (_, Some(seconds)) => TransportError::Throttle { seconds },
        (Some(429), None) => TransportError::Throttle { seconds: 1 },
        _ => TransportError::Failed(
            resp.description
                .clone()
                .unwrap_or_else(|| "unknown Bot API error".to_string()),
        ),
    }
}

/// Numeric ids go out as numbers, usernames as strings
fn chat_ref(channel: &str) -> serde_json::Value {
    let channel = channel.trim();
    match channel.parse::<i64>() {
        Ok(id) => json!(id),
        Err(_) => json!(channel),
    }
}

fn channel_key(channel: &str) -> String {
    channel.trim().trim_start_matches('@').to_lowercase()
}

fn channel_matches(key: &str, chat: &Chat) -> bool {
    if chat.id.to_string() == key {
        return true;
    }
    chat.username
        .as_deref()
        .is_some_and(|username| username.to_lowercase() == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flood_wait_maps_to_throttle() {
        let resp: ApiResponse<serde_json::Value> = serde_json::from_str(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 35","parameters":{"retry_after":35}}"#,
        )
        .unwrap();
        assert_eq!(
            classify_failure(&resp),
            TransportError::Throttle { seconds: 35 }
        );
    }

    #[test]
    fn test_other_failures_keep_description() {
        let resp: ApiResponse<serde_json::Value> = serde_json::from_str(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: message to forward not found"}"#,
        )
        .unwrap();
        assert_eq!(
            classify_failure(&resp),
            TransportError::Failed("Bad Request: message to forward not found".to_string())
        );
    }

    #[test]
    fn test_chat_ref_and_matching() {
        assert_eq!(chat_ref("-1001234567890"), json!(-1001234567890i64));
        assert_eq!(chat_ref("@news"), json!("@news"));

        let chat = Chat {
            id: -100777,
            username: Some("NewsFeed".to_string()),
        };
        assert!(channel_matches(&channel_key("@newsfeed"), &chat));
        assert!(channel_matches(&channel_key("-100777"), &chat));
        assert!(!channel_matches(&channel_key("@other"), &chat));
    }

    #[test]
    fn test_channel_post_content_detection() {
        let updates: Vec<Update> = serde_json::from_str(
            r#"[
                {"update_id":1,"channel_post":{"message_id":10,"chat":{"id":-1},"text":"hi"}},
                {"update_id":2,"channel_post":{"message_id":11,"chat":{"id":-1},"photo":[{"file_id":"x"}]}},
                {"update_id":3,"channel_post":{"message_id":12,"chat":{"id":-1},"pinned_message":{}}}
            ]"#,
        )
        .unwrap();
        let flags: Vec<bool> = updates
            .iter()
            .map(|u| u.channel_post.as_ref().unwrap().has_content())
            .collect();
        assert_eq!(flags, vec![true, true, false]);
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(BotApiTransport::with_base_url("123:abc", "not a url").is_err());
    }
}
