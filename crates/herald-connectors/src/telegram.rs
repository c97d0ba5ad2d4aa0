//! Telegram Bot API destination: one forum supergroup, one topic per source.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use herald_core::provider::{MessageSender, ThreadProvider};
use herald_core::{DestinationError, MessageId, ThreadId};

use crate::error::ConnectorError;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Forum topic names longer than this are rejected by the API.
const MAX_TOPIC_NAME_CHARS: usize = 128;

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: SecretString,
    /// Numeric id (`-100…`) or `@username` of the forum supergroup.
    pub chat_id: String,
    pub request_timeout: Duration,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: SecretString::from(String::new()),
            chat_id: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Deserialize)]
struct Chat {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_forum: bool,
}

#[derive(Deserialize)]
struct ForumTopic {
    message_thread_id: i64,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

pub struct TelegramClient {
    client: Client,
    api_base: String,
    bot_token: SecretString,
    chat_id: String,
    request_timeout: Duration,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Result<Self, ConnectorError> {
        if config.bot_token.expose_secret().trim().is_empty() {
            return Err(ConnectorError::MissingCredentials("telegram bot token"));
        }
        if config.chat_id.trim().is_empty() {
            return Err(ConnectorError::MissingCredentials("telegram chat id"));
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token,
            chat_id: config.chat_id,
            request_timeout: config.request_timeout,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base,
            self.bot_token.expose_secret(),
            method
        )
    }

    /// POST a Bot API method and unwrap its `result`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
    ) -> Result<T, DestinationError> {
        let resp = self
            .client
            .post(self.endpoint(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;

        let parsed: ApiResponse<T> = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(_) if (200..300).contains(&status) => {
                return Err(DestinationError::InvalidRequest(format!(
                    "{method}: unparseable response"
                )));
            }
            Err(_) => return Err(DestinationError::from_status(status, text)),
        };

        if parsed.ok {
            return parsed.result.ok_or_else(|| {
                DestinationError::InvalidRequest(format!("{method}: response without result"))
            });
        }

        let code = parsed.error_code.unwrap_or(status);
        let description = parsed.description.unwrap_or(text);
        if code == 429 {
            let retry_after = parsed
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs);
            return Err(DestinationError::RateLimited { retry_after });
        }
        Err(DestinationError::from_status(code, description))
    }

    fn transport_error(&self, e: reqwest::Error) -> DestinationError {
        if e.is_timeout() {
            DestinationError::Timeout(self.request_timeout)
        } else {
            DestinationError::Network(e.without_url().to_string())
        }
    }
}

fn topic_name(name: &str) -> String {
    name.chars().take(MAX_TOPIC_NAME_CHARS).collect()
}

#[async_trait]
impl ThreadProvider for TelegramClient {
    async fn supports_threads(&self) -> Result<bool, DestinationError> {
        let chat: Chat = self.call("getChat", json!({ "chat_id": self.chat_id })).await?;
        Ok(chat.kind == "supergroup" && chat.is_forum)
    }

    #[instrument(skip(self))]
    async fn create_thread(&self, name: &str) -> Result<ThreadId, DestinationError> {
        let topic: ForumTopic = self
            .call(
                "createForumTopic",
                json!({ "chat_id": self.chat_id, "name": topic_name(name) }),
            )
            .await?;
        debug!(thread_id = topic.message_thread_id, "forum topic created");
        Ok(ThreadId::new(topic.message_thread_id))
    }

    /// A chat action addressed to the topic: accepted while the topic exists,
    /// rejected with a missing-thread error once it is deleted.
    #[instrument(skip(self), fields(thread_id = %thread))]
    async fn thread_exists(&self, thread: ThreadId) -> Result<bool, DestinationError> {
        let outcome: Result<bool, _> = self
            .call(
                "sendChatAction",
                json!({
                    "chat_id": self.chat_id,
                    "message_thread_id": thread.get(),
                    "action": "typing",
                }),
            )
            .await;
        match outcome {
            Ok(_) => Ok(true),
            Err(DestinationError::ThreadNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(thread_id = %thread))]
    async fn close_thread(&self, thread: ThreadId) -> Result<(), DestinationError> {
        let outcome: Result<bool, _> = self
            .call(
                "closeForumTopic",
                json!({ "chat_id": self.chat_id, "message_thread_id": thread.get() }),
            )
            .await;
        match outcome {
            Ok(_) => Ok(()),
            // Already closed.
            Err(DestinationError::InvalidRequest(d)) if d.contains("TOPIC_NOT_MODIFIED") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MessageSender for TelegramClient {
    async fn send_message(
        &self,
        thread: Option<ThreadId>,
        text: &str,
    ) -> Result<MessageId, DestinationError> {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(thread) = thread {
            body["message_thread_id"] = json!(thread.get());
        }
        let sent: SentMessage = self.call("sendMessage", body).await?;
        Ok(MessageId::new(sent.message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> TelegramClient {
        TelegramClient::new(TelegramConfig {
            api_base: server.base_url(),
            bot_token: SecretString::from("test-token".to_string()),
            chat_id: "-1001".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn rejects_missing_credentials() {
        let err = TelegramClient::new(TelegramConfig::default()).err().unwrap();
        assert!(matches!(err, ConnectorError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn forum_supergroup_supports_threads() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/getChat")
                .body_includes("\"chat_id\":\"-1001\"");
            then.status(200).json_body(
                serde_json::json!({"ok": true, "result": {"id": -1001, "type": "supergroup", "is_forum": true}}),
            );
        });

        assert!(client(&server).supports_threads().await.unwrap());
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn plain_group_has_no_threads() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getChat");
            then.status(200)
                .json_body(serde_json::json!({"ok": true, "result": {"id": -1001, "type": "group"}}));
        });

        assert!(!client(&server).supports_threads().await.unwrap());
    }

    #[tokio::test]
    async fn create_thread_returns_topic_id() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/createForumTopic")
                .body_includes("\"name\":\"🏰 Alpha\"");
            then.status(200).json_body(serde_json::json!({
                "ok": true,
                "result": {"message_thread_id": 77, "name": "🏰 Alpha", "icon_color": 0}
            }));
        });

        let thread = client(&server).create_thread("🏰 Alpha").await.unwrap();
        assert_eq!(thread, ThreadId::new(77));
        mock.assert_calls(1);
    }

    #[test]
    fn long_topic_names_are_truncated() {
        let long = "x".repeat(300);
        assert_eq!(topic_name(&long).chars().count(), MAX_TOPIC_NAME_CHARS);
        assert_eq!(topic_name("🏰 Alpha"), "🏰 Alpha");
    }

    #[tokio::test]
    async fn thread_exists_reads_chat_action_outcome() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendChatAction")
                .body_includes("\"message_thread_id\":5");
            then.status(200).json_body(serde_json::json!({"ok": true, "result": true}));
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendChatAction")
                .body_includes("\"message_thread_id\":6");
            then.status(400).json_body(serde_json::json!({
                "ok": false, "error_code": 400, "description": "Bad Request: message thread not found"
            }));
        });

        let tg = client(&server);
        assert!(tg.thread_exists(ThreadId::new(5)).await.unwrap());
        assert!(!tg.thread_exists(ThreadId::new(6)).await.unwrap());
    }

    #[tokio::test]
    async fn thread_exists_propagates_inconclusive_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendChatAction");
            then.status(502).body("Bad Gateway");
        });

        let err = client(&server).thread_exists(ThreadId::new(5)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn close_thread_tolerates_already_closed() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/closeForumTopic");
            then.status(400).json_body(serde_json::json!({
                "ok": false, "error_code": 400, "description": "Bad Request: TOPIC_NOT_MODIFIED"
            }));
        });

        client(&server).close_thread(ThreadId::new(9)).await.unwrap();
    }

    #[tokio::test]
    async fn send_message_targets_thread() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendMessage")
                .body_includes("\"message_thread_id\":77")
                .body_includes("\"text\":\"hello\"");
            then.status(200)
                .json_body(serde_json::json!({"ok": true, "result": {"message_id": 55}}));
        });

        let id = client(&server)
            .send_message(Some(ThreadId::new(77)), "hello")
            .await
            .unwrap();
        assert_eq!(id, MessageId::new(55));
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn send_message_without_thread_omits_thread_id() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendMessage")
                .body_includes("message_thread_id");
            then.status(500);
        });
        let plain = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(200)
                .json_body(serde_json::json!({"ok": true, "result": {"message_id": 3}}));
        });

        client(&server).send_message(None, "hello").await.unwrap();
        plain.assert_calls(1);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(429).json_body(serde_json::json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 3",
                "parameters": {"retry_after": 3}
            }));
        });

        let err = client(&server).send_message(None, "x").await.unwrap_err();
        assert_eq!(
            err,
            DestinationError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }

    #[tokio::test]
    async fn deleted_topic_maps_to_thread_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(400).json_body(serde_json::json!({
                "ok": false, "error_code": 400, "description": "Bad Request: message thread not found"
            }));
        });

        let err = client(&server)
            .send_message(Some(ThreadId::new(4)), "x")
            .await
            .unwrap_err();
        assert_eq!(err, DestinationError::ThreadNotFound);
    }

    #[tokio::test]
    async fn forbidden_is_permanent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(403).json_body(serde_json::json!({
                "ok": false, "error_code": 403, "description": "Forbidden: bot was kicked from the supergroup chat"
            }));
        });

        let err = client(&server).send_message(None, "x").await.unwrap_err();
        assert!(err.is_permanent());
    }
}
