//! Discord REST: guild and channel listing, access probes, recent messages.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use herald_core::events::RawEvent;
use herald_core::provider::{PullClient, SourceRegistry};
use herald_core::{
    ChannelId, ChannelMap, ChannelRef, ProbeError, Registry, SourceError, SourceEvent, SourceName,
};

use crate::error::ConnectorError;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v9";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CHANNEL_TEXT: u8 = 0;
const CHANNEL_ANNOUNCEMENT: u8 = 5;
const ANNOUNCEMENT_KEYWORDS: &[&str] = &["announce", "news", "объявлен", "анонс"];

/// Whether a guild channel should be monitored: announcement channels, and
/// text channels whose name marks them as news.
pub fn is_announcement_channel(kind: u8, name: &str) -> bool {
    if kind == CHANNEL_ANNOUNCEMENT {
        return true;
    }
    if kind != CHANNEL_TEXT {
        return false;
    }
    let lower = name.to_lowercase();
    ANNOUNCEMENT_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[derive(Clone, Debug)]
pub struct DiscordConfig {
    pub api_base: String,
    /// Account tokens, tried in order.
    pub tokens: Vec<SecretString>,
    pub request_timeout: Duration,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            tokens: Vec::new(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Guild {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Author {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Message {
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub author: Author,
}

impl Message {
    /// Loosely-typed event for boundary validation.
    pub(crate) fn into_raw(self, source: &SourceName, channel_name: &str) -> RawEvent {
        RawEvent {
            id: Some(self.id),
            source: Some(source.to_string()),
            channel_id: Some(self.channel_id),
            channel_name: Some(channel_name.to_string()),
            author: self.author.global_name.or(self.author.username),
            content: self.content,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct GatewayInfo {
    url: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

pub struct DiscordClient {
    client: Client,
    api_base: String,
    tokens: Vec<SecretString>,
    request_timeout: Duration,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> Result<Self, ConnectorError> {
        if config.tokens.is_empty() {
            return Err(ConnectorError::MissingCredentials("discord token"));
        }
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            tokens: config.tokens,
            request_timeout: config.request_timeout,
        })
    }

    pub fn tokens(&self) -> &[SecretString] {
        &self.tokens
    }

    /// Websocket URL of the gateway.
    pub async fn gateway_url(&self) -> Result<String, SourceError> {
        let token = self
            .tokens
            .first()
            .ok_or_else(|| SourceError::Unauthorized("no tokens".into()))?;
        let info: GatewayInfo = self.get_json(token, "/gateway").await?;
        Ok(info.url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        token: &SecretString,
        path: &str,
    ) -> Result<T, SourceError> {
        let resp = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .header("Authorization", token.expose_secret())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status == 429 {
                let retry_after = serde_json::from_str::<RateLimitBody>(&body)
                    .ok()
                    .and_then(|b| b.retry_after)
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(Duration::from_secs_f64);
                return Err(SourceError::RateLimited { retry_after });
            }
            return Err(SourceError::from_status(status, body));
        }
        resp.json()
            .await
            .map_err(|e| SourceError::Malformed(e.without_url().to_string()))
    }

    fn transport_error(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::Timeout(self.request_timeout)
        } else {
            SourceError::Network(e.without_url().to_string())
        }
    }

    async fn list_with_token(&self, token: &SecretString) -> Result<Registry, SourceError> {
        let guilds: Vec<Guild> = self.get_json(token, "/users/@me/guilds").await?;
        let mut registry = Registry::new();
        for guild in guilds {
            let channels: Vec<Channel> = match self
                .get_json(token, &format!("/guilds/{}/channels", guild.id))
                .await
            {
                Ok(channels) => channels,
                Err(e) if e.is_access_denied() => {
                    debug!(guild = %guild.name, error = %e, "guild channels not listable");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let monitored: ChannelMap = channels
                .into_iter()
                .filter(|c| is_announcement_channel(c.kind, &c.name))
                .map(|c| (ChannelId::from_raw(c.id), c.name))
                .collect();
            if !monitored.is_empty() {
                registry
                    .entry(SourceName::from_raw(guild.name))
                    .or_default()
                    .extend(monitored);
            }
        }
        Ok(registry)
    }

    async fn messages(
        &self,
        channel: &ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>, SourceError> {
        let path = format!("/channels/{channel}/messages?limit={limit}");
        let mut last_err = None;
        for token in &self.tokens {
            match self.get_json(token, &path).await {
                Ok(messages) => return Ok(messages),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| SourceError::Unauthorized("no tokens".into())))
    }
}

#[async_trait]
impl SourceRegistry for DiscordClient {
    /// Union of the guilds every token can see. Fails only when every token fails.
    #[instrument(skip(self))]
    async fn list_sources(&self) -> Result<Registry, SourceError> {
        let mut merged = Registry::new();
        let mut last_err = None;
        let mut any_ok = false;
        for (index, token) in self.tokens.iter().enumerate() {
            match self.list_with_token(token).await {
                Ok(registry) => {
                    any_ok = true;
                    for (source, channels) in registry {
                        merged.entry(source).or_default().extend(channels);
                    }
                }
                Err(e) => {
                    warn!(token_index = index, error = %e, "guild listing failed");
                    last_err = Some(e);
                }
            }
        }
        match (any_ok, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(merged),
        }
    }
}

#[async_trait]
impl PullClient for DiscordClient {
    async fn probe_fetch(&self, channel: &ChannelId) -> Result<bool, ProbeError> {
        match self.messages(channel, 1).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_access_denied() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(source = %channel.source, channel_id = %channel.id))]
    async fn fetch_recent(
        &self,
        channel: &ChannelRef,
        limit: usize,
    ) -> Result<Vec<SourceEvent>, SourceError> {
        let messages = self.messages(&channel.id, limit.clamp(1, 100)).await?;
        let events = messages
            .into_iter()
            .filter_map(|m| {
                let id = m.id.clone();
                match m.into_raw(&channel.source, &channel.name).validate() {
                    Ok(event) => Some(event),
                    Err(reason) => {
                        debug!(message_id = %id, %reason, "message skipped");
                        None
                    }
                }
            })
            .collect();
        Ok(events)
    }
}
