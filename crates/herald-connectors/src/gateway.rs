//! Push path: one Discord gateway connection per account token.
//!
//! The listener keeps the connection alive with heartbeats, records which
//! channels the connection can see in [`PushPresence`], and forwards guild
//! discoveries and new messages to the engine as [`InboundEvent`]s. When the
//! connection drops the presence entry is cleared and the listener reconnects
//! after a fixed delay until cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use herald_core::{ChannelId, ChannelMap, InboundEvent, SourceName};

use crate::discord::{is_announcement_channel, Channel, DiscordClient, Message};
use crate::error::ConnectorError;
use crate::presence::PushPresence;

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
pub const DEFAULT_INTENTS: u64 = 1 | 512 | 32768;
const DEFAULT_HEARTBEAT_MS: u64 = 41_250;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Skip the REST lookup and connect here.
    pub url_override: Option<String>,
    pub intents: u64,
    pub reconnect_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url_override: None,
            intents: DEFAULT_INTENTS,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Deserialize)]
struct Payload {
    op: u8,
    #[serde(default)]
    d: Value,
    s: Option<u64>,
    t: Option<String>,
}

#[derive(Deserialize)]
struct GuildProperties {
    name: Option<String>,
}

#[derive(Deserialize)]
struct GuildPayload {
    id: String,
    name: Option<String>,
    properties: Option<GuildProperties>,
    #[serde(default)]
    channels: Vec<Channel>,
}

#[derive(Deserialize)]
struct ReadyPayload {
    #[serde(default)]
    guilds: Vec<GuildPayload>,
}

#[derive(Deserialize)]
struct MessageCreate {
    guild_id: Option<String>,
    #[serde(flatten)]
    message: Message,
}

struct GuildState {
    source: SourceName,
    channels: HashMap<ChannelId, String>,
}

/// What the connection should do after a frame.
#[derive(Debug)]
enum Step {
    Send(Value),
    Identify,
    StartHeartbeat(Duration),
    Presence(HashSet<ChannelId>),
    Emit(InboundEvent),
    Reconnect,
}

/// Protocol state of one gateway session. Performs no I/O.
#[derive(Default)]
struct Session {
    seq: Option<u64>,
    guilds: HashMap<String, GuildState>,
}

impl Session {
    fn heartbeat(&self) -> Value {
        json!({ "op": OP_HEARTBEAT, "d": self.seq })
    }

    fn on_text(&mut self, text: &str) -> Vec<Step> {
        match serde_json::from_str::<Payload>(text) {
            Ok(payload) => self.on_payload(payload),
            Err(e) => {
                warn!(error = %e, "unparseable gateway frame");
                Vec::new()
            }
        }
    }

    fn on_payload(&mut self, payload: Payload) -> Vec<Step> {
        match payload.op {
            OP_HELLO => {
                let ms = payload
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_HEARTBEAT_MS);
                vec![Step::StartHeartbeat(Duration::from_millis(ms)), Step::Identify]
            }
            OP_HEARTBEAT => vec![Step::Send(self.heartbeat())],
            OP_HEARTBEAT_ACK => {
                debug!("heartbeat acknowledged");
                Vec::new()
            }
            OP_RECONNECT | OP_INVALID_SESSION => vec![Step::Reconnect],
            OP_DISPATCH => {
                if payload.s.is_some() {
                    self.seq = payload.s;
                }
                match payload.t.as_deref() {
                    Some("READY") => self.on_ready(payload.d),
                    Some("GUILD_CREATE") => self.on_guilds(vec![payload.d]),
                    Some("MESSAGE_CREATE") => self.on_message(payload.d).into_iter().collect(),
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_ready(&mut self, d: Value) -> Vec<Step> {
        match serde_json::from_value::<ReadyPayload>(d) {
            Ok(ready) => {
                info!(guilds = ready.guilds.len(), "gateway ready");
                self.load_guilds(ready.guilds)
            }
            Err(e) => {
                warn!(error = %e, "malformed READY payload");
                Vec::new()
            }
        }
    }

    fn on_guilds(&mut self, raw: Vec<Value>) -> Vec<Step> {
        let guilds = raw
            .into_iter()
            .filter_map(|d| match serde_json::from_value::<GuildPayload>(d) {
                Ok(guild) => Some(guild),
                Err(e) => {
                    warn!(error = %e, "malformed guild payload");
                    None
                }
            })
            .collect();
        self.load_guilds(guilds)
    }

    /// Record guilds, refresh presence, and report their announcement channels.
    fn load_guilds(&mut self, guilds: Vec<GuildPayload>) -> Vec<Step> {
        let mut discoveries = Vec::new();
        for guild in guilds {
            let Some(name) = guild.name.or(guild.properties.and_then(|p| p.name)) else {
                continue;
            };
            let source = SourceName::from_raw(name);
            let announcements: ChannelMap = guild
                .channels
                .iter()
                .filter(|c| is_announcement_channel(c.kind, &c.name))
                .map(|c| (ChannelId::from_raw(c.id.clone()), c.name.clone()))
                .collect();
            let channels = guild
                .channels
                .into_iter()
                .map(|c| (ChannelId::from_raw(c.id), c.name))
                .collect();
            if !announcements.is_empty() {
                discoveries.push(Step::Emit(InboundEvent::SourceDiscovered {
                    source: source.clone(),
                    channels: announcements,
                }));
            }
            self.guilds.insert(guild.id, GuildState { source, channels });
        }

        let mut steps = vec![Step::Presence(self.visible())];
        steps.extend(discoveries);
        steps
    }

    fn visible(&self) -> HashSet<ChannelId> {
        self.guilds
            .values()
            .flat_map(|g| g.channels.keys().cloned())
            .collect()
    }

    fn on_message(&self, d: Value) -> Option<Step> {
        let created: MessageCreate = match serde_json::from_value(d) {
            Ok(created) => created,
            Err(e) => {
                debug!(error = %e, "malformed MESSAGE_CREATE");
                return None;
            }
        };
        let guild = self.guilds.get(created.guild_id.as_deref()?)?;
        let channel_id = ChannelId::from_raw(created.message.channel_id.clone());
        let channel_name = guild
            .channels
            .get(&channel_id)
            .cloned()
            .unwrap_or_else(|| channel_id.to_string());
        match created.message.into_raw(&guild.source, &channel_name).validate() {
            Ok(event) => Some(Step::Emit(InboundEvent::Message(event))),
            Err(reason) => {
                debug!(%reason, "push message skipped");
                None
            }
        }
    }
}

async fn next_beat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub struct GatewayListener {
    connection: usize,
    token: SecretString,
    discord: Arc<DiscordClient>,
    presence: Arc<PushPresence>,
    events: mpsc::Sender<InboundEvent>,
    config: GatewayConfig,
}

impl GatewayListener {
    pub fn new(
        connection: usize,
        token: SecretString,
        discord: Arc<DiscordClient>,
        presence: Arc<PushPresence>,
        events: mpsc::Sender<InboundEvent>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            connection,
            token,
            discord,
            presence,
            events,
            config,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Connect, listen, reconnect; returns once `cancel` fires.
    #[instrument(skip_all, fields(connection = self.connection))]
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            match self.session(&cancel).await {
                Ok(()) => info!("gateway session ended"),
                Err(e) => warn!(error = %e, "gateway session failed"),
            }
            self.presence.clear(self.connection);
            if self.events.is_closed() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
        debug!("gateway listener stopped");
    }

    fn identify(&self) -> Value {
        json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.token.expose_secret(),
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "herald",
                    "device": "herald",
                },
                "compress": false,
                "large_threshold": 50,
                "intents": self.config.intents,
            }
        })
    }

    async fn session(&self, cancel: &CancellationToken) -> Result<(), ConnectorError> {
        let base = match &self.config.url_override {
            Some(url) => url.clone(),
            None => self.discord.gateway_url().await?,
        };
        let url = format!("{}/?v=9&encoding=json", base.trim_end_matches('/'));
        let (stream, _response) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connected = connect_async(url.as_str()) => connected?,
        };
        info!("gateway connected");
        let (mut sink, mut source) = stream.split();

        let mut session = Session::default();
        let mut heartbeat: Option<Interval> = None;

        loop {
            let steps = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                _ = next_beat(&mut heartbeat) => vec![Step::Send(session.heartbeat())],
                frame = source.next() => {
                    let Some(frame) = frame else {
                        return Err(ConnectorError::Protocol("stream ended".into()));
                    };
                    match frame? {
                        WsMessage::Text(text) => session.on_text(&text),
                        WsMessage::Binary(bytes) => session.on_text(&String::from_utf8_lossy(&bytes)),
                        WsMessage::Close(frame) => {
                            return Err(ConnectorError::Protocol(format!("closed by server: {frame:?}")));
                        }
                        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Vec::new(),
                    }
                }
            };

            for step in steps {
                match step {
                    Step::Send(payload) => {
                        sink.send(WsMessage::Text(payload.to_string().into())).await?;
                    }
                    Step::Identify => {
                        sink.send(WsMessage::Text(self.identify().to_string().into()))
                            .await?;
                    }
                    Step::StartHeartbeat(period) => {
                        let mut interval = interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        heartbeat = Some(interval);
                    }
                    Step::Presence(channels) => self.presence.replace(self.connection, channels),
                    Step::Emit(event) => {
                        if self.events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    Step::Reconnect => {
                        return Err(ConnectorError::Protocol("server requested reconnect".into()));
                    }
                }
            }
        }
    }
}
