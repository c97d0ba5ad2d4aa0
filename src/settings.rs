//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`HeraldSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `HERALD_*` environment overrides (highest priority after CLI flags)
//!
//! Credentials are never read from or written to the settings file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn, Level};

use herald_connectors::{DiscordConfig, GatewayConfig, TelegramConfig};
use herald_engine::{AdmissionConfig, EngineConfig, FormatOptions, RetryPolicy, VerifierConfig};
use herald_server::ServerConfig;
use herald_telemetry::TelemetryConfig;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeraldSettings {
    pub telegram: TelegramSettings,
    pub discord: DiscordSettings,
    pub admission: AdmissionSettings,
    pub delivery: DeliverySettings,
    pub sync: SyncSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    /// SQLite file holding topics and the delivery ledger.
    pub database_path: PathBuf,
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for HeraldSettings {
    fn default() -> Self {
        Self {
            telegram: TelegramSettings::default(),
            discord: DiscordSettings::default(),
            admission: AdmissionSettings::default(),
            delivery: DeliverySettings::default(),
            sync: SyncSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
            database_path: herald_telemetry::herald_home().join("database/herald.db"),
            credentials: Credentials::default(),
        }
    }
}

/// Secrets, taken from the environment only.
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub telegram_bot_token: Option<SecretString>,
    pub discord_tokens: Vec<SecretString>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramSettings {
    pub api_base: String,
    pub chat_id: String,
    pub request_timeout_secs: u64,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            api_base: herald_connectors::telegram::DEFAULT_API_BASE.to_string(),
            chat_id: String::new(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscordSettings {
    pub api_base: String,
    pub request_timeout_secs: u64,
    pub gateway_enabled: bool,
    pub gateway_url: Option<String>,
    pub reconnect_delay_secs: u64,
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            api_base: herald_connectors::discord::DEFAULT_API_BASE.to_string(),
            request_timeout_secs: 15,
            gateway_enabled: true,
            gateway_url: None,
            reconnect_delay_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionSettings {
    pub verification_delay_secs: u64,
    pub grace_period_secs: u64,
    pub sweep_interval_secs: u64,
    pub retention_secs: u64,
    pub probe_timeout_secs: u64,
    pub backlog_limit: usize,
    pub notice_on_admission: bool,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            verification_delay_secs: 300,
            grace_period_secs: 60,
            sweep_interval_secs: 30,
            retention_secs: 3600,
            probe_timeout_secs: 5,
            backlog_limit: 5,
            notice_on_admission: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub jitter_factor: f64,
    pub max_thread_repairs: u32,
    pub show_timestamp: bool,
    pub destination_timeout_secs: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_secs: 60,
            jitter_factor: 0.2,
            max_thread_repairs: 1,
            show_timestamp: true,
            destination_timeout_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub initial_sync: bool,
    pub initial_sync_limit: usize,
    pub fallback_interval_secs: u64,
    pub fallback_limit: usize,
    pub fallback_window_secs: u64,
    pub registry_refresh_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            initial_sync: true,
            initial_sync_limit: 5,
            fallback_interval_secs: 300,
            fallback_limit: 3,
            fallback_window_secs: 120,
            registry_refresh_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            enabled: true,
            host: defaults.host,
            port: defaults.port,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub persist_warnings: bool,
    pub persist_metrics: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            persist_warnings: true,
            persist_metrics: true,
        }
    }
}

/// Intervals of zero would spin; everything periodic runs at most once a second.
fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

impl HeraldSettings {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            admission: AdmissionConfig {
                verification_delay: Duration::from_secs(self.admission.verification_delay_secs),
                grace_period: Duration::from_secs(self.admission.grace_period_secs),
                sweep_interval: secs(self.admission.sweep_interval_secs),
                retention: Duration::from_secs(self.admission.retention_secs),
            },
            verifier: VerifierConfig {
                probe_timeout: secs(self.admission.probe_timeout_secs),
            },
            retry: RetryPolicy {
                max_retries: self.delivery.max_retries,
                base_delay: Duration::from_millis(self.delivery.base_delay_ms),
                max_delay: secs(self.delivery.max_delay_secs),
                jitter_factor: self.delivery.jitter_factor.clamp(0.0, 1.0),
                max_thread_repairs: self.delivery.max_thread_repairs,
            },
            format: FormatOptions {
                show_timestamp: self.delivery.show_timestamp,
            },
            destination_timeout: secs(self.delivery.destination_timeout_secs),
            backlog_limit: self.admission.backlog_limit,
            initial_sync: self.sync.initial_sync,
            initial_sync_limit: self.sync.initial_sync_limit,
            fallback_interval: secs(self.sync.fallback_interval_secs),
            fallback_limit: self.sync.fallback_limit,
            fallback_window: Duration::from_secs(self.sync.fallback_window_secs),
            registry_refresh: secs(self.sync.registry_refresh_secs),
            notice_on_admission: self.admission.notice_on_admission,
        }
    }

    pub fn telegram_config(&self) -> TelegramConfig {
        TelegramConfig {
            api_base: self.telegram.api_base.clone(),
            bot_token: self
                .credentials
                .telegram_bot_token
                .clone()
                .unwrap_or_else(|| SecretString::from(String::new())),
            chat_id: self.telegram.chat_id.clone(),
            request_timeout: secs(self.telegram.request_timeout_secs),
        }
    }

    pub fn discord_config(&self) -> DiscordConfig {
        DiscordConfig {
            api_base: self.discord.api_base.clone(),
            tokens: self.credentials.discord_tokens.clone(),
            request_timeout: secs(self.discord.request_timeout_secs),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            url_override: self.discord.gateway_url.clone(),
            reconnect_delay: secs(self.discord.reconnect_delay_secs),
            ..GatewayConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            ..ServerConfig::default()
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: parse_level(&self.logging.level).unwrap_or(Level::INFO),
            json_logs: self.logging.json,
            log_to_sqlite: self.logging.persist_warnings,
            metrics_persist: self.logging.persist_metrics,
            ..TelemetryConfig::default()
        }
    }
}

/// `~/.herald/settings.json`.
pub fn settings_path() -> PathBuf {
    herald_telemetry::herald_home().join("settings.json")
}

/// Load settings from `path` (or the default path) with env overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<HeraldSettings> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(settings_path);
    let mut settings = load_file(&path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn load_file(path: &Path) -> Result<HeraldSettings> {
    let defaults = serde_json::to_value(HeraldSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursive merge: objects merge per key, everything else is replaced,
/// nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HERALD_*` overrides read through `lookup`. Invalid values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut HeraldSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = Env { lookup };

    if let Some(v) = env.secret("HERALD_TELEGRAM_BOT_TOKEN") {
        settings.credentials.telegram_bot_token = Some(v);
    }
    if let Some(v) = env.string("HERALD_DISCORD_TOKENS") {
        settings.credentials.discord_tokens = split_tokens(&v);
    }
    if let Some(v) = env.string("HERALD_TELEGRAM_CHAT_ID") {
        settings.telegram.chat_id = v;
    }
    if let Some(v) = env.string("HERALD_TELEGRAM_API_BASE") {
        settings.telegram.api_base = v;
    }
    if let Some(v) = env.string("HERALD_DISCORD_API_BASE") {
        settings.discord.api_base = v;
    }
    if let Some(v) = env.bool("HERALD_GATEWAY_ENABLED") {
        settings.discord.gateway_enabled = v;
    }
    if let Some(v) = env.string("HERALD_DATABASE_PATH") {
        settings.database_path = PathBuf::from(v);
    }
    if let Some(v) = env.u64("HERALD_VERIFICATION_DELAY_SECS", 0, 86_400) {
        settings.admission.verification_delay_secs = v;
    }
    if let Some(v) = env.u64("HERALD_GRACE_PERIOD_SECS", 0, 86_400) {
        settings.admission.grace_period_secs = v;
    }
    if let Some(v) = env.u64("HERALD_FALLBACK_INTERVAL_SECS", 1, 86_400) {
        settings.sync.fallback_interval_secs = v;
    }
    if let Some(v) = env.bool("HERALD_INITIAL_SYNC") {
        settings.sync.initial_sync = v;
    }
    if let Some(v) = env.bool("HERALD_SHOW_TIMESTAMP") {
        settings.delivery.show_timestamp = v;
    }
    if let Some(v) = env.bool("HERALD_SERVER_ENABLED") {
        settings.server.enabled = v;
    }
    if let Some(v) = env.string("HERALD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("HERALD_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("HERALD_LOG_LEVEL") {
        if parse_level(&v).is_some() {
            settings.logging.level = v;
        } else {
            warn!(key = "HERALD_LOG_LEVEL", value = %v, "invalid log level, ignoring");
        }
    }
    if let Some(v) = env.bool("HERALD_LOG_JSON") {
        settings.logging.json = v;
    }
}

fn split_tokens(raw: &str) -> Vec<SecretString> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| SecretString::from(t.to_string()))
        .collect()
}

pub fn parse_level(val: &str) -> Option<Level> {
    val.trim().parse().ok()
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn secret(&self, name: &str) -> Option<SecretString> {
        self.string(name).map(SecretString::from)
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.u64(name, u64::from(min), u64::from(max))
            .and_then(|n| u16::try_from(n).ok())
    }
}
