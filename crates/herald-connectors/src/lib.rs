//! Network adapters for the collaborator traits in `herald-core`.
//!
//! - [`telegram`]: forum-topic destination over the Telegram Bot API.
//! - [`discord`]: source registry and pull client over the Discord REST API.
//! - [`gateway`]: push listener over the Discord gateway websocket.
//! - [`presence`]: which channels each gateway connection currently sees.

pub mod discord;
pub mod error;
pub mod gateway;
pub mod presence;
pub mod telegram;

pub use discord::{is_announcement_channel, DiscordClient, DiscordConfig};
pub use error::ConnectorError;
pub use gateway::{GatewayConfig, GatewayListener};
pub use presence::PushPresence;
pub use telegram::{TelegramClient, TelegramConfig};
