mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use herald_connectors::{DiscordClient, GatewayListener, PushPresence, TelegramClient};
use herald_core::TopicMutation;
use herald_engine::{Collaborators, Engine};
use herald_store::{Database, DeliveryRepo, TopicRepo};
use herald_telemetry::{MetricsRecorder, TelemetryGuard};

use crate::settings::HeraldSettings;

const INBOUND_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "herald", version, about = "Mirror Discord announcement channels into Telegram forum topics")]
struct Cli {
    /// Settings file (default: ~/.herald/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the forwarder until interrupted.
    Run {
        /// Do not start the status server.
        #[arg(long)]
        no_server: bool,
        /// Status server port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Reconcile topics against the destination once and print the report.
    Reconcile,
    /// Print the persisted source → topic mapping.
    Topics,
    /// Forget every topic mapping. Threads at the destination are left alone.
    ResetTopics {
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings =
        settings::load_settings(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(level) = cli.log_level {
        settings.logging.level = level;
    }

    match cli.command.unwrap_or(Command::Run {
        no_server: false,
        port: None,
    }) {
        Command::Run { no_server, port } => {
            if no_server {
                settings.server.enabled = false;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            run(settings).await
        }
        Command::Reconcile => reconcile_once(settings).await,
        Command::Topics => print_topics(&settings),
        Command::ResetTopics { yes } => reset_topics(&settings, yes),
    }
}

fn open_database(settings: &HeraldSettings) -> anyhow::Result<Database> {
    Database::open(&settings.database_path)
        .with_context(|| format!("failed to open {}", settings.database_path.display()))
}

struct Wiring {
    engine: Arc<Engine>,
    discord: Arc<DiscordClient>,
    presence: Arc<PushPresence>,
}

fn build_engine(
    settings: &HeraldSettings,
    db: &Database,
    metrics: Arc<MetricsRecorder>,
) -> anyhow::Result<Wiring> {
    let telegram = Arc::new(
        TelegramClient::new(settings.telegram_config())
            .context("set HERALD_TELEGRAM_BOT_TOKEN and HERALD_TELEGRAM_CHAT_ID")?,
    );
    let discord = Arc::new(
        DiscordClient::new(settings.discord_config()).context("set HERALD_DISCORD_TOKENS")?,
    );
    let presence = Arc::new(PushPresence::new());

    let collaborators = Collaborators {
        registry: discord.clone(),
        push: presence.clone(),
        pull: discord.clone(),
        threads: telegram.clone(),
        sender: telegram,
        topics: Arc::new(TopicRepo::new(db.clone())),
        ledger: Arc::new(DeliveryRepo::new(db.clone())),
    };
    let engine = Engine::new(settings.engine_config(), collaborators, metrics)
        .context("failed to load topic mappings")?;

    Ok(Wiring {
        engine,
        discord,
        presence,
    })
}

fn init_telemetry(settings: &HeraldSettings) -> TelemetryGuard {
    herald_telemetry::init_telemetry(&settings.telemetry_config())
}

async fn run(settings: HeraldSettings) -> anyhow::Result<()> {
    let telemetry = init_telemetry(&settings);
    tracing::info!("starting herald");

    let db = open_database(&settings)?;
    let Wiring {
        engine,
        discord,
        presence,
    } = build_engine(&settings, &db, telemetry.metrics())?;

    let startup = engine.startup().await.context("startup reconcile failed")?;
    tracing::info!(
        sources = startup.sources,
        removed = startup.reconcile.removed,
        deduplicated = startup.reconcile.deduplicated,
        forwarded = startup.initial_sync.forwarded,
        "startup complete"
    );

    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

    let mut listeners = Vec::new();
    if settings.discord.gateway_enabled {
        for (index, token) in discord.tokens().iter().enumerate() {
            let listener = GatewayListener::new(
                index,
                token.clone(),
                Arc::clone(&discord),
                Arc::clone(&presence),
                inbound_tx.clone(),
                settings.gateway_config(),
            );
            listeners.push(listener.spawn(cancel.clone()));
        }
        tracing::info!(connections = listeners.len(), "gateway listeners started");
    }
    drop(inbound_tx);

    let background = engine.spawn_background(cancel.clone(), inbound_rx);
    let snapshots = spawn_metrics_snapshots(&settings, telemetry.metrics(), cancel.clone());

    let server = if settings.server.enabled {
        let handle = herald_server::start(
            settings.server_config(),
            Arc::clone(&engine),
            cancel.clone(),
        )
        .await
        .context("failed to start status server")?;
        Some(handle)
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    cancel.cancel();
    background.join().await;
    for listener in listeners {
        let _ = listener.await;
    }
    let _ = snapshots.await;
    if let Some(server) = server {
        server.join().await;
    }
    if let Err(e) = telemetry.metrics().snapshot() {
        tracing::warn!(error = %e, "final metrics snapshot failed");
    }
    tracing::info!("stopped");
    Ok(())
}

fn spawn_metrics_snapshots(
    settings: &HeraldSettings,
    metrics: Arc<MetricsRecorder>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let telemetry = settings.telemetry_config();
    let period = Duration::from_secs(telemetry.metrics_snapshot_interval_secs.max(1));
    let retention_days = telemetry.metrics_retention_days;
    tokio::spawn(async move {
        if !metrics.is_persistent() {
            return;
        }
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = metrics.snapshot() {
                        tracing::warn!(error = %e, "metrics snapshot failed");
                    }
                    if let Err(e) = metrics.prune(retention_days) {
                        tracing::warn!(error = %e, "metrics prune failed");
                    }
                }
            }
        }
    })
}

async fn reconcile_once(settings: HeraldSettings) -> anyhow::Result<()> {
    let telemetry = init_telemetry(&settings);
    let db = open_database(&settings)?;
    let wiring = build_engine(&settings, &db, telemetry.metrics())?;

    if let Err(e) = wiring.engine.load_registry().await {
        tracing::warn!(error = %e, "registry unavailable, unlisted sources will not be pruned");
    }
    let report = wiring.engine.reconcile().await.context("reconcile failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_topics(settings: &HeraldSettings) -> anyhow::Result<()> {
    let db = open_database(settings)?;
    let topics = TopicRepo::new(db).list().context("failed to read topics")?;
    if topics.is_empty() {
        println!("no topics");
        return Ok(());
    }
    for (source, record) in topics {
        println!(
            "{:<32} thread {:<10} {}  (created {})",
            source.as_str(),
            record.thread_id.get(),
            record.display_name,
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn reset_topics(settings: &HeraldSettings, confirmed: bool) -> anyhow::Result<()> {
    if !confirmed {
        bail!("refusing to clear topic mappings without --yes");
    }
    let db = open_database(settings)?;
    let repo = TopicRepo::new(db);
    let count = repo.list().context("failed to read topics")?.len();
    repo.apply_batch(&[TopicMutation::Clear])
        .context("failed to clear topics")?;
    println!("cleared {count} topic mappings");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::{ThreadId, TopicRecord};

    fn temp_settings() -> HeraldSettings {
        HeraldSettings {
            database_path: std::env::temp_dir()
                .join(format!("herald-main-{}", uuid::Uuid::now_v7()))
                .join("herald.db"),
            ..HeraldSettings::default()
        }
    }

    #[test]
    fn cli_defaults_to_run() {
        let cli = Cli::parse_from(["herald"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["herald", "run", "--no-server", "--port", "9999"]);
        assert!(matches!(
            cli.command,
            Some(Command::Run { no_server: true, port: Some(9999) })
        ));
    }

    #[test]
    fn cli_parses_maintenance_commands() {
        let cli = Cli::parse_from(["herald", "--config", "/tmp/h.json", "reset-topics", "--yes"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/h.json")));
        assert!(matches!(cli.command, Some(Command::ResetTopics { yes: true })));
        assert!(matches!(
            Cli::parse_from(["herald", "reconcile"]).command,
            Some(Command::Reconcile)
        ));
    }

    #[test]
    fn reset_requires_confirmation() {
        let settings = temp_settings();
        assert!(reset_topics(&settings, false).is_err());
    }

    #[test]
    fn reset_clears_persisted_topics() {
        let settings = temp_settings();
        let db = open_database(&settings).unwrap();
        let repo = TopicRepo::new(db.clone());
        repo.apply_batch(&[TopicMutation::Put {
            source: "Alpha".into(),
            record: TopicRecord::new(ThreadId::new(5), "🏰 Alpha"),
        }])
        .unwrap();

        reset_topics(&settings, true).unwrap();

        assert!(TopicRepo::new(db).list().unwrap().is_empty());
        if let Some(dir) = settings.database_path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn engine_needs_credentials() {
        let settings = temp_settings();
        let db = Database::in_memory().unwrap();
        let err = build_engine(&settings, &db, Arc::new(MetricsRecorder::in_memory()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("HERALD_TELEGRAM_BOT_TOKEN"));
    }
}
