//! Engine wiring.
//!
//! `Engine` owns the topic store, verifier, pending queue, synchronizer,
//! guard and dispatcher, and exposes the operations the process drives:
//! startup, discovery, delivery, admission sweeps, fallback polling and
//! on-demand reconciliation. Background loops only call these operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use herald_core::provider::{
    DeliveryLedger, MessageSender, PullClient, PushSnapshot, SourceRegistry, ThreadProvider,
    TopicPersistence,
};
use herald_core::{
    AccessState, ChannelMap, ChannelRef, InboundEvent, Registry, SourceEvent, SourceName,
    TopicRecord,
};
use herald_telemetry::MetricsRecorder;

use crate::access::{AccessVerifier, VerifierConfig};
use crate::delivery::{DeliveryMode, DeliveryOutcome, DeliveryReport, Dispatcher};
use crate::error::EngineError;
use crate::format::{admission_notice, FormatOptions};
use crate::guard::TopicGuard;
use crate::metric_names;
use crate::pending::{Admission, AdmissionConfig, PendingQueue, PendingView};
use crate::retry::RetryPolicy;
use crate::synchronizer::{ReconcileReport, Synchronizer};
use crate::topic_store::TopicStore;

const FETCH_CONCURRENCY: usize = 4;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub admission: AdmissionConfig,
    pub verifier: VerifierConfig,
    pub retry: RetryPolicy,
    pub format: FormatOptions,
    /// Bound on destination calls made while holding the creation mutex.
    pub destination_timeout: Duration,
    /// Events per channel forwarded when a source is admitted.
    pub backlog_limit: usize,
    pub initial_sync: bool,
    pub initial_sync_limit: usize,
    pub fallback_interval: Duration,
    pub fallback_limit: usize,
    /// Polled events older than this are left alone.
    pub fallback_window: Duration,
    pub registry_refresh: Duration,
    pub notice_on_admission: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            verifier: VerifierConfig::default(),
            retry: RetryPolicy::default(),
            format: FormatOptions::default(),
            destination_timeout: Duration::from_secs(10),
            backlog_limit: 5,
            initial_sync: true,
            initial_sync_limit: 5,
            fallback_interval: Duration::from_secs(300),
            fallback_limit: 3,
            fallback_window: Duration::from_secs(120),
            registry_refresh: Duration::from_secs(600),
            notice_on_admission: true,
        }
    }
}

/// External collaborators the engine is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn SourceRegistry>,
    pub push: Arc<dyn PushSnapshot>,
    pub pull: Arc<dyn PullClient>,
    pub threads: Arc<dyn ThreadProvider>,
    pub sender: Arc<dyn MessageSender>,
    pub topics: Arc<dyn TopicPersistence>,
    pub ledger: Arc<dyn DeliveryLedger>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReconcileRun {
    pub at: DateTime<Utc>,
    pub report: ReconcileReport,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StartupReport {
    pub sources: usize,
    pub reconcile: ReconcileReport,
    pub initial_sync: DeliveryReport,
}

/// Point-in-time view for operators.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub topics: usize,
    pub registry_sources: usize,
    pub registry_channels: usize,
    pub pending: Vec<PendingView>,
    pub last_reconcile: Option<ReconcileRun>,
    pub access: BTreeMap<String, AccessState>,
}

pub struct Engine {
    config: EngineConfig,
    registry_client: Arc<dyn SourceRegistry>,
    pull: Arc<dyn PullClient>,
    store: Arc<TopicStore>,
    verifier: AccessVerifier,
    pending: PendingQueue,
    synchronizer: Synchronizer,
    dispatcher: Dispatcher,
    registry: RwLock<Registry>,
    last_reconcile: Mutex<Option<ReconcileRun>>,
    metrics: Arc<MetricsRecorder>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        collab: Collaborators,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Arc<Self>, EngineError> {
        let store = Arc::new(TopicStore::load(collab.topics)?);
        let creation_lock = Arc::new(tokio::sync::Mutex::new(()));
        let guard = Arc::new(TopicGuard::new(
            Arc::clone(&store),
            Arc::clone(&collab.threads),
            Arc::clone(&creation_lock),
            config.destination_timeout,
            Arc::clone(&metrics),
        ));
        let synchronizer = Synchronizer::new(
            Arc::clone(&store),
            Arc::clone(&collab.threads),
            Arc::clone(&creation_lock),
            config.destination_timeout,
            Arc::clone(&metrics),
        );
        let dispatcher = Dispatcher::new(
            guard,
            collab.sender,
            collab.ledger,
            config.retry.clone(),
            config.format.clone(),
            Arc::clone(&metrics),
        );
        Ok(Arc::new(Self {
            verifier: AccessVerifier::new(collab.push, Arc::clone(&collab.pull), config.verifier.clone()),
            pending: PendingQueue::new(config.admission.clone()),
            registry_client: collab.registry,
            pull: collab.pull,
            store,
            synchronizer,
            dispatcher,
            registry: RwLock::new(Registry::new()),
            last_reconcile: Mutex::new(None),
            metrics,
            config,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load the registry, reconcile, then forward the recent backlog.
    /// Runs before any delivery is accepted.
    pub async fn startup(&self) -> Result<StartupReport, EngineError> {
        match self.load_registry().await {
            Ok(sources) => info!(sources, "registry loaded"),
            Err(e) => warn!(error = %e, "registry unavailable at startup, continuing without it"),
        }
        let reconcile = self.reconcile().await?;
        let initial_sync = if self.config.initial_sync {
            self.initial_sync().await
        } else {
            DeliveryReport::default()
        };
        Ok(StartupReport {
            sources: self.registry.read().len(),
            reconcile,
            initial_sync,
        })
    }

    /// Replace the registry view with a fresh listing. Nothing is queued.
    pub async fn load_registry(&self) -> Result<usize, EngineError> {
        let listed = self.registry_client.list_sources().await?;
        let count = listed.len();
        *self.registry.write() = listed;
        Ok(count)
    }

    /// Reconcile the topic store against the destination.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let listed: BTreeSet<SourceName> = self.registry.read().keys().cloned().collect();
        let report = self.synchronizer.reconcile(&listed).await?;
        *self.last_reconcile.lock() = Some(ReconcileRun {
            at: Utc::now(),
            report: report.clone(),
        });
        Ok(report)
    }

    /// Re-read the registry. New sources are queued for verification,
    /// listed ones get their channel sets refreshed, unlisted ones are
    /// dropped from the view. Returns how many sources were queued.
    pub async fn refresh_registry(&self) -> Result<usize, EngineError> {
        let listed = self.registry_client.list_sources().await?;
        let mut queued = 0;
        let mut fresh = Vec::new();
        {
            let mut registry = self.registry.write();
            registry.retain(|source, _| {
                let keep = listed.contains_key(source);
                if !keep {
                    info!(source = %source, "source no longer listed");
                }
                keep
            });
            for (source, channels) in listed {
                match registry.get_mut(&source) {
                    Some(known) => *known = channels,
                    None => fresh.push((source, channels)),
                }
            }
        }
        for (source, channels) in fresh {
            if self.on_discovery(source, channels) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// A source was observed. Unknown sources enter the pending queue;
    /// known ones only get new channels merged in.
    pub fn on_discovery(&self, source: SourceName, channels: ChannelMap) -> bool {
        {
            let mut registry = self.registry.write();
            if let Some(known) = registry.get_mut(&source) {
                known.extend(channels);
                return false;
            }
        }
        let queued = self.pending.discover(source, channels);
        self.update_pending_gauge();
        queued
    }

    /// A message arrived over the push path.
    #[instrument(skip_all, fields(source = %event.source, channel_id = %event.channel_id))]
    pub async fn on_message(&self, event: SourceEvent) -> Result<DeliveryOutcome, EngineError> {
        let monitored = self
            .registry
            .read()
            .get(&event.source)
            .is_some_and(|channels| channels.contains_key(&event.channel_id));
        if !monitored {
            debug!("message from unmonitored channel");
            return Ok(DeliveryOutcome::NotMonitored);
        }
        self.verifier.note_push_delivery(&event.channel_id);
        self.dispatcher.deliver(&event, DeliveryMode::Live).await
    }

    pub async fn on_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::SourceDiscovered { source, channels } => {
                self.on_discovery(source, channels);
            }
            InboundEvent::Message(event) => {
                if let Err(e) = self.on_message(event).await {
                    warn!(error = %e, kind = e.error_kind(), "live delivery failed");
                }
            }
        }
    }

    /// Run one admission sweep and admit whatever it promotes.
    pub async fn sweep_pending(&self) -> Vec<Admission> {
        let admissions = self.pending.sweep(&self.verifier).await;
        for admission in &admissions {
            if let Err(e) = self.admit(admission).await {
                warn!(source = %admission.source, error = %e, "admission follow-up failed");
            }
        }
        self.update_pending_gauge();
        admissions
    }

    /// Add an admitted source to the registry, forward its backlog and post
    /// a status notice. The thread itself is created on first send.
    #[instrument(skip_all, fields(source = %admission.source, reason = admission.reason.as_str()))]
    pub async fn admit(&self, admission: &Admission) -> Result<DeliveryReport, EngineError> {
        self.registry
            .write()
            .entry(admission.source.clone())
            .or_default()
            .extend(admission.channels.clone());
        self.metrics.counter_inc(
            metric_names::ADMISSIONS,
            &[("reason", admission.reason.as_str())],
            1,
        );

        let readable: Vec<ChannelRef> = admission
            .channels
            .iter()
            .filter(|(id, _)| admission.access.get(*id).is_some_and(|s| s.has_pull()))
            .map(|(id, name)| ChannelRef::new(admission.source.clone(), id.clone(), name.clone()))
            .collect();
        let backlog = self.fetch_all(readable, self.config.backlog_limit).await;
        let report = self
            .dispatcher
            .deliver_batch(backlog, DeliveryMode::Backfill)
            .await;

        if self.config.notice_on_admission && (admission.reachable() > 0 || report.forwarded > 0) {
            self.dispatcher
                .send_notice(&admission.source, &admission_notice(admission))
                .await?;
        }
        Ok(report)
    }

    /// Forward the most recent events of every pull-readable channel.
    pub async fn initial_sync(&self) -> DeliveryReport {
        let channels = self.registry_channels();
        let ids: Vec<_> = channels.iter().map(|c| c.id.clone()).collect();
        let access = self.verifier.probe_all(ids).await;
        let readable: Vec<ChannelRef> = channels
            .into_iter()
            .filter(|c| access.get(&c.id).is_some_and(|s| s.has_pull()))
            .collect();
        info!(channels = readable.len(), "initial sync");
        let events = self.fetch_all(readable, self.config.initial_sync_limit).await;
        self.dispatcher.deliver_batch(events, DeliveryMode::Backfill).await
    }

    /// Poll pull-readable channels for events inside the recency window.
    pub async fn fallback_poll(&self) -> DeliveryReport {
        let mut readable = Vec::new();
        for channel in self.registry_channels() {
            let state = match self.verifier.last_known(&channel.id) {
                AccessState::Unknown => self.verifier.probe(&channel.id).await,
                known => known,
            };
            if state.has_pull() {
                readable.push(channel);
            }
        }
        let window = chrono::Duration::from_std(self.config.fallback_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let cutoff = Utc::now() - window;
        let events: Vec<SourceEvent> = self
            .fetch_all(readable, self.config.fallback_limit)
            .await
            .into_iter()
            .filter(|e| e.timestamp >= cutoff)
            .collect();
        debug!(events = events.len(), "fallback poll");
        self.dispatcher.deliver_batch(events, DeliveryMode::Backfill).await
    }

    async fn fetch_all(&self, channels: Vec<ChannelRef>, limit: usize) -> Vec<SourceEvent> {
        if limit == 0 {
            return Vec::new();
        }
        stream::iter(channels)
            .map(|channel| async move {
                match self.pull.fetch_recent(&channel, limit).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(source = %channel.source, channel_id = %channel.id, error = %e, "fetch failed");
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .flat_map(stream::iter)
            .collect()
            .await
    }

    fn registry_channels(&self) -> Vec<ChannelRef> {
        self.registry
            .read()
            .iter()
            .flat_map(|(source, channels)| {
                channels
                    .iter()
                    .map(|(id, name)| ChannelRef::new(source.clone(), id.clone(), name.clone()))
            })
            .collect()
    }

    fn update_pending_gauge(&self) {
        self.metrics
            .gauge_set(metric_names::PENDING_SOURCES, &[], self.pending.waiting() as f64);
    }

    pub fn status(&self) -> EngineStatus {
        let registry = self.registry.read();
        EngineStatus {
            topics: self.store.len(),
            registry_sources: registry.len(),
            registry_channels: registry.values().map(|c| c.len()).sum(),
            pending: self.pending.snapshot(),
            last_reconcile: self.last_reconcile.lock().clone(),
            access: self
                .verifier
                .states()
                .into_iter()
                .map(|(id, state)| (id.to_string(), state))
                .collect(),
        }
    }

    pub fn topics(&self) -> BTreeMap<SourceName, TopicRecord> {
        self.store.records()
    }

    /// Start the background loops. They stop when `cancel` fires; work in
    /// progress finishes first.
    pub fn spawn_background(
        self: &Arc<Self>,
        cancel: CancellationToken,
        inbound: mpsc::Receiver<InboundEvent>,
    ) -> BackgroundTasks {
        let mut handles = Vec::new();

        let engine = Arc::clone(self);
        handles.push(spawn_periodic(
            "admission_sweep",
            self.config.admission.sweep_interval,
            cancel.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.sweep_pending().await;
                }
            },
        ));

        let engine = Arc::clone(self);
        handles.push(spawn_periodic(
            "fallback_poll",
            self.config.fallback_interval,
            cancel.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    let report = engine.fallback_poll().await;
                    if report.forwarded > 0 || report.failed > 0 {
                        info!(forwarded = report.forwarded, failed = report.failed, "fallback poll delivered");
                    }
                }
            },
        ));

        let engine = Arc::clone(self);
        handles.push(spawn_periodic(
            "registry_refresh",
            self.config.registry_refresh,
            cancel.clone(),
            move || {
                let engine = Arc::clone(&engine);
                async move {
                    match engine.refresh_registry().await {
                        Ok(queued) if queued > 0 => info!(queued, "new sources queued"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "registry refresh failed"),
                    }
                }
            },
        ));

        let engine = Arc::clone(self);
        handles.push(tokio::spawn(consume_inbound(engine, cancel, inbound)));

        BackgroundTasks { handles }
    }
}

async fn consume_inbound(
    engine: Arc<Engine>,
    cancel: CancellationToken,
    mut inbound: mpsc::Receiver<InboundEvent>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.recv() => match next {
                Some(event) => engine.on_inbound(event).await,
                None => break,
            },
        }
    }
    debug!("inbound consumer stopped");
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task = name, "background task stopped");
    })
}

/// Join handles of the engine's background loops.
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeDestination, FakeSource, StaticPushSnapshot};
    use herald_core::{ChannelId, SourceMessageId, ThreadId};
    use herald_store::MemoryPersistence;

    struct Harness {
        engine: Arc<Engine>,
        source: Arc<FakeSource>,
        dest: Arc<FakeDestination>,
        push: Arc<StaticPushSnapshot>,
        persistence: Arc<MemoryPersistence>,
        metrics: Arc<MetricsRecorder>,
    }

    fn harness_with(config: EngineConfig, persistence: MemoryPersistence) -> Harness {
        harness_on(config, persistence, FakeDestination::new())
    }

    fn harness_on(
        config: EngineConfig,
        persistence: MemoryPersistence,
        dest: FakeDestination,
    ) -> Harness {
        let source = Arc::new(FakeSource::new());
        let dest = Arc::new(dest);
        let push = Arc::new(StaticPushSnapshot::default());
        let persistence = Arc::new(persistence);
        let metrics = Arc::new(MetricsRecorder::in_memory());
        let engine = Engine::new(
            config,
            Collaborators {
                registry: source.clone(),
                push: push.clone(),
                pull: source.clone(),
                threads: dest.clone(),
                sender: dest.clone(),
                topics: persistence.clone(),
                ledger: persistence.clone(),
            },
            Arc::clone(&metrics),
        )
        .unwrap();
        Harness {
            engine,
            source,
            dest,
            push,
            persistence,
            metrics,
        }
    }

    fn harness() -> Harness {
        harness_with(
            EngineConfig {
                format: FormatOptions {
                    show_timestamp: false,
                },
                ..Default::default()
            },
            MemoryPersistence::new(),
        )
    }

    fn event(source: &str, channel: &str, id: &str, at: DateTime<Utc>) -> SourceEvent {
        SourceEvent {
            id: SourceMessageId::from(id),
            source: SourceName::from(source),
            channel_id: ChannelId::from(channel),
            channel_name: channel.to_string(),
            author: "mod".into(),
            content: format!("content {id}"),
            timestamp: at,
        }
    }

    fn channels(ids: &[&str]) -> ChannelMap {
        ids.iter().map(|id| (ChannelId::from(*id), id.to_string())).collect()
    }

    #[tokio::test]
    async fn startup_reconciles_and_syncs() {
        let persistence = MemoryPersistence::with_topics([(
            SourceName::from("Gone"),
            TopicRecord::new(ThreadId::new(1), "🏰 Gone"),
        )]);
        let h = harness_with(EngineConfig::default(), persistence);
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.source.set_readable(ChannelId::from("c1"), true);
        let now = Utc::now();
        h.source.push_event(event("Alpha", "c1", "m1", now - chrono::Duration::minutes(2)));
        h.source.push_event(event("Alpha", "c1", "m2", now - chrono::Duration::minutes(1)));

        let report = h.engine.startup().await.unwrap();

        assert_eq!(report.sources, 1);
        assert_eq!(report.reconcile.removed, 1);
        assert_eq!(report.initial_sync.forwarded, 2);
        assert_eq!(h.dest.creates(), 1);
        let topics = h.engine.topics();
        assert_eq!(topics.len(), 1);
        assert!(topics.contains_key(&SourceName::from("Alpha")));
        let sent = h.dest.sent();
        assert!(sent[0].1.contains("content m1"));
        assert!(sent[1].1.contains("content m2"));
    }

    #[tokio::test]
    async fn startup_survives_registry_outage() {
        let h = harness();
        h.source.set_registry_error(true);
        let report = h.engine.startup().await.unwrap();
        assert_eq!(report.sources, 0);
        assert!(report.reconcile.is_noop());
    }

    #[tokio::test]
    async fn concurrent_paths_share_one_thread() {
        let h = harness();
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.source.set_readable(ChannelId::from("c1"), true);
        h.engine.startup().await.unwrap();

        let now = Utc::now();
        let live = h.engine.on_message(event("Alpha", "c1", "m1", now));
        let sync = h
            .engine
            .dispatcher
            .deliver_batch(vec![event("Alpha", "c1", "m2", now)], DeliveryMode::Backfill);
        let (live, sync) = tokio::join!(live, sync);

        assert!(matches!(live.unwrap(), DeliveryOutcome::Forwarded { .. }));
        assert_eq!(sync.forwarded, 1);
        assert_eq!(h.dest.creates(), 1);
        assert_eq!(h.persistence.topics().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_racing_delivery_keeps_one_thread() {
        let h = harness_on(
            EngineConfig {
                format: FormatOptions {
                    show_timestamp: false,
                },
                initial_sync: false,
                ..Default::default()
            },
            MemoryPersistence::with_topics([(
                SourceName::from("Alpha"),
                TopicRecord::new(ThreadId::new(7), "🏰 Alpha"),
            )]),
            FakeDestination::new().with_latency(Duration::from_millis(50)),
        );
        h.dest.seed_thread(ThreadId::new(7), "🏰 Alpha");
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.source.add_source("Beta", &[("c2", "news")]);
        h.engine.load_registry().await.unwrap();

        let now = Utc::now();
        let (first, report) = tokio::join!(
            h.engine.on_message(event("Beta", "c2", "m1", now)),
            h.engine.reconcile(),
        );
        assert!(matches!(first.unwrap(), DeliveryOutcome::Forwarded { .. }));
        assert_eq!(report.unwrap().removed, 0);
        assert!(h.engine.topics().contains_key(&SourceName::from("Beta")));

        let second = h
            .engine
            .on_message(event("Beta", "c2", "m2", now))
            .await
            .unwrap();
        assert!(matches!(second, DeliveryOutcome::Forwarded { .. }));
        assert_eq!(h.dest.creates(), 1);
        let beta_threads = h
            .dest
            .open_threads()
            .values()
            .filter(|title| title.as_str() == "🏰 Beta")
            .count();
        assert_eq!(beta_threads, 1);
    }

    #[tokio::test]
    async fn unmonitored_messages_are_ignored() {
        let h = harness();
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.engine.startup().await.unwrap();

        let outcome = h
            .engine
            .on_message(event("Alpha", "c9", "m1", Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::NotMonitored);
        let outcome = h
            .engine
            .on_message(event("Stranger", "c1", "m1", Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::NotMonitored);
        assert!(h.dest.sent().is_empty());
    }

    #[tokio::test]
    async fn push_delivery_records_access() {
        let h = harness();
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.engine.startup().await.unwrap();
        h.engine
            .on_message(event("Alpha", "c1", "m1", Utc::now()))
            .await
            .unwrap();
        assert_eq!(h.engine.status().access.get("c1"), Some(&AccessState::PushOnly));
    }

    #[tokio::test(start_paused = true)]
    async fn early_admission_forwards_backlog_and_notice() {
        let h = harness();
        h.engine.startup().await.unwrap();
        h.source.set_readable(ChannelId::from("c1"), true);
        let now = Utc::now();
        h.source.push_event(event("Newcomer", "c1", "m1", now));

        assert!(h.engine.on_discovery(SourceName::from("Newcomer"), channels(&["c1", "c2"])));
        assert!(h.engine.sweep_pending().await.is_empty());

        tokio::time::advance(Duration::from_secs(60)).await;
        let admitted = h.engine.sweep_pending().await;
        assert_eq!(admitted.len(), 1);

        let sent = h.dest.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].1.contains("content m1"));
        assert!(sent[1].1.starts_with("🔔 Monitoring started for Newcomer (1 of 2"));
        assert_eq!(h.engine.status().registry_sources, 1);
        assert_eq!(h.metrics.counter_get(metric_names::ADMISSIONS, &[("reason", "early")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_admission_without_access_defers_thread() {
        let h = harness();
        h.engine.startup().await.unwrap();
        h.engine.on_discovery(SourceName::from("Dark"), channels(&["c1"]));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(h.engine.sweep_pending().await.is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
        let admitted = h.engine.sweep_pending().await;

        assert_eq!(admitted.len(), 1);
        assert_eq!(h.dest.creates(), 0);
        assert!(h.dest.sent().is_empty());
        assert_eq!(h.metrics.counter_get(metric_names::ADMISSIONS, &[("reason", "forced")]), 1);

        let outcome = h
            .engine
            .on_message(event("Dark", "c1", "m1", Utc::now()))
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Forwarded { .. }));
        assert_eq!(h.dest.creates(), 1);
    }

    #[tokio::test]
    async fn discovery_of_known_source_merges_channels() {
        let h = harness();
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.engine.startup().await.unwrap();

        assert!(!h.engine.on_discovery(SourceName::from("Alpha"), channels(&["c2"])));
        assert_eq!(h.engine.status().registry_channels, 2);
        assert!(h.engine.status().pending.is_empty());
    }

    #[tokio::test]
    async fn refresh_queues_new_and_drops_unlisted() {
        let h = harness();
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.source.add_source("Beta", &[("c2", "news")]);
        h.engine.startup().await.unwrap();

        h.source.remove_source("Beta");
        h.source.add_source("Gamma", &[("c3", "news")]);
        assert_eq!(h.engine.refresh_registry().await.unwrap(), 1);

        let status = h.engine.status();
        assert_eq!(status.registry_sources, 1);
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.pending[0].source.as_str(), "Gamma");
        assert_eq!(h.engine.refresh_registry().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fallback_poll_only_forwards_recent_events() {
        let h = harness();
        h.source.add_source("Alpha", &[("c1", "news")]);
        h.source.set_readable(ChannelId::from("c1"), true);
        h.engine.startup().await.unwrap();

        let now = Utc::now();
        h.source.push_event(event("Alpha", "c1", "old", now - chrono::Duration::minutes(10)));
        h.source.push_event(event("Alpha", "c1", "fresh", now));

        let report = h.engine.fallback_poll().await;
        assert_eq!(report.forwarded, 1);
        assert!(h.dest.sent().iter().any(|(_, t)| t.contains("content fresh")));

        let again = h.engine.fallback_poll().await;
        assert_eq!(again.forwarded, 0);
        assert_eq!(again.skipped, 1);
    }

    #[tokio::test]
    async fn reconcile_records_last_run() {
        let h = harness();
        h.engine.startup().await.unwrap();
        let status = h.engine.status();
        assert!(status.last_reconcile.is_some());
        assert_eq!(status.topics, 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["last_reconcile"]["report"]["removed"], 0);
        assert!(json["pending"].as_array().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_loops_admit_and_stop_on_cancel() {
        let h = harness();
        h.engine.startup().await.unwrap();
        h.push.set_visible(ChannelId::from("c1"), true);

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let tasks = h.engine.spawn_background(cancel.clone(), rx);
        assert_eq!(tasks.len(), 4);

        tx.send(InboundEvent::SourceDiscovered {
            source: SourceName::from("Newcomer"),
            channels: channels(&["c1"]),
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(h.engine.status().registry_sources, 1);
        assert!(h.engine.status().pending.iter().all(|p| p.admitted));

        cancel.cancel();
        tasks.join().await;
    }
}
