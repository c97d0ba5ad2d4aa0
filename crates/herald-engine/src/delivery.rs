use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use herald_core::events::sort_chronological;
use herald_core::provider::{DeliveryLedger, MessageSender};
use herald_core::{DeliveryRecord, DestinationError, MessageId, SourceEvent, SourceName, ThreadId};
use herald_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::format::{chunk_text, format_event, FormatOptions, MAX_MESSAGE_CHARS};
use crate::guard::TopicGuard;
use crate::metric_names;
use crate::retry::RetryPolicy;

/// Where an event came from. Only backfill is held to the source cursor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Live,
    Backfill,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Forwarded {
        thread: Option<ThreadId>,
        message: MessageId,
    },
    /// Already in the ledger.
    Duplicate,
    /// Backfill event older than the last forwarded one.
    Stale,
    /// Source or channel is not monitored.
    NotMonitored,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub forwarded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DeliveryReport {
    fn merge(&mut self, other: DeliveryReport) {
        self.forwarded += other.forwarded;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Sends events into their source threads, in order, with bounded retry
/// and missing-thread repair.
pub struct Dispatcher {
    guard: Arc<TopicGuard>,
    sender: Arc<dyn MessageSender>,
    ledger: Arc<dyn DeliveryLedger>,
    policy: RetryPolicy,
    format: FormatOptions,
    metrics: Arc<MetricsRecorder>,
    source_locks: DashMap<SourceName, Arc<Mutex<()>>>,
}

impl Dispatcher {
    pub fn new(
        guard: Arc<TopicGuard>,
        sender: Arc<dyn MessageSender>,
        ledger: Arc<dyn DeliveryLedger>,
        policy: RetryPolicy,
        format: FormatOptions,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            guard,
            sender,
            ledger,
            policy,
            format,
            metrics,
            source_locks: DashMap::new(),
        }
    }

    fn source_lock(&self, source: &SourceName) -> Arc<Mutex<()>> {
        self.source_locks
            .entry(source.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn deliver(
        &self,
        event: &SourceEvent,
        mode: DeliveryMode,
    ) -> Result<DeliveryOutcome, EngineError> {
        let lock = self.source_lock(&event.source);
        let _ordered = lock.lock().await;
        self.deliver_locked(event, mode).await
    }

    /// Deliver a batch: per source in timestamp order, sources in parallel.
    /// The first failure stops the rest of that source's events.
    pub async fn deliver_batch(&self, events: Vec<SourceEvent>, mode: DeliveryMode) -> DeliveryReport {
        let mut by_source: BTreeMap<SourceName, Vec<SourceEvent>> = BTreeMap::new();
        for event in events {
            by_source.entry(event.source.clone()).or_default().push(event);
        }

        let runs = by_source.into_iter().map(|(source, mut events)| {
            let span = info_span!("deliver_batch", source = %source, events = events.len());
            async move {
                sort_chronological(&mut events);
                let lock = self.source_lock(&source);
                let _ordered = lock.lock().await;
                let mut report = DeliveryReport::default();
                for (i, event) in events.iter().enumerate() {
                    match self.deliver_locked(event, mode).await {
                        Ok(DeliveryOutcome::Forwarded { .. }) => report.forwarded += 1,
                        Ok(_) => report.skipped += 1,
                        Err(e) => {
                            let remaining = events.len() - i;
                            warn!(error = %e, kind = e.error_kind(), remaining, "batch delivery stopped");
                            report.failed += remaining;
                            break;
                        }
                    }
                }
                report
            }
            .instrument(span)
        });

        let mut total = DeliveryReport::default();
        for report in join_all(runs).await {
            total.merge(report);
        }
        total
    }

    async fn deliver_locked(
        &self,
        event: &SourceEvent,
        mode: DeliveryMode,
    ) -> Result<DeliveryOutcome, EngineError> {
        let key = event.dedup_key();
        if self.ledger.is_forwarded(&key)? {
            debug!(key = %key, "already forwarded");
            return Ok(DeliveryOutcome::Duplicate);
        }
        if mode == DeliveryMode::Backfill {
            if let Some(cursor) = self.ledger.cursor(&event.source)? {
                if event.timestamp < cursor {
                    debug!(key = %key, "older than cursor, skipping");
                    return Ok(DeliveryOutcome::Stale);
                }
            }
        }

        let text = format_event(event, &self.format);
        let (thread, message) = match self.send_text(&event.source, &text).await {
            Ok(sent) => sent,
            Err(e) => {
                self.metrics.counter_inc(metric_names::DELIVERY_FAILURES, &[], 1);
                return Err(e);
            }
        };

        self.ledger.record(&DeliveryRecord {
            event_key: key,
            source: event.source.clone(),
            thread_id: thread,
            message_id: message,
            event_time: event.timestamp,
        })?;
        self.metrics.counter_inc(metric_names::MESSAGES_FORWARDED, &[], 1);
        Ok(DeliveryOutcome::Forwarded { thread, message })
    }

    /// Post a free-form notice into the source's thread.
    pub async fn send_notice(&self, source: &SourceName, text: &str) -> Result<MessageId, EngineError> {
        let lock = self.source_lock(source);
        let _ordered = lock.lock().await;
        self.send_text(source, text).await.map(|(_, id)| id)
    }

    /// Resolve the thread and send every chunk of `text`. Returns the thread
    /// used and the id of the first message.
    async fn send_text(
        &self,
        source: &SourceName,
        text: &str,
    ) -> Result<(Option<ThreadId>, MessageId), EngineError> {
        let mut thread = self.resolve_thread(source).await?;
        let mut repairs = 0;
        let mut first = None;

        for chunk in chunk_text(text, MAX_MESSAGE_CHARS) {
            let mut attempt = 0;
            loop {
                match (self.sender.send_message(thread, &chunk).await, thread) {
                    (Ok(id), _) => {
                        first.get_or_insert(id);
                        break;
                    }
                    (Err(DestinationError::ThreadNotFound), Some(stale)) => {
                        if repairs >= self.policy.max_thread_repairs {
                            return Err(EngineError::DeliveryFailed {
                                source_name: source.clone(),
                                attempts: repairs + 1,
                                error: DestinationError::ThreadNotFound,
                            });
                        }
                        repairs += 1;
                        warn!(source = %source, thread_id = stale.get(), "thread vanished, repairing");
                        self.guard.invalidate(source, stale)?;
                        thread = self.resolve_thread(source).await?;
                    }
                    (Err(e), _) if e.is_retryable() && attempt < self.policy.max_retries => {
                        let delay = self.policy.delay_for(attempt, e.suggested_delay());
                        warn!(
                            attempt,
                            max_retries = self.policy.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying after error"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    (Err(e), _) => {
                        return Err(EngineError::DeliveryFailed {
                            source_name: source.clone(),
                            attempts: attempt + 1,
                            error: e,
                        });
                    }
                }
            }
        }

        first
            .map(|id| (thread, id))
            .ok_or_else(|| EngineError::Internal("nothing was sent".into()))
    }

    /// Thread for `source`, or `None` for the main conversation. A creation
    /// failure that will not go away falls back to un-threaded sends.
    async fn resolve_thread(&self, source: &SourceName) -> Result<Option<ThreadId>, EngineError> {
        match self.guard.get_or_create(source).await {
            Ok(lookup) => Ok(lookup.thread()),
            Err(EngineError::CreationFailed { error, .. }) if error.is_permanent() => {
                warn!(source = %source, error = %error, "topic unavailable, sending un-threaded");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
