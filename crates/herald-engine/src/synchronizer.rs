//! Reconciliation of the topic store against the live destination.
//!
//! A pass removes mappings whose thread is gone or whose source left the
//! registry, then collapses sources whose threads carry the same title onto
//! the lowest thread id. All store changes land as one batch before any
//! thread is closed, so a failed write closes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use herald_core::naming::{canonical_topic_name, normalize_display_name};
use herald_core::provider::ThreadProvider;
use herald_core::{DestinationError, SourceName, ThreadId, TopicMutation, TopicRecord};
use herald_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::metric_names;
use crate::topic_store::TopicStore;

/// Outcome of one reconcile pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Mappings dropped because the thread is gone or the source is unlisted.
    pub removed: usize,
    /// Sources dropped because another source owns the same titled thread.
    pub deduplicated: usize,
    /// Sources moved onto the canonical thread of their group.
    pub repointed: usize,
    /// Duplicate threads closed on the destination.
    pub closed: Vec<ThreadId>,
    pub close_failures: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.deduplicated == 0 && self.repointed == 0 && self.closed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Plan {
    mutations: Vec<TopicMutation>,
    to_close: Vec<ThreadId>,
    report: ReconcileReport,
}

/// Work out the mutations and closures for one pass without touching anything.
fn plan(
    mappings: &BTreeMap<SourceName, TopicRecord>,
    registry: &BTreeSet<SourceName>,
    live: &BTreeMap<ThreadId, String>,
) -> Plan {
    let mut plan = Plan::default();
    let mut survivors: BTreeMap<String, Vec<(SourceName, TopicRecord)>> = BTreeMap::new();

    for (source, record) in mappings {
        let Some(live_title) = live.get(&record.thread_id) else {
            info!(source = %source, thread_id = record.thread_id.get(), "removing stale topic");
            plan.mutations.push(TopicMutation::Remove {
                source: source.clone(),
            });
            plan.report.removed += 1;
            continue;
        };
        if !registry.is_empty() && !registry.contains(source) {
            info!(source = %source, thread_id = record.thread_id.get(), "removing topic of unlisted source");
            plan.mutations.push(TopicMutation::Remove {
                source: source.clone(),
            });
            plan.report.removed += 1;
            continue;
        }
        let title = if live_title.trim().is_empty() {
            canonical_topic_name(source)
        } else {
            live_title.clone()
        };
        survivors
            .entry(normalize_display_name(&title))
            .or_default()
            .push((source.clone(), record.clone()));
    }

    for (title, group) in survivors {
        if group.len() < 2 {
            continue;
        }
        let Some(winner) = group.iter().map(|(_, r)| r.thread_id).min() else {
            continue;
        };
        let owner = group
            .iter()
            .filter(|(s, _)| normalize_display_name(&canonical_topic_name(s)) == title)
            .min_by_key(|(_, r)| (r.thread_id != winner, r.thread_id))
            .or_else(|| group.iter().find(|(_, r)| r.thread_id == winner))
            .map(|(s, _)| s.clone());
        let Some(owner) = owner else {
            continue;
        };
        let winner_record = group
            .iter()
            .find(|(_, r)| r.thread_id == winner)
            .map(|(_, r)| r.clone());

        warn!(
            title = %title,
            sources = group.len(),
            canonical = winner.get(),
            owner = %owner,
            "duplicate topics detected"
        );

        for (source, record) in &group {
            if *source == owner {
                if record.thread_id != winner {
                    if let Some(rec) = &winner_record {
                        plan.mutations.push(TopicMutation::Put {
                            source: source.clone(),
                            record: rec.clone(),
                        });
                        plan.report.repointed += 1;
                    }
                }
                continue;
            }
            plan.mutations.push(TopicMutation::Remove {
                source: source.clone(),
            });
            plan.report.deduplicated += 1;
        }

        let mut losing: Vec<ThreadId> = group
            .iter()
            .map(|(_, r)| r.thread_id)
            .filter(|t| *t != winner)
            .collect();
        losing.sort();
        losing.dedup();
        plan.to_close.extend(losing);
    }
    plan
}

pub struct Synchronizer {
    store: Arc<TopicStore>,
    threads: Arc<dyn ThreadProvider>,
    creation_lock: Arc<Mutex<()>>,
    call_timeout: Duration,
    metrics: Arc<MetricsRecorder>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<TopicStore>,
        threads: Arc<dyn ThreadProvider>,
        creation_lock: Arc<Mutex<()>>,
        call_timeout: Duration,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            threads,
            creation_lock,
            call_timeout,
            metrics,
        }
    }

    /// Reconcile the store against the destination. An empty `registry`
    /// skips the unlisted-source pruning step.
    ///
    /// The live listing is taken under the creation mutex, so a thread
    /// created concurrently is either seen here or created after the pass.
    #[instrument(skip_all, fields(registry = registry.len()))]
    pub async fn reconcile(
        &self,
        registry: &BTreeSet<SourceName>,
    ) -> Result<ReconcileReport, EngineError> {
        let _creation = self.creation_lock.lock().await;
        let known: Vec<TopicRecord> = self.store.records().into_values().collect();
        let live = self.threads.list_open_threads(&known).await?;
        self.reconcile_locked(registry, &live).await
    }

    /// One pass against an explicit `live` listing. The caller holds the
    /// creation mutex.
    async fn reconcile_locked(
        &self,
        registry: &BTreeSet<SourceName>,
        live: &BTreeMap<ThreadId, String>,
    ) -> Result<ReconcileReport, EngineError> {
        let Plan {
            mutations,
            to_close,
            mut report,
        } = plan(&self.store.records(), registry, live);

        self.store.apply(mutations)?;

        for thread in to_close {
            let closed = tokio::time::timeout(self.call_timeout, self.threads.close_thread(thread))
                .await
                .unwrap_or(Err(DestinationError::Timeout(self.call_timeout)));
            match closed {
                Ok(()) | Err(DestinationError::ThreadNotFound) => report.closed.push(thread),
                Err(e) => {
                    warn!(thread_id = thread.get(), error = %e, "failed to close duplicate topic");
                    report.close_failures += 1;
                }
            }
        }

        self.metrics
            .counter_inc(metric_names::TOPICS_STALE_REMOVED, &[], report.removed as u64);
        self.metrics
            .counter_inc(metric_names::DUPLICATES_CLOSED, &[], report.closed.len() as u64);
        if report.is_noop() {
            info!("reconcile found nothing to do");
        } else {
            info!(
                removed = report.removed,
                deduplicated = report.deduplicated,
                repointed = report.repointed,
                closed = report.closed.len(),
                "reconcile complete"
            );
        }
        Ok(report)
    }
}
