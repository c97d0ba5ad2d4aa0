//! Get-or-create for source threads.
//!
//! The fast path reads the store and runs an existence check without any
//! lock. Everything that may create, adopt or drop a mapping runs under one
//! process-wide creation mutex, shared with the synchronizer, and re-reads
//! the store after acquiring it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use herald_core::naming::canonical_topic_name;
use herald_core::provider::ThreadProvider;
use herald_core::{DestinationError, SourceName, ThreadId, TopicMutation, TopicRecord};
use herald_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::metric_names;
use crate::topic_store::TopicStore;

/// How a thread was obtained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicLookup {
    Existing(ThreadId),
    /// Taken over from another key carrying the same title.
    Adopted { thread: ThreadId, from: SourceName },
    Created(ThreadId),
    /// The destination has no topic support; send to the main conversation.
    Unthreaded,
}

impl TopicLookup {
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Self::Existing(t) | Self::Created(t) => Some(*t),
            Self::Adopted { thread, .. } => Some(*thread),
            Self::Unthreaded => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ThreadState {
    Open,
    Missing,
    /// The check itself failed; the thread is assumed to still exist.
    Unknown,
}

pub struct TopicGuard {
    store: Arc<TopicStore>,
    threads: Arc<dyn ThreadProvider>,
    creation_lock: Arc<Mutex<()>>,
    call_timeout: Duration,
    metrics: Arc<MetricsRecorder>,
}

impl TopicGuard {
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

    #[instrument(skip(self), fields(source = %source))]
    pub async fn get_or_create(&self, source: &SourceName) -> Result<TopicLookup, EngineError> {
        let mut known_missing = None;
        if let Some(thread) = self.store.get(source) {
            match self.thread_state(thread).await {
                ThreadState::Open | ThreadState::Unknown => return Ok(TopicLookup::Existing(thread)),
                ThreadState::Missing => known_missing = Some(thread),
            }
        }

        let _creation = self.creation_lock.lock().await;

        if let Some(thread) = self.store.get(source) {
            let state = if known_missing == Some(thread) {
                ThreadState::Missing
            } else {
                self.thread_state(thread).await
            };
            if state != ThreadState::Missing {
                return Ok(TopicLookup::Existing(thread));
            }
            info!(thread_id = thread.get(), "cached topic no longer exists, dropping mapping");
            self.store.remove_if(source, thread)?;
            self.metrics
                .counter_inc(metric_names::TOPICS_STALE_REMOVED, &[], 1);
        }

        let supported = self
            .bounded(self.threads.supports_threads())
            .await
            .map_err(|error| EngineError::CreationFailed {
                source_name: source.clone(),
                error,
            })?;
        if !supported {
            debug!("destination has no topic support");
            return Ok(TopicLookup::Unthreaded);
        }

        let title = canonical_topic_name(source);

        if let Some((other, record)) = self.store.find_by_display_name(&title, source) {
            if self.thread_state(record.thread_id).await == ThreadState::Missing {
                self.store.remove_if(&other, record.thread_id)?;
            } else {
                let thread = record.thread_id;
                self.store.apply(vec![
                    TopicMutation::Remove {
                        source: other.clone(),
                    },
                    TopicMutation::Put {
                        source: source.clone(),
                        record,
                    },
                ])?;
                info!(thread_id = thread.get(), from = %other, "adopted existing topic");
                self.metrics.counter_inc(metric_names::TOPICS_ADOPTED, &[], 1);
                return Ok(TopicLookup::Adopted { thread, from: other });
            }
        }

        let thread = self
            .bounded(self.threads.create_thread(&title))
            .await
            .map_err(|error| {
                warn!(error = %error, "topic creation failed");
                EngineError::CreationFailed {
                    source_name: source.clone(),
                    error,
                }
            })?;

        if let Err(e) = self.store.put(source.clone(), TopicRecord::new(thread, title)) {
            // Unrecorded threads would be duplicated by the next attempt.
            if let Err(close_err) = self.bounded(self.threads.close_thread(thread)).await {
                warn!(thread_id = thread.get(), error = %close_err, "failed to close unrecorded topic");
            }
            return Err(e.into());
        }
        info!(thread_id = thread.get(), "topic created");
        self.metrics.counter_inc(metric_names::TOPICS_CREATED, &[], 1);
        Ok(TopicLookup::Created(thread))
    }

    /// Drop the mapping for `source` if it still points at `thread`.
    pub fn invalidate(&self, source: &SourceName, thread: ThreadId) -> Result<bool, EngineError> {
        let removed = self.store.remove_if(source, thread)?;
        if removed {
            self.metrics
                .counter_inc(metric_names::TOPICS_STALE_REMOVED, &[], 1);
        }
        Ok(removed)
    }

    async fn thread_state(&self, thread: ThreadId) -> ThreadState {
        match self.bounded(self.threads.thread_exists(thread)).await {
            Ok(true) => ThreadState::Open,
            Ok(false) | Err(DestinationError::ThreadNotFound) => ThreadState::Missing,
            Err(e) => {
                debug!(thread_id = thread.get(), error = %e, "existence check inconclusive");
                ThreadState::Unknown
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, DestinationError>>,
    ) -> Result<T, DestinationError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or(Err(DestinationError::Timeout(self.call_timeout)))
    }
}
