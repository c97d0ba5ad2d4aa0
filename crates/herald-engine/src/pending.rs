//! Pending-source admission.
//!
//! A newly discovered source waits in the queue until its channels verify
//! or the verification window runs out, whichever comes first. The window
//! is measured from the moment the source was first seen and is never
//! restarted by later discovery notifications.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use herald_core::{AccessState, ChannelId, ChannelMap, SourceName};

use crate::access::AccessVerifier;

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Forced admission once a source has waited this long.
    pub verification_delay: Duration,
    /// Earliest point at which a verified source may be admitted.
    pub grace_period: Duration,
    pub sweep_interval: Duration,
    /// How long admitted entries stay in the queue before cleanup.
    pub retention: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            verification_delay: Duration::from_secs(300),
            grace_period: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    /// The verification window expired.
    Forced,
    /// At least one channel verified after the grace period.
    Early,
}

impl AdmissionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forced => "forced",
            Self::Early => "early",
        }
    }
}

/// A source leaving the queue.
#[derive(Clone, Debug)]
pub struct Admission {
    pub source: SourceName,
    pub channels: ChannelMap,
    pub reason: AdmissionReason,
    pub access: BTreeMap<ChannelId, AccessState>,
}

impl Admission {
    pub fn reachable(&self) -> usize {
        self.access.values().filter(|s| s.is_usable()).count()
    }
}

struct PendingEntry {
    channels: ChannelMap,
    join_time: Instant,
    admitted: bool,
}

/// Read-only view of one queued source.
#[derive(Clone, Debug, Serialize)]
pub struct PendingView {
    pub source: SourceName,
    pub channels: usize,
    pub waiting_secs: u64,
    pub admitted: bool,
}

pub struct PendingQueue {
    config: AdmissionConfig,
    entries: Mutex<HashMap<SourceName, PendingEntry>>,
}

impl PendingQueue {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Register a source. Returns false if it was already queued; its
    /// channels are merged in but the join time is left alone.
    pub fn discover(&self, source: SourceName, channels: ChannelMap) -> bool {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get_mut(&source) {
            existing.channels.extend(channels);
            return false;
        }
        debug!(source = %source, channels = channels.len(), "source queued for verification");
        entries.insert(
            source,
            PendingEntry {
                channels,
                join_time: Instant::now(),
                admitted: false,
            },
        );
        true
    }

    /// Sources still waiting for admission.
    pub fn waiting(&self) -> usize {
        self.entries.lock().values().filter(|e| !e.admitted).count()
    }

    pub fn contains(&self, source: &SourceName) -> bool {
        self.entries.lock().contains_key(source)
    }

    /// Run one admission pass.
    ///
    /// Sources past the verification window are admitted unconditionally.
    /// Sources past the grace period are probed and admitted if any channel
    /// is usable. Probes run without holding the queue lock.
    pub async fn sweep(&self, verifier: &AccessVerifier) -> Vec<Admission> {
        let now = Instant::now();
        let candidates: Vec<(SourceName, ChannelMap, bool)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| !e.admitted)
                .filter_map(|(source, e)| {
                    let waited = now.saturating_duration_since(e.join_time);
                    if waited >= self.config.verification_delay {
                        Some((source.clone(), e.channels.clone(), true))
                    } else if waited >= self.config.grace_period {
                        Some((source.clone(), e.channels.clone(), false))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut admissions = Vec::new();
        for (source, channels, expired) in candidates {
            let access = verifier.probe_all(channels.keys().cloned()).await;
            let verified = access.values().any(|s| s.is_usable());
            let reason = match (expired, verified) {
                (true, _) => AdmissionReason::Forced,
                (false, true) => AdmissionReason::Early,
                (false, false) => continue,
            };
            admissions.push(Admission {
                source,
                channels,
                reason,
                access,
            });
        }

        {
            let mut entries = self.entries.lock();
            admissions.retain(|a| match entries.get_mut(&a.source) {
                Some(entry) if !entry.admitted => {
                    entry.admitted = true;
                    true
                }
                _ => false,
            });
            let retention = self.config.retention;
            entries.retain(|_, e| {
                !(e.admitted && now.saturating_duration_since(e.join_time) >= retention)
            });
        }

        for a in &admissions {
            info!(
                source = %a.source,
                reason = a.reason.as_str(),
                reachable = a.reachable(),
                channels = a.channels.len(),
                "source admitted"
            );
        }
        admissions
    }

    pub fn snapshot(&self) -> Vec<PendingView> {
        let now = Instant::now();
        let mut out: Vec<PendingView> = self
            .entries
            .lock()
            .iter()
            .map(|(source, e)| PendingView {
                source: source.clone(),
                channels: e.channels.len(),
                waiting_secs: now.saturating_duration_since(e.join_time).as_secs(),
                admitted: e.admitted,
            })
            .collect();
        out.sort_by(|a, b| a.source.cmp(&b.source));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::VerifierConfig;
    use crate::mock::{FakeSource, StaticPushSnapshot};
    use std::sync::Arc;

    fn channels(ids: &[&str]) -> ChannelMap {
        ids.iter()
            .map(|id| (ChannelId::from(*id), format!("#{id}")))
            .collect()
    }

    fn verifier(readable: &[&str]) -> AccessVerifier {
        let source = Arc::new(FakeSource::new());
        for c in readable {
            source.set_readable(ChannelId::from(*c), true);
        }
        AccessVerifier::new(
            Arc::new(StaticPushSnapshot::default()),
            source,
            VerifierConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn forced_admission_waits_full_window() {
        let queue = PendingQueue::new(AdmissionConfig::default());
        let v = verifier(&[]);
        queue.discover(SourceName::from("Dark"), channels(&["c1"]));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(queue.sweep(&v).await.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let admitted = queue.sweep(&v).await;
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].reason, AdmissionReason::Forced);
        assert_eq!(admitted[0].reachable(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn early_admission_after_grace() {
        let queue = PendingQueue::new(AdmissionConfig::default());
        let v = verifier(&["c1"]);
        queue.discover(SourceName::from("Open"), channels(&["c1", "c2"]));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(queue.sweep(&v).await.is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let admitted = queue.sweep(&v).await;
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].reason, AdmissionReason::Early);
        assert_eq!(admitted[0].reachable(), 1);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rediscovery_does_not_reset_join_time() {
        let queue = PendingQueue::new(AdmissionConfig::default());
        let v = verifier(&[]);
        assert!(queue.discover(SourceName::from("Dark"), channels(&["c1"])));

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(!queue.discover(SourceName::from("Dark"), channels(&["c2"])));

        tokio::time::advance(Duration::from_secs(100)).await;
        let admitted = queue.sweep(&v).await;
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].channels.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_once_then_collected() {
        let queue = PendingQueue::new(AdmissionConfig::default());
        let v = verifier(&["c1"]);
        queue.discover(SourceName::from("Open"), channels(&["c1"]));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(queue.sweep(&v).await.len(), 1);
        tokio::time::advance(Duration::from_secs(400)).await;
        assert!(queue.sweep(&v).await.is_empty());
        assert!(queue.contains(&SourceName::from("Open")));

        tokio::time::advance(Duration::from_secs(3600)).await;
        queue.sweep(&v).await;
        assert!(!queue.contains(&SourceName::from("Open")));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_wait() {
        let queue = PendingQueue::new(AdmissionConfig::default());
        queue.discover(SourceName::from("B"), channels(&["c1"]));
        queue.discover(SourceName::from("A"), channels(&["c1", "c2"]));
        tokio::time::advance(Duration::from_secs(10)).await;

        let view = queue.snapshot();
        assert_eq!(view[0].source.as_str(), "A");
        assert_eq!(view[0].channels, 2);
        assert_eq!(view[1].waiting_secs, 10);
    }
}
