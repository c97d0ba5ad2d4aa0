use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use herald_core::provider::{PullClient, PushSnapshot};
use herald_core::{AccessState, ChannelId, ProbeError};

const PROBE_CONCURRENCY: usize = 8;

#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// Upper bound on a single pull-path probe.
    pub probe_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Combines the push snapshot with a live pull probe into an [`AccessState`].
///
/// Probes never fail the caller: an error or timeout on the pull path is a
/// negative check for that path only.
pub struct AccessVerifier {
    push: Arc<dyn PushSnapshot>,
    pull: Arc<dyn PullClient>,
    config: VerifierConfig,
    last_known: DashMap<ChannelId, AccessState>,
}

impl AccessVerifier {
    pub fn new(push: Arc<dyn PushSnapshot>, pull: Arc<dyn PullClient>, config: VerifierConfig) -> Self {
        Self {
            push,
            pull,
            config,
            last_known: DashMap::new(),
        }
    }

    pub async fn probe(&self, channel: &ChannelId) -> AccessState {
        let push_ok = self.push.is_visible(channel);
        let pull_ok = self.probe_pull(channel).await;
        let state = AccessState::from_paths(push_ok, pull_ok);
        debug!(channel = %channel, push_ok, pull_ok, state = %state, "channel probed");
        self.last_known.insert(channel.clone(), state);
        state
    }

    async fn probe_pull(&self, channel: &ChannelId) -> bool {
        let result = tokio::time::timeout(self.config.probe_timeout, self.pull.probe_fetch(channel))
            .await
            .unwrap_or(Err(ProbeError::Timeout(self.config.probe_timeout)));
        match result {
            Ok(readable) => readable,
            Err(e) => {
                warn!(channel = %channel, error = %e, "pull probe failed");
                false
            }
        }
    }

    /// Probe every channel, a bounded number at a time.
    pub async fn probe_all<I>(&self, channels: I) -> BTreeMap<ChannelId, AccessState>
    where
        I: IntoIterator<Item = ChannelId>,
    {
        let channels: Vec<ChannelId> = channels.into_iter().collect();
        stream::iter(channels)
            .map(|channel| async move {
                let state = self.probe(&channel).await;
                (channel, state)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await
    }

    pub fn last_known(&self, channel: &ChannelId) -> AccessState {
        self.last_known
            .get(channel)
            .map(|s| *s)
            .unwrap_or_default()
    }

    pub fn states(&self) -> BTreeMap<ChannelId, AccessState> {
        self.last_known
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// A push delivery proves the push path without a probe.
    pub fn note_push_delivery(&self, channel: &ChannelId) {
        let mut entry = self.last_known.entry(channel.clone()).or_default();
        *entry = match *entry {
            AccessState::PullOnly | AccessState::Full => AccessState::Full,
            _ => AccessState::PushOnly,
        };
    }
}
