//! In-process fakes for the collaborator traits.
//!
//! Deterministic and scriptable, with optional latency so races can be
//! provoked under `tokio::time::pause`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use herald_core::provider::{MessageSender, PullClient, PushSnapshot, SourceRegistry, ThreadProvider};
use herald_core::{
    ChannelId, ChannelRef, DestinationError, MessageId, ProbeError, Registry, SourceError,
    SourceEvent, SourceName, ThreadId,
};

/// Fake forum-style destination.
pub struct FakeDestination {
    latency: Duration,
    close_latency: Mutex<Duration>,
    open: Mutex<BTreeMap<ThreadId, String>>,
    next_thread: AtomicI64,
    next_message: AtomicI64,
    creates: AtomicUsize,
    supports_threads: AtomicBool,
    exists_error: AtomicBool,
    create_failures: Mutex<VecDeque<DestinationError>>,
    send_failures: Mutex<VecDeque<DestinationError>>,
    sent: Mutex<Vec<(Option<ThreadId>, String)>>,
    closed: Mutex<Vec<ThreadId>>,
}

impl Default for FakeDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDestination {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            close_latency: Mutex::new(Duration::ZERO),
            open: Mutex::new(BTreeMap::new()),
            next_thread: AtomicI64::new(100),
            next_message: AtomicI64::new(1),
            creates: AtomicUsize::new(0),
            supports_threads: AtomicBool::new(true),
            exists_error: AtomicBool::new(false),
            create_failures: Mutex::new(VecDeque::new()),
            send_failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// Delay applied to every remote call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Extra delay on `close_thread` only.
    pub fn set_close_latency(&self, latency: Duration) {
        *self.close_latency.lock() = latency;
    }

    pub fn seed_thread(&self, thread: ThreadId, title: &str) {
        self.open.lock().insert(thread, title.to_string());
    }

    /// Delete a thread out-of-band.
    pub fn delete_thread(&self, thread: ThreadId) {
        self.open.lock().remove(&thread);
    }

    pub fn set_supports_threads(&self, supported: bool) {
        self.supports_threads.store(supported, Ordering::SeqCst);
    }

    /// Make existence checks fail with a network error.
    pub fn set_exists_error(&self, failing: bool) {
        self.exists_error.store(failing, Ordering::SeqCst);
    }

    pub fn fail_next_create(&self, error: DestinationError) {
        self.create_failures.lock().push_back(error);
    }

    /// Queue an error for a future send; queued errors are used in order.
    pub fn script_send_failure(&self, error: DestinationError) {
        self.send_failures.lock().push_back(error);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(Option<ThreadId>, String)> {
        self.sent.lock().clone()
    }

    pub fn closed(&self) -> Vec<ThreadId> {
        self.closed.lock().clone()
    }

    pub fn open_threads(&self) -> BTreeMap<ThreadId, String> {
        self.open.lock().clone()
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ThreadProvider for FakeDestination {
    async fn supports_threads(&self) -> Result<bool, DestinationError> {
        self.pause().await;
        Ok(self.supports_threads.load(Ordering::SeqCst))
    }

    async fn create_thread(&self, name: &str) -> Result<ThreadId, DestinationError> {
        self.pause().await;
        if let Some(e) = self.create_failures.lock().pop_front() {
            return Err(e);
        }
        let thread = ThreadId::new(self.next_thread.fetch_add(1, Ordering::SeqCst));
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.open.lock().insert(thread, name.to_string());
        Ok(thread)
    }

    async fn thread_exists(&self, thread: ThreadId) -> Result<bool, DestinationError> {
        self.pause().await;
        if self.exists_error.load(Ordering::SeqCst) {
            return Err(DestinationError::Network("connection reset".into()));
        }
        Ok(self.open.lock().contains_key(&thread))
    }

    async fn close_thread(&self, thread: ThreadId) -> Result<(), DestinationError> {
        self.pause().await;
        let extra = *self.close_latency.lock();
        if !extra.is_zero() {
            tokio::time::sleep(extra).await;
        }
        self.open.lock().remove(&thread);
        self.closed.lock().push(thread);
        Ok(())
    }
}

#[async_trait]
impl MessageSender for FakeDestination {
    async fn send_message(
        &self,
        thread: Option<ThreadId>,
        text: &str,
    ) -> Result<MessageId, DestinationError> {
        self.pause().await;
        if let Some(e) = self.send_failures.lock().pop_front() {
            return Err(e);
        }
        if let Some(t) = thread {
            if !self.open.lock().contains_key(&t) {
                return Err(DestinationError::ThreadNotFound);
            }
        }
        self.sent.lock().push((thread, text.to_string()));
        Ok(MessageId::new(self.next_message.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Fake source registry and pull client.
#[derive(Default)]
pub struct FakeSource {
    registry: Mutex<Registry>,
    readable: Mutex<HashSet<ChannelId>>,
    failing_probes: Mutex<HashSet<ChannelId>>,
    events: Mutex<HashMap<ChannelId, Vec<SourceEvent>>>,
    probe_latency: Mutex<Duration>,
    registry_error: AtomicBool,
    fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, source: &str, channels: &[(&str, &str)]) {
        self.registry.lock().insert(
            SourceName::from(source),
            channels
                .iter()
                .map(|(id, name)| (ChannelId::from(*id), name.to_string()))
                .collect(),
        );
    }

    pub fn remove_source(&self, source: &str) {
        self.registry.lock().remove(source);
    }

    pub fn set_readable(&self, channel: ChannelId, readable: bool) {
        let mut set = self.readable.lock();
        if readable {
            set.insert(channel);
        } else {
            set.remove(&channel);
        }
    }

    /// Make probes of `channel` error instead of answering.
    pub fn fail_probe(&self, channel: ChannelId) {
        self.failing_probes.lock().insert(channel);
    }

    pub fn set_probe_latency(&self, latency: Duration) {
        *self.probe_latency.lock() = latency;
    }

    pub fn set_registry_error(&self, failing: bool) {
        self.registry_error.store(failing, Ordering::SeqCst);
    }

    pub fn push_event(&self, event: SourceEvent) {
        self.events
            .lock()
            .entry(event.channel_id.clone())
            .or_default()
            .push(event);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceRegistry for FakeSource {
    async fn list_sources(&self) -> Result<Registry, SourceError> {
        if self.registry_error.load(Ordering::SeqCst) {
            return Err(SourceError::Network("registry unreachable".into()));
        }
        Ok(self.registry.lock().clone())
    }
}

#[async_trait]
impl PullClient for FakeSource {
    async fn probe_fetch(&self, channel: &ChannelId) -> Result<bool, ProbeError> {
        let latency = *self.probe_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing_probes.lock().contains(channel) {
            return Err(ProbeError::Failure("probe exploded".into()));
        }
        Ok(self.readable.lock().contains(channel))
    }

    async fn fetch_recent(
        &self,
        channel: &ChannelRef,
        limit: usize,
    ) -> Result<Vec<SourceEvent>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.readable.lock().contains(&channel.id) {
            return Err(SourceError::Unauthorized("Missing Access".into()));
        }
        let mut events = self
            .events
            .lock()
            .get(&channel.id)
            .cloned()
            .unwrap_or_default();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(limit);
        Ok(events)
    }
}

/// Push snapshot with a fixed, settable channel set.
#[derive(Default)]
pub struct StaticPushSnapshot {
    visible: Mutex<HashSet<ChannelId>>,
}

impl StaticPushSnapshot {
    pub fn new(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            visible: Mutex::new(channels.into_iter().collect()),
        }
    }

    pub fn set_visible(&self, channel: ChannelId, visible: bool) {
        let mut set = self.visible.lock();
        if visible {
            set.insert(channel);
        } else {
            set.remove(&channel);
        }
    }
}

impl PushSnapshot for StaticPushSnapshot {
    fn is_visible(&self, channel: &ChannelId) -> bool {
        self.visible.lock().contains(channel)
    }

    fn visible_channels(&self) -> HashSet<ChannelId> {
        self.visible.lock().clone()
    }
}
