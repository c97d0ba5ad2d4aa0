use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use herald_core::provider::PushSnapshot;
use herald_core::ChannelId;

/// Channels each live gateway connection can see.
///
/// A channel is push-visible while at least one connection lists it.
/// A connection's set is dropped as soon as it disconnects.
#[derive(Default)]
pub struct PushPresence {
    connections: RwLock<HashMap<usize, HashSet<ChannelId>>>,
}

impl PushPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, connection: usize, channels: HashSet<ChannelId>) {
        self.connections.write().insert(connection, channels);
    }

    pub fn clear(&self, connection: usize) {
        self.connections.write().remove(&connection);
    }

    pub fn connected(&self) -> usize {
        self.connections.read().len()
    }
}

impl PushSnapshot for PushPresence {
    fn is_visible(&self, channel: &ChannelId) -> bool {
        self.connections
            .read()
            .values()
            .any(|set| set.contains(channel))
    }

    fn visible_channels(&self) -> HashSet<ChannelId> {
        self.connections
            .read()
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect()
    }
}
