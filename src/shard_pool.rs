use crate::{channel::ChannelName, entry::PubSubEntry};
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

/// Per-shard pool state: the channel keys hosted on the shard and the FIFO of
/// connection entries that still have free subscription slots.
///
/// An entry sits in the queue iff it has at least one free slot and still
/// hosts at least one subscription (or was just created for one). All
/// mutation happens under the engine's free-pool lock.
#[derive(Default)]
pub(crate) struct ShardPool {
    keys: HashSet<ChannelName>,
    free_entries: VecDeque<Arc<PubSubEntry>>,
}

impl ShardPool {
    /// Oldest entry with free slots, without dequeuing it.
    pub fn peek_free(&self) -> Option<&Arc<PubSubEntry>> {
        self.free_entries.front()
    }

    pub fn push_free(&mut self, entry: Arc<PubSubEntry>) {
        if !self.contains_free(&entry) {
            self.free_entries.push_back(entry);
        }
    }

    pub fn remove_free(&mut self, entry: &Arc<PubSubEntry>) {
        self.free_entries.retain(|e| !Arc::ptr_eq(e, entry));
    }

    fn contains_free(&self, entry: &Arc<PubSubEntry>) -> bool {
        self.free_entries.iter().any(|e| Arc::ptr_eq(e, entry))
    }

    pub fn add_key(&mut self, channel: ChannelName) {
        self.keys.insert(channel);
    }

    pub fn remove_key(&mut self, channel: &ChannelName) {
        self.keys.remove(channel);
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.free_entries.is_empty()
    }

    #[cfg(test)]
    pub fn free_entries(&self) -> impl Iterator<Item = &Arc<PubSubEntry>> {
        self.free_entries.iter()
    }

    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}
