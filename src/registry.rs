use crate::{
    channel::ChannelName,
    connection::PubSubConnection,
    entry::PubSubEntry,
    routing::{ShardId, hash_slot},
    util::lock_or_recover,
};
use smallvec::SmallVec;
use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex},
};

/// Key of one hosted subscription.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct SubscriptionKey {
    pub channel: ChannelName,
    pub shard: ShardId,
}

/// Authoritative mapping of which connection entry hosts which subscription.
///
/// A key is inserted the moment the subscribe engine commits it, before the
/// wire acknowledgement, and removed atomically with the teardown commit. For
/// any key at most one entry is mapped; racing subscribers resolve through
/// [`insert`](SubscriptionRegistry::insert), first inserter wins.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<SubscriptionKey, Arc<PubSubEntry>>>,
}

impl SubscriptionRegistry {
    pub fn get(&self, key: &SubscriptionKey) -> Option<Arc<PubSubEntry>> {
        lock_or_recover(&self.entries).get(key).cloned()
    }

    /// Insert `entry` unless the key is already taken; on collision the
    /// existing entry is returned instead.
    pub fn insert(
        &self,
        key: SubscriptionKey,
        entry: Arc<PubSubEntry>,
    ) -> Option<Arc<PubSubEntry>> {
        match lock_or_recover(&self.entries).entry(key) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                None
            }
        }
    }

    pub fn remove(&self, key: &SubscriptionKey) -> Option<Arc<PubSubEntry>> {
        lock_or_recover(&self.entries).remove(key)
    }

    /// Remove the key only while it still maps to `entry`; a rollback must
    /// not evict a subscription committed by someone else in the meantime.
    pub fn remove_if(&self, key: &SubscriptionKey, entry: &Arc<PubSubEntry>) -> bool {
        let mut entries = lock_or_recover(&self.entries);
        match entries.get(key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        lock_or_recover(&self.entries).contains_key(key)
    }

    /// Shards currently hosting `channel`; one ordinarily, several for
    /// notification patterns in cluster mode.
    pub fn shards_of(&self, channel: &ChannelName) -> SmallVec<[ShardId; 4]> {
        let entries = lock_or_recover(&self.entries);
        let mut shards: SmallVec<[ShardId; 4]> = entries
            .keys()
            .filter(|key| &key.channel == channel)
            .map(|key| key.shard)
            .collect();
        shards.sort_unstable();
        shards
    }

    /// First entry hosting `channel`, across all shards.
    pub fn first_entry_of(&self, channel: &ChannelName) -> Option<Arc<PubSubEntry>> {
        let entries = lock_or_recover(&self.entries);
        entries
            .iter()
            .find(|(key, _)| &key.channel == channel)
            .map(|(_, entry)| entry.clone())
    }

    /// Keys whose channel hashes into `slot`.
    pub fn keys_in_slot(&self, slot: u16) -> Vec<SubscriptionKey> {
        let entries = lock_or_recover(&self.entries);
        entries
            .keys()
            .filter(|key| hash_slot(&key.channel) == slot)
            .cloned()
            .collect()
    }

    /// Remove every key hosted by `connection`'s entry and return the entry
    /// together with the removed keys.
    pub fn take_connection(
        &self,
        connection: &Arc<dyn PubSubConnection>,
    ) -> Option<(Arc<PubSubEntry>, Vec<SubscriptionKey>)> {
        let mut entries = lock_or_recover(&self.entries);
        let keys: Vec<SubscriptionKey> = entries
            .iter()
            .filter(|(_, entry)| Arc::ptr_eq(entry.connection(), connection))
            .map(|(key, _)| key.clone())
            .collect();
        let mut taken = None;
        for key in &keys {
            taken = entries.remove(key);
        }
        taken.map(|entry| (entry, keys))
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }
}
