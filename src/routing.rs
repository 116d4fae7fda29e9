use crate::channel::ChannelName;
use smallvec::SmallVec;
use std::fmt;

/// Total number of hash slots of a clustered backend.
pub const SLOT_COUNT: u16 = 16384;

/// Identifier of one backend partition.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ShardId(u16);

impl ShardId {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Set of shards returned by [`Router::shards`].
pub type ShardIds = SmallVec<[ShardId; 8]>;

/// Cluster topology resolver.
///
/// The router maps channel names to backend partitions and reports the
/// manager lifecycle; how it tracks the topology is its own business.
/// A router that is shutting down typically resolves no shard at all.
pub trait Router: Send + Sync {
    /// Resolve the shard currently hosting `channel`, or `None` when the
    /// topology cannot place it.
    fn shard_of(&self, channel: &ChannelName) -> Option<ShardId>;

    /// All shards of the current topology.
    fn shards(&self) -> ShardIds;

    fn is_cluster(&self) -> bool;

    fn is_shutting_down(&self) -> bool;
}

/// Implement the cluster hash_slot algorithm over a channel name
/// see. <https://redis.io/docs/reference/cluster-spec/#hash-tags>
pub fn hash_slot(channel: &ChannelName) -> u16 {
    let mut key = channel.as_bytes();

    // { found
    if let Some(s) = memchr::memchr(b'{', key) {
        // } found
        if let Some(e) = memchr::memchr(b'}', &key[s + 1..]) {
            // hash tag non empty
            if e != 0 {
                key = &key[s + 1..s + 1 + e];
            }
        }
    }

    crc16(key) % SLOT_COUNT
}

fn crc16(bytes: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(bytes)
}
