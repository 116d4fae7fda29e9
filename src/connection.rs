use crate::{Future, channel::ChannelName, codec::Codec, entry::PubSubEntry, routing::ShardId};
use std::sync::{Arc, Weak};

/// One physical pub/sub connection, as seen by the multiplexer.
///
/// Implementations frame and write the wire commands; the returned futures
/// resolve when the command has been written, not when it is acknowledged.
/// Acknowledgements travel back as status messages: the transport routes them
/// to the owning [`PubSubEntry`] through the handle received in
/// [`bind`](PubSubConnection::bind), calling
/// [`on_status_message`](PubSubEntry::on_status_message) for status frames
/// and [`on_message`](PubSubEntry::on_message) for payload frames.
pub trait PubSubConnection: Send + Sync {
    /// Called once when a [`PubSubEntry`] takes ownership of this connection.
    ///
    /// The entry is handed out weakly so a transport callback can never keep
    /// the engine alive. The default implementation ignores the handle.
    fn bind(&self, entry: Weak<PubSubEntry>) {
        let _ = entry;
    }

    /// Write a SUBSCRIBE command for `channel`.
    fn subscribe(&self, codec: &Codec, channel: &ChannelName) -> Future<'_, ()>;

    /// Write a PSUBSCRIBE command for the pattern `channel`.
    fn psubscribe(&self, codec: &Codec, channel: &ChannelName) -> Future<'_, ()>;

    /// Write an UNSUBSCRIBE command for `channel`.
    fn unsubscribe(&self, channel: &ChannelName) -> Future<'_, ()>;

    /// Write a PUNSUBSCRIBE command for the pattern `channel`.
    fn punsubscribe(&self, channel: &ChannelName) -> Future<'_, ()>;
}

/// Pool of pub/sub connections, one sub-pool per shard.
///
/// Ownership of a connection transfers to the multiplexer on
/// [`acquire_pubsub`](ConnectionProvider::acquire_pubsub) and back on
/// [`release_pubsub`](ConnectionProvider::release_pubsub), once the last
/// subscription hosted by the connection has been removed.
pub trait ConnectionProvider: Send + Sync {
    /// Acquire a fresh pub/sub connection to `shard`.
    fn acquire_pubsub(&self, shard: ShardId) -> Future<'_, Arc<dyn PubSubConnection>>;

    /// Take back a connection that hosts no subscription anymore.
    fn release_pubsub(&self, shard: ShardId, connection: Arc<dyn PubSubConnection>);
}
