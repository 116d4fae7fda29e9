#![cfg_attr(docsrs, feature(doc_cfg))]
/*!
pubsub-mux shares a bounded pool of pub/sub connections across an unbounded
set of logical channel subscriptions against a clustered Redis-compatible
backend.

# Philosophy
* Full async library
* No blocking primitives: critical sections are async semaphores
* Transport, topology and payload decoding stay behind traits
* Rust idiomatic API

# Features
* Connection entry reuse: one wire SUBSCRIBE per channel, however many
  subscribers
* Capacity rollover: a new connection is created when every pooled entry of a
  shard reached its subscription cap
* Pattern subscriptions, with keyspace/keyevent notification channels
  broadcast across all shards in cluster mode
* Watchdogged subscribe/unsubscribe acknowledgements; teardown always
  completes, even against a silent backend
* Transparent reattachment after a connection loss or a slot migration
* Async support ([tokio](https://tokio.rs/) or [async-std](https://async.rs/))

# External collaborators

The multiplexer drives three traits and owns none of their concerns:
* [`Router`] resolves a channel to a shard and reports the manager lifecycle.
* [`ConnectionProvider`] hands out and takes back pub/sub connections.
* [`PubSubConnection`] writes the wire commands; the transport behind it
  routes acknowledgements and payloads to the owning [`PubSubEntry`] through
  [`on_status_message`](PubSubEntry::on_status_message) and
  [`on_message`](PubSubEntry::on_message).

# Basic Usage

```
use pubsub_mux::{
    ChannelName, Codec, ConnectionProvider, Future, PubSubConfig, PubSubConnection, PubSubEntry,
    PubSubListener, PubSubMessage, PubSubMultiplexer, Result, Router, ShardId, ShardIds,
    SubscriptionKind,
};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, Weak};

struct SingleShardRouter;

impl Router for SingleShardRouter {
    fn shard_of(&self, _channel: &ChannelName) -> Option<ShardId> {
        Some(ShardId::new(0))
    }

    fn shards(&self) -> ShardIds {
        ShardIds::from_slice(&[ShardId::new(0)])
    }

    fn is_cluster(&self) -> bool {
        false
    }

    fn is_shutting_down(&self) -> bool {
        false
    }
}

/// Test double standing in for a real transport: acknowledges every command
/// by injecting the matching status message into the owning entry.
#[derive(Default)]
struct LoopbackConnection {
    entry: Mutex<Weak<PubSubEntry>>,
}

impl LoopbackConnection {
    fn acknowledge(&self, kind: SubscriptionKind, channel: &ChannelName) {
        let entry = self.entry.lock().unwrap().clone();
        if let Some(entry) = entry.upgrade() {
            entry.on_status_message(kind, channel);
        }
    }
}

impl PubSubConnection for LoopbackConnection {
    fn bind(&self, entry: Weak<PubSubEntry>) {
        *self.entry.lock().unwrap() = entry;
    }

    fn subscribe(&self, _codec: &Codec, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move {
            self.acknowledge(SubscriptionKind::Subscribe, &channel);
            Ok(())
        })
    }

    fn psubscribe(&self, _codec: &Codec, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move {
            self.acknowledge(SubscriptionKind::PSubscribe, &channel);
            Ok(())
        })
    }

    fn unsubscribe(&self, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move {
            self.acknowledge(SubscriptionKind::Unsubscribe, &channel);
            Ok(())
        })
    }

    fn punsubscribe(&self, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move {
            self.acknowledge(SubscriptionKind::PUnsubscribe, &channel);
            Ok(())
        })
    }
}

struct LoopbackProvider;

impl ConnectionProvider for LoopbackProvider {
    fn acquire_pubsub(&self, _shard: ShardId) -> Future<'_, Arc<dyn PubSubConnection>> {
        Box::pin(async {
            Ok(Arc::new(LoopbackConnection::default()) as Arc<dyn PubSubConnection>)
        })
    }

    fn release_pubsub(&self, _shard: ShardId, _connection: Arc<dyn PubSubConnection>) {}
}

#[cfg_attr(feature = "tokio-runtime", tokio::main)]
#[cfg_attr(feature = "async-std-runtime", async_std::main)]
async fn main() -> Result<()> {
    let multiplexer = PubSubMultiplexer::new(
        PubSubConfig::default(),
        Arc::new(SingleShardRouter),
        Arc::new(LoopbackProvider),
    )?;

    let (listener, mut messages) = PubSubListener::new();
    let entry = multiplexer
        .subscribe(Codec::default(), "news", vec![listener])
        .await?;

    // a real transport delivers payload frames the same way
    entry.on_message(PubSubMessage {
        pattern: None,
        channel: "news".into(),
        payload: "breaking".into(),
    });

    let message = messages.next().await.unwrap();
    assert_eq!(b"breaking".as_ref(), &message.payload[..]);

    multiplexer
        .unsubscribe(SubscriptionKind::Unsubscribe, "news")
        .await?;

    Ok(())
}
```
*/

mod channel;
mod codec;
mod config;
mod connection;
mod entry;
mod error;
mod executor;
mod listener;
mod multiplexer;
mod registry;
mod routing;
mod semaphore;
mod shard_pool;
mod timer;
mod util;

pub use channel::{ChannelName, SubscriptionKind};
pub use codec::Codec;
pub use config::PubSubConfig;
pub use connection::{ConnectionProvider, PubSubConnection};
pub use entry::PubSubEntry;
pub use error::Error;
pub use listener::{
    ListenerId, MessageReceiver, MessageSender, PubSubListener, PubSubMessage,
};
pub use multiplexer::PubSubMultiplexer;
pub use routing::{Router, ShardId, ShardIds, SLOT_COUNT, hash_slot};

/// Library general result type.
pub type Result<T> = std::result::Result<T, Error>;
/// Library general future type.
pub type Future<'a, T> = futures_util::future::BoxFuture<'a, Result<T>>;

#[cfg(all(feature = "tokio-runtime", feature = "async-std-runtime"))]
compile_error!(
    "feature \"tokio-runtime\" and feature \"async-std-runtime\" cannot be enabled at the same time"
);

#[cfg(test)]
mod tests;
