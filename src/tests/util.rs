use crate::{
    ChannelName, Codec, ConnectionProvider, Error, Future, PubSubConfig, PubSubConnection,
    PubSubEntry, Result, Router, ShardId, ShardIds, SubscriptionKind, hash_slot,
};
use futures_util::future;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

pub(crate) use crate::executor::sleep;

pub(crate) fn log_try_init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `predicate` every millisecond until it holds; panics after ~2s.
pub(crate) async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if predicate() {
            return;
        }
        sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

pub(crate) fn test_config() -> PubSubConfig {
    PubSubConfig {
        subscriptions_per_connection: 5,
        retry_attempts: 2,
        retry_interval: Duration::from_millis(50),
        timeout: Duration::from_millis(200),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckMode {
    /// acknowledge every command as soon as it is written
    Auto,
    /// record commands only, the test injects acknowledgements itself
    Manual,
}

/// Scriptable connection double: records written commands and acknowledges
/// them by injecting status messages into the bound entry, the way a real
/// transport would.
pub(crate) struct TestConnection {
    shard: ShardId,
    ack_mode: AckMode,
    muted: AtomicBool,
    fail_writes: AtomicBool,
    entry: Mutex<Weak<PubSubEntry>>,
    commands: Mutex<Vec<(SubscriptionKind, ChannelName)>>,
}

impl TestConnection {
    pub fn new(shard: ShardId, ack_mode: AckMode, fail_writes: bool) -> Arc<Self> {
        Arc::new(Self {
            shard,
            ack_mode,
            muted: AtomicBool::new(false),
            fail_writes: AtomicBool::new(fail_writes),
            entry: Mutex::new(Weak::new()),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn command_count(&self, kind: SubscriptionKind) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(command_kind, _)| *command_kind == kind)
            .count()
    }

    /// Suppress automatic acknowledgements from now on.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn entry(&self) -> Option<Arc<PubSubEntry>> {
        self.entry.lock().unwrap().upgrade()
    }

    /// Inject a status message into the bound entry.
    pub fn acknowledge(&self, kind: SubscriptionKind, channel: &ChannelName) {
        if let Some(entry) = self.entry() {
            entry.on_status_message(kind, channel);
        }
    }

    fn record(&self, kind: SubscriptionKind, channel: &ChannelName) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Wire("injected write failure".to_owned()));
        }
        self.commands.lock().unwrap().push((kind, channel.clone()));
        if self.ack_mode == AckMode::Auto && !self.muted.load(Ordering::SeqCst) {
            self.acknowledge(kind, channel);
        }
        Ok(())
    }
}

impl PubSubConnection for TestConnection {
    fn bind(&self, entry: Weak<PubSubEntry>) {
        *self.entry.lock().unwrap() = entry;
    }

    fn subscribe(&self, _codec: &Codec, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move { self.record(SubscriptionKind::Subscribe, &channel) })
    }

    fn psubscribe(&self, _codec: &Codec, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move { self.record(SubscriptionKind::PSubscribe, &channel) })
    }

    fn unsubscribe(&self, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move { self.record(SubscriptionKind::Unsubscribe, &channel) })
    }

    fn punsubscribe(&self, channel: &ChannelName) -> Future<'_, ()> {
        let channel = channel.clone();
        Box::pin(async move { self.record(SubscriptionKind::PUnsubscribe, &channel) })
    }
}

/// Scriptable backend pool double.
pub(crate) struct TestConnectionProvider {
    ack_mode: AckMode,
    connect_failures: AtomicU32,
    hang: AtomicBool,
    fail_writes: AtomicBool,
    attempts: AtomicU32,
    connections: Mutex<Vec<Arc<TestConnection>>>,
    released: Mutex<Vec<Arc<dyn PubSubConnection>>>,
}

impl TestConnectionProvider {
    pub fn new(ack_mode: AckMode) -> Arc<Self> {
        Arc::new(Self {
            ack_mode,
            connect_failures: AtomicU32::new(0),
            hang: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            connections: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Keep connect attempts pending forever.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// Hand out connections whose writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<TestConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn connection(&self, index: usize) -> Arc<TestConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn released_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }
}

impl ConnectionProvider for TestConnectionProvider {
    fn acquire_pubsub(&self, shard: ShardId) -> Future<'_, Arc<dyn PubSubConnection>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                future::pending::<()>().await;
            }
            if self
                .connect_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |failures| {
                    failures.checked_sub(1)
                })
                .is_ok()
            {
                return Err(Error::Connect("injected connect failure".to_owned()));
            }
            let connection = TestConnection::new(
                shard,
                self.ack_mode,
                self.fail_writes.load(Ordering::SeqCst),
            );
            self.connections.lock().unwrap().push(connection.clone());
            Ok(connection as Arc<dyn PubSubConnection>)
        })
    }

    fn release_pubsub(&self, _shard: ShardId, connection: Arc<dyn PubSubConnection>) {
        self.released.lock().unwrap().push(connection);
    }
}

/// Remappable topology double. Routes explicitly mapped channels first, then
/// hashes into the shard list; resolves nothing while shutting down.
pub(crate) struct TestRouter {
    routes: Mutex<HashMap<ChannelName, ShardId>>,
    shards: Mutex<Vec<ShardId>>,
    cluster: AtomicBool,
    shutting_down: AtomicBool,
}

impl TestRouter {
    pub fn single(shard: ShardId) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            shards: Mutex::new(vec![shard]),
            cluster: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn cluster(shards: Vec<ShardId>) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            shards: Mutex::new(shards),
            cluster: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn set_route(&self, channel: impl Into<ChannelName>, shard: ShardId) {
        self.routes.lock().unwrap().insert(channel.into(), shard);
    }

    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::SeqCst);
    }
}

impl Router for TestRouter {
    fn shard_of(&self, channel: &ChannelName) -> Option<ShardId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(shard) = self.routes.lock().unwrap().get(channel) {
            return Some(*shard);
        }
        let shards = self.shards.lock().unwrap();
        if shards.is_empty() {
            None
        } else {
            Some(shards[hash_slot(channel) as usize % shards.len()])
        }
    }

    fn shards(&self) -> ShardIds {
        self.shards.lock().unwrap().iter().copied().collect()
    }

    fn is_cluster(&self) -> bool {
        self.cluster.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
