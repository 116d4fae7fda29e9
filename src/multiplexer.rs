use crate::{
    Error, Result,
    channel::{ChannelName, SubscriptionKind},
    codec::Codec,
    config::PubSubConfig,
    connection::{ConnectionProvider, PubSubConnection},
    entry::{AbortSubscribe, PubSubEntry},
    executor::{sleep, spawn, timeout},
    listener::{ListenerId, PubSubListener},
    registry::{SubscriptionKey, SubscriptionRegistry},
    routing::{Router, ShardId},
    semaphore::AsyncSemaphore,
    shard_pool::ShardPool,
    timer::Watchdog,
    util::lock_or_recover,
};
use futures_channel::oneshot;
use futures_util::future;
use log::{debug, info, trace, warn};
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, Mutex},
    time::Duration,
};

/// Number of single-permit semaphores striping the per-channel critical
/// sections. Prime, sized above the expected hot-channel count.
const LOCK_STRIPES: usize = 53;

/// Fixed pace of the best-effort reattachment retries.
const REATTACH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

type ListenerIds = SmallVec<[ListenerId; 2]>;

/// Outcome of trying to reserve a slot on a pooled entry.
enum Reservation {
    /// slot reserved and registry committed
    Reserved(Arc<PubSubEntry>),
    /// another subscriber committed the same key first
    Raced,
    /// no pooled entry has free slots, a new connection is needed
    Empty,
}

struct MultiplexerInner {
    config: PubSubConfig,
    router: Arc<dyn Router>,
    provider: Arc<dyn ConnectionProvider>,
    registry: SubscriptionRegistry,
    shard_pools: Mutex<HashMap<ShardId, ShardPool>>,
    channel_locks: Vec<AsyncSemaphore>,
    free_pool_lock: AsyncSemaphore,
}

/// Shares a bounded pool of pub/sub connections across an unbounded set of
/// logical channel subscriptions.
///
/// The multiplexer reuses a connection entry for every subscriber of a
/// channel, rolls over to a new connection when every pooled entry of a shard
/// is at its subscription cap, and replays subscriptions transparently after
/// a connection loss or a slot migration.
///
/// Per-channel work is serialized through a striped array of single-permit
/// [`AsyncSemaphore`]s; pool accounting is serialized through one more. The
/// per-channel lock is always taken before the pool lock, and completions
/// are delivered through channels, never under a lock.
///
/// Cloning is cheap and every clone drives the same state.
#[derive(Clone)]
pub struct PubSubMultiplexer {
    inner: Arc<MultiplexerInner>,
}

impl PubSubMultiplexer {
    pub fn new(
        config: PubSubConfig,
        router: Arc<dyn Router>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(MultiplexerInner {
                config,
                router,
                provider,
                registry: SubscriptionRegistry::default(),
                shard_pools: Mutex::new(HashMap::new()),
                channel_locks: (0..LOCK_STRIPES).map(|_| AsyncSemaphore::new(1)).collect(),
                free_pool_lock: AsyncSemaphore::new(1),
            }),
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.inner.config
    }

    fn channel_lock(&self, channel: &ChannelName) -> &AsyncSemaphore {
        let mut hasher = DefaultHasher::new();
        channel.as_bytes().hash(&mut hasher);
        &self.inner.channel_locks[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    /// Subscribe `listeners` to `channel`.
    ///
    /// The returned future completes with the hosting entry once the backend
    /// acknowledged the subscription, immediately when the channel is already
    /// hosted. Listeners attached before the acknowledgement observe every
    /// message delivered on the channel.
    pub async fn subscribe(
        &self,
        codec: Codec,
        channel: impl Into<ChannelName>,
        listeners: Vec<PubSubListener>,
    ) -> Result<Arc<PubSubEntry>> {
        let channel = channel.into();
        let shard = self.shard_of(&channel)?;
        self.subscribe_on_shard(SubscriptionKind::Subscribe, codec, channel, listeners, shard)
            .await
    }

    /// Subscribe `listeners` to the glob pattern `channel`.
    ///
    /// Keyspace/keyevent notification channels are broadcast by every shard
    /// in cluster mode, so the subscription is established on all of them and
    /// one entry per shard is returned; any other pattern routes normally.
    pub async fn psubscribe(
        &self,
        codec: Codec,
        channel: impl Into<ChannelName>,
        listeners: Vec<PubSubListener>,
    ) -> Result<Vec<Arc<PubSubEntry>>> {
        let channel = channel.into();
        if self.inner.router.is_cluster() && channel.is_notification_channel() {
            let shards = self.inner.router.shards();
            if shards.is_empty() {
                return Err(Error::NodeNotFound(format!(
                    "no shard for notification channel {channel}"
                )));
            }
            let subscribes = shards.into_iter().map(|shard| {
                let codec = codec.clone();
                let channel = channel.clone();
                let listeners = listeners.clone();
                async move {
                    self.subscribe_on_shard(
                        SubscriptionKind::PSubscribe,
                        codec,
                        channel,
                        listeners,
                        shard,
                    )
                    .await
                }
            });
            future::join_all(subscribes).await.into_iter().collect()
        } else {
            let shard = self.shard_of(&channel)?;
            let entry = self
                .subscribe_on_shard(SubscriptionKind::PSubscribe, codec, channel, listeners, shard)
                .await?;
            Ok(vec![entry])
        }
    }

    /// Tear down the subscription for `channel` on every shard hosting it.
    ///
    /// Returns the codec the channel was subscribed with, so a caller can
    /// resubscribe identically, or `None` when nothing was subscribed (a
    /// second teardown of the same channel completes immediately).
    ///
    /// A failure to write the teardown command is logged and swallowed: the
    /// watchdog synthesizes a local acknowledgement after
    /// [`timeout`](PubSubConfig::timeout) so the returned future always
    /// completes, at the cost of ignoring a late duplicate acknowledgement.
    pub async fn unsubscribe(
        &self,
        kind: SubscriptionKind,
        channel: impl Into<ChannelName>,
    ) -> Result<Option<Codec>> {
        let kind = kind.to_unsubscribe();
        let channel = channel.into();
        if self.inner.router.is_shutting_down() {
            return Ok(None);
        }
        let _channel_guard = self.channel_lock(&channel).acquire().await;
        let mut codec = None;
        for shard in self.inner.registry.shards_of(&channel) {
            if let Some(entry_codec) = self.unsubscribe_locked(kind, &channel, shard).await? {
                codec = Some(entry_codec);
            }
        }
        Ok(codec)
    }

    /// Detach listeners from `channel`; when the last one goes away the
    /// subscription itself is torn down and, once its connection hosts
    /// nothing anymore, the connection returns to the backend pool.
    ///
    /// For notification patterns hosted on several shards, the future
    /// completes when every shard finished.
    pub async fn remove_listener(
        &self,
        kind: SubscriptionKind,
        channel: impl Into<ChannelName>,
        listener_ids: impl IntoIterator<Item = ListenerId>,
    ) -> Result<()> {
        let listener_ids: ListenerIds = listener_ids.into_iter().collect();
        self.strip_listeners(kind, channel.into(), Some(&listener_ids))
            .await
    }

    /// Detach every listener of `channel` and tear the subscription down.
    pub async fn remove_all_listeners(
        &self,
        kind: SubscriptionKind,
        channel: impl Into<ChannelName>,
    ) -> Result<()> {
        self.strip_listeners(kind, channel.into(), None).await
    }

    /// Entry currently hosting `channel`, if any.
    pub fn entry_of(&self, channel: &ChannelName) -> Option<Arc<PubSubEntry>> {
        self.inner.registry.first_entry_of(channel)
    }

    /// Re-run every subscription whose channel hashes into `slot`.
    ///
    /// Driven by the connection manager on topology changes (slot migration,
    /// master failover). Each affected channel is detached from its old shard
    /// binding and resubscribed wherever the router currently points, with
    /// its codec and listeners preserved. Failures are retried forever at a
    /// fixed 1 second pace; every replay goes through the ordinary engine
    /// paths and therefore serializes with concurrent calls on the same
    /// channel.
    pub fn reattach_slot(&self, slot: u16) {
        let keys = self.inner.registry.keys_in_slot(slot);
        if keys.is_empty() {
            return;
        }
        info!("reattaching {} subscription(s) of slot {slot}", keys.len());
        for key in keys {
            let this = self.clone();
            spawn(async move { this.reattach_key(key).await });
        }
    }

    /// Recover the subscriptions hosted by a broken connection.
    ///
    /// The owning entry is discarded (its connection is not returned to the
    /// pool) and everything it hosted is resubscribed on whatever shard the
    /// router currently indicates, retrying forever at a fixed 1 second pace.
    pub fn reattach_connection(&self, connection: &Arc<dyn PubSubConnection>) {
        let Some((entry, keys)) = self.inner.registry.take_connection(connection) else {
            return;
        };
        info!(
            "reattaching {} subscription(s) of a lost connection",
            keys.len()
        );
        let this = self.clone();
        spawn(async move {
            {
                let _pool_guard = this.inner.free_pool_lock.acquire().await;
                let mut pools = lock_or_recover(&this.inner.shard_pools);
                for key in &keys {
                    if let Some(pool) = pools.get_mut(&key.shard) {
                        pool.remove_key(&key.channel);
                        pool.remove_free(&entry);
                        if pool.is_empty() {
                            pools.remove(&key.shard);
                        }
                    }
                }
            }
            // the broken connection never goes back to the pool
            entry.retire();

            for (kind, channel, codec, listeners) in entry.snapshot() {
                let this = this.clone();
                spawn(async move {
                    this.resubscribe_forever(kind, codec, channel, listeners)
                        .await
                });
            }
        });
    }

    fn shard_of(&self, channel: &ChannelName) -> Result<ShardId> {
        self.inner
            .router
            .shard_of(channel)
            .ok_or_else(|| Error::NodeNotFound(format!("no shard for channel {channel}")))
    }

    async fn subscribe_on_shard(
        &self,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        listeners: Vec<PubSubListener>,
        shard: ShardId,
    ) -> Result<Arc<PubSubEntry>> {
        let _channel_guard = self.channel_lock(&channel).acquire().await;
        self.subscribe_locked(kind, codec, channel, listeners, shard)
            .await
    }

    /// Subscribe engine body; runs under the per-channel lock.
    async fn subscribe_locked(
        &self,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        listeners: Vec<PubSubListener>,
        shard: ShardId,
    ) -> Result<Arc<PubSubEntry>> {
        let key = SubscriptionKey {
            channel: channel.clone(),
            shard,
        };
        loop {
            // fast path: the channel is already hosted, attach and wait for
            // the initial acknowledgement
            if let Some(entry) = self.inner.registry.get(&key) {
                trace!("reusing pub/sub entry for {channel} on shard {shard}");
                return self.attach_to_entry(kind, &channel, listeners, entry).await;
            }

            match self.reserve_pooled_entry(&key).await? {
                Reservation::Reserved(entry) => {
                    return self
                        .issue_subscribe(kind, codec, channel, listeners, shard, entry)
                        .await;
                }
                Reservation::Raced => continue,
                Reservation::Empty => {
                    return self
                        .subscribe_with_new_connection(kind, codec, channel, listeners, shard)
                        .await;
                }
            }
        }
    }

    /// Slow path step: under the free-pool lock, reserve a slot on the head
    /// of the shard's free queue and commit the registry key.
    async fn reserve_pooled_entry(&self, key: &SubscriptionKey) -> Result<Reservation> {
        let _pool_guard = self.inner.free_pool_lock.acquire().await;
        let mut pools = lock_or_recover(&self.inner.shard_pools);
        let pool = pools.entry(key.shard).or_default();

        let Some(entry) = pool.peek_free().cloned() else {
            return Ok(Reservation::Empty);
        };
        if !entry.try_acquire() {
            // R4: a queued entry always has free slots
            return Err(Error::Internal(format!(
                "pooled entry for shard {} has no free slot",
                key.shard
            )));
        }
        if self.inner.registry.insert(key.clone(), entry.clone()).is_some() {
            entry.release_slot();
            return Ok(Reservation::Raced);
        }
        pool.add_key(key.channel.clone());
        if entry.free_slots() == 0 {
            pool.remove_free(&entry);
        }
        Ok(Reservation::Reserved(entry))
    }

    /// Attach listeners to an entry that already hosts (or is acquiring) the
    /// channel and wait for the initial subscribe acknowledgement.
    async fn attach_to_entry(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        listeners: Vec<PubSubListener>,
        entry: Arc<PubSubEntry>,
    ) -> Result<Arc<PubSubEntry>> {
        let listener_ids: ListenerIds = listeners.iter().map(PubSubListener::id).collect();
        entry.add_listeners(kind, channel, &listeners);

        let ack = entry.subscribe_ack(kind, channel);
        match timeout(self.inner.config.timeout, ack).await {
            Ok(Ok(Ok(()))) => Ok(entry),
            Ok(Ok(Err(e))) => {
                entry.remove_listeners(kind, channel, &listener_ids);
                Err(e)
            }
            Ok(Err(_canceled)) => {
                entry.remove_listeners(kind, channel, &listener_ids);
                Err(Error::Internal(format!(
                    "subscription state for {channel} was dropped before its acknowledgement"
                )))
            }
            Err(_) => {
                entry.remove_listeners(kind, channel, &listener_ids);
                Err(self.ack_timeout(kind, channel))
            }
        }
    }

    /// 4.2a: no pooled entry has room, acquire a brand new connection.
    async fn subscribe_with_new_connection(
        &self,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        listeners: Vec<PubSubListener>,
        shard: ShardId,
    ) -> Result<Arc<PubSubEntry>> {
        let connection = self.connect_with_retries(shard).await?;
        let key = SubscriptionKey {
            channel: channel.clone(),
            shard,
        };

        let entry = {
            let _pool_guard = self.inner.free_pool_lock.acquire().await;
            let entry = PubSubEntry::new(connection, self.inner.config.subscriptions_per_connection);
            if !entry.try_acquire() {
                return Err(Error::Internal(
                    "fresh pub/sub entry has no free slot".to_owned(),
                ));
            }
            if let Some(existing) = self.inner.registry.insert(key.clone(), entry.clone()) {
                // someone committed the key while we were connecting; give
                // the fresh connection back and attach to the winner
                entry.release_slot();
                if entry.retire() {
                    self.inner
                        .provider
                        .release_pubsub(shard, entry.connection().clone());
                }
                drop(_pool_guard);
                return self.attach_to_entry(kind, &channel, listeners, existing).await;
            }
            let mut pools = lock_or_recover(&self.inner.shard_pools);
            let pool = pools.entry(shard).or_default();
            pool.add_key(channel.clone());
            if entry.free_slots() > 0 {
                pool.push_free(entry.clone());
            }
            entry
        };

        debug!("created pub/sub connection entry for shard {shard}");
        self.issue_subscribe(kind, codec, channel, listeners, shard, entry)
            .await
    }

    /// Acquire a pub/sub connection, canceling an attempt that outlives
    /// `retry_interval` and retrying up to `retry_attempts` times.
    async fn connect_with_retries(&self, shard: ShardId) -> Result<Arc<dyn PubSubConnection>> {
        let retry_interval = self.inner.config.retry_interval;
        let mut attempt: u32 = 0;
        loop {
            match timeout(retry_interval, self.inner.provider.acquire_pubsub(shard)).await {
                Ok(Ok(connection)) => return Ok(connection),
                Ok(Err(e)) => {
                    if attempt >= self.inner.config.retry_attempts {
                        return Err(e);
                    }
                    trace!("connect attempt {attempt} to shard {shard} failed: {e}");
                    sleep(retry_interval).await;
                }
                Err(_) => {
                    // dropping the attempt cancels it
                    if attempt >= self.inner.config.retry_attempts {
                        return Err(Error::Connect(format!(
                            "pub/sub connect attempt to shard {shard} timed out"
                        )));
                    }
                    trace!("connect attempt {attempt} to shard {shard} timed out");
                }
            }
            attempt += 1;
        }
    }

    /// Write the subscribe command and wait for its acknowledgement under the
    /// configured watchdog. The wire exchange runs in a detached task so a
    /// canceled caller cannot abort it half-way; a rollback guard restores
    /// registry, pool and listener state when the caller goes away early.
    async fn issue_subscribe(
        &self,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        listeners: Vec<PubSubListener>,
        shard: ShardId,
        entry: Arc<PubSubEntry>,
    ) -> Result<Arc<PubSubEntry>> {
        let listener_ids: ListenerIds = listeners.iter().map(PubSubListener::id).collect();
        entry.add_listeners(kind, &channel, &listeners);
        let ack = entry.begin_subscribe(kind, codec.clone(), &channel);

        let mut rollback = RollbackGuard {
            multiplexer: self.clone(),
            kind,
            channel: channel.clone(),
            shard,
            entry: entry.clone(),
            listener_ids: listener_ids.clone(),
            armed: true,
        };

        {
            let entry = entry.clone();
            let channel = channel.clone();
            spawn(async move {
                let connection = entry.connection().clone();
                let result = match kind {
                    SubscriptionKind::Subscribe => connection.subscribe(&codec, &channel).await,
                    SubscriptionKind::PSubscribe => connection.psubscribe(&codec, &channel).await,
                    _ => Err(Error::Internal(format!("{kind} is not a subscribe command"))),
                };
                if let Err(e) = result {
                    warn!("failed to write {kind} {channel}: {e}");
                    entry.abort_subscribe(kind, &channel, Error::Wire(e.to_string()));
                }
            });
        }

        match timeout(self.inner.config.timeout, ack).await {
            Ok(Ok(Ok(()))) => {
                rollback.armed = false;
                trace!("subscribed to {channel} on shard {shard}");
                Ok(entry)
            }
            Ok(Ok(Err(e))) => {
                rollback.armed = false;
                self.cleanup_subscribe(kind, &channel, shard, &entry, &listener_ids, false)
                    .await;
                Err(e)
            }
            Ok(Err(_canceled)) => {
                rollback.armed = false;
                self.cleanup_subscribe(kind, &channel, shard, &entry, &listener_ids, false)
                    .await;
                Err(Error::Internal(format!(
                    "subscription state for {channel} was dropped before its acknowledgement"
                )))
            }
            Err(_) => {
                rollback.armed = false;
                match entry.abort_subscribe(kind, &channel, self.ack_timeout(kind, &channel)) {
                    // the acknowledgement landed a hair after the watchdog
                    AbortSubscribe::Acknowledged => Ok(entry),
                    _ => {
                        self.cleanup_subscribe(kind, &channel, shard, &entry, &listener_ids, true)
                            .await;
                        Err(self.ack_timeout(kind, &channel))
                    }
                }
            }
        }
    }

    fn ack_timeout(&self, kind: SubscriptionKind, channel: &ChannelName) -> Error {
        Error::Timeout(format!(
            "no acknowledgement for {kind} {channel} within {:?}",
            self.inner.config.timeout
        ))
    }

    /// Undo a failed or abandoned subscribe: drop the pending exchange, strip
    /// the listeners it attached, roll back the registry key and reconcile
    /// the pool. When the backend may have accepted the command without
    /// answering in time, a teardown command is emitted as well.
    async fn cleanup_subscribe(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        shard: ShardId,
        entry: &Arc<PubSubEntry>,
        listener_ids: &[ListenerId],
        partially_accepted: bool,
    ) {
        entry.abort_subscribe(
            kind,
            channel,
            Error::Wire(format!("subscription to {channel} was rolled back")),
        );
        entry.remove_listeners(kind, channel, listener_ids);

        let key = SubscriptionKey {
            channel: channel.clone(),
            shard,
        };
        self.inner.registry.remove_if(&key, entry);
        let keep_key = self.inner.registry.contains(&key);
        {
            let _pool_guard = self.inner.free_pool_lock.acquire().await;
            self.reconcile_locked(shard, channel, entry, !keep_key);
        }

        if partially_accepted {
            let connection = entry.connection().clone();
            let channel = channel.clone();
            let unsubscribe_kind = kind.to_unsubscribe();
            spawn(async move {
                let result = match unsubscribe_kind {
                    SubscriptionKind::PUnsubscribe => connection.punsubscribe(&channel).await,
                    _ => connection.unsubscribe(&channel).await,
                };
                if let Err(e) = result {
                    trace!("cleanup {unsubscribe_kind} {channel} failed: {e}");
                }
            });
        }
    }

    /// Forced teardown of `(channel, shard)`; runs under the per-channel
    /// lock. Completes on the real acknowledgement or on the one synthesized
    /// by the watchdog.
    async fn unsubscribe_locked(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        shard: ShardId,
    ) -> Result<Option<Codec>> {
        if self.inner.router.is_shutting_down() {
            return Ok(None);
        }
        let key = SubscriptionKey {
            channel: channel.clone(),
            shard,
        };
        let Some(entry) = self.inner.registry.remove(&key) else {
            return Ok(None);
        };

        {
            let _pool_guard = self.inner.free_pool_lock.acquire().await;
            let mut pools = lock_or_recover(&self.inner.shard_pools);
            if let Some(pool) = pools.get_mut(&shard) {
                pool.remove_key(channel);
                pool.remove_free(&entry);
            }
        }

        let codec = entry.codec_of(kind, channel);
        let ack = entry.begin_unsubscribe(kind, channel);

        {
            // detached wire driver; failures are swallowed, the watchdog
            // guarantees completion
            let connection = entry.connection().clone();
            let channel = channel.clone();
            spawn(async move {
                let result = match kind {
                    SubscriptionKind::PUnsubscribe => connection.punsubscribe(&channel).await,
                    _ => connection.unsubscribe(&channel).await,
                };
                if let Err(e) = result {
                    warn!("failed to write {kind} {channel}: {e}");
                }
            });
        }

        // completion runs detached: canceling the caller must not stop a
        // teardown already in flight
        let (done_sender, done_receiver) = oneshot::channel::<()>();
        {
            let this = self.clone();
            let entry = entry.clone();
            let channel = channel.clone();
            spawn(async move {
                let watchdog = {
                    let entry = entry.clone();
                    let channel = channel.clone();
                    Watchdog::arm(this.inner.config.timeout, move || {
                        debug!("synthesizing {kind} acknowledgement for {channel}");
                        entry.on_status_message(kind, &channel);
                    })
                };
                let _acknowledged = ack.await;
                watchdog.disarm();

                {
                    let _pool_guard = this.inner.free_pool_lock.acquire().await;
                    this.reconcile_locked(shard, &channel, &entry, false);
                }
                trace!("unsubscribed from {channel} on shard {shard}");
                let _result = done_sender.send(());
            });
        }
        let _done = done_receiver.await;
        Ok(codec)
    }

    /// Reconcile an entry's pool membership after a teardown or rollback:
    /// an entry hosting nothing is retired and its connection returned to
    /// the provider; an entry with free slots that still hosts subscriptions
    /// goes (back) into the shard's free queue. Must run under the free-pool
    /// lock.
    fn reconcile_locked(
        &self,
        shard: ShardId,
        channel: &ChannelName,
        entry: &Arc<PubSubEntry>,
        remove_key: bool,
    ) {
        let mut pools = lock_or_recover(&self.inner.shard_pools);
        let Some(pool) = pools.get_mut(&shard) else {
            return;
        };
        if remove_key {
            pool.remove_key(channel);
        }
        if entry.subscription_count() == 0 {
            pool.remove_free(entry);
            if entry.retire() {
                self.inner
                    .provider
                    .release_pubsub(shard, entry.connection().clone());
                debug!("returned idle pub/sub connection for shard {shard}");
            }
        } else if entry.free_slots() > 0 {
            pool.push_free(entry.clone());
        }
        if pool.is_empty() {
            pools.remove(&shard);
        }
    }

    async fn strip_listeners(
        &self,
        kind: SubscriptionKind,
        channel: ChannelName,
        listener_ids: Option<&[ListenerId]>,
    ) -> Result<()> {
        if self.inner.router.is_shutting_down() {
            return Ok(());
        }
        let _channel_guard = self.channel_lock(&channel).acquire().await;
        for shard in self.inner.registry.shards_of(&channel) {
            let key = SubscriptionKey {
                channel: channel.clone(),
                shard,
            };
            let Some(entry) = self.inner.registry.get(&key) else {
                continue;
            };
            match listener_ids {
                Some(listener_ids) => entry.remove_listeners(kind, &channel, listener_ids),
                None => entry.remove_all_listeners(kind, &channel),
            }
            if !entry.has_listeners(kind, &channel) {
                self.unsubscribe_locked(kind.to_unsubscribe(), &channel, shard)
                    .await?;
            }
        }
        Ok(())
    }

    /// Replay one subscription after a topology change: forced teardown of
    /// the old shard binding, then a fresh subscribe through the router.
    async fn reattach_key(&self, key: SubscriptionKey) {
        let Some(entry) = self.inner.registry.get(&key) else {
            return;
        };
        let Some((kind, codec)) = entry.subscription_of(&key.channel) else {
            return;
        };
        let listeners = entry.listeners_of(kind, &key.channel);

        let detached = {
            let _channel_guard = self.channel_lock(&key.channel).acquire().await;
            self.unsubscribe_locked(kind.to_unsubscribe(), &key.channel, key.shard)
                .await
        };
        if let Err(e) = detached {
            warn!(
                "failed to detach {} from shard {}: {e}",
                key.channel, key.shard
            );
        }

        self.resubscribe_forever(kind, codec, key.channel, listeners)
            .await;
    }

    /// Best-effort infinite retry; only reattachment uses it.
    async fn resubscribe_forever(
        &self,
        kind: SubscriptionKind,
        codec: Codec,
        channel: ChannelName,
        listeners: Vec<PubSubListener>,
    ) {
        loop {
            let result = match self.inner.router.shard_of(&channel) {
                None => Err(Error::NodeNotFound(format!("no shard for channel {channel}"))),
                Some(shard) => self
                    .subscribe_on_shard(
                        kind,
                        codec.clone(),
                        channel.clone(),
                        listeners.clone(),
                        shard,
                    )
                    .await
                    .map(|_| ()),
            };
            match result {
                Ok(()) => {
                    debug!("reattached {kind} {channel}");
                    return;
                }
                Err(e) => {
                    if self.inner.router.is_shutting_down() {
                        debug!("giving up on reattaching {channel}: shutting down");
                        return;
                    }
                    warn!("failed to reattach {kind} {channel}: {e}, retrying");
                    sleep(REATTACH_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

/// Rolls a committed subscribe back when the caller's future is dropped
/// before the exchange settled.
struct RollbackGuard {
    multiplexer: PubSubMultiplexer,
    kind: SubscriptionKind,
    channel: ChannelName,
    shard: ShardId,
    entry: Arc<PubSubEntry>,
    listener_ids: ListenerIds,
    armed: bool,
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let multiplexer = self.multiplexer.clone();
        let kind = self.kind;
        let channel = self.channel.clone();
        let shard = self.shard;
        let entry = self.entry.clone();
        let listener_ids = self.listener_ids.clone();
        spawn(async move {
            debug!("rolling back canceled {kind} {channel}");
            multiplexer
                .cleanup_subscribe(kind, &channel, shard, &entry, &listener_ids, true)
                .await;
        });
    }
}

#[cfg(test)]
impl PubSubMultiplexer {
    pub(crate) fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub(crate) fn with_shard_pool<T>(
        &self,
        shard: ShardId,
        f: impl FnOnce(Option<&ShardPool>) -> T,
    ) -> T {
        let pools = lock_or_recover(&self.inner.shard_pools);
        f(pools.get(&shard))
    }
}
