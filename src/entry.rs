use crate::{
    Error, Result,
    channel::{ChannelName, SubscriptionKind},
    codec::Codec,
    connection::PubSubConnection,
    listener::{ListenerId, PubSubListener, PubSubMessage},
    util::lock_or_recover,
};
use futures_channel::oneshot;
use log::trace;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

type AckSender = oneshot::Sender<Result<()>>;
pub(crate) type AckReceiver = oneshot::Receiver<Result<()>>;

/// Acknowledgement state of one hosted channel or pattern.
///
/// Waiters are drained exactly once; a duplicate acknowledgement, real or
/// synthesized by the teardown watchdog, is ignored.
enum AckState {
    /// command written (or about to be), waiting for the status message
    Subscribing(Vec<AckSender>),
    Active,
    /// teardown issued, waiting for the status message or the watchdog
    Unsubscribing(Vec<AckSender>),
}

struct Subscription {
    codec: Codec,
    ack: AckState,
}

/// Outcome of rolling back a pending subscribe exchange.
pub(crate) enum AbortSubscribe {
    /// the pending exchange was dropped and its slot freed
    Aborted,
    /// the acknowledgement landed first, the subscription is live
    Acknowledged,
    /// nothing pending, some other cleanup already ran
    Missing,
}

#[derive(Default)]
struct EntryState {
    channels: HashMap<ChannelName, Subscription>,
    patterns: HashMap<ChannelName, Subscription>,
    channel_listeners: HashMap<ChannelName, Vec<PubSubListener>>,
    pattern_listeners: HashMap<ChannelName, Vec<PubSubListener>>,
}

impl EntryState {
    fn subscriptions_mut(&mut self, kind: SubscriptionKind) -> &mut HashMap<ChannelName, Subscription> {
        if kind.is_pattern() {
            &mut self.patterns
        } else {
            &mut self.channels
        }
    }

    fn subscriptions(&self, kind: SubscriptionKind) -> &HashMap<ChannelName, Subscription> {
        if kind.is_pattern() {
            &self.patterns
        } else {
            &self.channels
        }
    }

    fn listeners_mut(&mut self, kind: SubscriptionKind) -> &mut HashMap<ChannelName, Vec<PubSubListener>> {
        if kind.is_pattern() {
            &mut self.pattern_listeners
        } else {
            &mut self.channel_listeners
        }
    }

    fn listeners(&self, kind: SubscriptionKind) -> &HashMap<ChannelName, Vec<PubSubListener>> {
        if kind.is_pattern() {
            &self.pattern_listeners
        } else {
            &self.channel_listeners
        }
    }
}

/// Wraps one physical pub/sub connection and tracks the subscriptions it
/// hosts against the configured cap.
///
/// `free_slots` always equals the cap minus the number of hosted channels and
/// patterns, reserved and in-flight exchanges included. Listeners attached to
/// a channel are kept in attach order.
pub struct PubSubEntry {
    connection: Arc<dyn PubSubConnection>,
    capacity: usize,
    free_slots: AtomicUsize,
    retired: AtomicBool,
    state: Mutex<EntryState>,
}

impl PubSubEntry {
    pub(crate) fn new(connection: Arc<dyn PubSubConnection>, capacity: usize) -> Arc<Self> {
        let entry = Arc::new(Self {
            connection,
            capacity,
            free_slots: AtomicUsize::new(capacity),
            retired: AtomicBool::new(false),
            state: Mutex::new(EntryState::default()),
        });
        entry.connection.bind(Arc::downgrade(&entry));
        entry
    }

    /// Connection owned by this entry.
    pub fn connection(&self) -> &Arc<dyn PubSubConnection> {
        &self.connection
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining subscription slots.
    pub fn free_slots(&self) -> usize {
        self.free_slots.load(Ordering::Acquire)
    }

    /// Number of channels and patterns currently hosted, in-flight exchanges
    /// included.
    pub fn subscription_count(&self) -> usize {
        let state = lock_or_recover(&self.state);
        state.channels.len() + state.patterns.len()
    }

    /// Reserve one subscription slot. `false` when the entry is exhausted.
    pub(crate) fn try_acquire(&self) -> bool {
        self.free_slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |slots| {
                slots.checked_sub(1)
            })
            .is_ok()
    }

    /// Give back a slot reserved with [`try_acquire`](Self::try_acquire) that
    /// never turned into a hosted subscription.
    pub(crate) fn release_slot(&self) {
        self.free_slots.fetch_add(1, Ordering::AcqRel);
    }

    /// Mark the entry as done for good; `true` on the first call only, so the
    /// connection is handed back (or abandoned) exactly once.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn add_listeners(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        listeners: &[PubSubListener],
    ) {
        if listeners.is_empty() {
            return;
        }
        let mut state = lock_or_recover(&self.state);
        state
            .listeners_mut(kind)
            .entry(channel.clone())
            .or_default()
            .extend(listeners.iter().cloned());
    }

    pub(crate) fn remove_listeners(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        listener_ids: &[ListenerId],
    ) {
        if listener_ids.is_empty() {
            return;
        }
        let mut state = lock_or_recover(&self.state);
        let listeners = state.listeners_mut(kind);
        if let Some(attached) = listeners.get_mut(channel) {
            attached.retain(|listener| !listener_ids.contains(&listener.id()));
            if attached.is_empty() {
                listeners.remove(channel);
            }
        }
    }

    pub(crate) fn remove_all_listeners(&self, kind: SubscriptionKind, channel: &ChannelName) {
        let mut state = lock_or_recover(&self.state);
        state.listeners_mut(kind).remove(channel);
    }

    /// `true` when at least one listener is attached for `channel`.
    pub fn has_listeners(&self, kind: SubscriptionKind, channel: &ChannelName) -> bool {
        let state = lock_or_recover(&self.state);
        state
            .listeners(kind)
            .get(channel)
            .is_some_and(|attached| !attached.is_empty())
    }

    pub fn count_listeners(&self, kind: SubscriptionKind, channel: &ChannelName) -> usize {
        let state = lock_or_recover(&self.state);
        state
            .listeners(kind)
            .get(channel)
            .map_or(0, |attached| attached.len())
    }

    pub(crate) fn listeners_of(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
    ) -> Vec<PubSubListener> {
        let state = lock_or_recover(&self.state);
        state
            .listeners(kind)
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Names of the literal channels currently hosted.
    pub fn channels(&self) -> Vec<ChannelName> {
        lock_or_recover(&self.state).channels.keys().cloned().collect()
    }

    /// Names of the patterns currently hosted.
    pub fn patterns(&self) -> Vec<ChannelName> {
        lock_or_recover(&self.state).patterns.keys().cloned().collect()
    }

    /// Record the pending subscribe exchange for `channel` and return the
    /// future completed by its acknowledgement.
    pub(crate) fn begin_subscribe(
        &self,
        kind: SubscriptionKind,
        codec: Codec,
        channel: &ChannelName,
    ) -> AckReceiver {
        let (sender, receiver) = oneshot::channel();
        let mut state = lock_or_recover(&self.state);
        let subscriptions = state.subscriptions_mut(kind);
        if subscriptions.contains_key(channel) {
            drop(state);
            let _result = sender.send(Err(Error::Internal(format!(
                "{channel} is already hosted by this connection"
            ))));
        } else {
            subscriptions.insert(
                channel.clone(),
                Subscription {
                    codec,
                    ack: AckState::Subscribing(vec![sender]),
                },
            );
        }
        receiver
    }

    /// Future resolving on the channel's initial subscribe acknowledgement;
    /// immediate when the backend already acknowledged.
    pub(crate) fn subscribe_ack(&self, kind: SubscriptionKind, channel: &ChannelName) -> AckReceiver {
        let (sender, receiver) = oneshot::channel();
        let mut state = lock_or_recover(&self.state);
        match state.subscriptions_mut(kind).get_mut(channel).map(|s| &mut s.ack) {
            Some(AckState::Subscribing(waiters)) => {
                waiters.push(sender);
            }
            Some(AckState::Active) => {
                drop(state);
                let _result = sender.send(Ok(()));
            }
            Some(AckState::Unsubscribing(_)) => {
                drop(state);
                let _result = sender.send(Err(Error::Internal(format!(
                    "{channel} is being torn down"
                ))));
            }
            None => {
                drop(state);
                let _result = sender.send(Err(Error::Internal(format!(
                    "no subscription for {channel} on this connection"
                ))));
            }
        }
        receiver
    }

    /// Record the pending teardown for `channel` and return the future
    /// completed by its acknowledgement, real or synthesized. Completes
    /// immediately when nothing is subscribed.
    pub(crate) fn begin_unsubscribe(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
    ) -> AckReceiver {
        let (sender, receiver) = oneshot::channel();
        let mut state = lock_or_recover(&self.state);
        match state.subscriptions_mut(kind).get_mut(channel) {
            None => {
                drop(state);
                let _result = sender.send(Ok(()));
            }
            Some(subscription) => {
                let previous = std::mem::replace(
                    &mut subscription.ack,
                    AckState::Unsubscribing(vec![sender]),
                );
                match previous {
                    AckState::Unsubscribing(mut waiters) => {
                        // teardown already in flight, join its waiters
                        if let AckState::Unsubscribing(current) = &mut subscription.ack {
                            waiters.append(current);
                            subscription.ack = AckState::Unsubscribing(waiters);
                        }
                    }
                    AckState::Subscribing(waiters) => {
                        drop(state);
                        for waiter in waiters {
                            let _result = waiter.send(Err(Error::Internal(format!(
                                "{channel} was torn down before its subscribe acknowledgement"
                            ))));
                        }
                    }
                    AckState::Active => (),
                }
            }
        }
        receiver
    }

    /// Roll back a pending subscribe exchange, freeing its slot and failing
    /// its waiters with `error`.
    pub(crate) fn abort_subscribe(
        &self,
        kind: SubscriptionKind,
        channel: &ChannelName,
        error: Error,
    ) -> AbortSubscribe {
        let waiters = {
            let mut state = lock_or_recover(&self.state);
            let subscriptions = state.subscriptions_mut(kind);
            match subscriptions.get(channel).map(|s| &s.ack) {
                None | Some(AckState::Unsubscribing(_)) => return AbortSubscribe::Missing,
                Some(AckState::Active) => return AbortSubscribe::Acknowledged,
                Some(AckState::Subscribing(_)) => (),
            }
            let Some(subscription) = subscriptions.remove(channel) else {
                return AbortSubscribe::Missing;
            };
            self.free_slots.fetch_add(1, Ordering::AcqRel);
            match subscription.ack {
                AckState::Subscribing(waiters) => waiters,
                _ => Vec::new(),
            }
        };

        for waiter in waiters {
            let _result = waiter.send(Err(error.clone()));
        }
        AbortSubscribe::Aborted
    }

    /// Status-message hook.
    ///
    /// Transports route subscribe/unsubscribe acknowledgements here; the
    /// teardown watchdog injects a synthesized acknowledgement through the
    /// same path. Duplicate acknowledgements are ignored.
    pub fn on_status_message(&self, kind: SubscriptionKind, channel: &ChannelName) {
        if kind.is_subscribe() {
            let waiters = {
                let mut state = lock_or_recover(&self.state);
                let Some(subscription) = state.subscriptions_mut(kind).get_mut(channel) else {
                    trace!("ignoring {kind} acknowledgement for unknown channel {channel}");
                    return;
                };
                match &mut subscription.ack {
                    AckState::Subscribing(waiters) => {
                        let waiters = std::mem::take(waiters);
                        subscription.ack = AckState::Active;
                        waiters
                    }
                    _ => {
                        trace!("ignoring duplicate {kind} acknowledgement for {channel}");
                        return;
                    }
                }
            };
            for waiter in waiters {
                let _result = waiter.send(Ok(()));
            }
        } else {
            let waiters = {
                let mut state = lock_or_recover(&self.state);
                match state.subscriptions_mut(kind).get(channel).map(|s| &s.ack) {
                    Some(AckState::Unsubscribing(_)) => (),
                    // a duplicate of an acknowledgement the watchdog already
                    // synthesized must not touch a re-established subscription
                    Some(_) | None => {
                        trace!("ignoring stray {kind} acknowledgement for {channel}");
                        return;
                    }
                }
                let Some(subscription) = state.subscriptions_mut(kind).remove(channel) else {
                    return;
                };
                state.listeners_mut(kind).remove(channel);
                self.free_slots.fetch_add(1, Ordering::AcqRel);
                match subscription.ack {
                    AckState::Unsubscribing(waiters) => waiters,
                    _ => Vec::new(),
                }
            };
            for waiter in waiters {
                let _result = waiter.send(Ok(()));
            }
        }
    }

    /// Deliver a payload message to the listeners attached to its channel or
    /// pattern, preserving attach order.
    pub fn on_message(&self, message: PubSubMessage) {
        let (kind, name) = match &message.pattern {
            Some(pattern) => (SubscriptionKind::PSubscribe, pattern.clone()),
            None => (SubscriptionKind::Subscribe, message.channel.clone()),
        };
        let listeners = {
            let state = lock_or_recover(&self.state);
            state.listeners(kind).get(&name).cloned().unwrap_or_default()
        };
        for listener in &listeners {
            if !listener.deliver(message.clone()) {
                trace!("dropping message for detached listener {:?}", listener.id());
            }
        }
    }

    pub(crate) fn codec_of(&self, kind: SubscriptionKind, channel: &ChannelName) -> Option<Codec> {
        let state = lock_or_recover(&self.state);
        state
            .subscriptions(kind)
            .get(channel)
            .map(|subscription| subscription.codec.clone())
    }

    /// Kind and codec of the subscription hosted for `channel`, if any.
    pub(crate) fn subscription_of(
        &self,
        channel: &ChannelName,
    ) -> Option<(SubscriptionKind, Codec)> {
        let state = lock_or_recover(&self.state);
        if let Some(subscription) = state.channels.get(channel) {
            Some((SubscriptionKind::Subscribe, subscription.codec.clone()))
        } else {
            state
                .patterns
                .get(channel)
                .map(|subscription| (SubscriptionKind::PSubscribe, subscription.codec.clone()))
        }
    }

    /// Everything hosted by this entry, with the listeners currently
    /// attached; used to replay subscriptions after a connection loss.
    pub(crate) fn snapshot(
        &self,
    ) -> Vec<(SubscriptionKind, ChannelName, Codec, Vec<PubSubListener>)> {
        let state = lock_or_recover(&self.state);
        let mut subscriptions =
            Vec::with_capacity(state.channels.len() + state.patterns.len());
        for (kind, hosted) in [
            (SubscriptionKind::Subscribe, &state.channels),
            (SubscriptionKind::PSubscribe, &state.patterns),
        ] {
            for (channel, subscription) in hosted {
                let listeners = state
                    .listeners(kind)
                    .get(channel)
                    .cloned()
                    .unwrap_or_default();
                subscriptions.push((
                    kind,
                    channel.clone(),
                    subscription.codec.clone(),
                    listeners,
                ));
            }
        }
        subscriptions
    }
}

impl fmt::Debug for PubSubEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_or_recover(&self.state);
        f.debug_struct("PubSubEntry")
            .field("capacity", &self.capacity)
            .field("free_slots", &self.free_slots.load(Ordering::Acquire))
            .field("channels", &state.channels.len())
            .field("patterns", &state.patterns.len())
            .finish()
    }
}
