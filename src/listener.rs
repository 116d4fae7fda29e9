use crate::channel::ChannelName;
use bytes::Bytes;
use futures_channel::mpsc;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier assigned to a [`PubSubListener`] so that callers can detach a
/// listener without retaining the value itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Message delivered to the listeners of a channel or pattern.
///
/// `pattern` is set when the message was matched by a pattern subscription.
/// Payloads are opaque byte strings; decoding them is the caller's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub pattern: Option<ChannelName>,
    pub channel: ChannelName,
    pub payload: Bytes,
}

pub type MessageSender = mpsc::UnboundedSender<PubSubMessage>;
pub type MessageReceiver = mpsc::UnboundedReceiver<PubSubMessage>;

/// Callback bundle attached to a subscription.
///
/// Messages are forwarded to the receiving half returned by
/// [`new`](PubSubListener::new). A listener is cloneable so that the same
/// receiver can be attached on every shard of a notification-channel
/// subscription; all clones share the listener id.
#[derive(Clone)]
pub struct PubSubListener {
    id: ListenerId,
    sender: MessageSender,
}

impl PubSubListener {
    /// Create a listener and the receiver its messages will be delivered to.
    pub fn new() -> (Self, MessageReceiver) {
        let (sender, receiver) = mpsc::unbounded();
        let listener = Self {
            id: ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)),
            sender,
        };
        (listener, receiver)
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// `false` when the receiving half is gone.
    pub(crate) fn deliver(&self, message: PubSubMessage) -> bool {
        self.sender.unbounded_send(message).is_ok()
    }
}

impl fmt::Debug for PubSubListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubListener")
            .field("id", &self.id)
            .finish()
    }
}
