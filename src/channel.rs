use bytes::Bytes;
use std::fmt;

const KEYSPACE_PREFIX: &[u8] = b"__keyspace@";
const KEYEVENT_PREFIX: &[u8] = b"__keyevent@";

/// Name of a pub/sub channel or pattern.
///
/// Channel names are opaque byte strings compared byte-wise.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(Bytes);

impl ChannelName {
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self(name.into())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `true` for keyspace/keyevent notification channels, which the backend
    /// emits itself and which are broadcast across all shards in cluster mode.
    pub fn is_notification_channel(&self) -> bool {
        self.0.starts_with(KEYSPACE_PREFIX) || self.0.starts_with(KEYEVENT_PREFIX)
    }
}

impl From<&str> for ChannelName {
    fn from(name: &str) -> Self {
        Self(Bytes::copy_from_slice(name.as_bytes()))
    }
}

impl From<String> for ChannelName {
    fn from(name: String) -> Self {
        Self(Bytes::from(name.into_bytes()))
    }
}

impl From<Bytes> for ChannelName {
    fn from(name: Bytes) -> Self {
        Self(name)
    }
}

impl From<Vec<u8>> for ChannelName {
    fn from(name: Vec<u8>) -> Self {
        Self(Bytes::from(name))
    }
}

impl From<&[u8]> for ChannelName {
    fn from(name: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(name))
    }
}

impl AsRef<[u8]> for ChannelName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelName")
            .field(&String::from_utf8_lossy(&self.0))
            .finish()
    }
}

/// Kinds of pub/sub protocol exchanges.
///
/// The pattern kinds subscribe to glob patterns instead of literal channel
/// names; the unsubscribe kinds mirror them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl SubscriptionKind {
    #[inline]
    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::PSubscribe | Self::PUnsubscribe)
    }

    #[inline]
    pub fn is_subscribe(&self) -> bool {
        matches!(self, Self::Subscribe | Self::PSubscribe)
    }

    /// The teardown kind mirroring this kind.
    pub fn to_unsubscribe(self) -> Self {
        match self {
            Self::Subscribe | Self::Unsubscribe => Self::Unsubscribe,
            Self::PSubscribe | Self::PUnsubscribe => Self::PUnsubscribe,
        }
    }

    pub(crate) fn command_name(&self) -> &'static str {
        match self {
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::PSubscribe => "PSUBSCRIBE",
            Self::PUnsubscribe => "PUNSUBSCRIBE",
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}
