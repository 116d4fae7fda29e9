use std::{fmt, sync::Arc};

/// Opaque payload codec descriptor.
///
/// The multiplexer never decodes payloads. The codec travels with each
/// subscription so that a reattachment after a topology change resubscribes
/// with the codec the caller originally supplied, and so that transports can
/// frame payloads accordingly.
#[derive(Clone, PartialEq, Eq)]
pub struct Codec(Arc<str>);

impl Codec {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new("bytes")
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Codec").field(&self.name()).finish()
    }
}
