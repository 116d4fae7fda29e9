mod multiplexer;
mod util;

pub(crate) use util::*;
