#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Identifies one logical stream on a shared datagram endpoint.
pub type StreamId = u16;

pub mod logging;
pub mod options;
pub mod reqid;
pub mod shared;
