//! User-space messaging transport over an abstract fabric provider: framed,
//! credit flow-controlled channels on connection-oriented (MSG) or shared
//! reliable-datagram (RDM) endpoints, with a typed request/response/message
//! dispatch layer on top.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod channel;
pub mod client;
pub mod connection;
pub mod datagram;
pub mod dispatch;
pub mod eventloop;
pub mod fabric;
pub mod packet;
pub mod server;
