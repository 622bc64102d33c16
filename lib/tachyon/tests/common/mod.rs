//! Shared fixtures for the integration tests: payload types and loop
//! drivers over the loopback provider.
#![allow(dead_code)]

use byteorder::{BigEndian, ByteOrder};
use ion::options::Options;
use ion::shared::{ErrorType, Payload, TransportError, TransportResult};
use tachyon::client::Client;
use tachyon::server::Server;

/// Ordered test payload carrying a monotonically increasing id.
#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
    pub id: u32,
}

impl Payload for Echo {
    const TYPE_NAME: &'static str = "echo";

    fn byte_size(&self) -> usize {
        4
    }

    fn serialize_into(&self, buf: &mut [u8]) -> TransportResult<()> {
        BigEndian::write_u32(buf, self.id);
        Ok(())
    }

    fn parse_from(buf: &[u8]) -> TransportResult<Echo> {
        if buf.len() != 4 {
            return Err(TransportError::Fatal(ErrorType::Serialization));
        }
        Ok(Echo {
            id: BigEndian::read_u32(buf),
        })
    }
}

macro_rules! text_payload {
    ($ty:ident, $name:expr) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $ty(pub String);

        impl Payload for $ty {
            const TYPE_NAME: &'static str = $name;

            fn byte_size(&self) -> usize {
                self.0.len()
            }

            fn serialize_into(&self, buf: &mut [u8]) -> TransportResult<()> {
                buf.copy_from_slice(self.0.as_bytes());
                Ok(())
            }

            fn parse_from(buf: &[u8]) -> TransportResult<$ty> {
                String::from_utf8(buf.to_vec())
                    .map($ty)
                    .map_err(|_| TransportError::Fatal(ErrorType::Serialization))
            }
        }
    };
}

text_payload!(Ask, "ask");
text_payload!(Reply, "reply");

/// Bulk payload for slot-spanning transfers.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl Payload for Blob {
    const TYPE_NAME: &'static str = "blob";

    fn byte_size(&self) -> usize {
        self.0.len()
    }

    fn serialize_into(&self, buf: &mut [u8]) -> TransportResult<()> {
        buf.copy_from_slice(&self.0);
        Ok(())
    }

    fn parse_from(buf: &[u8]) -> TransportResult<Blob> {
        Ok(Blob(buf.to_vec()))
    }
}

pub fn server_opts(port: u16) -> Options {
    let mut opts = Options::default();
    opts.src_addr = Some("127.0.0.1".to_string());
    opts.src_port = port;
    opts
}

pub fn client_opts(port: u16) -> Options {
    let mut opts = Options::default();
    opts.dst_addr = Some("127.0.0.1".to_string());
    opts.dst_port = port;
    opts
}

/// Drives both loops until `done` holds or the round budget runs out.
/// Returns whether the condition was reached.
pub fn pump_until<F: FnMut() -> bool>(
    client: &Client,
    server: &Server,
    rounds: usize,
    mut done: F,
) -> bool {
    for _ in 0..rounds {
        if done() {
            return true;
        }
        client.poll_once().expect("client poll failed");
        server.poll_once().expect("server poll failed");
    }
    done()
}

/// Fixed number of quiet rounds, for settling in-flight completions.
pub fn pump(client: &Client, server: &Server, rounds: usize) {
    for _ in 0..rounds {
        client.poll_once().expect("client poll failed");
        server.poll_once().expect("server poll failed");
    }
}
