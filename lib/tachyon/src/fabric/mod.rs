//! Abstract fabric provider interface. Everything above this module talks to
//! endpoints, completion queues, CM event queues and registered memory
//! through these traits; `mem` provides the in-process loopback
//! implementation the test suite runs against.

use ion::options::Options;
use ion::shared::TransportResult;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

pub mod mem;

/// Memory-region access masks, or-able.
pub mod access {
    pub const SEND: u64 = 1;
    pub const RECV: u64 = 1 << 1;
    pub const READ: u64 = 1 << 2;
    pub const WRITE: u64 = 1 << 3;

    pub const MSG: u64 = SEND | RECV;
}

/// Provider descriptor for a registered region, passed back on posts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MrDesc(pub u64);

/// Address-vector handle naming a remote peer on an RDM endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AvHandle(pub u64);

/// One completion queue entry. `ctx` is returned verbatim from the post that
/// produced it; `tag` is only meaningful on tagged (RDM) endpoints.
#[derive(Debug, Copy, Clone, Default)]
pub struct Completion {
    pub ctx: u64,
    pub tag: u64,
    pub len: u32,
}

/// Opaque handle to a pending connection, embedded in a
/// `CmEvent::ConnectRequest` and redeemed through `Fabric::accept_msg`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnectRequest {
    pub token: u64,
}

/// Connection-management events read off an event queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CmEvent {
    ConnectRequest(ConnectRequest),
    Connected,
    Shutdown,
}

/// A contiguous registered memory region. The handle is cloneable so the
/// provider can deliver into it while the owning channel reads out of it;
/// registration happens once at channel construction and the region is
/// released when the last handle drops.
#[derive(Clone, Debug)]
pub struct Region {
    mem: Arc<Mutex<Box<[u8]>>>,
    desc: MrDesc,
    key: u64,
}

impl Region {
    pub fn new(len: usize, desc: MrDesc, key: u64) -> Region {
        Region {
            mem: Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice())),
            desc,
            key,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.mem.lock().len()
    }

    #[inline]
    pub fn desc(&self) -> MrDesc {
        self.desc
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Copies `data` into the region at `offset`.
    #[inline]
    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut mem = self.mem.lock();
        mem[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copies `out.len()` bytes out of the region at `offset`.
    #[inline]
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        let mem = self.mem.lock();
        out.copy_from_slice(&mem[offset..offset + out.len()]);
    }

    /// Runs `f` over an immutable window of the region.
    #[inline]
    pub fn with_slice<R, F: FnOnce(&[u8]) -> R>(&self, offset: usize, len: usize, f: F) -> R {
        let mem = self.mem.lock();
        f(&mem[offset..offset + len])
    }
}

/// Protection domain: registers memory.
pub trait Domain: Send {
    fn register(&mut self, len: usize, access: u64) -> TransportResult<Region>;
}

/// CM event queue of a session endpoint or a passive listener.
pub trait EventQueue: Send {
    /// Non-blocking read; `Ok(None)` when no event is pending.
    fn read(&mut self) -> TransportResult<Option<CmEvent>>;
}

/// Completion queue. Reads are non-blocking; `sread` blocks up to the
/// timeout; `wait_fd` exposes a pollable descriptor when the provider
/// supports fd-based waiting.
pub trait CompletionQueue: Send {
    fn read(&mut self, entries: &mut [Completion]) -> TransportResult<usize>;

    fn sread(&mut self, entries: &mut [Completion], timeout: Duration) -> TransportResult<usize> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let n = self.read(entries)?;
            if n > 0 || std::time::Instant::now() >= deadline {
                return Ok(n);
            }
            std::thread::yield_now();
        }
    }

    fn wait_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Connection-oriented endpoint. Posts address the connected peer.
pub trait MsgEndpoint: Send {
    fn enable(&mut self) -> TransportResult<()>;
    fn connect(&mut self) -> TransportResult<()>;
    fn accept(&mut self) -> TransportResult<()>;
    fn reject(&mut self) -> TransportResult<()>;
    fn shutdown(&mut self) -> TransportResult<()>;

    fn post_send(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        ctx: u64,
    ) -> TransportResult<()>;

    fn post_recv(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        ctx: u64,
    ) -> TransportResult<()>;
}

/// Connectionless reliable-datagram endpoint with tagged messaging. Posts
/// are addressed by an address-vector handle; receives match on
/// `(tag, mask)` where set mask bits are ignored.
pub trait RdmEndpoint: Send {
    fn enable(&mut self) -> TransportResult<()>;

    /// Inserts a raw peer address, yielding the handle used to address it.
    fn av_insert(&mut self, raw_addr: &[u8]) -> TransportResult<AvHandle>;

    /// This endpoint's own raw address, as peers would insert it.
    fn name(&self) -> Vec<u8>;

    fn post_tsend(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        tag: u64,
        dest: AvHandle,
        ctx: u64,
    ) -> TransportResult<()>;

    fn post_trecv(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        tag: u64,
        mask: u64,
        ctx: u64,
    ) -> TransportResult<()>;
}

/// Everything one MSG connection needs: the endpoint, its CM event queue,
/// the two completion queues and the protection domain they live in.
pub struct MsgSession {
    pub ep: Box<dyn MsgEndpoint>,
    pub eq: Box<dyn EventQueue>,
    pub txcq: Box<dyn CompletionQueue>,
    pub rxcq: Box<dyn CompletionQueue>,
    pub domain: Box<dyn Domain>,
    pub max_msg_size: usize,
}

/// One shared RDM endpoint with its completion queues; many channels
/// multiplex over it, keyed by stream id.
pub struct RdmSession {
    pub ep: Box<dyn RdmEndpoint>,
    pub txcq: Box<dyn CompletionQueue>,
    pub rxcq: Box<dyn CompletionQueue>,
    pub domain: Box<dyn Domain>,
    pub max_msg_size: usize,
}

/// Entry point into a concrete provider.
pub trait Fabric: Send {
    /// Active side: builds a session aimed at `opts.dst_endpoint()`. The
    /// caller still has to `connect()` the endpoint and wait for
    /// `CmEvent::Connected`.
    fn connect_msg(&mut self, opts: &Options) -> TransportResult<MsgSession>;

    /// Passive side: binds `opts.src_endpoint()` and returns the listener
    /// event queue, which yields `ConnectRequest` events.
    fn listen(&mut self, opts: &Options) -> TransportResult<Box<dyn EventQueue>>;

    /// Redeems a `ConnectRequest` into an active session. The caller then
    /// `accept()`s or `reject()`s the endpoint.
    fn accept_msg(&mut self, request: ConnectRequest) -> TransportResult<MsgSession>;

    /// Opens the shared datagram endpoint bound at `opts.src_endpoint()`.
    fn open_rdm(&mut self, opts: &Options) -> TransportResult<RdmSession>;
}
