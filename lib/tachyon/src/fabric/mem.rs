//! In-process loopback provider: paired endpoints over in-memory queues,
//! with tag matching on the datagram side. This is what the test suite runs
//! the full stack against; it implements the provider traits faithfully
//! enough that a hardware-backed provider slots in behind the same code.

use super::{
    AvHandle, CmEvent, Completion, CompletionQueue, ConnectRequest, Domain, EventQueue, Fabric,
    MrDesc, MsgEndpoint, MsgSession, RdmEndpoint, RdmSession, Region,
};
use hashbrown::HashMap;
use ion::options::Options;
use ion::shared::{ErrorType, TransportError, TransportResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

const MEM_MAX_MSG_SIZE: usize = 1 << 20;

type CqHandle = Arc<Mutex<VecDeque<Completion>>>;
type EqHandle = Arc<Mutex<VecDeque<CmEvent>>>;

struct MemCq {
    queue: CqHandle,
}

impl CompletionQueue for MemCq {
    fn read(&mut self, entries: &mut [Completion]) -> TransportResult<usize> {
        let mut queue = self.queue.lock();
        let count = queue.len().min(entries.len());
        for entry in entries.iter_mut().take(count) {
            *entry = queue.pop_front().unwrap();
        }
        Ok(count)
    }
}

struct MemEq {
    queue: EqHandle,
}

impl EventQueue for MemEq {
    fn read(&mut self) -> TransportResult<Option<CmEvent>> {
        Ok(self.queue.lock().pop_front())
    }
}

struct MemDomain {
    hub: Arc<Mutex<Hub>>,
}

impl Domain for MemDomain {
    fn register(&mut self, len: usize, _access: u64) -> TransportResult<Region> {
        let mut hub = self.hub.lock();
        hub.next_mr += 1;
        Ok(Region::new(len, MrDesc(hub.next_mr), hub.next_mr))
    }
}

struct PostedRecv {
    region: Region,
    offset: usize,
    len: usize,
    ctx: u64,
}

/// One direction of a connected pair: messages queue here until the
/// receiver posts a buffer for them. Message boundaries are preserved,
/// one posted receive consumes exactly one message.
struct Wire {
    messages: VecDeque<Vec<u8>>,
    recvs: VecDeque<PostedRecv>,
    // receiver's RX completion queue; bound once that side exists
    rxcq: Option<CqHandle>,
}

impl Wire {
    fn new() -> Arc<Mutex<Wire>> {
        Arc::new(Mutex::new(Wire {
            messages: VecDeque::new(),
            recvs: VecDeque::new(),
            rxcq: None,
        }))
    }

    fn push_message(&mut self, bytes: Vec<u8>) {
        match self.recvs.pop_front() {
            Some(recv) => {
                let len = bytes.len().min(recv.len);
                recv.region.write(recv.offset, &bytes[..len]);
                if let Some(rxcq) = &self.rxcq {
                    rxcq.lock().push_back(Completion {
                        ctx: recv.ctx,
                        tag: 0,
                        len: len as u32,
                    });
                }
            }
            None => self.messages.push_back(bytes),
        }
    }

    fn push_recv(&mut self, recv: PostedRecv) {
        match self.messages.pop_front() {
            Some(bytes) => {
                let len = bytes.len().min(recv.len);
                recv.region.write(recv.offset, &bytes[..len]);
                if let Some(rxcq) = &self.rxcq {
                    rxcq.lock().push_back(Completion {
                        ctx: recv.ctx,
                        tag: 0,
                        len: len as u32,
                    });
                }
            }
            None => self.recvs.push_back(recv),
        }
    }
}

struct MemMsgEndpoint {
    hub: Arc<Mutex<Hub>>,
    // wire toward the peer and the one the peer writes into
    out: Arc<Mutex<Wire>>,
    inn: Arc<Mutex<Wire>>,
    txcq: CqHandle,
    own_eq: EqHandle,
    peer_eq: EqHandle,
    // pending-connect token; meaningful on the active side only
    token: Option<u64>,
    dst: String,
}

impl MsgEndpoint for MemMsgEndpoint {
    fn enable(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn connect(&mut self) -> TransportResult<()> {
        let token = self
            .token
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;

        let listener = self.hub.lock().listeners.get(&self.dst).cloned();
        match listener {
            Some(listener) => {
                listener
                    .lock()
                    .push_back(CmEvent::ConnectRequest(ConnectRequest { token }));
                Ok(())
            }
            None => Err(TransportError::Fatal(ErrorType::UnknownPeer)),
        }
    }

    fn accept(&mut self) -> TransportResult<()> {
        self.own_eq.lock().push_back(CmEvent::Connected);
        self.peer_eq.lock().push_back(CmEvent::Connected);
        Ok(())
    }

    fn reject(&mut self) -> TransportResult<()> {
        self.peer_eq.lock().push_back(CmEvent::Shutdown);
        Ok(())
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.peer_eq.lock().push_back(CmEvent::Shutdown);
        Ok(())
    }

    fn post_send(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        ctx: u64,
    ) -> TransportResult<()> {
        let mut bytes = vec![0u8; len];
        region.read(offset, &mut bytes);

        self.out.lock().push_message(bytes);
        self.txcq.lock().push_back(Completion {
            ctx,
            tag: 0,
            len: len as u32,
        });
        Ok(())
    }

    fn post_recv(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        ctx: u64,
    ) -> TransportResult<()> {
        self.inn.lock().push_recv(PostedRecv {
            region: region.clone(),
            offset,
            len,
            ctx,
        });
        Ok(())
    }
}

struct PostedTrecv {
    region: Region,
    offset: usize,
    len: usize,
    tag: u64,
    ignore: u64,
    ctx: u64,
}

#[inline]
fn tag_matches(recv_tag: u64, recv_ignore: u64, msg_tag: u64) -> bool {
    (recv_tag ^ msg_tag) & !recv_ignore == 0
}

/// Tagged-receive state of one datagram endpoint.
struct RdmEpState {
    recvs: Vec<PostedTrecv>,
    unexpected: VecDeque<(u64, Vec<u8>)>,
    rxcq: CqHandle,
}

impl RdmEpState {
    fn deliver(&mut self, tag: u64, bytes: Vec<u8>) {
        let position = self
            .recvs
            .iter()
            .position(|recv| tag_matches(recv.tag, recv.ignore, tag));

        match position {
            Some(position) => {
                let recv = self.recvs.remove(position);
                let len = bytes.len().min(recv.len);
                recv.region.write(recv.offset, &bytes[..len]);
                self.rxcq.lock().push_back(Completion {
                    ctx: recv.ctx,
                    tag,
                    len: len as u32,
                });
            }
            None => self.unexpected.push_back((tag, bytes)),
        }
    }

    fn post(&mut self, recv: PostedTrecv) {
        let position = self
            .unexpected
            .iter()
            .position(|(tag, _)| tag_matches(recv.tag, recv.ignore, *tag));

        match position {
            Some(position) => {
                let (tag, bytes) = self.unexpected.remove(position).unwrap();
                let len = bytes.len().min(recv.len);
                recv.region.write(recv.offset, &bytes[..len]);
                self.rxcq.lock().push_back(Completion {
                    ctx: recv.ctx,
                    tag,
                    len: len as u32,
                });
            }
            None => self.recvs.push(recv),
        }
    }
}

struct MemRdmEndpoint {
    hub: Arc<Mutex<Hub>>,
    name: Vec<u8>,
    av: Vec<Vec<u8>>,
    txcq: CqHandle,
}

impl RdmEndpoint for MemRdmEndpoint {
    fn enable(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn av_insert(&mut self, raw_addr: &[u8]) -> TransportResult<AvHandle> {
        if let Some(position) = self.av.iter().position(|addr| addr == raw_addr) {
            return Ok(AvHandle(position as u64));
        }
        self.av.push(raw_addr.to_vec());
        Ok(AvHandle((self.av.len() - 1) as u64))
    }

    fn name(&self) -> Vec<u8> {
        self.name.clone()
    }

    fn post_tsend(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        tag: u64,
        dest: AvHandle,
        ctx: u64,
    ) -> TransportResult<()> {
        let addr = self
            .av
            .get(dest.0 as usize)
            .cloned()
            .ok_or(TransportError::Fatal(ErrorType::UnknownPeer))?;

        let mut bytes = vec![0u8; len];
        region.read(offset, &mut bytes);

        let peer = self
            .hub
            .lock()
            .rdm
            .get(&addr)
            .cloned()
            .ok_or(TransportError::Fatal(ErrorType::UnknownPeer))?;
        peer.lock().deliver(tag, bytes);

        self.txcq.lock().push_back(Completion {
            ctx,
            tag,
            len: len as u32,
        });
        Ok(())
    }

    fn post_trecv(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        tag: u64,
        mask: u64,
        ctx: u64,
    ) -> TransportResult<()> {
        let own = self
            .hub
            .lock()
            .rdm
            .get(&self.name)
            .cloned()
            .ok_or(TransportError::Fatal(ErrorType::NotConnected))?;

        own.lock().post(PostedTrecv {
            region: region.clone(),
            offset,
            len,
            tag,
            ignore: mask,
            ctx,
        });
        Ok(())
    }
}

struct PendingMsg {
    client_to_server: Arc<Mutex<Wire>>,
    server_to_client: Arc<Mutex<Wire>>,
    client_eq: EqHandle,
    server_eq: EqHandle,
}

struct Hub {
    listeners: HashMap<String, EqHandle>,
    pending: HashMap<u64, PendingMsg>,
    rdm: HashMap<Vec<u8>, Arc<Mutex<RdmEpState>>>,
    next_token: u64,
    next_mr: u64,
}

/// The loopback fabric. Clones share one hub, so a server and its clients
/// are built from clones of the same instance.
#[derive(Clone)]
pub struct MemFabric {
    hub: Arc<Mutex<Hub>>,
}

impl MemFabric {
    pub fn new() -> MemFabric {
        MemFabric {
            hub: Arc::new(Mutex::new(Hub {
                listeners: HashMap::new(),
                pending: HashMap::new(),
                rdm: HashMap::new(),
                next_token: 0,
                next_mr: 0,
            })),
        }
    }
}

impl Fabric for MemFabric {
    fn connect_msg(&mut self, opts: &Options) -> TransportResult<MsgSession> {
        let client_to_server = Wire::new();
        let server_to_client = Wire::new();
        let client_eq: EqHandle = Arc::new(Mutex::new(VecDeque::new()));
        let server_eq: EqHandle = Arc::new(Mutex::new(VecDeque::new()));
        let txcq: CqHandle = Arc::new(Mutex::new(VecDeque::new()));
        let rxcq: CqHandle = Arc::new(Mutex::new(VecDeque::new()));

        server_to_client.lock().rxcq = Some(rxcq.clone());

        let token = {
            let mut hub = self.hub.lock();
            hub.next_token += 1;
            let token = hub.next_token;
            hub.pending.insert(
                token,
                PendingMsg {
                    client_to_server: client_to_server.clone(),
                    server_to_client: server_to_client.clone(),
                    client_eq: client_eq.clone(),
                    server_eq: server_eq.clone(),
                },
            );
            token
        };

        let ep = MemMsgEndpoint {
            hub: self.hub.clone(),
            out: client_to_server,
            inn: server_to_client,
            txcq: txcq.clone(),
            own_eq: client_eq.clone(),
            peer_eq: server_eq,
            token: Some(token),
            dst: opts.dst_endpoint(),
        };

        Ok(MsgSession {
            ep: Box::new(ep),
            eq: Box::new(MemEq { queue: client_eq }),
            txcq: Box::new(MemCq { queue: txcq }),
            rxcq: Box::new(MemCq { queue: rxcq }),
            domain: Box::new(MemDomain {
                hub: self.hub.clone(),
            }),
            max_msg_size: MEM_MAX_MSG_SIZE,
        })
    }

    fn listen(&mut self, opts: &Options) -> TransportResult<Box<dyn EventQueue>> {
        let queue: EqHandle = Arc::new(Mutex::new(VecDeque::new()));
        self.hub
            .lock()
            .listeners
            .insert(opts.src_endpoint(), queue.clone());
        Ok(Box::new(MemEq { queue }))
    }

    fn accept_msg(&mut self, request: ConnectRequest) -> TransportResult<MsgSession> {
        let pending = self
            .hub
            .lock()
            .pending
            .remove(&request.token)
            .ok_or(TransportError::Fatal(ErrorType::UnknownPeer))?;

        let txcq: CqHandle = Arc::new(Mutex::new(VecDeque::new()));
        let rxcq: CqHandle = Arc::new(Mutex::new(VecDeque::new()));
        pending.client_to_server.lock().rxcq = Some(rxcq.clone());

        let ep = MemMsgEndpoint {
            hub: self.hub.clone(),
            out: pending.server_to_client,
            inn: pending.client_to_server,
            txcq: txcq.clone(),
            own_eq: pending.server_eq.clone(),
            peer_eq: pending.client_eq,
            token: None,
            dst: String::new(),
        };

        Ok(MsgSession {
            ep: Box::new(ep),
            eq: Box::new(MemEq {
                queue: pending.server_eq,
            }),
            txcq: Box::new(MemCq { queue: txcq }),
            rxcq: Box::new(MemCq { queue: rxcq }),
            domain: Box::new(MemDomain {
                hub: self.hub.clone(),
            }),
            max_msg_size: MEM_MAX_MSG_SIZE,
        })
    }

    fn open_rdm(&mut self, opts: &Options) -> TransportResult<RdmSession> {
        let name = opts.src_endpoint().into_bytes();
        let txcq: CqHandle = Arc::new(Mutex::new(VecDeque::new()));
        let rxcq: CqHandle = Arc::new(Mutex::new(VecDeque::new()));

        self.hub.lock().rdm.insert(
            name.clone(),
            Arc::new(Mutex::new(RdmEpState {
                recvs: Vec::new(),
                unexpected: VecDeque::new(),
                rxcq: rxcq.clone(),
            })),
        );

        Ok(RdmSession {
            ep: Box::new(MemRdmEndpoint {
                hub: self.hub.clone(),
                name,
                av: Vec::new(),
                txcq: txcq.clone(),
            }),
            txcq: Box::new(MemCq { queue: txcq }),
            rxcq: Box::new(MemCq { queue: rxcq }),
            domain: Box::new(MemDomain {
                hub: self.hub.clone(),
            }),
            max_msg_size: MEM_MAX_MSG_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_for(port: u16, dst_port: u16) -> Options {
        let mut opts = Options::default();
        opts.src_addr = Some("127.0.0.1".to_string());
        opts.src_port = port;
        opts.dst_addr = Some("127.0.0.1".to_string());
        opts.dst_port = dst_port;
        opts
    }

    #[test]
    fn test_msg_connect_accept_roundtrip() {
        let mut fabric = MemFabric::new();

        let mut listener = fabric.listen(&opts_for(9000, 0)).unwrap();
        let mut client = fabric.connect_msg(&opts_for(0, 9000)).unwrap();
        client.ep.connect().unwrap();

        let request = match listener.read().unwrap() {
            Some(CmEvent::ConnectRequest(request)) => request,
            other => panic!("expected a connect request, got {:?}", other),
        };

        let mut server = fabric.accept_msg(request).unwrap();
        server.ep.accept().unwrap();

        assert_eq!(client.eq.read().unwrap(), Some(CmEvent::Connected));
        assert_eq!(server.eq.read().unwrap(), Some(CmEvent::Connected));

        // data + completions both ways
        let mut client_domain = client.domain;
        let region = client_domain.register(64, super::super::access::MSG).unwrap();
        region.write(0, b"ping");
        client.ep.post_send(&region, 0, 4, 7).unwrap();

        let mut server_domain = server.domain;
        let server_region = server_domain.register(64, super::super::access::MSG).unwrap();
        server.ep.post_recv(&server_region, 0, 64, 3).unwrap();

        let mut entries = [Completion::default(); 4];
        assert_eq!(client.txcq.read(&mut entries).unwrap(), 1);
        assert_eq!(entries[0].ctx, 7);

        assert_eq!(server.rxcq.read(&mut entries).unwrap(), 1);
        assert_eq!(entries[0].ctx, 3);
        assert_eq!(entries[0].len, 4);

        let mut out = [0u8; 4];
        server_region.read(0, &mut out);
        assert_eq!(&out, b"ping");
    }

    #[test]
    fn test_msg_connect_without_listener_fails() {
        let mut fabric = MemFabric::new();
        let mut client = fabric.connect_msg(&opts_for(0, 9999)).unwrap();

        assert!(client.ep.connect().is_err());
    }

    #[test]
    fn test_rdm_tag_matching() {
        let mut fabric = MemFabric::new();

        let mut alpha = fabric.open_rdm(&opts_for(7000, 0)).unwrap();
        let mut beta = fabric.open_rdm(&opts_for(7001, 0)).unwrap();

        let mut alpha_domain = alpha.domain;
        let mut beta_domain = beta.domain;
        let send_region = alpha_domain.register(64, super::super::access::MSG).unwrap();
        let recv_region = beta_domain.register(64, super::super::access::MSG).unwrap();

        // beta posts a recv matching tag 0x22 exactly
        beta.ep
            .post_trecv(&recv_region, 0, 64, 0x22, 0, 5)
            .unwrap();

        let handle = alpha.ep.av_insert(&beta.ep.name()).unwrap();

        // non-matching tag parks in the unexpected queue
        send_region.write(0, b"mismatch");
        alpha
            .ep
            .post_tsend(&send_region, 0, 8, 0x33, handle, 1)
            .unwrap();

        let mut entries = [Completion::default(); 4];
        assert_eq!(beta.rxcq.read(&mut entries).unwrap(), 0);

        // matching tag delivers
        send_region.write(0, b"match!!!");
        alpha
            .ep
            .post_tsend(&send_region, 0, 8, 0x22, handle, 2)
            .unwrap();

        assert_eq!(beta.rxcq.read(&mut entries).unwrap(), 1);
        assert_eq!(entries[0].tag, 0x22);
        assert_eq!(entries[0].ctx, 5);

        // a recv with a full ignore mask drains the parked message
        beta.ep
            .post_trecv(&recv_region, 0, 64, 0, !0u64, 6)
            .unwrap();
        assert_eq!(beta.rxcq.read(&mut entries).unwrap(), 1);
        assert_eq!(entries[0].tag, 0x33);
        assert_eq!(entries[0].ctx, 6);
    }
}
