use crate::packet::{IncomingPacket, OutgoingPacket};
use hashbrown::HashMap;
use ion::logging;
use ion::reqid::{Generator, Reqid, REQID_SIZE};
use ion::shared::{ErrorCode, ErrorType, Payload, TransportError, TransportResult};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque user context carried from `send_request` to the matching
/// response callback.
pub type UserContext = Box<dyn Any + Send>;

/// Identifies the connection a packet arrived on: the connection id on a
/// server, the peer stream id on a datagram multiplexer.
pub type Source = u64;

type RequestFn = Box<dyn FnMut(Source, Reqid, &mut IncomingPacket) -> TransportResult<()> + Send>;
type MessageFn = Box<dyn FnMut(Source, &mut IncomingPacket) -> TransportResult<()> + Send>;
type ResponseFn =
    Box<dyn FnMut(Option<UserContext>, Option<&mut IncomingPacket>, ErrorCode) + Send>;

enum Handler {
    Request(Mutex<RequestFn>),
    Message(Mutex<MessageFn>),
    Response(Mutex<ResponseFn>),
}

struct PendingRequest {
    response_type: String,
    ctx: Option<UserContext>,
    deadline: Option<Instant>,
}

/// Typed dispatch over framed packets: handlers are registered per payload
/// type name, requests correlate to responses through 32-byte ids, and
/// pending requests can expire.
///
/// The handler registry is build-once read-many; routing takes a shared
/// lock and never allocates beyond the unavoidable wire-string read. The
/// pending map sits under its own lock, and an entry is always inserted
/// before its request packet is handed to the provider.
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
    request_to_response: RwLock<HashMap<&'static str, String>>,
    pending: Mutex<HashMap<Reqid, PendingRequest>>,
    rid_gen: Generator,
    log: logging::Logger,
}

impl Dispatcher {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Dispatcher {
        Dispatcher {
            handlers: RwLock::new(HashMap::new()),
            request_to_response: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            rid_gen: Generator::new(),
            log: logging::child(log),
        }
    }

    fn install(&self, name: &str, handler: Handler) {
        let replaced = self
            .handlers
            .write()
            .insert(name.to_string(), Arc::new(handler));
        if replaced.is_some() {
            logging::warn!(self.log, "handler replaced";
                           "context" => "install",
                           "type_name" => name);
        }
    }

    /// Registers a handler for incoming requests of type `M`. The callback
    /// receives the originating connection and the request id to answer
    /// with.
    pub fn install_request_handler<M, F>(&self, mut cb: F)
    where
        M: Payload,
        F: FnMut(Source, Reqid, M) + Send + 'static,
    {
        self.install(
            M::TYPE_NAME,
            Handler::Request(Mutex::new(Box::new(move |source, rid, packet| {
                let payload = packet.unpack_payload::<M>()?;
                cb(source, rid, payload);
                Ok(())
            }))),
        );
    }

    /// Registers a handler for unsolicited messages of type `M`.
    pub fn install_message_handler<M, F>(&self, mut cb: F)
    where
        M: Payload,
        F: FnMut(Source, M) + Send + 'static,
    {
        self.install(
            M::TYPE_NAME,
            Handler::Message(Mutex::new(Box::new(move |source, packet| {
                let payload = packet.unpack_payload::<M>()?;
                cb(source, payload);
                Ok(())
            }))),
        );
    }

    /// Registers that requests of type `Req` expect responses of type
    /// `Resp`, handled by `cb`. The callback sees the user context from the
    /// originating `send_request`, the decoded payload on success, and the
    /// status code (`Ok`, `Timeout`, or a send failure).
    pub fn install_response_handler<Req, Resp, F>(&self, mut cb: F)
    where
        Req: Payload,
        Resp: Payload,
        F: FnMut(Option<UserContext>, Option<Resp>, ErrorCode) + Send + 'static,
    {
        self.request_to_response
            .write()
            .insert(Req::TYPE_NAME, Resp::TYPE_NAME.to_string());

        let log = logging::child(&self.log);
        self.install(
            Resp::TYPE_NAME,
            Handler::Response(Mutex::new(Box::new(move |ctx, packet, code| {
                match packet {
                    Some(packet) => match packet.unpack_payload::<Resp>() {
                        Ok(payload) => cb(ctx, Some(payload), code),
                        Err(err) => {
                            logging::error!(log, "response payload failed to parse";
                                            "context" => "dispatch",
                                            "type_name" => Resp::TYPE_NAME,
                                            "error" => ?err);
                        }
                    },
                    None => cb(ctx, None, code),
                }
            }))),
        );
    }

    /// Frames `(type_name, request_id, payload)` into one packet.
    fn frame<M: Payload>(name: &str, rid: &Reqid, payload: &M) -> TransportResult<OutgoingPacket> {
        let byte_size = payload.byte_size();
        let body = OutgoingPacket::size_required_to_pack_string(name)
            + REQID_SIZE
            + OutgoingPacket::size_required_to_pack_payload(byte_size);

        let mut packet = OutgoingPacket::new(body as u32);
        packet.pack_string(name)?;
        packet.pack_reqid(rid)?;
        packet.pack_payload(payload, byte_size)?;
        packet.prepare_for_writing()?;
        Ok(packet)
    }

    /// Stages a request: generates a fresh id, frames the packet, and
    /// records the pending entry (before any provider post, so a response
    /// can never race past its own bookkeeping). The caller enqueues the
    /// packet and calls `abort_request` if that fails.
    pub fn begin_request<M: Payload>(
        &self,
        payload: &M,
        ctx: Option<UserContext>,
        timeout: Option<Duration>,
    ) -> TransportResult<(Reqid, OutgoingPacket)> {
        let response_type = self
            .request_to_response
            .read()
            .get(M::TYPE_NAME)
            .cloned()
            .ok_or(TransportError::Fatal(ErrorType::InvalidPacket))?;

        let rid = self.rid_gen.generate();
        let packet = Self::frame(M::TYPE_NAME, &rid, payload)?;

        self.pending.lock().insert(
            rid,
            PendingRequest {
                response_type,
                ctx,
                deadline: timeout.map(|t| Instant::now() + t),
            },
        );

        Ok((rid, packet))
    }

    /// Drops a staged request whose packet could not be sent and reports
    /// the failure to the response handler.
    pub fn abort_request(&self, rid: &Reqid, code: ErrorCode) {
        if let Some(pending) = self.pending.lock().remove(rid) {
            self.invoke_response_failure(&pending.response_type, pending.ctx, code);
        }
    }

    /// Reports a request that was refused before staging (not connected).
    pub fn fail_request<M: Payload>(&self, code: ErrorCode) {
        if let Some(response_type) = self.request_to_response.read().get(M::TYPE_NAME).cloned() {
            self.invoke_response_failure(&response_type, None, code);
        }
    }

    /// Frames a response to a previously received request id.
    pub fn make_response<M: Payload>(
        &self,
        rid: &Reqid,
        payload: &M,
    ) -> TransportResult<OutgoingPacket> {
        Self::frame(M::TYPE_NAME, rid, payload)
    }

    /// Frames an unsolicited message: the reserved zero id fills the
    /// request-id field.
    pub fn make_message<M: Payload>(&self, payload: &M) -> TransportResult<OutgoingPacket> {
        Self::frame(M::TYPE_NAME, &Reqid::zero(), payload)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn has_pending(&self, rid: &Reqid) -> bool {
        self.pending.lock().contains_key(rid)
    }

    /// Routes one incoming packet: requests and messages go straight to
    /// their handlers; responses retire the pending entry first, and
    /// responses without one (unknown or already timed out) are dropped.
    pub fn route(&self, source: Source, packet: &mut IncomingPacket) -> TransportResult<()> {
        let name = packet.unpack_string()?;

        let handler = self.handlers.read().get(name.as_str()).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                logging::warn!(self.log, "no handler for type, dropping packet";
                               "context" => "dispatch",
                               "type_name" => %name);
                return Ok(());
            }
        };

        match &*handler {
            Handler::Request(cb) => {
                let rid = packet.unpack_reqid()?;
                (*cb.lock())(source, rid, packet)
            }
            Handler::Message(cb) => {
                // the request-id field rides along unused
                let _ = packet.unpack_reqid()?;
                (*cb.lock())(source, packet)
            }
            Handler::Response(cb) => {
                let rid = packet.unpack_reqid()?;
                let pending = self.pending.lock().remove(&rid);
                match pending {
                    Some(pending) => {
                        (*cb.lock())(pending.ctx, Some(packet), ErrorCode::Ok);
                        Ok(())
                    }
                    None => {
                        logging::debug!(self.log, "response without a pending request, dropping";
                                        "context" => "dispatch",
                                        "type_name" => %name);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Expires pending requests whose deadline has passed, invoking their
    /// response handlers with `Timeout` and no payload. Returns how many
    /// fired.
    pub fn sweep_timeouts(&self, now: Instant) -> usize {
        let expired: Vec<(Reqid, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<Reqid> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline.map_or(false, |deadline| deadline <= now))
                .map(|(rid, _)| *rid)
                .collect();
            ids.into_iter()
                .filter_map(|rid| pending.remove(&rid).map(|entry| (rid, entry)))
                .collect()
        };

        let count = expired.len();
        for (rid, entry) in expired {
            logging::debug!(self.log, "request timed out";
                            "context" => "sweep",
                            "reqid" => ?rid,
                            "response_type" => %entry.response_type);
            self.invoke_response_failure(&entry.response_type, entry.ctx, ErrorCode::Timeout);
        }
        count
    }

    fn invoke_response_failure(
        &self,
        response_type: &str,
        ctx: Option<UserContext>,
        code: ErrorCode,
    ) {
        let handler = self.handlers.read().get(response_type).cloned();
        match handler {
            Some(handler) => {
                if let Handler::Response(cb) = &*handler {
                    (*cb.lock())(ctx, None, code);
                }
            }
            None => {
                logging::warn!(self.log, "no response handler for failure report";
                               "context" => "dispatch",
                               "type_name" => response_type,
                               "code" => ?code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Ask(u32);

    #[derive(Debug, PartialEq)]
    struct Reply(u32);

    macro_rules! impl_payload {
        ($ty:ident, $name:expr) => {
            impl Payload for $ty {
                const TYPE_NAME: &'static str = $name;

                fn byte_size(&self) -> usize {
                    4
                }

                fn serialize_into(&self, buf: &mut [u8]) -> TransportResult<()> {
                    BigEndian::write_u32(buf, self.0);
                    Ok(())
                }

                fn parse_from(buf: &[u8]) -> TransportResult<$ty> {
                    if buf.len() != 4 {
                        return Err(TransportError::Fatal(ErrorType::Serialization));
                    }
                    Ok($ty(BigEndian::read_u32(buf)))
                }
            }
        };
    }

    impl_payload!(Ask, "ask");
    impl_payload!(Reply, "reply");

    fn loopback(packet: &OutgoingPacket) -> IncomingPacket {
        IncomingPacket::from_wire(packet.as_bytes()).unwrap()
    }

    #[test]
    fn test_request_routing() {
        let dispatcher = Dispatcher::new(None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        dispatcher.install_request_handler::<Ask, _>(move |source, rid, ask| {
            sink.lock().push((source, rid, ask.0));
        });

        let rid = Generator::new().generate();
        let packet = Dispatcher::frame("ask", &rid, &Ask(42)).unwrap();
        dispatcher.route(3, &mut loopback(&packet)).unwrap();

        assert_eq!(*seen.lock(), vec![(3, rid, 42)]);
    }

    #[test]
    fn test_message_routing_skips_reqid() {
        let dispatcher = Dispatcher::new(None);
        let count = Arc::new(AtomicUsize::new(0));

        let sink = count.clone();
        dispatcher.install_message_handler::<Ask, _>(move |_source, ask| {
            assert_eq!(ask.0, 7);
            sink.fetch_add(1, Ordering::Relaxed);
        });

        let packet = dispatcher.make_message(&Ask(7)).unwrap();
        dispatcher.route(0, &mut loopback(&packet)).unwrap();

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_request_response_correlation() {
        let dispatcher = Dispatcher::new(None);
        let observed = Arc::new(Mutex::new(None));

        let sink = observed.clone();
        dispatcher.install_response_handler::<Ask, Reply, _>(move |ctx, reply, code| {
            let ctx = ctx.and_then(|b| b.downcast::<&'static str>().ok());
            *sink.lock() = Some((ctx.map(|c| *c), reply.map(|r| r.0), code));
        });

        let (rid, _packet) = dispatcher
            .begin_request(&Ask(1), Some(Box::new("my-context")), None)
            .unwrap();
        assert!(dispatcher.has_pending(&rid));

        let response = dispatcher.make_response(&rid, &Reply(99)).unwrap();
        dispatcher.route(0, &mut loopback(&response)).unwrap();

        assert_eq!(
            *observed.lock(),
            Some((Some("my-context"), Some(99), ErrorCode::Ok))
        );
        assert!(!dispatcher.has_pending(&rid));
    }

    #[test]
    fn test_unknown_reqid_response_dropped() {
        let dispatcher = Dispatcher::new(None);
        let fired = Arc::new(AtomicUsize::new(0));

        let sink = fired.clone();
        dispatcher.install_response_handler::<Ask, Reply, _>(move |_, _, _| {
            sink.fetch_add(1, Ordering::Relaxed);
        });

        let response = dispatcher
            .make_response(&Generator::new().generate(), &Reply(1))
            .unwrap();
        dispatcher.route(0, &mut loopback(&response)).unwrap();

        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_unknown_type_dropped() {
        let dispatcher = Dispatcher::new(None);
        let packet = Dispatcher::frame("mystery", &Reqid::zero(), &Ask(0)).unwrap();

        // no handler installed: the packet is silently dropped
        dispatcher.route(0, &mut loopback(&packet)).unwrap();
    }

    #[test]
    fn test_timeout_sweep() {
        let dispatcher = Dispatcher::new(None);
        let observed = Arc::new(Mutex::new(None));

        let sink = observed.clone();
        dispatcher.install_response_handler::<Ask, Reply, _>(move |ctx, reply, code| {
            *sink.lock() = Some((ctx.is_some(), reply.is_none(), code));
        });

        let (rid, _packet) = dispatcher
            .begin_request(
                &Ask(5),
                Some(Box::new(12u64)),
                Some(Duration::from_millis(1)),
            )
            .unwrap();

        // not yet expired
        assert_eq!(dispatcher.sweep_timeouts(Instant::now() - Duration::from_secs(1)), 0);
        assert!(dispatcher.has_pending(&rid));

        let fired = dispatcher.sweep_timeouts(Instant::now() + Duration::from_secs(1));
        assert_eq!(fired, 1);
        assert!(!dispatcher.has_pending(&rid));
        assert_eq!(*observed.lock(), Some((true, true, ErrorCode::Timeout)));

        // the late response is dropped on arrival
        let response = dispatcher.make_response(&rid, &Reply(2)).unwrap();
        dispatcher.route(0, &mut loopback(&response)).unwrap();
        assert_eq!(*observed.lock(), Some((true, true, ErrorCode::Timeout)));
    }

    #[test]
    fn test_request_without_response_handler_refused() {
        let dispatcher = Dispatcher::new(None);

        assert!(dispatcher.begin_request(&Ask(1), None, None).is_err());
    }

    #[test]
    fn test_message_carries_zero_reqid() {
        let dispatcher = Dispatcher::new(None);
        let packet = dispatcher.make_message(&Ask(3)).unwrap();

        let mut incoming = loopback(&packet);
        assert_eq!(incoming.unpack_string().unwrap(), "ask");
        assert!(incoming.unpack_reqid().unwrap().is_zero());
    }
}
