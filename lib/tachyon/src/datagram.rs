use crate::buffer::RingBuffer;
use crate::channel::{Channel, SlotPoster};
use crate::connection::Connection;
use crate::eventloop::{Completer, LoopThread, COMPLETION_BATCH};
use crate::fabric::{
    access, AvHandle, Completion, CompletionQueue, Domain, RdmEndpoint, RdmSession, Region,
};
use crate::packet::IncomingPacket;
use hashbrown::HashMap;
use ion::logging;
use ion::options::Options;
use ion::shared::{ErrorCode, ErrorType, TransportError, TransportResult};
use ion::StreamId;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// 64-bit completion tag layout, low bits first: message kind, control
/// subtype (doubling as the credit marker on data), sender stream id,
/// receiver stream id.
pub mod tag {
    use ion::StreamId;

    pub const KIND_CONTROL: u16 = 0;
    pub const KIND_DATA: u16 = 1;

    pub const CTL_CONNECT: u16 = 0;
    pub const CTL_CONFIRM: u16 = 1;

    /// Subtype bit marking a credit-only data message.
    pub const SUB_CREDIT: u16 = 1;

    /// Ignore mask for posted data receives: the subtype field floats so a
    /// credit-only message matches the same buffers as data.
    pub const IGNORE_SUBTYPE: u64 = 0xffff_0000;

    /// Ignore mask for control receives: match on the kind field only.
    pub const IGNORE_ALL_BUT_KIND: u64 = !0xffff_u64;

    #[inline]
    pub fn pack(kind: u16, subtype: u16, sender: StreamId, receiver: StreamId) -> u64 {
        u64::from(kind)
            | u64::from(subtype) << 16
            | u64::from(sender) << 32
            | u64::from(receiver) << 48
    }

    #[inline]
    pub fn kind(tag: u64) -> u16 {
        tag as u16
    }

    #[inline]
    pub fn subtype(tag: u64) -> u16 {
        (tag >> 16) as u16
    }

    #[inline]
    pub fn sender(tag: u64) -> StreamId {
        (tag >> 32) as StreamId
    }

    #[inline]
    pub fn receiver(tag: u64) -> StreamId {
        (tag >> 48) as StreamId
    }
}

/// `SlotPoster` over the shared datagram endpoint: adds the peer handle and
/// the channel's tags to every post.
pub struct RdmPoster {
    ep: Arc<Mutex<Box<dyn RdmEndpoint>>>,
    dest: AvHandle,
    send_tag: u64,
    send_credit_tag: u64,
    recv_tag: u64,
}

impl RdmPoster {
    pub fn new(
        ep: Arc<Mutex<Box<dyn RdmEndpoint>>>,
        dest: AvHandle,
        local_stream: StreamId,
        peer_stream: StreamId,
    ) -> RdmPoster {
        RdmPoster {
            ep,
            dest,
            send_tag: tag::pack(tag::KIND_DATA, 0, local_stream, peer_stream),
            send_credit_tag: tag::pack(tag::KIND_DATA, tag::SUB_CREDIT, local_stream, peer_stream),
            recv_tag: tag::pack(tag::KIND_DATA, 0, peer_stream, local_stream),
        }
    }
}

impl SlotPoster for RdmPoster {
    fn post_data(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        slot: u64,
    ) -> TransportResult<()> {
        self.ep
            .lock()
            .post_tsend(region, offset, len, self.send_tag, self.dest, slot)
    }

    fn post_credit(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        slot: u64,
    ) -> TransportResult<()> {
        self.ep
            .lock()
            .post_tsend(region, offset, len, self.send_credit_tag, self.dest, slot)
    }

    fn post_recv(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        slot: u64,
    ) -> TransportResult<()> {
        self.ep
            .lock()
            .post_trecv(region, offset, len, self.recv_tag, tag::IGNORE_SUBTYPE, slot)
    }
}

/// Sink receiving completed packets, keyed by the originating stream id.
pub type PacketSink = Box<dyn FnMut(StreamId, IncomingPacket) + Send>;

/// Stream-connectivity callbacks.
pub type StreamCb = Box<dyn FnMut(StreamId) + Send>;

// Control messages are tiny (a raw endpoint address or a confirmation
// byte); their rings use small fixed slots.
const CTRL_SLOT_SIZE: usize = 256;

struct ControlRings {
    tx: RingBuffer,
    rx: RingBuffer,
}

/// One shared reliable-datagram endpoint multiplexed across per-peer
/// channels. Completions route by tag: control messages run the
/// connect/confirm protocol on the multiplexer's own rings, data and
/// credit messages go to the channel registered under the sender's stream
/// id.
pub struct Datagram {
    stream_id: StreamId,
    opts: Options,
    ep: Arc<Mutex<Box<dyn RdmEndpoint>>>,
    txcq: Mutex<Box<dyn CompletionQueue>>,
    rxcq: Mutex<Box<dyn CompletionQueue>>,
    domain: Mutex<Box<dyn Domain>>,
    max_msg_size: usize,

    ctl: Mutex<ControlRings>,

    // Read-mostly: the sync loop resolves streams far more often than
    // connects mutate the set.
    channels: RwLock<HashMap<StreamId, Arc<Connection>>>,
    peers: Mutex<HashMap<StreamId, AvHandle>>,

    on_connect: Mutex<Option<StreamCb>>,
    on_confirm: Mutex<Option<StreamCb>>,
    on_close: Mutex<Option<StreamCb>>,
    sink: Mutex<Option<PacketSink>>,
    // periodic work (request-timeout sweeps) from whoever rides this loop
    housekeeping: Mutex<Option<Box<dyn FnMut() -> bool + Send>>>,

    worker: Mutex<Option<LoopThread>>,
    log: logging::Logger,
}

impl Datagram {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        opts: Options,
        mut session: RdmSession,
        stream_id: StreamId,
        log: L,
    ) -> TransportResult<Arc<Datagram>> {
        let log = logging::child(log);

        session.ep.enable()?;

        let slots = opts.no_buffers;
        let ctl_tx_region = session.domain.register(slots * CTRL_SLOT_SIZE, access::MSG)?;
        let ctl_rx_region = session.domain.register(slots * CTRL_SLOT_SIZE, access::MSG)?;

        let datagram = Arc::new(Datagram {
            stream_id,
            opts,
            ep: Arc::new(Mutex::new(session.ep)),
            txcq: Mutex::new(session.txcq),
            rxcq: Mutex::new(session.rxcq),
            domain: Mutex::new(session.domain),
            max_msg_size: session.max_msg_size,
            ctl: Mutex::new(ControlRings {
                tx: RingBuffer::new(ctl_tx_region, slots)?,
                rx: RingBuffer::new(ctl_rx_region, slots)?,
            }),
            channels: RwLock::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            on_connect: Mutex::new(None),
            on_confirm: Mutex::new(None),
            on_close: Mutex::new(None),
            sink: Mutex::new(None),
            housekeeping: Mutex::new(None),
            worker: Mutex::new(None),
            log,
        });

        datagram.post_control_recvs()?;
        Ok(datagram)
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// This endpoint's raw address, as a peer would insert it.
    pub fn name(&self) -> Vec<u8> {
        self.ep.lock().name()
    }

    pub fn set_on_connect(&self, cb: StreamCb) {
        *self.on_connect.lock() = Some(cb);
    }

    pub fn set_on_confirm(&self, cb: StreamCb) {
        *self.on_confirm.lock() = Some(cb);
    }

    pub fn set_on_close(&self, cb: StreamCb) {
        *self.on_close.lock() = Some(cb);
    }

    pub fn set_packet_sink(&self, sink: PacketSink) {
        *self.sink.lock() = Some(sink);
    }

    /// Installs the periodic-work hook, run once per `sync`; it returns
    /// whether it made progress.
    pub fn set_housekeeping(&self, cb: Box<dyn FnMut() -> bool + Send>) {
        *self.housekeeping.lock() = Some(cb);
    }

    pub fn channel(&self, stream: StreamId) -> Option<Arc<Connection>> {
        self.channels.read().get(&stream).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    fn post_control_recvs(&self) -> TransportResult<()> {
        let mut ctl = self.ctl.lock();
        let recv_tag = tag::pack(tag::KIND_CONTROL, 0, 0, 0);

        for slot in 0..ctl.rx.slot_count() {
            self.ep.lock().post_trecv(
                ctl.rx.region(),
                ctl.rx.slot_offset(slot),
                ctl.rx.slot_size(),
                recv_tag,
                tag::IGNORE_ALL_BUT_KIND,
                slot as u64,
            )?;
            ctl.rx.mark_submitted(1)?;
        }
        Ok(())
    }

    /// Builds (or returns) the channel for `target`, registering its rings
    /// against the shared domain.
    fn ensure_channel(
        &self,
        target: StreamId,
        handle: AvHandle,
    ) -> TransportResult<Arc<Connection>> {
        if let Some(conn) = self.channel(target) {
            return Ok(conn);
        }

        let ring_bytes = self.opts.buf_size.min(self.max_msg_size);
        let (tx_region, rx_region) = {
            let mut domain = self.domain.lock();
            (
                domain.register(ring_bytes, access::MSG)?,
                domain.register(ring_bytes, access::MSG)?,
            )
        };

        let tx = RingBuffer::new(tx_region, self.opts.no_buffers)?;
        let rx = RingBuffer::new(rx_region, self.opts.no_buffers)?;
        let channel = Channel::new(tx, rx, self.stream_id, target, &self.log);
        let poster = RdmPoster::new(self.ep.clone(), handle, self.stream_id, target);

        let conn = Arc::new(Connection::new(
            u64::from(target),
            channel,
            Box::new(poster),
            self.opts.max_packet_size,
            self.opts.hwm_bytes,
            self.opts.lwm_bytes,
            self.opts.hwm_enqueue_count,
            &self.log,
        ));
        conn.start()?;

        self.channels.write().insert(target, conn.clone());
        self.peers.lock().insert(target, handle);

        logging::debug!(self.log, "datagram channel created";
                        "context" => "ensure_channel",
                        "local_stream" => self.stream_id,
                        "peer_stream" => target);

        Ok(conn)
    }

    /// Initiates the datagram connection protocol towards a peer whose raw
    /// address is already known (from configuration).
    pub fn connect_peer(
        &self,
        target: StreamId,
        raw_addr: &[u8],
    ) -> TransportResult<Arc<Connection>> {
        let handle = self.ep.lock().av_insert(raw_addr)?;
        let conn = self.ensure_channel(target, handle)?;

        let name = self.name();
        self.send_control(handle, tag::CTL_CONNECT, target, &name)?;
        Ok(conn)
    }

    /// Posts a control message from the multiplexer's own TX ring.
    fn send_control(
        &self,
        dest: AvHandle,
        subtype: u16,
        receiver: StreamId,
        body: &[u8],
    ) -> TransportResult<()> {
        let (slot, offset, region, len) = {
            let ctl = self.ctl.lock();
            let slot = match ctl.tx.acquire_write_slot() {
                Some(slot) => slot,
                None => return Err(TransportError::Wait),
            };
            if body.len() > ctl.tx.slot_size() {
                return Err(TransportError::Fatal(ErrorType::PayloadTooLarge));
            }
            ctl.tx.write_slot(slot, 0, body);
            (
                slot,
                ctl.tx.slot_offset(slot),
                ctl.tx.region().clone(),
                body.len().max(1),
            )
        };

        let send_tag = tag::pack(tag::KIND_CONTROL, subtype, self.stream_id, receiver);
        let result = self
            .ep
            .lock()
            .post_tsend(&region, offset, len, send_tag, dest, slot as u64);

        let mut ctl = self.ctl.lock();
        if result.is_ok() {
            ctl.tx.mark_filled(1)?;
            ctl.tx.mark_submitted(1)?;
        }
        result
    }

    /// Handles an inbound control completion: connects create the channel
    /// and answer with a confirm, confirms complete the initiator's side.
    fn handle_control(&self, subtype: u16, sender: StreamId, len: usize) -> TransportResult<()> {
        let (slot, repost_info) = {
            let mut ctl = self.ctl.lock();
            ctl.rx.mark_filled(1)?;
            let slot = ctl
                .rx
                .head_slot()
                .ok_or(TransportError::Fatal(ErrorType::BufferState))?;
            (slot, (ctl.rx.slot_offset(slot), ctl.rx.slot_size(), ctl.rx.region().clone()))
        };

        match subtype {
            tag::CTL_CONNECT => {
                let mut raw_addr = vec![0u8; len];
                repost_info.2.read(repost_info.0, &mut raw_addr);

                let handle = self.ep.lock().av_insert(&raw_addr)?;
                self.ensure_channel(sender, handle)?;

                if let Some(cb) = self.on_connect.lock().as_mut() {
                    cb(sender);
                } else {
                    logging::error!(self.log, "connect received but no callback installed";
                                    "context" => "handle_control",
                                    "peer_stream" => sender);
                }

                self.recycle_control_slot(slot)?;
                self.send_control(handle, tag::CTL_CONFIRM, sender, &[1u8])?;
            }
            tag::CTL_CONFIRM => {
                if let Some(cb) = self.on_confirm.lock().as_mut() {
                    cb(sender);
                } else {
                    logging::error!(self.log, "confirm received but no callback installed";
                                    "context" => "handle_control",
                                    "peer_stream" => sender);
                }
                self.recycle_control_slot(slot)?;
            }
            other => {
                logging::warn!(self.log, "unknown control subtype, dropping";
                               "context" => "handle_control",
                               "subtype" => other);
                self.recycle_control_slot(slot)?;
            }
        }
        Ok(())
    }

    fn recycle_control_slot(&self, slot: usize) -> TransportResult<()> {
        let (offset, size, region) = {
            let mut ctl = self.ctl.lock();
            ctl.rx.release(1)?;
            (ctl.rx.slot_offset(slot), ctl.rx.slot_size(), ctl.rx.region().clone())
        };

        let recv_tag = tag::pack(tag::KIND_CONTROL, 0, 0, 0);
        self.ep.lock().post_trecv(
            &region,
            offset,
            size,
            recv_tag,
            tag::IGNORE_ALL_BUT_KIND,
            slot as u64,
        )?;

        self.ctl.lock().rx.mark_submitted(1)?;
        Ok(())
    }

    /// Aggregate posted-send count: the sum over the channels' own
    /// counters. Derived on demand, never separately mutated.
    pub fn tx_seq(&self) -> u64 {
        self.channels
            .read()
            .values()
            .map(|conn| conn.counters().0)
            .sum()
    }

    /// Aggregate send-completion count, same derivation.
    pub fn tx_cq_cntr(&self) -> u64 {
        self.channels
            .read()
            .values()
            .map(|conn| conn.counters().1)
            .sum()
    }

    /// Aggregate posted-receive count.
    pub fn rx_seq(&self) -> u64 {
        self.channels
            .read()
            .values()
            .map(|conn| conn.counters().2)
            .sum()
    }

    /// Aggregate receive-completion count.
    pub fn rx_cq_cntr(&self) -> u64 {
        self.channels
            .read()
            .values()
            .map(|conn| conn.counters().3)
            .sum()
    }

    /// One loop iteration: drain both completion queues and run the
    /// channels' pumps. Returns whether any progress was made.
    pub fn sync(&self) -> TransportResult<bool> {
        let mut progress = false;

        let mut entries = [Completion::default(); COMPLETION_BATCH];

        let drained = {
            let mut txcq = self.txcq.lock();
            txcq.read(&mut entries)?
        };
        for comp in &entries[..drained] {
            progress = true;
            self.on_tx_completion(comp)?;
        }

        let drained = {
            let mut rxcq = self.rxcq.lock();
            rxcq.read(&mut entries)?
        };
        for comp in &entries[..drained] {
            progress = true;
            self.on_rx_completion(comp)?;
        }

        if let Some(cb) = self.housekeeping.lock().as_mut() {
            progress |= cb();
        }

        Ok(progress)
    }

    fn on_tx_completion(&self, comp: &Completion) -> TransportResult<()> {
        match tag::kind(comp.tag) {
            tag::KIND_CONTROL => {
                let mut ctl = self.ctl.lock();
                ctl.tx.release(1)?;
                Ok(())
            }
            tag::KIND_DATA => {
                // our own send tag: the receiver field names the peer
                let peer = tag::receiver(comp.tag);
                match self.channel(peer) {
                    Some(conn) => {
                        let result =
                            conn.on_write_complete(tag::subtype(comp.tag) == tag::SUB_CREDIT);
                        self.fold_channel_result(peer, &conn, ErrorCode::WriteError, result);
                        Ok(())
                    }
                    None => {
                        logging::error!(self.log, "send completion for unknown stream";
                                        "context" => "sync",
                                        "peer_stream" => peer);
                        Ok(())
                    }
                }
            }
            other => {
                logging::warn!(self.log, "completion with unknown kind";
                               "context" => "sync",
                               "kind" => other);
                Ok(())
            }
        }
    }

    fn on_rx_completion(&self, comp: &Completion) -> TransportResult<()> {
        match tag::kind(comp.tag) {
            tag::KIND_CONTROL => {
                self.handle_control(tag::subtype(comp.tag), tag::sender(comp.tag), comp.len as usize)
            }
            tag::KIND_DATA => {
                let peer = tag::sender(comp.tag);
                let conn = match self.channel(peer) {
                    Some(conn) => conn,
                    None => {
                        logging::error!(self.log, "receive completion for unknown stream";
                                        "context" => "sync",
                                        "peer_stream" => peer);
                        return Ok(());
                    }
                };

                let result = if tag::subtype(comp.tag) == tag::SUB_CREDIT {
                    conn.on_credit_read_complete()
                } else {
                    conn.on_read_complete(1).map(|_| ()).and_then(|_| conn.pump_reads())
                };
                self.fold_channel_result(peer, &conn, ErrorCode::ReadError, result);

                if let Some(sink) = self.sink.lock().as_mut() {
                    conn.handle_data_read(|packet| sink(peer, packet));
                }
                Ok(())
            }
            other => {
                logging::warn!(self.log, "completion with unknown kind";
                               "context" => "sync",
                               "kind" => other);
                Ok(())
            }
        }
    }

    /// A fatal channel error closes that channel only; the multiplexer and
    /// its other channels keep running.
    fn fold_channel_result(
        &self,
        peer: StreamId,
        conn: &Arc<Connection>,
        code: ErrorCode,
        result: TransportResult<()>,
    ) {
        let err = match result {
            Ok(()) | Err(TransportError::Wait) => return,
            Err(err) => err,
        };

        logging::error!(self.log, "channel failed, closing";
                        "context" => "sync",
                        "peer_stream" => peer,
                        "error" => ?err);

        conn.close(code);
        self.channels.write().remove(&peer);
        self.peers.lock().remove(&peer);

        if let Some(cb) = self.on_close.lock().as_mut() {
            cb(peer);
        }
    }

    /// Spawns the dedicated loop thread. `sync` keeps working for callers
    /// that drive the multiplexer manually.
    pub fn run(self: Arc<Self>) -> TransportResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let completer = Completer::new(self.opts.comp_method, &self.log)?;
        let datagram = self.clone();
        let log = logging::child(&self.log);

        *worker = Some(LoopThread::spawn("tachyon-rdm", completer, move || {
            match datagram.sync() {
                Ok(progress) => progress,
                Err(err) => {
                    logging::error!(log, "datagram loop error";
                                    "context" => "run",
                                    "error" => ?err);
                    false
                }
            }
        }));
        Ok(())
    }

    /// Stops the loop thread and closes every channel.
    pub fn stop(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }

        let channels: Vec<_> = self.channels.read().values().cloned().collect();
        for conn in channels {
            conn.close(ErrorCode::Ok);
        }
        self.channels.write().clear();
    }
}
