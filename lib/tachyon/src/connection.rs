use crate::channel::{Channel, Signals, SlotPoster};
use crate::fabric::{MsgEndpoint, Region};
use crate::packet::{IncomingPacket, OutgoingPacket, HEADER_SIZE};
use ion::logging;
use ion::shared::{
    ErrorCode, ErrorType, TransportError, TransportResult, MAX_ERRORS,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

pub type ConnectionId = u64;

/// Per-packet completion callback, fired once the packet's bytes have all
/// been acknowledged by the provider.
pub type SendDone = Box<dyn FnMut(ErrorCode) + Send>;

/// Back-pressure callbacks, keyed by connection id.
pub type PressureCb = Box<dyn FnMut(ConnectionId) + Send>;

// Per-iteration transfer ceilings so one busy connection cannot starve the
// loop.
const WRITE_BATCH_SIZE: usize = 10 * 1024 * 1024;
const READ_BATCH_SIZE: usize = 10 * 1024 * 1024;

/// Post-context encoding for untagged (MSG) endpoints: the slot index plus
/// a flag bit marking credit-only sends, so completions can be routed
/// without a tag.
pub mod ctx {
    const CREDIT_FLAG: u64 = 1 << 32;

    #[inline]
    pub fn data(slot: usize) -> u64 {
        slot as u64
    }

    #[inline]
    pub fn credit(slot: usize) -> u64 {
        slot as u64 | CREDIT_FLAG
    }

    #[inline]
    pub fn is_credit(ctx: u64) -> bool {
        ctx & CREDIT_FLAG != 0
    }

    #[inline]
    pub fn slot(ctx: u64) -> usize {
        (ctx & !CREDIT_FLAG) as usize
    }
}

/// `SlotPoster` over a dedicated connection-oriented endpoint. The endpoint
/// is shared with the owning client/server for CM operations.
pub struct MsgPoster {
    ep: Arc<Mutex<Box<dyn MsgEndpoint>>>,
}

impl MsgPoster {
    pub fn new(ep: Arc<Mutex<Box<dyn MsgEndpoint>>>) -> MsgPoster {
        MsgPoster { ep }
    }
}

impl SlotPoster for MsgPoster {
    fn post_data(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        slot: u64,
    ) -> TransportResult<()> {
        self.ep
            .lock()
            .post_send(region, offset, len, ctx::data(slot as usize))
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
            .post_send(region, offset, len, ctx::credit(slot as usize))
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
            .post_recv(region, offset, len, ctx::data(slot as usize))
    }
}

struct Outbound {
    packet: OutgoingPacket,
    position: usize,
    done: Option<SendDone>,
}

struct Pending {
    remaining: usize,
    done: Option<SendDone>,
}

struct Core {
    channel: Channel,
    // queued but not yet fully placed into TX slots
    outstanding: VecDeque<Outbound>,
    // fully placed, awaiting send completions
    pending: VecDeque<Pending>,
    incoming: IncomingPacket,
    received: VecDeque<IncomingPacket>,
    outstanding_bytes: u64,
    outstanding_packets: u64,
    enqueues_with_buffer_full: u32,
    caused_back_pressure: bool,
    error_count: u32,
}

/// Packet-level connection over one channel: queues outbound packets,
/// reassembles inbound frames into packets, and applies back-pressure
/// water marks on the outstanding byte count.
///
/// The single `core` lock covers ring and queue bookkeeping; it is released
/// before every provider post (the `poster` lock serializes those) and
/// before any user callback fires.
pub struct Connection {
    id: ConnectionId,
    core: Mutex<Core>,
    poster: Mutex<Box<dyn SlotPoster>>,
    on_buffer_full: Mutex<Option<PressureCb>>,
    on_buffer_empty: Mutex<Option<PressureCb>>,
    hwm_bytes: u64,
    lwm_bytes: u64,
    hwm_enqueue_count: u32,
    log: logging::Logger,
}

impl Connection {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        id: ConnectionId,
        channel: Channel,
        poster: Box<dyn SlotPoster>,
        max_packet_size: u32,
        hwm_bytes: u64,
        lwm_bytes: u64,
        hwm_enqueue_count: u32,
        log: L,
    ) -> Connection {
        Connection {
            id,
            core: Mutex::new(Core {
                channel,
                outstanding: VecDeque::new(),
                pending: VecDeque::new(),
                incoming: IncomingPacket::new(max_packet_size),
                received: VecDeque::new(),
                outstanding_bytes: 0,
                outstanding_packets: 0,
                enqueues_with_buffer_full: 0,
                caused_back_pressure: false,
                error_count: 0,
            }),
            poster: Mutex::new(poster),
            on_buffer_full: Mutex::new(None),
            on_buffer_empty: Mutex::new(None),
            hwm_bytes,
            lwm_bytes,
            hwm_enqueue_count,
            log: logging::child(log),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.core.lock().channel.is_connected()
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.core.lock().outstanding_bytes
    }

    pub fn outstanding_packets(&self) -> u64 {
        self.core.lock().outstanding_packets
    }

    pub fn caused_back_pressure(&self) -> bool {
        self.core.lock().caused_back_pressure
    }

    /// Installs the back-pressure callback pair.
    pub fn register_back_pressure(&self, full: PressureCb, empty: PressureCb) {
        *self.on_buffer_full.lock() = Some(full);
        *self.on_buffer_empty.lock() = Some(empty);
    }

    /// Starts the channel and posts its receive slots.
    pub fn start(&self) -> TransportResult<()> {
        let reposts = self.core.lock().channel.start()?;

        let mut poster = self.poster.lock();
        for repost in reposts {
            let result = poster.post_recv(&repost.region, repost.offset, repost.len, repost.slot as u64);
            self.core
                .lock()
                .channel
                .commit_repost(&repost, result.is_ok())?;
            result?;
        }
        Ok(())
    }

    /// Queues a packet for transmission and drains as much of the queue as
    /// currently fits. Never blocks; the packet rides along on later loop
    /// iterations if the channel is stalled.
    pub fn send_packet(
        &self,
        packet: OutgoingPacket,
        done: Option<SendDone>,
    ) -> TransportResult<()> {
        packet.prepare_for_writing()?;

        let fire_full = {
            let mut core = self.core.lock();
            if !core.channel.is_connected() {
                return Err(TransportError::Fatal(ErrorType::NotConnected));
            }

            core.outstanding_bytes += packet.total_size() as u64;
            core.outstanding_packets += 1;
            core.outstanding.push_back(Outbound {
                packet,
                position: 0,
                done,
            });

            // High-water hysteresis: only signal after enough consecutive
            // above-threshold enqueues.
            if !core.caused_back_pressure {
                if core.outstanding_bytes >= self.hwm_bytes {
                    core.enqueues_with_buffer_full += 1;
                    if core.enqueues_with_buffer_full > self.hwm_enqueue_count {
                        core.enqueues_with_buffer_full = 0;
                        core.caused_back_pressure = true;
                        true
                    } else {
                        false
                    }
                } else {
                    core.enqueues_with_buffer_full = 0;
                    false
                }
            } else {
                false
            }
        };

        if fire_full {
            if let Some(cb) = self.on_buffer_full.lock().as_mut() {
                cb(self.id);
            }
        }

        self.pump_writes()
    }

    /// Moves queued packet bytes into TX slots and posts them, up to the
    /// write batch limit. A transient post failure leaves the packet where
    /// it is; the next completion-driven call retries it.
    pub fn pump_writes(&self) -> TransportResult<()> {
        let mut poster = self.poster.lock();
        let mut total_written = 0usize;

        loop {
            let prepared = {
                let mut core = self.core.lock();
                if !core.channel.is_connected() {
                    return Ok(());
                }
                let front = match core.outstanding.front() {
                    Some(front) => front,
                    None => return Ok(()),
                };
                let position = front.position;
                // split borrows: the slice lives in the packet, the staging
                // happens in the channel
                let Core {
                    channel,
                    outstanding,
                    ..
                } = &mut *core;
                let bytes = outstanding.front().unwrap().packet.as_bytes();
                match channel.prepare_write(&bytes[position..])? {
                    Some(prepared) => prepared,
                    None => return Ok(()),
                }
            };

            let result =
                poster.post_data(&prepared.region, prepared.offset, prepared.len, prepared.slot as u64);

            let mut core = self.core.lock();
            match result {
                Ok(()) => {
                    // The lock was released across the post; a concurrent
                    // close may have torn the connection down and drained
                    // the queue in the meantime. The packet is gone (its
                    // callback already fired with the close code), so the
                    // staged write is dropped without committing anything
                    // into the closed channel.
                    if !core.channel.is_connected() || core.outstanding.is_empty() {
                        logging::debug!(self.log, "write raced a close, dropping";
                                        "context" => "pump_writes",
                                        "connection_id" => self.id);
                        return Ok(());
                    }

                    let written = core.channel.commit_write(&prepared, true)?;
                    core.error_count = 0;
                    total_written += written;

                    let front = match core.outstanding.front_mut() {
                        Some(front) => front,
                        None => return Ok(()),
                    };
                    front.position += written;
                    if front.position == front.packet.total_size() {
                        if let Some(finished) = core.outstanding.pop_front() {
                            core.pending.push_back(Pending {
                                remaining: finished.packet.total_size(),
                                done: finished.done,
                            });
                        }
                    }

                    if total_written >= WRITE_BATCH_SIZE {
                        return Ok(());
                    }
                }
                Err(TransportError::Wait) => {
                    core.channel.commit_write(&prepared, false)?;
                    core.error_count += 1;
                    if core.error_count > MAX_ERRORS {
                        logging::error!(self.log, "provider kept refusing posts";
                                        "context" => "pump_writes",
                                        "connection_id" => self.id,
                                        "errors" => core.error_count);
                        return Err(TransportError::Fatal(ErrorType::Resource));
                    }
                    return Ok(());
                }
                Err(err) => {
                    core.channel.commit_write(&prepared, false)?;
                    return Err(err);
                }
            }
        }
    }

    /// A send completion arrived. Retires the head TX slot, credits the
    /// completed bytes against pending packets, fires their callbacks, and
    /// re-arms the write pump.
    pub fn on_write_complete(&self, credit_only: bool) -> TransportResult<()> {
        let mut finished: Vec<SendDone> = Vec::new();

        let (signals, fire_empty) = {
            let mut core = self.core.lock();

            let signals = if credit_only {
                core.channel.on_credit_write_complete()?
            } else {
                let (mut completed, signals) = core.channel.on_write_complete()?;
                core.outstanding_bytes = core.outstanding_bytes.saturating_sub(completed as u64);

                while completed > 0 {
                    let front = match core.pending.front_mut() {
                        Some(front) => front,
                        None => break,
                    };
                    if completed >= front.remaining {
                        completed -= front.remaining;
                        core.outstanding_packets -= 1;
                        let mut retired = core.pending.pop_front().unwrap();
                        if let Some(done) = retired.done.take() {
                            finished.push(done);
                        }
                    } else {
                        front.remaining -= completed;
                        completed = 0;
                    }
                }
                signals
            };

            let fire_empty = core.caused_back_pressure
                && core.outstanding_bytes <= self.lwm_bytes;
            if fire_empty {
                core.caused_back_pressure = false;
            }

            core.channel.drain();
            (signals, fire_empty)
        };

        for mut done in finished {
            done(ErrorCode::Ok);
        }
        if fire_empty {
            if let Some(cb) = self.on_buffer_empty.lock().as_mut() {
                cb(self.id);
            }
        }

        if signals.write_ready {
            self.pump_writes()?;
        }
        Ok(())
    }

    /// `count` receive completions arrived.
    pub fn on_read_complete(&self, count: usize) -> TransportResult<Signals> {
        self.core.lock().channel.on_read_complete(count)
    }

    /// A credit-only completion arrived on a tagged transport.
    pub fn on_credit_read_complete(&self) -> TransportResult<()> {
        let (signals, repost) = self.core.lock().channel.on_credit_read_complete()?;

        if let Some(repost) = repost {
            let result = self
                .poster
                .lock()
                .post_recv(&repost.region, repost.offset, repost.len, repost.slot as u64);
            self.core
                .lock()
                .channel
                .commit_repost(&repost, result.is_ok())?;
            result?;
        }

        if signals.write_ready {
            self.pump_writes()?;
        }
        Ok(())
    }

    /// Drains readable RX slots into packets, up to the read batch limit.
    /// Completed packets queue up for `handle_data_read`.
    pub fn pump_reads(&self) -> TransportResult<()> {
        let mut bytes_read = 0usize;
        let mut write_ready = false;

        loop {
            let mut staged_repost = None;
            let progressed = {
                let mut core = self.core.lock();
                let Core {
                    channel, incoming, ..
                } = &mut *core;

                let (read, signals, repost) = if !incoming.header_complete() {
                    let mut scratch = [0u8; HEADER_SIZE];
                    let need = HEADER_SIZE - incoming.header_filled;
                    let (read, signals, repost) = channel.read_data(&mut scratch[..need])?;
                    incoming.header[incoming.header_filled..incoming.header_filled + read]
                        .copy_from_slice(&scratch[..read]);
                    incoming.header_filled += read;

                    if incoming.header_complete() {
                        let declared = incoming.packet_size();
                        let limit = incoming.max_packet_size();
                        if limit != 0 && declared > limit {
                            logging::error!(self.log, "incoming packet exceeds the size limit";
                                            "context" => "pump_reads",
                                            "connection_id" => self.id,
                                            "declared" => declared,
                                            "limit" => limit);
                            return Err(TransportError::Fatal(ErrorType::PayloadTooLarge));
                        }
                        incoming.data = Some(vec![0u8; declared as usize]);
                        incoming.data_filled = 0;
                    }
                    (read, signals, repost)
                } else {
                    let filled = incoming.data_filled;
                    let data = incoming.data.as_mut().expect("body missing after header");
                    let (read, signals, repost) = channel.read_data(&mut data[filled..])?;
                    incoming.data_filled += read;
                    (read, signals, repost)
                };

                write_ready |= signals.write_ready;
                bytes_read += read;
                staged_repost = repost;

                if incoming.complete() {
                    let max = incoming.max_packet_size();
                    let packet = std::mem::replace(incoming, IncomingPacket::new(max));
                    core.received.push_back(packet);
                }

                read > 0 || staged_repost.is_some()
            };

            if let Some(repost) = staged_repost {
                let result = self
                    .poster
                    .lock()
                    .post_recv(&repost.region, repost.offset, repost.len, repost.slot as u64);
                self.core
                    .lock()
                    .channel
                    .commit_repost(&repost, result.is_ok())?;
                result?;
            }

            if !progressed || bytes_read >= READ_BATCH_SIZE {
                break;
            }
        }

        self.post_credit_if_needed()?;

        if write_ready {
            self.pump_writes()?;
        }
        Ok(())
    }

    /// Emits an explicit credit-only packet once the unadvertised window
    /// crosses the half-ring threshold.
    pub fn post_credit_if_needed(&self) -> TransportResult<()> {
        let prepared = {
            let mut core = self.core.lock();
            if !core.channel.credit_post_due() {
                return Ok(());
            }
            match core.channel.prepare_credit()? {
                Some(prepared) => prepared,
                None => return Ok(()),
            }
        };

        let result = self.poster.lock().post_credit(
            &prepared.region,
            prepared.offset,
            prepared.len,
            prepared.slot as u64,
        );

        let mut core = self.core.lock();
        match result {
            Ok(()) => {
                core.channel.commit_write(&prepared, true)?;
                Ok(())
            }
            Err(TransportError::Wait) => {
                core.channel.commit_write(&prepared, false)?;
                Ok(())
            }
            Err(err) => {
                core.channel.commit_write(&prepared, false)?;
                Err(err)
            }
        }
    }

    /// Hands completed packets to the dispatch sink. Runs without any lock
    /// held while user code executes.
    pub fn handle_data_read<F: FnMut(IncomingPacket)>(&self, mut sink: F) {
        loop {
            let packet = match self.core.lock().received.pop_front() {
                Some(packet) => packet,
                None => return,
            };
            sink(packet);
        }
    }

    /// Closes the connection: pending outbound packets are discarded and
    /// their callbacks fired with `code`. In-flight provider posts drain
    /// silently.
    pub fn close(&self, code: ErrorCode) {
        let mut finished: Vec<SendDone> = Vec::new();
        {
            let mut core = self.core.lock();

            logging::debug!(self.log, "closing connection";
                            "context" => "close",
                            "connection_id" => self.id,
                            "code" => ?code,
                            "outstanding_packets" => core.outstanding_packets);

            for mut outbound in core.outstanding.drain(..) {
                if let Some(done) = outbound.done.take() {
                    finished.push(done);
                }
            }
            for mut pending in core.pending.drain(..) {
                if let Some(done) = pending.done.take() {
                    finished.push(done);
                }
            }
            core.outstanding_bytes = 0;
            core.outstanding_packets = 0;
            core.received.clear();
            core.channel.close();
        }

        for mut done in finished {
            done(code);
        }
    }

    /// Finishes teardown once in-flight completions have drained.
    pub fn drained(&self) -> bool {
        self.core.lock().channel.drain()
    }

    /// Ring occupancy snapshot:
    /// `(tx_filled, tx_submitted, rx_filled, rx_submitted)`.
    pub fn ring_counts(&self) -> (usize, usize, usize, usize) {
        let core = self.core.lock();
        (
            core.channel.tx_ring().filled_count(),
            core.channel.tx_ring().submitted_count(),
            core.channel.rx_ring().filled_count(),
            core.channel.rx_ring().submitted_count(),
        )
    }

    /// Aggregate view over the channel's authoritative counters.
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        let core = self.core.lock();
        (
            core.channel.tx_posts(),
            core.channel.tx_completions(),
            core.channel.rx_posts(),
            core.channel.rx_completions(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::RingBuffer;
    use crate::fabric::MrDesc;
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc as StdArc;

    const SLOTS: usize = 4;
    const SLOT_SIZE: usize = 1024;

    // Accepts every post without delivering anywhere; completions are
    // injected by hand.
    struct NullPoster;

    impl SlotPoster for NullPoster {
        fn post_data(&mut self, _: &Region, _: usize, _: usize, _: u64) -> TransportResult<()> {
            Ok(())
        }

        fn post_credit(&mut self, _: &Region, _: usize, _: usize, _: u64) -> TransportResult<()> {
            Ok(())
        }

        fn post_recv(&mut self, _: &Region, _: usize, _: usize, _: u64) -> TransportResult<()> {
            Ok(())
        }
    }

    fn make_connection(hwm: u64, lwm: u64, hwm_enqueues: u32) -> Connection {
        let tx = RingBuffer::new(Region::new(SLOTS * SLOT_SIZE, MrDesc(1), 1), SLOTS).unwrap();
        let rx = RingBuffer::new(Region::new(SLOTS * SLOT_SIZE, MrDesc(2), 2), SLOTS).unwrap();
        let channel = Channel::new(tx, rx, 0, 0, None);

        let conn = Connection::new(
            1,
            channel,
            Box::new(NullPoster),
            0,
            hwm,
            lwm,
            hwm_enqueues,
            None,
        );
        conn.start().unwrap();
        conn
    }

    fn small_packet() -> OutgoingPacket {
        let mut packet = OutgoingPacket::new(8);
        packet.pack_int(1).unwrap();
        packet.pack_int(2).unwrap();
        packet
    }

    #[test]
    fn test_send_packet_places_and_retires() {
        let conn = make_connection(u64::MAX, 0, 0);

        let done: StdArc<PlMutex<Vec<ErrorCode>>> = StdArc::new(PlMutex::new(Vec::new()));
        let sink = done.clone();
        conn.send_packet(
            small_packet(),
            Some(Box::new(move |code| sink.lock().push(code))),
        )
        .unwrap();

        // placed into one slot, awaiting its completion
        assert_eq!(conn.outstanding_packets(), 1);
        assert_eq!(conn.outstanding_bytes(), 12);
        assert!(done.lock().is_empty());

        conn.on_write_complete(false).unwrap();

        assert_eq!(conn.outstanding_packets(), 0);
        assert_eq!(conn.outstanding_bytes(), 0);
        assert_eq!(*done.lock(), vec![ErrorCode::Ok]);

        let (tx_filled, tx_submitted, _, _) = conn.ring_counts();
        assert_eq!(tx_filled, 0);
        assert_eq!(tx_submitted, 0);
    }

    #[test]
    fn test_unfilled_packet_rejected() {
        let conn = make_connection(u64::MAX, 0, 0);

        let mut packet = OutgoingPacket::new(8);
        packet.pack_int(1).unwrap();

        assert!(conn.send_packet(packet, None).is_err());
        assert_eq!(conn.outstanding_packets(), 0);
    }

    #[test]
    fn test_send_on_unconnected_channel_refused() {
        let tx = RingBuffer::new(Region::new(SLOTS * SLOT_SIZE, MrDesc(1), 1), SLOTS).unwrap();
        let rx = RingBuffer::new(Region::new(SLOTS * SLOT_SIZE, MrDesc(2), 2), SLOTS).unwrap();
        let conn = Connection::new(
            1,
            Channel::new(tx, rx, 0, 0, None),
            Box::new(NullPoster),
            0,
            u64::MAX,
            0,
            0,
            None,
        );

        // never started
        assert_eq!(
            conn.send_packet(small_packet(), None).unwrap_err(),
            TransportError::Fatal(ErrorType::NotConnected)
        );
    }

    #[test]
    fn test_back_pressure_hysteresis() {
        // threshold 1 byte, two above-threshold enqueues tolerated, and a
        // low water mark everything fits under
        let conn = make_connection(1, 100, 2);

        let full_count = StdArc::new(PlMutex::new(0u32));
        let empty_count = StdArc::new(PlMutex::new(0u32));
        let full = full_count.clone();
        let empty = empty_count.clone();
        conn.register_back_pressure(
            Box::new(move |_| *full.lock() += 1),
            Box::new(move |_| *empty.lock() += 1),
        );

        // first two above-threshold enqueues stay quiet
        conn.send_packet(small_packet(), None).unwrap();
        conn.send_packet(small_packet(), None).unwrap();
        assert_eq!(*full_count.lock(), 0);

        // the third crosses the enqueue-count bar
        conn.send_packet(small_packet(), None).unwrap();
        assert_eq!(*full_count.lock(), 1);
        assert!(conn.caused_back_pressure());

        // no re-arm while pressure stands
        conn.send_packet(small_packet(), None).unwrap();
        assert_eq!(*full_count.lock(), 1);

        // the credit window let two slots fly; retiring the first drops
        // the outstanding count below the low water mark
        conn.on_write_complete(false).unwrap();
        assert_eq!(*empty_count.lock(), 1);
        assert!(!conn.caused_back_pressure());

        conn.on_write_complete(false).unwrap();
        assert_eq!(*empty_count.lock(), 1);
        // the two unplaced packets still wait for credit
        assert_eq!(conn.outstanding_packets(), 2);
    }

    // Closes the connection from inside the post itself, landing in the
    // window where pump_writes has released the core lock.
    struct ClosingPoster {
        target: StdArc<PlMutex<Option<StdArc<Connection>>>>,
    }

    impl SlotPoster for ClosingPoster {
        fn post_data(&mut self, _: &Region, _: usize, _: usize, _: u64) -> TransportResult<()> {
            let target = self.target.lock().clone();
            if let Some(conn) = target {
                conn.close(ErrorCode::NotConnected);
            }
            Ok(())
        }

        fn post_credit(&mut self, _: &Region, _: usize, _: usize, _: u64) -> TransportResult<()> {
            Ok(())
        }

        fn post_recv(&mut self, _: &Region, _: usize, _: usize, _: u64) -> TransportResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_racing_close_is_dropped() {
        let target = StdArc::new(PlMutex::new(None));

        let tx = RingBuffer::new(Region::new(SLOTS * SLOT_SIZE, MrDesc(1), 1), SLOTS).unwrap();
        let rx = RingBuffer::new(Region::new(SLOTS * SLOT_SIZE, MrDesc(2), 2), SLOTS).unwrap();
        let conn = StdArc::new(Connection::new(
            1,
            Channel::new(tx, rx, 0, 0, None),
            Box::new(ClosingPoster {
                target: target.clone(),
            }),
            0,
            u64::MAX,
            0,
            0,
            None,
        ));
        conn.start().unwrap();
        *target.lock() = Some(conn.clone());

        let done: StdArc<PlMutex<Vec<ErrorCode>>> = StdArc::new(PlMutex::new(Vec::new()));
        let sink = done.clone();

        // the close drains the queue while the post runs unlocked; the
        // staged write must be dropped, not committed or unwrapped
        conn.send_packet(
            small_packet(),
            Some(Box::new(move |code| sink.lock().push(code))),
        )
        .unwrap();

        assert!(!conn.is_connected());
        assert_eq!(conn.outstanding_packets(), 0);
        assert_eq!(conn.outstanding_bytes(), 0);
        assert_eq!(*done.lock(), vec![ErrorCode::NotConnected]);

        // nothing was committed into the closed channel
        let (tx_filled, tx_submitted, _, _) = conn.ring_counts();
        assert_eq!(tx_filled, 0);
        assert_eq!(tx_submitted, 0);

        *target.lock() = None;
    }

    #[test]
    fn test_close_fails_queued_packets() {
        let conn = make_connection(u64::MAX, 0, 0);

        let done: StdArc<PlMutex<Vec<ErrorCode>>> = StdArc::new(PlMutex::new(Vec::new()));
        for _ in 0..3 {
            let sink = done.clone();
            conn.send_packet(
                small_packet(),
                Some(Box::new(move |code| sink.lock().push(code))),
            )
            .unwrap();
        }

        conn.close(ErrorCode::NotConnected);

        assert_eq!(done.lock().len(), 3);
        assert!(done.lock().iter().all(|&code| code == ErrorCode::NotConnected));
        assert!(!conn.is_connected());
        assert_eq!(conn.outstanding_packets(), 0);

        // late sends are refused outright
        assert!(conn.send_packet(small_packet(), None).is_err());
    }
}
