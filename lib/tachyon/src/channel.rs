use crate::buffer::RingBuffer;
use crate::datagram::tag;
use crate::fabric::Region;
use byteorder::{BigEndian, ByteOrder};
use ion::logging;
use ion::shared::{ErrorType, TransportError, TransportResult};
use ion::StreamId;

/// Per-slot framing overhead: a 4-byte length word followed by a 4-byte
/// piggybacked-credit word.
pub const SLOT_OVERHEAD: usize = 8;

/// Slots a channel keeps out of the credit window so a credit-only
/// advertisement can always be posted, even with a full pipeline.
pub const RESERVED_SLOTS: usize = 2;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Init,
    Connected,
    ToBeDisconnected,
    Disconnected,
}

/// Readiness raised by channel operations. The owning loop acts on these;
/// the channel never calls back into it.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Signals {
    pub write_ready: bool,
    pub read_ready: bool,
}

impl Signals {
    pub const NONE: Signals = Signals {
        write_ready: false,
        read_ready: false,
    };

    #[inline]
    pub fn merge(self, other: Signals) -> Signals {
        Signals {
            write_ready: self.write_ready || other.write_ready,
            read_ready: self.read_ready || other.read_ready,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PostKind {
    Data,
    Credit,
}

/// A TX slot staged under the channel lock. The caller posts it with the
/// lock released and commits the outcome afterwards.
#[derive(Debug)]
pub struct PreparedWrite {
    pub slot: usize,
    pub offset: usize,
    pub len: usize,
    pub region: Region,
    credit: u32,
    body_len: usize,
    kind: PostKind,
}

impl PreparedWrite {
    #[inline]
    pub fn is_credit_only(&self) -> bool {
        self.kind == PostKind::Credit
    }
}

/// An RX slot to hand back to the provider. `count_credit` is false for
/// slots that carried a credit-only packet - their sender spent no credit,
/// so recycling them must not mint any.
#[derive(Debug)]
pub struct Repost {
    pub slot: usize,
    pub offset: usize,
    pub len: usize,
    pub region: Region,
    count_credit: bool,
}

/// The provider-post surface behind a channel: a dedicated MSG endpoint or
/// a shared tagged RDM endpoint. Implementations add whatever addressing
/// (peer handle, tags) the transport needs.
pub trait SlotPoster: Send {
    fn post_data(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        slot: u64,
    ) -> TransportResult<()>;

    fn post_credit(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        slot: u64,
    ) -> TransportResult<()>;

    fn post_recv(
        &mut self,
        region: &Region,
        offset: usize,
        len: usize,
        slot: u64,
    ) -> TransportResult<()>;
}

/// Per-peer transport: a TX and an RX ring over registered memory plus the
/// credit state that flow-controls them.
///
/// Each RX slot is one unit of credit. `peer_credit` counts slots known
/// free at the peer; each released local slot bumps `total_used_credit`,
/// and the delta against `credit_used_checkpoint` is advertised either as
/// a piggyback on outgoing data or through an explicit credit-only packet.
/// Identical semantics back both the MSG and RDM transports.
pub struct Channel {
    state: ChannelState,
    tx: RingBuffer,
    rx: RingBuffer,

    peer_credit: u32,
    total_used_credit: u64,
    credit_used_checkpoint: u64,
    written_buffers: u32,
    waiting_for_credit: bool,

    local_stream: StreamId,
    peer_stream: StreamId,
    send_tag: u64,
    send_credit_tag: u64,

    // Authoritative post/completion counters; multiplexer aggregates are
    // derived from these.
    tx_posts: u64,
    tx_completions: u64,
    rx_posts: u64,
    rx_completions: u64,

    log: logging::Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        tx: RingBuffer,
        rx: RingBuffer,
        local_stream: StreamId,
        peer_stream: StreamId,
        log: L,
    ) -> Channel {
        Channel {
            state: ChannelState::Init,
            tx,
            rx,
            peer_credit: 0,
            total_used_credit: 0,
            credit_used_checkpoint: 0,
            written_buffers: 0,
            waiting_for_credit: false,
            local_stream,
            peer_stream,
            send_tag: 0,
            send_credit_tag: 0,
            tx_posts: 0,
            tx_completions: 0,
            rx_posts: 0,
            rx_completions: 0,
            log: logging::child(log),
        }
    }

    /// Initializes tags and credit and returns the full set of RX slots to
    /// post. Idempotent: a second call on a live channel returns nothing.
    pub fn start(&mut self) -> TransportResult<Vec<Repost>> {
        if self.state != ChannelState::Init {
            return Ok(Vec::new());
        }
        if self.rx.slot_count() <= RESERVED_SLOTS || self.tx.slot_count() <= RESERVED_SLOTS {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }

        self.send_tag = tag::pack(tag::KIND_DATA, 0, self.local_stream, self.peer_stream);
        self.send_credit_tag = tag::pack(
            tag::KIND_DATA,
            tag::SUB_CREDIT,
            self.local_stream,
            self.peer_stream,
        );

        self.peer_credit = self.credit_cap();
        self.total_used_credit = 0;
        self.credit_used_checkpoint = 0;
        self.written_buffers = 0;
        self.waiting_for_credit = false;
        self.state = ChannelState::Connected;

        logging::debug!(self.log, "channel started";
                        "context" => "start",
                        "local_stream" => self.local_stream,
                        "peer_stream" => self.peer_stream,
                        "credit" => self.peer_credit);

        let slot_size = self.rx.slot_size();
        let region = self.rx.region().clone();
        Ok((0..self.rx.slot_count())
            .map(|slot| Repost {
                slot,
                offset: self.rx.slot_offset(slot),
                len: slot_size,
                region: region.clone(),
                count_credit: false,
            })
            .collect())
    }

    #[inline]
    fn credit_cap(&self) -> u32 {
        (self.rx.slot_count() - RESERVED_SLOTS) as u32
    }

    /// Largest body one TX slot can carry.
    #[inline]
    pub fn max_writable(&self) -> usize {
        self.tx.slot_size() - SLOT_OVERHEAD
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    #[inline]
    pub fn send_tag(&self) -> u64 {
        self.send_tag
    }

    #[inline]
    pub fn send_credit_tag(&self) -> u64 {
        self.send_credit_tag
    }

    #[inline]
    pub fn local_stream(&self) -> StreamId {
        self.local_stream
    }

    #[inline]
    pub fn peer_stream(&self) -> StreamId {
        self.peer_stream
    }

    #[inline]
    pub fn peer_credit(&self) -> u32 {
        self.peer_credit
    }

    #[inline]
    pub fn written_buffers(&self) -> u32 {
        self.written_buffers
    }

    #[inline]
    pub fn waiting_for_credit(&self) -> bool {
        self.waiting_for_credit
    }

    #[inline]
    pub fn total_used_credit(&self) -> u64 {
        self.total_used_credit
    }

    #[inline]
    pub fn credit_used_checkpoint(&self) -> u64 {
        self.credit_used_checkpoint
    }

    #[inline]
    pub fn tx_ring(&self) -> &RingBuffer {
        &self.tx
    }

    #[inline]
    pub fn rx_ring(&self) -> &RingBuffer {
        &self.rx
    }

    #[inline]
    pub fn tx_posts(&self) -> u64 {
        self.tx_posts
    }

    #[inline]
    pub fn tx_completions(&self) -> u64 {
        self.tx_completions
    }

    #[inline]
    pub fn rx_posts(&self) -> u64 {
        self.rx_posts
    }

    #[inline]
    pub fn rx_completions(&self) -> u64 {
        self.rx_completions
    }

    /// True when a data write can currently proceed.
    #[inline]
    pub fn write_ready(&self) -> bool {
        self.is_connected()
            && self.peer_credit > 0
            && self.tx.slot_count() - self.written_buffers as usize > RESERVED_SLOTS
    }

    /// Unadvertised credit accumulated since the last advertisement.
    #[inline]
    fn unadvertised_credit(&self) -> TransportResult<u32> {
        let delta = self.total_used_credit - self.credit_used_checkpoint;
        if delta > u64::from(self.credit_cap()) {
            logging::error!(self.log, "used credit exceeds the ring window";
                            "context" => "credit",
                            "delta" => delta,
                            "cap" => self.credit_cap());
            return Err(TransportError::Fatal(ErrorType::CreditAccounting));
        }
        Ok(delta as u32)
    }

    /// Stages up to one TX slot's worth of `data`. Returns `None` when the
    /// write must wait for credit or for in-flight slots to complete; a
    /// credit stall latches `waiting_for_credit`.
    pub fn prepare_write(&mut self, data: &[u8]) -> TransportResult<Option<PreparedWrite>> {
        if !self.is_connected() {
            return Err(TransportError::Fatal(ErrorType::NotConnected));
        }

        let free_slots = self.tx.slot_count() - self.written_buffers as usize;
        if self.peer_credit == 0 || free_slots <= RESERVED_SLOTS {
            if self.peer_credit == 0 {
                self.waiting_for_credit = true;
            }
            return Ok(None);
        }

        let slot = match self.tx.acquire_write_slot() {
            Some(slot) => slot,
            None => return Ok(None),
        };

        let body_len = data.len().min(self.max_writable());
        let credit = self.unadvertised_credit()?;

        let mut head = [0u8; SLOT_OVERHEAD];
        BigEndian::write_u32(&mut head[..4], body_len as u32);
        BigEndian::write_u32(&mut head[4..], credit);
        self.tx.write_slot(slot, 0, &head);
        self.tx.write_slot(slot, SLOT_OVERHEAD, &data[..body_len]);

        logging::trace!(self.log, "staged data slot";
                        "context" => "write",
                        "slot" => slot,
                        "body_len" => body_len,
                        "credit" => credit,
                        "peer_credit" => self.peer_credit);

        Ok(Some(PreparedWrite {
            slot,
            offset: self.tx.slot_offset(slot),
            len: SLOT_OVERHEAD + body_len,
            region: self.tx.region().clone(),
            credit,
            body_len,
            kind: PostKind::Data,
        }))
    }

    /// Commits a staged write after the provider post. `posted` is false
    /// when the post reported a transient failure; nothing is applied then
    /// and the slot is simply re-staged later.
    pub fn commit_write(&mut self, prepared: &PreparedWrite, posted: bool) -> TransportResult<usize> {
        if !posted {
            return Ok(0);
        }

        self.tx.mark_filled(1)?;
        self.tx.mark_submitted(1)?;
        self.tx.set_content_size(prepared.slot, prepared.body_len)?;
        self.tx_posts += 1;
        self.written_buffers += 1;

        match prepared.kind {
            PostKind::Data => {
                if self.peer_credit == 0 {
                    return Err(TransportError::Fatal(ErrorType::CreditAccounting));
                }
                self.peer_credit -= 1;
                self.waiting_for_credit = false;
            }
            PostKind::Credit => {}
        }
        self.credit_used_checkpoint += u64::from(prepared.credit);

        Ok(prepared.body_len)
    }

    /// True once the unadvertised window justifies an explicit credit-only
    /// packet.
    #[inline]
    pub fn credit_post_due(&self) -> bool {
        let due = (self.rx.slot_count() / 2).saturating_sub(1).max(1) as u64;
        self.is_connected() && self.total_used_credit - self.credit_used_checkpoint >= due
    }

    /// Stages a credit-only packet: zero length word, credit piggyback, no
    /// body. Consumes a TX slot from the reserved margin.
    pub fn prepare_credit(&mut self) -> TransportResult<Option<PreparedWrite>> {
        if !self.is_connected() {
            return Err(TransportError::Fatal(ErrorType::NotConnected));
        }
        let slot = match self.tx.acquire_write_slot() {
            Some(slot) => slot,
            None => {
                logging::warn!(self.log, "no free slot to post credit";
                               "context" => "credit",
                               "peer_credit" => self.peer_credit,
                               "used" => self.total_used_credit,
                               "checkpoint" => self.credit_used_checkpoint);
                return Ok(None);
            }
        };

        let credit = self.unadvertised_credit()?;

        let mut head = [0u8; SLOT_OVERHEAD];
        BigEndian::write_u32(&mut head[4..], credit);
        self.tx.write_slot(slot, 0, &head);

        logging::trace!(self.log, "staged credit slot";
                        "context" => "credit",
                        "slot" => slot,
                        "credit" => credit);

        Ok(Some(PreparedWrite {
            slot,
            offset: self.tx.slot_offset(slot),
            len: SLOT_OVERHEAD,
            region: self.tx.region().clone(),
            credit,
            body_len: 0,
            kind: PostKind::Credit,
        }))
    }

    /// Absorbs a credit advertisement from the peer, clamped to the window.
    fn absorb_credit(&mut self, credit: u32) -> Signals {
        if credit == 0 {
            return Signals::NONE;
        }

        let cap = self.credit_cap();
        self.peer_credit += credit;
        if self.peer_credit > cap {
            logging::warn!(self.log, "peer credit above the ring window, clamping";
                           "context" => "credit",
                           "peer_credit" => self.peer_credit,
                           "cap" => cap);
            self.peer_credit = cap;
        }

        Signals {
            write_ready: self.waiting_for_credit,
            read_ready: false,
        }
    }

    /// Consumes bytes from the head RX slot into `out`, resuming at the
    /// stored read offset. A fully drained slot is released and handed back
    /// for re-posting; credit-only slots are absorbed without delivering
    /// data.
    pub fn read_data(&mut self, out: &mut [u8]) -> TransportResult<(usize, Signals, Option<Repost>)> {
        let slot = match self.rx.head_slot() {
            Some(slot) => slot,
            None => return Ok((0, Signals::NONE, None)),
        };

        let mut head = [0u8; SLOT_OVERHEAD];
        self.rx.read_slot(slot, 0, &mut head);
        let length = BigEndian::read_u32(&head[..4]) as usize;
        let credit = BigEndian::read_u32(&head[4..]);

        let mut signals = self.absorb_credit(credit);
        if credit > 0 {
            // zero the word so a partial read does not absorb it twice
            self.rx.write_slot(slot, 4, &[0u8; 4]);
        }

        if length > self.rx.slot_size() - SLOT_OVERHEAD {
            logging::error!(self.log, "declared length exceeds the slot";
                            "context" => "read",
                            "slot" => slot,
                            "length" => length);
            return Err(TransportError::Fatal(ErrorType::PayloadTooLarge));
        }

        // Credit-only packet: no body, no credit minted for the recycled
        // slot.
        if length == 0 {
            self.rx.release(1)?;
            self.rx.set_read_offset(0);
            return Ok((0, signals, Some(self.repost_for(slot, false))));
        }

        let read_offset = self.rx.read_offset();
        let need_copy = length - read_offset;
        let can_copy = need_copy.min(out.len());

        self.rx
            .read_slot(slot, SLOT_OVERHEAD + read_offset, &mut out[..can_copy]);

        let repost = if can_copy == need_copy {
            self.rx.release(1)?;
            self.rx.set_read_offset(0);
            Some(self.repost_for(slot, true))
        } else {
            self.rx.set_read_offset(read_offset + can_copy);
            None
        };

        if self.rx.filled_count() > 0 {
            signals.read_ready = true;
        }

        Ok((can_copy, signals, repost))
    }

    fn repost_for(&self, slot: usize, count_credit: bool) -> Repost {
        Repost {
            slot,
            offset: self.rx.slot_offset(slot),
            len: self.rx.slot_size(),
            region: self.rx.region().clone(),
            count_credit,
        }
    }

    /// Commits an RX re-post (or one of the initial posts from `start`).
    /// Released slots only count toward the credit window once the provider
    /// holds them again.
    pub fn commit_repost(&mut self, repost: &Repost, posted: bool) -> TransportResult<()> {
        if !posted {
            return Ok(());
        }
        self.rx.mark_submitted(1)?;
        self.rx_posts += 1;
        if repost.count_credit {
            self.total_used_credit += 1;
        }
        Ok(())
    }

    /// A data send completed: retire the head TX slot and report its body
    /// byte count so the packet layer can account it.
    pub fn on_write_complete(&mut self) -> TransportResult<(usize, Signals)> {
        if self.written_buffers == 0 {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }

        let base = self.tx.base();
        let completed = self.tx.content_size(base)?;

        self.tx.release(1)?;
        self.tx_completions += 1;
        self.written_buffers -= 1;

        Ok((
            completed,
            Signals {
                write_ready: true,
                read_ready: false,
            },
        ))
    }

    /// A credit-only send completed.
    pub fn on_credit_write_complete(&mut self) -> TransportResult<Signals> {
        let (_, signals) = self.on_write_complete()?;
        Ok(signals)
    }

    /// `count` receive completions landed: the corresponding slots now hold
    /// data.
    pub fn on_read_complete(&mut self, count: usize) -> TransportResult<Signals> {
        self.rx.mark_filled(count)?;
        self.rx_completions += count as u64;
        Ok(Signals {
            write_ready: false,
            read_ready: self.rx.filled_count() > 0,
        })
    }

    /// A credit-only packet landed; tagged transports route it here instead
    /// of through the data path. The slot is consumed immediately unless
    /// unconsumed data slots sit ahead of it, in which case the ordinary
    /// read path will absorb it on arrival at the head.
    pub fn on_credit_read_complete(&mut self) -> TransportResult<(Signals, Option<Repost>)> {
        self.rx.mark_filled(1)?;
        self.rx_completions += 1;

        if self.rx.filled_count() != 1 {
            return Ok((
                Signals {
                    write_ready: false,
                    read_ready: true,
                },
                None,
            ));
        }

        let slot = match self.rx.head_slot() {
            Some(slot) => slot,
            None => return Err(TransportError::Fatal(ErrorType::BufferState)),
        };

        let mut head = [0u8; SLOT_OVERHEAD];
        self.rx.read_slot(slot, 0, &mut head);
        let length = BigEndian::read_u32(&head[..4]);
        let credit = BigEndian::read_u32(&head[4..]);

        if length != 0 {
            logging::warn!(self.log, "credit packet with a non-zero length";
                           "context" => "credit",
                           "length" => length);
        }

        let signals = self.absorb_credit(credit);
        self.rx.release(1)?;
        self.rx.set_read_offset(0);

        Ok((signals, Some(self.repost_for(slot, false))))
    }

    /// Begins teardown. In-flight posts still complete but produce no user
    /// callbacks; `drain` finishes the transition.
    pub fn close(&mut self) {
        match self.state {
            ChannelState::Connected => {
                logging::debug!(self.log, "closing channel";
                                "context" => "close",
                                "written_buffers" => self.written_buffers,
                                "peer_credit" => self.peer_credit);
                self.state = if self.written_buffers == 0 {
                    ChannelState::Disconnected
                } else {
                    ChannelState::ToBeDisconnected
                };
            }
            ChannelState::Init => self.state = ChannelState::Disconnected,
            _ => {}
        }
    }

    /// Completes teardown once in-flight sends have drained. Returns true
    /// when the channel reached `Disconnected`.
    pub fn drain(&mut self) -> bool {
        if self.state == ChannelState::ToBeDisconnected && self.written_buffers == 0 {
            self.state = ChannelState::Disconnected;
        }
        self.state == ChannelState::Disconnected
    }
}
