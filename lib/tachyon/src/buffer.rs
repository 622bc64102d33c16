use crate::fabric::Region;
use ion::shared::{ErrorType, TransportError, TransportResult};

/// Fixed-slot carousel over a single contiguous registered region.
///
/// Three counters advance modulo the slot count: `base` is the oldest slot
/// still in use, `filled` counts slots holding valid data, and `submitted`
/// counts slots committed to the provider. On a send ring slots are filled
/// before they are submitted, so `submitted <= filled <= slots`; on a
/// receive ring every slot is submitted up front and fills as completions
/// land, so `filled <= submitted <= slots`. Releasing retires a slot from
/// both counts. An operation that would break the counters fails without
/// applying anything.
///
/// The buffer carries no lock of its own - the owning channel's lock guards
/// it together with the rest of the channel bookkeeping.
pub struct RingBuffer {
    region: Region,
    slot_size: usize,
    slots: usize,
    base: usize,
    filled: usize,
    submitted: usize,
    // Byte offset consumed so far within the head slot, for partial reads.
    read_offset: usize,
    content_sizes: Vec<usize>,
}

impl RingBuffer {
    pub fn new(region: Region, slots: usize) -> TransportResult<RingBuffer> {
        if slots == 0 || region.len() / slots == 0 {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }

        let slot_size = region.len() / slots;

        Ok(RingBuffer {
            region,
            slot_size,
            slots,
            base: 0,
            filled: 0,
            submitted: 0,
            read_offset: 0,
            content_sizes: vec![0; slots],
        })
    }

    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    pub fn slot_offset(&self, index: usize) -> usize {
        index * self.slot_size
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn filled_count(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn submitted_count(&self) -> usize {
        self.submitted
    }

    #[inline]
    pub fn free_slots(&self) -> usize {
        self.slots - self.filled
    }

    /// Total free space, in bytes, across the unfilled slots.
    #[inline]
    pub fn available_write_space(&self) -> usize {
        self.free_slots() * self.slot_size
    }

    #[inline]
    pub fn next_write_index(&self) -> usize {
        (self.base + self.filled) % self.slots
    }

    /// The next slot available for writing, if any. The caller fills it and
    /// then calls `mark_filled`.
    #[inline]
    pub fn acquire_write_slot(&self) -> Option<usize> {
        if self.filled < self.slots {
            Some(self.next_write_index())
        } else {
            None
        }
    }

    /// The oldest in-use slot, if any data is held.
    #[inline]
    pub fn head_slot(&self) -> Option<usize> {
        if self.filled > 0 {
            Some(self.base)
        } else {
            None
        }
    }

    pub fn mark_filled(&mut self, count: usize) -> TransportResult<()> {
        if self.filled + count > self.slots {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }
        self.filled += count;
        Ok(())
    }

    pub fn mark_submitted(&mut self, count: usize) -> TransportResult<()> {
        if self.submitted + count > self.slots {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }
        self.submitted += count;
        Ok(())
    }

    /// Releases `count` slots from the base, returning them to the free
    /// pool.
    pub fn release(&mut self, count: usize) -> TransportResult<()> {
        if count > self.filled || count > self.submitted {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }
        self.base = (self.base + count) % self.slots;
        self.filled -= count;
        self.submitted -= count;
        Ok(())
    }

    #[inline]
    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    #[inline]
    pub fn set_read_offset(&mut self, offset: usize) {
        self.read_offset = offset;
    }

    pub fn content_size(&self, index: usize) -> TransportResult<usize> {
        if index >= self.slots {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }
        Ok(self.content_sizes[index])
    }

    pub fn set_content_size(&mut self, index: usize, size: usize) -> TransportResult<()> {
        if index >= self.slots {
            return Err(TransportError::Fatal(ErrorType::BufferState));
        }
        self.content_sizes[index] = size;
        Ok(())
    }

    /// Copies `data` into slot `index` starting `offset` bytes in.
    #[inline]
    pub fn write_slot(&self, index: usize, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.slot_size);
        self.region.write(self.slot_offset(index) + offset, data);
    }

    /// Copies `out.len()` bytes from slot `index` starting `offset` bytes
    /// in.
    #[inline]
    pub fn read_slot(&self, index: usize, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.slot_size);
        self.region.read(self.slot_offset(index) + offset, out);
    }
}
