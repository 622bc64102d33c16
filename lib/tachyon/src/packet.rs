use byteorder::{BigEndian, ByteOrder};
use ion::reqid::{Reqid, REQID_SIZE};
use ion::shared::{ErrorType, Payload, TransportError, TransportResult};

/// Length of the outer frame header: a single big-endian word holding the
/// body length.
pub const HEADER_SIZE: usize = 4;

/// Manipulates the 4-byte packet header in place. Always go through this
/// instead of poking the buffer directly.
pub struct PacketHeader;

impl PacketHeader {
    #[inline]
    pub fn set_packet_size(header: &mut [u8], size: u32) {
        BigEndian::write_u32(header, size);
    }

    #[inline]
    pub fn get_packet_size(header: &[u8]) -> u32 {
        BigEndian::read_u32(header)
    }

    #[inline]
    pub fn size() -> usize {
        HEADER_SIZE
    }
}

/// Outbound packet: header plus body in one contiguous allocation. The body
/// size is fixed at construction and must be filled exactly - packing more
/// fails, and `prepare_for_writing` rejects a partially packed body.
pub struct OutgoingPacket {
    data: Vec<u8>,
    position: usize,
}

impl OutgoingPacket {
    pub fn new(body_size: u32) -> OutgoingPacket {
        let total = body_size as usize + HEADER_SIZE;
        let mut data = vec![0u8; total];
        PacketHeader::set_packet_size(&mut data, body_size);

        OutgoingPacket {
            data,
            position: HEADER_SIZE,
        }
    }

    /// Bytes needed to pack `value` with its length prefix.
    #[inline]
    pub fn size_required_to_pack_string(value: &str) -> usize {
        4 + value.len()
    }

    /// Bytes needed to pack an encoded payload of `byte_size` bytes with its
    /// length prefix.
    #[inline]
    pub fn size_required_to_pack_payload(byte_size: usize) -> usize {
        4 + byte_size
    }

    pub fn pack_int(&mut self, value: i32) -> TransportResult<()> {
        if self.position + 4 > self.data.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }
        BigEndian::write_i32(&mut self.data[self.position..], value);
        self.position += 4;
        Ok(())
    }

    pub fn pack_string(&mut self, value: &str) -> TransportResult<()> {
        if self.position + 4 + value.len() > self.data.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }
        self.pack_int(value.len() as i32)?;
        self.data[self.position..self.position + value.len()].copy_from_slice(value.as_bytes());
        self.position += value.len();
        Ok(())
    }

    pub fn pack_reqid(&mut self, rid: &Reqid) -> TransportResult<()> {
        if self.position + REQID_SIZE > self.data.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }
        self.data[self.position..self.position + REQID_SIZE].copy_from_slice(rid.as_bytes());
        self.position += REQID_SIZE;
        Ok(())
    }

    /// Packs a length prefix followed by the payload's serialized bytes.
    /// `byte_size` must match what the payload actually produces.
    pub fn pack_payload<P: Payload>(&mut self, payload: &P, byte_size: usize) -> TransportResult<()> {
        if self.position + 4 + byte_size > self.data.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }
        self.pack_int(byte_size as i32)?;
        payload
            .serialize_into(&mut self.data[self.position..self.position + byte_size])
            .map_err(|_| TransportError::Fatal(ErrorType::Serialization))?;
        self.position += byte_size;
        Ok(())
    }

    /// Validates that the body was filled exactly. Must be called before the
    /// packet is handed to a connection.
    pub fn prepare_for_writing(&self) -> TransportResult<()> {
        if self.position != self.data.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }
        Ok(())
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn bytes_filled(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn bytes_left(&self) -> usize {
        self.data.len() - self.position
    }

    /// The full frame: header followed by body.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Inbound packet, assembled in two stages: the fixed-size header first,
/// then a body of the length the header declares. Assembly state is managed
/// by the owning connection; unpacking walks the body with a read position
/// that never advances past a failed operation.
pub struct IncomingPacket {
    pub(crate) header: [u8; HEADER_SIZE],
    pub(crate) header_filled: usize,
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) data_filled: usize,
    position: usize,
    max_packet_size: u32,
}

impl IncomingPacket {
    /// An empty packet that will accept a body of at most
    /// `max_packet_size` bytes (zero means no limit).
    pub fn new(max_packet_size: u32) -> IncomingPacket {
        IncomingPacket {
            header: [0; HEADER_SIZE],
            header_filled: 0,
            data: None,
            data_filled: 0,
            position: 0,
            max_packet_size,
        }
    }

    /// Builds a complete packet from a contiguous frame.
    pub fn from_wire(bytes: &[u8]) -> TransportResult<IncomingPacket> {
        if bytes.len() < HEADER_SIZE {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&bytes[..HEADER_SIZE]);
        let body_len = PacketHeader::get_packet_size(&header) as usize;

        if bytes.len() < HEADER_SIZE + body_len {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }

        Ok(IncomingPacket {
            header,
            header_filled: HEADER_SIZE,
            data: Some(bytes[HEADER_SIZE..HEADER_SIZE + body_len].to_vec()),
            data_filled: body_len,
            position: 0,
            max_packet_size: 0,
        })
    }

    /// Declared body length. Only meaningful once the header is complete.
    #[inline]
    pub fn packet_size(&self) -> u32 {
        PacketHeader::get_packet_size(&self.header)
    }

    #[inline]
    pub fn total_size(&self) -> u32 {
        self.packet_size() + HEADER_SIZE as u32
    }

    #[inline]
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    #[inline]
    pub(crate) fn header_complete(&self) -> bool {
        self.header_filled == HEADER_SIZE
    }

    #[inline]
    pub(crate) fn complete(&self) -> bool {
        self.header_complete() && self.data.is_some() && self.data_filled == self.packet_size() as usize
    }

    /// Rewinds the unpack position to the start of the body.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    fn body(&self) -> TransportResult<&[u8]> {
        match &self.data {
            Some(data) => Ok(&data[..self.data_filled]),
            None => Err(TransportError::Fatal(ErrorType::InvalidPacket)),
        }
    }

    pub fn unpack_int(&mut self) -> TransportResult<i32> {
        let body = self.body()?;
        if self.position + 4 > body.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }
        let value = BigEndian::read_i32(&body[self.position..]);
        self.position += 4;
        Ok(value)
    }

    pub fn unpack_string(&mut self) -> TransportResult<String> {
        let body = self.body()?;
        if self.position + 4 > body.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }

        let size = BigEndian::read_i32(&body[self.position..]);
        if size < 0 || self.position + 4 + size as usize > body.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }

        let start = self.position + 4;
        let value = String::from_utf8(body[start..start + size as usize].to_vec())
            .map_err(|_| TransportError::Fatal(ErrorType::InvalidPacket))?;

        self.position += 4 + size as usize;
        Ok(value)
    }

    pub fn unpack_reqid(&mut self) -> TransportResult<Reqid> {
        let body = self.body()?;
        if self.position + REQID_SIZE > body.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }

        let mut bytes = [0u8; REQID_SIZE];
        bytes.copy_from_slice(&body[self.position..self.position + REQID_SIZE]);
        self.position += REQID_SIZE;
        Ok(Reqid::from_bytes(bytes))
    }

    /// Unpacks a length-prefixed encoded payload. The declared length must
    /// exactly cover the bytes the decoder consumes.
    pub fn unpack_payload<P: Payload>(&mut self) -> TransportResult<P> {
        let body = self.body()?;
        if self.position + 4 > body.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }

        let size = BigEndian::read_i32(&body[self.position..]);
        if size < 0 || self.position + 4 + size as usize > body.len() {
            return Err(TransportError::Fatal(ErrorType::InvalidPacket));
        }

        let start = self.position + 4;
        let payload = P::parse_from(&body[start..start + size as usize])?;

        self.position += 4 + size as usize;
        Ok(payload)
    }
}
