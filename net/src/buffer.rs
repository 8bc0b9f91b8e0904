//! Fixed-capacity datagram buffer: the binary packet framing and codec layer.
//!
//! A [`Buffer`] is used both by a sender, which writes a header and payload into it
//! before a tick flushes it to the socket, and by a receiver, which reads the same
//! datagram back out field by field. There is no self-describing framing: a reader
//! must issue exactly the same sequence of typed reads that the writer issued typed
//! writes, mirroring the on-the-wire contract described in the module-level design.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian as LE};

use crate::error::PacketError;
use crate::seq::PacketId;

/// Maximum size of a single datagram, header included.
pub const BUFFER_CAP: usize = 1024;

const TYPE_POS: usize = 0;
const ID_POS: usize = 1;
/// `1` type/flags byte + `2` bytes of packet id.
pub const HEADER_LEN: usize = ID_POS + 2;

const TYPE_MASK: u8 = 0x07;

/// Packet flag bits, stored in the upper bits of byte 0 alongside the type.
pub mod flags {
    /// The packet carries a reliable payload and participates in the retransmission
    /// and ack machinery.
    pub const RELIABLE: u8 = 0x08;
    /// The packet's tail carries a list of ack ids, see [`super::Buffer::add_ack`].
    pub const HAS_ACK: u8 = 0x10;
}

/// Boxed backing storage for a [`Buffer`], kept out of the parent struct so that a
/// `Buffer` itself stays small and cheap to move between queues.
#[derive(Clone)]
struct Inner {
    data: [u8; BUFFER_CAP],
    /// Number of populated bytes, header included.
    size: u16,
}

/// A single fixed-capacity datagram, readable and writable through a shared cursor.
///
/// See the module documentation for the wire layout. A freshly [`cleared`](Buffer::clear)
/// buffer has `size == HEADER_LEN` and a cursor positioned right after the header.
#[derive(Clone)]
pub struct Buffer {
    inner: Box<Inner>,
    /// Shared read/write byte cursor.
    cursor: u16,
    /// Index of the byte currently being packed with bools, if any.
    bool_byte: Option<u16>,
    /// Next free bit within `bool_byte`, in `[0, 8)`.
    bool_bit: u8,
    /// Number of acks appended via [`Buffer::add_ack`] since the last [`Buffer::clear`].
    pending_ack_count: u8,
}

impl Buffer {

    /// Construct a fresh, cleared buffer.
    pub fn new() -> Self {
        let mut buf = Self {
            inner: Box::new(Inner {
                data: [0; BUFFER_CAP],
                size: HEADER_LEN as u16,
            }),
            cursor: HEADER_LEN as u16,
            bool_byte: None,
            bool_bit: 0,
            pending_ack_count: 0,
        };
        buf.clear();
        buf
    }

    /// Reset cursors, size and ack bookkeeping, and zero the type/flags byte. Called
    /// whenever a buffer is recycled from the pool, both before reuse for sending and
    /// before being handed to the socket to receive into.
    pub fn clear(&mut self) {
        self.inner.data[TYPE_POS] = 0;
        self.inner.size = HEADER_LEN as u16;
        self.cursor = HEADER_LEN as u16;
        self.bool_byte = None;
        self.bool_bit = 0;
        self.pending_ack_count = 0;
    }

    /// Full mutable backing array, used by the network layer to receive a datagram
    /// directly into the buffer's storage.
    #[inline]
    pub fn raw_mut(&mut self) -> &mut [u8; BUFFER_CAP] {
        &mut self.inner.data
    }

    /// Mark this buffer as holding `len` bytes received from the socket, and position
    /// the cursor right after the header for reading. The caller is responsible for
    /// validating `len >= HEADER_LEN` before trusting the buffer's contents.
    pub fn set_received_len(&mut self, len: usize) {
        debug_assert!(len <= BUFFER_CAP);
        self.inner.size = len as u16;
        self.cursor = HEADER_LEN as u16;
        self.bool_byte = None;
        self.bool_bit = 0;
        self.pending_ack_count = 0;
    }

    /// Number of populated bytes, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.size as usize
    }

    /// The datagram as written so far, ready to be handed to the socket.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.inner.data[..self.size()]
    }

    // -- header accessors --------------------------------------------------------

    #[inline]
    pub fn get_type(&self) -> u8 {
        self.inner.data[TYPE_POS] & TYPE_MASK
    }

    #[inline]
    pub fn set_type(&mut self, ty: u8) {
        let flags = self.inner.data[TYPE_POS] & !TYPE_MASK;
        self.inner.data[TYPE_POS] = flags | (ty & TYPE_MASK);
    }

    #[inline]
    pub fn get_reliable(&self) -> bool {
        self.inner.data[TYPE_POS] & flags::RELIABLE != 0
    }

    #[inline]
    pub fn set_reliable(&mut self, reliable: bool) {
        if reliable {
            self.inner.data[TYPE_POS] |= flags::RELIABLE;
        } else {
            self.inner.data[TYPE_POS] &= !flags::RELIABLE;
        }
    }

    #[inline]
    pub fn has_ack(&self) -> bool {
        self.inner.data[TYPE_POS] & flags::HAS_ACK != 0
    }

    #[inline]
    pub fn get_id(&self) -> PacketId {
        PacketId::new(LE::read_u16(&self.inner.data[ID_POS..ID_POS + 2]))
    }

    #[inline]
    pub fn set_id(&mut self, id: PacketId) {
        LE::write_u16(&mut self.inner.data[ID_POS..ID_POS + 2], id.get());
    }

    // -- bound checks -------------------------------------------------------------

    fn check_write(&self, len: usize) -> Result<(), PacketError> {
        if self.cursor as usize + len > BUFFER_CAP {
            Err(PacketError::BufferOverflow)
        } else {
            Ok(())
        }
    }

    fn check_read(&self, len: usize) -> Result<(), PacketError> {
        if self.cursor as usize + len > self.size() {
            Err(PacketError::BufferUnderrun)
        } else {
            Ok(())
        }
    }

    // -- primitives -----------------------------------------------------------------

    /// Append a bool into the current bool-pack byte, allocating a new one from the
    /// write cursor if none is open or the current one is full.
    pub fn write_bool(&mut self, v: bool) -> Result<(), PacketError> {
        self.alloc_bool_byte(true)?;
        let byte = self.bool_byte.unwrap() as usize;
        if v {
            self.inner.data[byte] |= 1 << self.bool_bit;
        }
        self.bool_bit += 1;
        Ok(())
    }

    /// Read a bool from the current bool-pack byte, as written by the matching
    /// [`Buffer::write_bool`] call on the sender.
    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        self.alloc_bool_byte(false)?;
        let byte = self.bool_byte.unwrap() as usize;
        let v = (self.inner.data[byte] >> self.bool_bit) & 1 != 0;
        self.bool_bit += 1;
        Ok(v)
    }

    fn alloc_bool_byte(&mut self, write: bool) -> Result<(), PacketError> {
        if self.bool_byte.is_none() || self.bool_bit >= 8 {
            if write {
                self.check_write(1)?;
            } else {
                self.check_read(1)?;
            }
            self.bool_bit = 0;
            let byte = self.cursor;
            self.bool_byte = Some(byte);
            self.cursor += 1;
            self.inner.size = self.inner.size.max(self.cursor);
            if write {
                self.inner.data[byte as usize] = 0;
            }
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<(), PacketError> {
        self.check_write(1)?;
        self.inner.data[self.cursor as usize] = v;
        self.advance(1);
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        self.check_read(1)?;
        let v = self.inner.data[self.cursor as usize];
        self.cursor += 1;
        Ok(v)
    }

    #[inline]
    pub fn write_i8(&mut self, v: i8) -> Result<(), PacketError> {
        self.write_u8(v as u8)
    }

    #[inline]
    pub fn read_i8(&mut self) -> Result<i8, PacketError> {
        self.read_u8().map(|v| v as i8)
    }

    pub fn write_u16(&mut self, v: u16) -> Result<(), PacketError> {
        self.check_write(2)?;
        LE::write_u16(&mut self.inner.data[self.cursor as usize..], v);
        self.advance(2);
        Ok(())
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        self.check_read(2)?;
        let v = LE::read_u16(&self.inner.data[self.cursor as usize..]);
        self.cursor += 2;
        Ok(v)
    }

    #[inline]
    pub fn write_i16(&mut self, v: i16) -> Result<(), PacketError> {
        self.write_u16(v as u16)
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16, PacketError> {
        self.read_u16().map(|v| v as i16)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<(), PacketError> {
        self.check_write(4)?;
        LE::write_u32(&mut self.inner.data[self.cursor as usize..], v);
        self.advance(4);
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        self.check_read(4)?;
        let v = LE::read_u32(&self.inner.data[self.cursor as usize..]);
        self.cursor += 4;
        Ok(v)
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) -> Result<(), PacketError> {
        self.write_u32(v as u32)
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, PacketError> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn write_f32(&mut self, v: f32) -> Result<(), PacketError> {
        self.check_write(4)?;
        LE::write_f32(&mut self.inner.data[self.cursor as usize..], v);
        self.advance(4);
        Ok(())
    }

    pub fn read_f32(&mut self) -> Result<f32, PacketError> {
        self.check_read(4)?;
        let v = LE::read_f32(&self.inner.data[self.cursor as usize..]);
        self.cursor += 4;
        Ok(v)
    }

    /// Write the bytes of `s` followed by a NUL terminator.
    pub fn write_string(&mut self, s: &str) -> Result<(), PacketError> {
        self.check_write(s.len() + 1)?;
        let start = self.cursor as usize;
        self.inner.data[start..start + s.len()].copy_from_slice(s.as_bytes());
        self.inner.data[start + s.len()] = 0;
        self.advance((s.len() + 1) as u16);
        Ok(())
    }

    /// Read a NUL-terminated string, mirroring [`Buffer::write_string`].
    pub fn read_string(&mut self) -> Result<String, PacketError> {
        let start = self.cursor as usize;
        let rel = self.inner.data[start..self.size()]
            .iter()
            .position(|&b| b == 0)
            .ok_or(PacketError::BufferUnderrun)?;
        let s = String::from_utf8_lossy(&self.inner.data[start..start + rel]).into_owned();
        self.cursor += (rel + 1) as u16;
        Ok(s)
    }

    #[inline]
    fn advance(&mut self, n: u16) {
        self.cursor += n;
        self.inner.size = self.inner.size.max(self.cursor);
    }

    // -- ack piggybacking -----------------------------------------------------------

    /// Append `id` to the tail of the payload as a pending ack. The caller must call
    /// [`Buffer::finalize`] once before sending so `HAS_ACK` and the trailing count
    /// byte get written.
    pub fn add_ack(&mut self, id: PacketId) -> Result<(), PacketError> {
        self.write_u16(id.get())?;
        self.pending_ack_count += 1;
        Ok(())
    }

    /// Number of acks carried by this datagram. Always computed from the wire data,
    /// valid only once [`Buffer::has_ack`] is true.
    pub fn get_ack_count(&self) -> u8 {
        if self.has_ack() {
            self.inner.data[self.size() - 1]
        } else {
            0
        }
    }

    /// Read the `i`-th ack id (`0 <= i < get_ack_count()`), most recently added last.
    pub fn get_ack(&self, i: u8) -> Result<PacketId, PacketError> {
        let count = self.get_ack_count();
        if i >= count {
            return Err(PacketError::BufferUnderrun);
        }
        let offset = self.size() - 1 - (count - i) as usize * 2;
        Ok(PacketId::new(LE::read_u16(&self.inner.data[offset..offset + 2])))
    }

    /// If any acks were appended, set `HAS_ACK` and write the trailing count byte.
    ///
    /// Idempotent: the count is consumed as it is written, so a second call with no
    /// further [`Buffer::add_ack`] calls in between (e.g. re-finalizing an unacked
    /// reliable packet on every retransmission) is a no-op rather than appending a
    /// second count byte and growing `size` on each retransmit.
    pub fn finalize(&mut self) -> Result<(), PacketError> {
        if self.pending_ack_count > 0 {
            self.inner.data[TYPE_POS] |= flags::HAS_ACK;
            let count = self.pending_ack_count;
            self.pending_ack_count = 0;
            self.write_u8(count)?;
        }
        Ok(())
    }

}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview_len = self.size().min(16);
        f.debug_struct("Buffer")
            .field("type", &self.get_type())
            .field("reliable", &self.get_reliable())
            .field("has_ack", &self.has_ack())
            .field("id", &self.get_id())
            .field("size", &self.size())
            .field("preview", &format_args!("{:02x?}", &self.inner.data[..preview_len]))
            .finish()
    }
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = Buffer::new();
        buf.set_type(3);
        buf.set_reliable(true);
        buf.set_id(PacketId::new(42));
        assert_eq!(buf.get_type(), 3);
        assert!(buf.get_reliable());
        assert_eq!(buf.get_id(), PacketId::new(42));
    }

    #[test]
    fn primitive_round_trip() {
        let mut buf = Buffer::new();
        buf.write_u8(7).unwrap();
        buf.write_u16(1000).unwrap();
        buf.write_u32(123_456).unwrap();
        buf.write_f32(1.5).unwrap();
        buf.write_string("hello").unwrap();

        assert_eq!(buf.read_u8().unwrap(), 7);
        assert_eq!(buf.read_u16().unwrap(), 1000);
        assert_eq!(buf.read_u32().unwrap(), 123_456);
        assert_eq!(buf.read_f32().unwrap(), 1.5);
        assert_eq!(buf.read_string().unwrap(), "hello");
    }

    #[test]
    fn interleaved_bools() {
        let mut buf = Buffer::new();
        buf.write_bool(true).unwrap();
        buf.write_u8(9).unwrap();
        buf.write_bool(false).unwrap();
        buf.write_bool(true).unwrap();

        assert!(buf.read_bool().unwrap());
        assert_eq!(buf.read_u8().unwrap(), 9);
        assert!(!buf.read_bool().unwrap());
        assert!(buf.read_bool().unwrap());
    }

    #[test]
    fn nine_bools_span_two_pack_bytes() {
        let mut buf = Buffer::new();
        for i in 0..9 {
            buf.write_bool(i % 2 == 0).unwrap();
        }
        for i in 0..9 {
            assert_eq!(buf.read_bool().unwrap(), i % 2 == 0);
        }
    }

    #[test]
    fn acks_are_indexed_independently() {
        let mut buf = Buffer::new();
        buf.add_ack(PacketId::new(1)).unwrap();
        buf.add_ack(PacketId::new(2)).unwrap();
        buf.add_ack(PacketId::new(3)).unwrap();
        buf.finalize().unwrap();

        assert!(buf.has_ack());
        assert_eq!(buf.get_ack_count(), 3);
        assert_eq!(buf.get_ack(0).unwrap(), PacketId::new(1));
        assert_eq!(buf.get_ack(1).unwrap(), PacketId::new(2));
        assert_eq!(buf.get_ack(2).unwrap(), PacketId::new(3));
    }

    /// Re-finalizing a buffer that carries acks but received no further `add_ack`
    /// calls (the retransmission path in `Connection::flush`) must not append a
    /// second count byte and grow `size` each time it is called.
    #[test]
    fn finalize_is_idempotent_without_new_acks() {
        let mut buf = Buffer::new();
        buf.add_ack(PacketId::new(1)).unwrap();
        buf.add_ack(PacketId::new(2)).unwrap();
        buf.finalize().unwrap();
        let size_after_first = buf.size();

        buf.finalize().unwrap();
        buf.finalize().unwrap();

        assert_eq!(buf.size(), size_after_first);
        assert_eq!(buf.get_ack_count(), 2);
        assert_eq!(buf.get_ack(0).unwrap(), PacketId::new(1));
        assert_eq!(buf.get_ack(1).unwrap(), PacketId::new(2));
    }

    #[test]
    fn write_past_capacity_overflows() {
        let mut buf = Buffer::new();
        let big = vec![0u8; BUFFER_CAP];
        // Can't write a string that large.
        let s = String::from_utf8(big).unwrap();
        assert!(matches!(buf.write_string(&s), Err(PacketError::BufferOverflow)));
    }

    #[test]
    fn read_past_size_underruns() {
        let mut buf = Buffer::new();
        buf.write_u8(1).unwrap();
        buf.read_u8().unwrap();
        assert!(matches!(buf.read_u8(), Err(PacketError::BufferUnderrun)));
    }

}
