//! CDR streams.
//!
//! `StreamOut` grows a byte buffer with every primitive aligned to its
//! natural boundary relative to the message body start; `StreamIn` reads it
//! back, swapping byte order when the declared order differs from native.
//! Encapsulations restart alignment at their own first byte (the byte-order
//! octet) and nest through a base-offset stack, which keeps absolute
//! positions valid for TypeCode and value indirections.

use bytes::{BufMut, Bytes, BytesMut};
use orb_core::error::{CoreResult, SystemException};

/// Minor code reported when a message declares more bytes than it carries.
pub const MINOR_FEWER_BYTES: u32 = 1;
/// Minor code reported on a bad indirection offset.
pub const MINOR_BAD_INDIRECTION: u32 = 2;
/// Minor code reported on malformed string data.
pub const MINOR_BAD_STRING: u32 = 3;

/// Whether this build's native order is little-endian.
pub const fn native_little_endian() -> bool {
    cfg!(target_endian = "little")
}

struct ChunkState {
    limit: usize,
    // usize::MAX while no chunk is open.
    size_pos: usize,
    data_start: usize,
}

/// A growable CDR output stream.
pub struct StreamOut {
    buf: BytesMut,
    little_endian: bool,
    // Alignment restarts at each encapsulation; entries are the absolute
    // position of the encapsulation's byte-order octet.
    bases: Vec<usize>,
    // Backpatch positions for encapsulation length fields.
    length_fields: Vec<usize>,
    chunk: Option<ChunkState>,
}

macro_rules! write_primitive {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: $ty) {
            const N: usize = std::mem::size_of::<$ty>();
            self.reserve_chunk_space(N, N);
            self.align(N);
            if self.little_endian {
                self.buf.extend_from_slice(&value.to_le_bytes());
            } else {
                self.buf.extend_from_slice(&value.to_be_bytes());
            }
        }
    };
}

impl StreamOut {
    /// A stream writing in native byte order.
    pub fn new() -> Self {
        Self::with_order(native_little_endian())
    }

    /// A stream writing in an explicit byte order.
    pub fn with_order(little_endian: bool) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            little_endian,
            bases: vec![0],
            length_fields: Vec::new(),
            chunk: None,
        }
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    /// Absolute position from the start of the stream.
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    fn base(&self) -> usize {
        *self.bases.last().unwrap_or(&0)
    }

    /// Pads with zeros until the position is a multiple of `n` relative to
    /// the current alignment base.
    pub fn align(&mut self, n: usize) {
        let rel = self.buf.len() - self.base();
        let pad = (n - rel % n) % n;
        for _ in 0..pad {
            self.buf.put_u8(0);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.reserve_chunk_space(1, 1);
        self.buf.put_u8(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    write_primitive!(write_u16, u16);
    write_primitive!(write_i16, i16);
    write_primitive!(write_u32, u32);
    write_primitive!(write_i32, i32);
    write_primitive!(write_u64, u64);
    write_primitive!(write_i64, i64);
    write_primitive!(write_f32, f32);
    write_primitive!(write_f64, f64);

    /// Raw bytes, no alignment.
    pub fn write_octets(&mut self, bytes: &[u8]) {
        if self.chunk.is_some() {
            // Octet runs may split across chunk boundaries.
            let mut rest = bytes;
            while !rest.is_empty() {
                let room = self.chunk_room(rest.len());
                self.buf.extend_from_slice(&rest[..room]);
                rest = &rest[room..];
            }
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// A sequence length (or any CDR size field).
    pub fn write_size(&mut self, size: usize) {
        self.write_u32(size as u32);
    }

    /// An octet sequence: length prefix plus raw bytes.
    pub fn write_octet_seq(&mut self, bytes: &[u8]) {
        self.write_size(bytes.len());
        self.write_octets(bytes);
    }

    /// Adopts an allocated buffer as an octet sequence. Ownership moves in;
    /// the bytes are spliced after the length prefix without reencoding.
    pub fn write_octet_seq_adopt(&mut self, bytes: Bytes) {
        self.write_size(bytes.len());
        self.write_octets(&bytes);
    }

    /// A narrow string: length prefix (including NUL) + bytes + NUL.
    pub fn write_string(&mut self, value: &str) {
        self.write_size(value.len() + 1);
        self.write_octets(value.as_bytes());
        self.write_octets(&[0]);
    }

    /// Opens a nested encapsulation: length placeholder, then the byte-order
    /// octet. Alignment restarts at the octet. Close with
    /// [`end_encapsulation`](Self::end_encapsulation).
    pub fn begin_encapsulation(&mut self) {
        self.align(4);
        self.length_fields.push(self.buf.len());
        self.write_u32(0);
        self.bases.push(self.buf.len());
        self.write_u8(u8::from(self.little_endian));
    }

    /// Closes the innermost encapsulation, backpatching its length.
    pub fn end_encapsulation(&mut self) {
        let base = self.bases.pop().unwrap_or(0);
        let len = (self.buf.len() - base) as u32;
        if let Some(pos) = self.length_fields.pop() {
            let encoded = if self.little_endian {
                len.to_le_bytes()
            } else {
                len.to_be_bytes()
            };
            self.buf[pos..pos + 4].copy_from_slice(&encoded);
        }
    }

    /// Backpatches a previously written u32 (chunk sizes, lengths).
    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        let encoded = if self.little_endian {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        self.buf[pos..pos + 4].copy_from_slice(&encoded);
    }

    pub fn patch_i32(&mut self, pos: usize, value: i32) {
        self.patch_u32(pos, value as u32);
    }

    /// Enters chunked mode for a valuetype body. Chunks are size-prefixed
    /// runs of at most `limit` bytes; a primitive never straddles a chunk
    /// boundary. Close with [`end_chunk_mode`](Self::end_chunk_mode).
    pub fn begin_chunk_mode(&mut self, limit: usize) {
        debug_assert!(self.chunk.is_none());
        self.chunk = Some(ChunkState {
            limit: limit.max(16),
            size_pos: usize::MAX,
            data_start: 0,
        });
    }

    /// Closes the open chunk (if any), writes the end tag, and leaves
    /// chunked mode.
    pub fn end_chunk_mode(&mut self) {
        self.close_chunk();
        self.chunk = None;
        self.write_i32(-1);
    }

    pub fn in_chunk_mode(&self) -> bool {
        self.chunk.is_some()
    }

    fn open_chunk(&mut self) {
        // The size field is an ordinary aligned long outside the chunk body.
        let rel = self.buf.len() - self.base();
        let pad = (4 - rel % 4) % 4;
        for _ in 0..pad {
            self.buf.put_u8(0);
        }
        let size_pos = self.buf.len();
        let zero = [0u8; 4];
        self.buf.extend_from_slice(&zero);
        if let Some(chunk) = &mut self.chunk {
            chunk.size_pos = size_pos;
            chunk.data_start = size_pos + 4;
        }
    }

    fn close_chunk(&mut self) {
        let (size_pos, data_start) = match &self.chunk {
            Some(c) if c.size_pos != usize::MAX => (c.size_pos, c.data_start),
            _ => return,
        };
        let size = (self.buf.len() - data_start) as u32;
        self.patch_u32(size_pos, size);
        if let Some(chunk) = &mut self.chunk {
            chunk.size_pos = usize::MAX;
        }
    }

    /// Makes room for an aligned write of `len` bytes without straddling a
    /// chunk boundary.
    fn reserve_chunk_space(&mut self, len: usize, align: usize) {
        let must_open = match &self.chunk {
            Some(c) => c.size_pos == usize::MAX,
            None => return,
        };
        if must_open {
            self.open_chunk();
        }
        let (limit, data_start) = match &self.chunk {
            Some(c) => (c.limit, c.data_start),
            None => return,
        };
        let rel = self.buf.len() - self.base();
        let pad = (align - rel % align) % align;
        let fill = self.buf.len() - data_start;
        if fill + pad + len > limit && fill > 0 {
            self.close_chunk();
            self.open_chunk();
        }
    }

    /// Room left in the current chunk, opening or rotating chunks so at
    /// least one byte fits. Returns how many of `wanted` bytes fit now.
    fn chunk_room(&mut self, wanted: usize) -> usize {
        let limit = match &self.chunk {
            Some(c) => c.limit,
            None => return wanted,
        };
        let needs_open = match &self.chunk {
            Some(c) => c.size_pos == usize::MAX,
            None => false,
        };
        if needs_open {
            self.open_chunk();
        }
        let data_start = self.chunk.as_ref().map(|c| c.data_start).unwrap_or(0);
        let fill = self.buf.len() - data_start;
        if fill >= limit {
            self.close_chunk();
            self.open_chunk();
            return self.chunk_room(wanted);
        }
        wanted.min(limit - fill)
    }

    /// Finishes the stream and yields the bytes.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    /// The bytes written so far.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for StreamOut {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
struct ChunkReadState {
    remaining: usize,
    ended: bool,
}

/// A CDR input stream over a received buffer.
pub struct StreamIn {
    data: Bytes,
    pos: usize,
    little_endian: bool,
    bases: Vec<usize>,
    chunk: Option<ChunkReadState>,
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> CoreResult<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            self.align(N)?;
            let bytes = self.take(N)?;
            let mut arr = [0u8; N];
            arr.copy_from_slice(bytes);
            Ok(if self.little_endian {
                <$ty>::from_le_bytes(arr)
            } else {
                <$ty>::from_be_bytes(arr)
            })
        }
    };
}

impl StreamIn {
    /// A reader over `data` declared to be in the given byte order.
    pub fn new(data: Bytes, little_endian: bool) -> Self {
        Self {
            data,
            pos: 0,
            little_endian,
            bases: vec![0],
            chunk: None,
        }
    }

    /// A reader over an encapsulation: the first octet declares the order.
    pub fn new_encapsulation(data: Bytes) -> CoreResult<Self> {
        let mut stream = Self::new(data, false);
        let order = stream.read_u8()?;
        stream.little_endian = order != 0;
        Ok(stream)
    }

    pub fn little_endian(&self) -> bool {
        self.little_endian
    }

    /// Absolute position from the start of the buffer.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Unread bytes remaining.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Remaining byte count; used to verify a fully consumed message.
    pub fn end(&self) -> usize {
        self.remaining()
    }

    fn base(&self) -> usize {
        *self.bases.last().unwrap_or(&0)
    }

    /// Skips padding so the next read sits on an `n`-byte boundary.
    pub fn align(&mut self, n: usize) -> CoreResult<()> {
        if self.chunk.is_some() {
            self.chunk_refill_if_empty()?;
        }
        let rel = self.pos - self.base();
        let pad = (n - rel % n) % n;
        if self.remaining() < pad {
            return Err(SystemException::marshal(MINOR_FEWER_BYTES));
        }
        self.pos += pad;
        if let Some(chunk) = &mut self.chunk {
            if pad > chunk.remaining {
                return Err(SystemException::marshal(MINOR_FEWER_BYTES));
            }
            chunk.remaining -= pad;
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> CoreResult<&[u8]> {
        if self.chunk.is_some() && n > 0 {
            self.chunk_refill_if_empty()?;
            let chunk = self.chunk.as_mut().expect("chunk state");
            if chunk.remaining < n {
                // The writer never splits a primitive across chunks.
                return Err(SystemException::marshal(MINOR_FEWER_BYTES));
            }
            chunk.remaining -= n;
        }
        if self.remaining() < n {
            return Err(SystemException::marshal(MINOR_FEWER_BYTES));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn chunk_refill_if_empty(&mut self) -> CoreResult<()> {
        loop {
            let state = match self.chunk {
                Some(s) => s,
                None => return Ok(()),
            };
            if state.ended {
                return Err(SystemException::marshal(MINOR_FEWER_BYTES));
            }
            if state.remaining > 0 {
                return Ok(());
            }
            // Chunk headers are ordinary aligned longs outside chunk data.
            self.chunk = None;
            let header = (|| -> CoreResult<i32> { self.read_i32() })();
            let header = match header {
                Ok(h) => h,
                Err(e) => {
                    self.chunk = Some(state);
                    return Err(e);
                }
            };
            if header > 0 {
                self.chunk = Some(ChunkReadState {
                    remaining: header as usize,
                    ended: false,
                });
                return Ok(());
            }
            if header < 0 {
                self.chunk = Some(ChunkReadState {
                    remaining: 0,
                    ended: true,
                });
                return Err(SystemException::marshal(MINOR_FEWER_BYTES));
            }
            // A zero-length chunk is tolerated; keep scanning.
            self.chunk = Some(ChunkReadState {
                remaining: 0,
                ended: false,
            });
        }
    }

    pub fn read_u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> CoreResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> CoreResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    read_primitive!(read_u16, u16);
    read_primitive!(read_i16, i16);
    read_primitive!(read_u32, u32);
    read_primitive!(read_i32, i32);
    read_primitive!(read_u64, u64);
    read_primitive!(read_i64, i64);
    read_primitive!(read_f32, f32);
    read_primitive!(read_f64, f64);

    /// Raw bytes, no alignment. Octet runs may span chunk boundaries.
    pub fn read_octets(&mut self, n: usize) -> CoreResult<Bytes> {
        if self.chunk.is_none() {
            if self.remaining() < n {
                return Err(SystemException::marshal(MINOR_FEWER_BYTES));
            }
            let bytes = self.data.slice(self.pos..self.pos + n);
            self.pos += n;
            return Ok(bytes);
        }
        let mut collected = Vec::with_capacity(n);
        let mut left = n;
        while left > 0 {
            self.chunk_refill_if_empty()?;
            let available = self.chunk.as_ref().map(|c| c.remaining).unwrap_or(left);
            let step = left.min(available);
            if self.remaining() < step {
                return Err(SystemException::marshal(MINOR_FEWER_BYTES));
            }
            collected.extend_from_slice(&self.data[self.pos..self.pos + step]);
            self.pos += step;
            if let Some(chunk) = &mut self.chunk {
                chunk.remaining -= step;
            }
            left -= step;
        }
        Ok(Bytes::from(collected))
    }

    /// Enters chunked mode for a valuetype body.
    pub fn begin_chunk_mode(&mut self) {
        debug_assert!(self.chunk.is_none());
        self.chunk = Some(ChunkReadState {
            remaining: 0,
            ended: false,
        });
    }

    /// Skips any unread chunk tail through the end tag and leaves chunked
    /// mode.
    pub fn end_chunk_mode(&mut self) -> CoreResult<()> {
        loop {
            let state = match self.chunk {
                Some(s) => s,
                None => return Ok(()),
            };
            if state.ended {
                self.chunk = None;
                return Ok(());
            }
            if state.remaining > 0 {
                if self.remaining() < state.remaining {
                    self.chunk = None;
                    return Err(SystemException::marshal(MINOR_FEWER_BYTES));
                }
                self.pos += state.remaining;
                self.chunk = Some(ChunkReadState {
                    remaining: 0,
                    ended: false,
                });
                continue;
            }
            // Consume the next header; the refill helper marks the end tag.
            match self.chunk_refill_if_empty() {
                Ok(()) => continue,
                Err(_) if self.chunk.map(|c| c.ended).unwrap_or(false) => {
                    self.chunk = None;
                    return Ok(());
                }
                Err(e) => {
                    self.chunk = None;
                    return Err(e);
                }
            }
        }
    }

    /// A sequence length field.
    pub fn read_size(&mut self) -> CoreResult<usize> {
        let size = self.read_u32()? as usize;
        if size > self.remaining() + 8 {
            // A length that cannot possibly fit is a truncated message.
            return Err(SystemException::marshal(MINOR_FEWER_BYTES));
        }
        Ok(size)
    }

    /// An octet sequence: length prefix plus raw bytes.
    pub fn read_octet_seq(&mut self) -> CoreResult<Bytes> {
        let len = self.read_size()?;
        self.read_octets(len)
    }

    /// A narrow string: length-prefixed, NUL-terminated UTF-8.
    pub fn read_string(&mut self) -> CoreResult<String> {
        let len = self.read_size()?;
        if len == 0 {
            return Err(SystemException::marshal(MINOR_BAD_STRING));
        }
        let bytes = self.read_octets(len)?;
        if bytes[len - 1] != 0 {
            return Err(SystemException::marshal(MINOR_BAD_STRING));
        }
        std::str::from_utf8(&bytes[..len - 1])
            .map(str::to_owned)
            .map_err(|_| SystemException::marshal(MINOR_BAD_STRING))
    }

    /// Enters a nested encapsulation in place: reads the length field and
    /// the byte-order octet, restarting alignment. Returns the previous
    /// byte order and the encapsulation's end position for
    /// [`leave_encapsulation`](Self::leave_encapsulation).
    pub fn enter_encapsulation(&mut self) -> CoreResult<(bool, usize)> {
        let len = self.read_size()?;
        if self.remaining() < len {
            return Err(SystemException::marshal(MINOR_FEWER_BYTES));
        }
        let end = self.pos + len;
        self.bases.push(self.pos);
        let prev_order = self.little_endian;
        let order = self.read_u8()?;
        self.little_endian = order != 0;
        Ok((prev_order, end))
    }

    /// Leaves an encapsulation entered in place, skipping any unread tail.
    pub fn leave_encapsulation(&mut self, state: (bool, usize)) -> CoreResult<()> {
        let (prev_order, end) = state;
        if self.pos > end {
            return Err(SystemException::marshal(MINOR_FEWER_BYTES));
        }
        self.pos = end;
        self.bases.pop();
        self.little_endian = prev_order;
        Ok(())
    }

    /// A cursor rewound to an absolute position, for indirections. The
    /// alignment base is pinned to the target so re-reads see the same
    /// layout the writer produced.
    pub fn at(&self, pos: usize) -> CoreResult<StreamIn> {
        if pos > self.data.len() {
            return Err(SystemException::marshal(MINOR_BAD_INDIRECTION));
        }
        Ok(StreamIn {
            data: self.data.clone(),
            pos,
            little_endian: self.little_endian,
            bases: vec![pos],
            chunk: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_aligned_from_body_start() {
        let mut out = StreamOut::with_order(true);
        out.write_u8(1);
        out.write_u32(0xdead_beef);
        // One byte + three pad bytes + four value bytes.
        assert_eq!(out.pos(), 8);
        let data = out.finish();
        assert_eq!(&data[..4], &[1, 0, 0, 0]);

        let mut input = StreamIn::new(data, true);
        assert_eq!(input.read_u8().unwrap(), 1);
        assert_eq!(input.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(input.end(), 0);
    }

    #[test]
    fn both_orders_round_trip() {
        for little in [true, false] {
            let mut out = StreamOut::with_order(little);
            out.write_i64(-7);
            out.write_f64(1.5);
            out.write_u16(300);
            let mut input = StreamIn::new(out.finish(), little);
            assert_eq!(input.read_i64().unwrap(), -7);
            assert_eq!(input.read_f64().unwrap(), 1.5);
            assert_eq!(input.read_u16().unwrap(), 300);
        }
    }

    #[test]
    fn string_round_trip_and_nul() {
        let mut out = StreamOut::with_order(true);
        out.write_string("adapter");
        let data = out.finish();
        // length 8 = 7 chars + NUL
        assert_eq!(&data[..4], &8u32.to_le_bytes());
        assert_eq!(data[data.len() - 1], 0);
        let mut input = StreamIn::new(data, true);
        assert_eq!(input.read_string().unwrap(), "adapter");
    }

    #[test]
    fn truncated_read_reports_fewer_bytes() {
        let mut out = StreamOut::with_order(true);
        out.write_u32(5);
        let mut input = StreamIn::new(out.finish().slice(0..2), true);
        let err = input.read_u32().expect_err("truncated");
        assert_eq!(err.kind, orb_core::error::ExceptionKind::Marshal);
        assert_eq!(err.minor, MINOR_FEWER_BYTES);
    }

    #[test]
    fn encapsulation_restarts_alignment() {
        let mut out = StreamOut::with_order(true);
        out.write_u8(0xAA);
        out.begin_encapsulation();
        // Inside the encapsulation, u32 alignment is relative to the
        // byte-order octet, not the outer stream.
        out.write_u32(42);
        out.end_encapsulation();
        out.write_u16(7);
        let data = out.finish();

        let mut input = StreamIn::new(data, true);
        assert_eq!(input.read_u8().unwrap(), 0xAA);
        let state = input.enter_encapsulation().unwrap();
        assert_eq!(input.read_u32().unwrap(), 42);
        input.leave_encapsulation(state).unwrap();
        assert_eq!(input.read_u16().unwrap(), 7);
        assert_eq!(input.end(), 0);
    }

    #[test]
    fn octet_seq_adoption_keeps_bytes() {
        let payload = Bytes::from_static(b"zero-copy payload");
        let mut out = StreamOut::with_order(true);
        out.write_octet_seq_adopt(payload.clone());
        let mut input = StreamIn::new(out.finish(), true);
        assert_eq!(input.read_octet_seq().unwrap(), payload);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut out = StreamOut::with_order(true);
        out.write_u32(0xffff_ff00);
        let mut input = StreamIn::new(out.finish(), true);
        assert!(input.read_size().is_err());
    }

    #[test]
    fn chunked_body_round_trip_with_small_limit() {
        let mut out = StreamOut::with_order(true);
        out.begin_chunk_mode(16);
        out.write_u32(7);
        out.write_octets(b"a run of octets longer than one chunk");
        out.write_u64(0x0102_0304_0506_0708);
        out.end_chunk_mode();
        out.write_u32(0xCAFE);
        let data = out.finish();

        let mut input = StreamIn::new(data, true);
        input.begin_chunk_mode();
        assert_eq!(input.read_u32().unwrap(), 7);
        let run = b"a run of octets longer than one chunk";
        assert_eq!(&input.read_octets(run.len()).unwrap()[..], run);
        assert_eq!(input.read_u64().unwrap(), 0x0102_0304_0506_0708);
        input.end_chunk_mode().unwrap();
        assert_eq!(input.read_u32().unwrap(), 0xCAFE);
        assert_eq!(input.end(), 0);
    }

    #[test]
    fn unread_chunk_tail_is_skipped() {
        let mut out = StreamOut::with_order(true);
        out.begin_chunk_mode(8);
        out.write_octets(&[1; 20]);
        out.end_chunk_mode();
        out.write_u16(77);
        let mut input = StreamIn::new(out.finish(), true);
        input.begin_chunk_mode();
        // Read only a prefix; the rest must be skipped cleanly.
        assert_eq!(&input.read_octets(3).unwrap()[..], &[1, 1, 1]);
        input.end_chunk_mode().unwrap();
        assert_eq!(input.read_u16().unwrap(), 77);
    }
}
