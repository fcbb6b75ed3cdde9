//! Shared-memory streams.
//!
//! An outgoing stream accumulates message bytes locally, publishes filled
//! blocks into the peer's arena, and links them into a singly-linked chain
//! whose head is the stream header returned to the control message. Large,
//! properly-aligned buffers transfer as their own exact-size blocks
//! ("virtual copy") instead of being coalesced. Local copies of
//! fully-transferred blocks are purged promptly to bound the working set;
//! a partial allocation failure releases every peer block already placed.
//!
//! The reply stream buffers into the immediate budget first and switches
//! to the general path on overflow.

use crate::messages::{ImmediateData, SharedMemPtr};
use crate::other_domain::{load_width, OtherDomain, PlatformSizes};
use crate::shared_mem::{DomainArena, ALLOCATION_UNIT};
use bytes::{Bytes, BytesMut};
use orb_core::error::{CoreResult, SystemException};
use std::sync::Arc;
use tracing::debug;

/// Buffers at least this large transfer as their own block.
pub const VIRTUAL_COPY_THRESHOLD: usize = ALLOCATION_UNIT / 2;

fn header_size(sizes: PlatformSizes) -> usize {
    sizes.pointer_size as usize + sizes.size_size as usize
}

/// Outgoing block stream into one peer.
pub struct StreamOutSm {
    peer: Arc<dyn OtherDomain>,
    // (block ptr, data length), in chain order.
    blocks: Vec<(SharedMemPtr, usize)>,
    current: Vec<u8>,
    capacity: usize,
}

impl StreamOutSm {
    pub fn new(peer: Arc<dyn OtherDomain>) -> Self {
        let capacity = ALLOCATION_UNIT - header_size(peer.sizes());
        Self {
            peer,
            blocks: Vec::new(),
            current: Vec::new(),
            capacity,
        }
    }

    /// Appends message bytes.
    pub fn write(&mut self, data: &[u8]) -> CoreResult<()> {
        if data.len() >= VIRTUAL_COPY_THRESHOLD {
            // Transfer by pointer: an exact-size block of its own.
            self.flush_current()?;
            self.push_block(data)?;
            return Ok(());
        }
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.capacity - self.current.len();
            let step = rest.len().min(room);
            self.current.extend_from_slice(&rest[..step]);
            rest = &rest[step..];
            if self.current.len() == self.capacity {
                self.flush_current()?;
            }
        }
        Ok(())
    }

    /// Bytes pending plus blocks already published.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.current.is_empty()
    }

    fn flush_current(&mut self) -> CoreResult<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.current);
        // The local copy dies here; the peer block is the only copy left.
        self.push_block(&data)
    }

    fn push_block(&mut self, data: &[u8]) -> CoreResult<()> {
        let sizes = self.peer.sizes();
        let header = header_size(sizes);
        let result = (|| -> CoreResult<SharedMemPtr> {
            let ptr = self.peer.reserve(header + data.len())?;
            // next = 0 until a successor is linked.
            let next = self.peer.store_pointer(0)?;
            let len = self.peer.store_size(data.len() as u64)?;
            if let Err(e) = self
                .peer
                .write(ptr, 0, &next)
                .and_then(|_| self.peer.write(ptr, sizes.pointer_size as usize, &len))
                .and_then(|_| self.peer.write(ptr, header, data))
            {
                self.peer.release(ptr);
                return Err(e);
            }
            Ok(ptr)
        })();
        match result {
            Ok(ptr) => {
                // Link the predecessor to this block.
                if let Some(&(prev, _)) = self.blocks.last() {
                    let encoded = self.peer.store_pointer(ptr)?;
                    if let Err(e) = self.peer.write(prev, 0, &encoded) {
                        self.peer.release(ptr);
                        self.unwind();
                        return Err(e);
                    }
                }
                self.blocks.push((ptr, data.len()));
                Ok(())
            }
            Err(e) => {
                self.unwind();
                debug!(error = %e, "shared-memory stream failed; peer blocks released");
                Err(SystemException::marshal(0))
            }
        }
    }

    fn unwind(&mut self) {
        for (ptr, _) in self.blocks.drain(..) {
            self.peer.release(ptr);
        }
        self.current.clear();
    }

    /// Completes the stream; returns the chain head.
    pub fn finish(mut self) -> CoreResult<SharedMemPtr> {
        self.flush_current()?;
        match self.blocks.first() {
            Some(&(head, _)) => {
                self.blocks.clear();
                Ok(head)
            }
            None => {
                // An empty message still needs a header block.
                self.push_block(&[])?;
                let head = self.blocks[0].0;
                self.blocks.clear();
                Ok(head)
            }
        }
    }

    /// Abandons the stream, releasing every published block.
    pub fn abandon(mut self) {
        self.unwind();
    }
}

/// Reads a chain out of this domain's own arena, releasing blocks as they
/// are consumed.
pub struct StreamInSm;

impl StreamInSm {
    /// Collects the whole chained message and frees its blocks.
    pub fn read_all(
        arena: &Arc<DomainArena>,
        head: SharedMemPtr,
        sizes: PlatformSizes,
    ) -> CoreResult<Bytes> {
        let pointer = sizes.pointer_size as usize;
        let header = header_size(sizes);
        let mut out = BytesMut::new();
        let mut next = head;
        let mut hops = 0usize;
        while next != 0 {
            if hops > 1 << 20 {
                return Err(SystemException::marshal(0));
            }
            hops += 1;
            let block = arena.read(next)?;
            if block.len() < header {
                return Err(SystemException::marshal(0));
            }
            let successor = load_width(&block[..pointer])?;
            let len = load_width(&block[pointer..header])? as usize;
            if header + len > block.len() {
                return Err(SystemException::marshal(0));
            }
            out.extend_from_slice(&block[header..header + len]);
            arena.release(next);
            next = successor;
        }
        Ok(out.freeze())
    }
}

/// Where a finished reply body went.
pub enum ReplyBody {
    /// Inline in the control message; no shared memory was allocated.
    Immediate(ImmediateData),
    /// A chained message in the recipient's arena.
    Shared(SharedMemPtr),
}

/// Reply stream with the immediate fast path.
pub struct StreamOutSmReply {
    peer: Arc<dyn OtherDomain>,
    immediate: Vec<u8>,
    overflow: Option<StreamOutSm>,
}

impl StreamOutSmReply {
    pub fn new(peer: Arc<dyn OtherDomain>) -> Self {
        Self {
            peer,
            immediate: Vec::with_capacity(ImmediateData::MAX_DATA_SIZE),
            overflow: None,
        }
    }

    /// Appends reply bytes, switching to the general path on overflow.
    pub fn write(&mut self, data: &[u8]) -> CoreResult<()> {
        if let Some(stream) = &mut self.overflow {
            return stream.write(data);
        }
        if self.immediate.len() + data.len() <= ImmediateData::MAX_DATA_SIZE {
            self.immediate.extend_from_slice(data);
            return Ok(());
        }
        let mut stream = StreamOutSm::new(self.peer.clone());
        stream.write(&self.immediate)?;
        stream.write(data)?;
        self.immediate.clear();
        self.overflow = Some(stream);
        Ok(())
    }

    /// Whether the body still fits the immediate budget.
    pub fn is_immediate(&self) -> bool {
        self.overflow.is_none()
    }

    /// Completes the reply body.
    pub fn finish(self) -> CoreResult<ReplyBody> {
        match self.overflow {
            Some(stream) => Ok(ReplyBody::Shared(stream.finish()?)),
            None => ImmediateData::new(&self.immediate)
                .map(ReplyBody::Immediate)
                .ok_or_else(|| SystemException::internal(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::other_domain::OtherDomainLocal;
    use crate::shared_mem::HostMemory;

    fn peer_pair() -> (Arc<HostMemory>, Arc<dyn OtherDomain>) {
        let host = HostMemory::new();
        let helper: Arc<dyn OtherDomain> = Arc::new(OtherDomainLocal::new(host.arena(7)));
        (host, helper)
    }

    #[test]
    fn small_message_round_trip() {
        let (host, peer) = peer_pair();
        let mut stream = StreamOutSm::new(peer);
        stream.write(b"hello ").unwrap();
        stream.write(b"peer").unwrap();
        let head = stream.finish().unwrap();
        let bytes =
            StreamInSm::read_all(&host.arena(7), head, PlatformSizes::default()).unwrap();
        assert_eq!(&bytes[..], b"hello peer");
        // Consumed blocks are freed.
        assert_eq!(host.arena(7).live_blocks(), 0);
    }

    #[test]
    fn long_message_spans_blocks() {
        let (host, peer) = peer_pair();
        let mut stream = StreamOutSm::new(peer);
        let chunk = vec![0x5A; 1000];
        for _ in 0..10 {
            stream.write(&chunk).unwrap();
        }
        let head = stream.finish().unwrap();
        assert!(host.arena(7).live_blocks() >= 3);
        let bytes =
            StreamInSm::read_all(&host.arena(7), head, PlatformSizes::default()).unwrap();
        assert_eq!(bytes.len(), 10_000);
        assert!(bytes.iter().all(|&b| b == 0x5A));
        assert_eq!(host.arena(7).live_blocks(), 0);
    }

    #[test]
    fn large_buffer_becomes_its_own_block() {
        let (host, peer) = peer_pair();
        let mut stream = StreamOutSm::new(peer);
        stream.write(b"prefix").unwrap();
        let big = vec![0xC3; VIRTUAL_COPY_THRESHOLD + 16];
        stream.write(&big).unwrap();
        let head = stream.finish().unwrap();
        // prefix block + virtual-copy block.
        assert_eq!(host.arena(7).live_blocks(), 2);
        let bytes =
            StreamInSm::read_all(&host.arena(7), head, PlatformSizes::default()).unwrap();
        assert_eq!(bytes.len(), 6 + big.len());
        assert_eq!(&bytes[..6], b"prefix");
    }

    #[test]
    fn allocation_failure_releases_published_blocks() {
        let host = HostMemory::new();
        let arena = host.arena(8);
        let helper: Arc<dyn OtherDomain> = Arc::new(OtherDomainLocal::new(arena.clone()));
        arena.set_allocation_quota(2);
        let mut stream = StreamOutSm::new(helper);
        let chunk = vec![1u8; ALLOCATION_UNIT];
        stream.write(&chunk).unwrap();
        let err = loop {
            match stream.write(&chunk) {
                Ok(()) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind, orb_core::error::ExceptionKind::Marshal);
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn reply_exactly_at_budget_stays_immediate() {
        let (_host, peer) = peer_pair();
        let mut reply = StreamOutSmReply::new(peer);
        reply
            .write(&vec![7u8; ImmediateData::MAX_DATA_SIZE])
            .unwrap();
        assert!(reply.is_immediate());
        match reply.finish().unwrap() {
            ReplyBody::Immediate(data) => {
                assert_eq!(data.len(), ImmediateData::MAX_DATA_SIZE)
            }
            ReplyBody::Shared(_) => panic!("must stay immediate"),
        }
    }

    #[test]
    fn reply_one_byte_over_budget_switches_paths() {
        let (host, peer) = peer_pair();
        let mut reply = StreamOutSmReply::new(peer);
        reply
            .write(&vec![7u8; ImmediateData::MAX_DATA_SIZE + 1])
            .unwrap();
        assert!(!reply.is_immediate());
        match reply.finish().unwrap() {
            ReplyBody::Shared(head) => {
                let bytes =
                    StreamInSm::read_all(&host.arena(7), head, PlatformSizes::default())
                        .unwrap();
                assert_eq!(bytes.len(), ImmediateData::MAX_DATA_SIZE + 1);
            }
            ReplyBody::Immediate(_) => panic!("must overflow"),
        }
    }
}
