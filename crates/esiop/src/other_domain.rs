//! Peer helpers.
//!
//! An `OtherDomain` knows how to place data into one peer's address space:
//! reserve, copy, release, and translate pointers and sizes under the
//! platform widths negotiated at handshake. Same-width local peers write
//! directly; the width-checked variant refuses values the narrower peer
//! cannot represent. IIOP peers translate pointer operations into opaque
//! ids at the runtime layer, outside the transport.

use crate::messages::SharedMemPtr;
use crate::shared_mem::DomainArena;
use bytes::Bytes;
use orb_core::error::{CoreResult, SystemException};
use std::sync::Arc;

/// Pointer/size widths negotiated with a peer at handshake.
///
/// Same-width peers are the exercised configuration; heterogeneous widths
/// are width-checked and refused when a value cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformSizes {
    /// Pointer width in bytes.
    pub pointer_size: u8,
    /// Size-type width in bytes.
    pub size_size: u8,
}

impl Default for PlatformSizes {
    fn default() -> Self {
        Self {
            pointer_size: 8,
            size_size: 8,
        }
    }
}

/// Operations on one peer's address space.
pub trait OtherDomain: Send + Sync {
    /// The peer's platform widths.
    fn sizes(&self) -> PlatformSizes;

    /// Reserves `size` bytes in the peer's space.
    fn reserve(&self, size: usize) -> CoreResult<SharedMemPtr>;

    /// Writes `data` at `offset` inside a reserved block.
    fn write(&self, ptr: SharedMemPtr, offset: usize, data: &[u8]) -> CoreResult<()>;

    /// Copies a whole buffer into a fresh peer block.
    fn copy(&self, data: &[u8]) -> CoreResult<SharedMemPtr> {
        let ptr = self.reserve(data.len())?;
        if let Err(e) = self.write(ptr, 0, data) {
            self.release(ptr);
            return Err(e);
        }
        Ok(ptr)
    }

    /// Releases a peer block.
    fn release(&self, ptr: SharedMemPtr);

    /// Encodes a pointer in the peer's width.
    fn store_pointer(&self, ptr: SharedMemPtr) -> CoreResult<Vec<u8>>;

    /// Encodes a size in the peer's width.
    fn store_size(&self, size: u64) -> CoreResult<Vec<u8>>;

    /// Reads back a whole peer block (receive side).
    fn read(&self, ptr: SharedMemPtr) -> CoreResult<Bytes>;
}

/// Helper for a same-host peer sharing this platform's widths.
pub struct OtherDomainLocal {
    arena: Arc<DomainArena>,
    sizes: PlatformSizes,
}

impl OtherDomainLocal {
    pub fn new(arena: Arc<DomainArena>) -> Self {
        Self {
            arena,
            sizes: PlatformSizes::default(),
        }
    }

    /// A helper speaking a narrower peer's widths.
    pub fn with_sizes(arena: Arc<DomainArena>, sizes: PlatformSizes) -> Self {
        Self { arena, sizes }
    }
}

impl OtherDomain for OtherDomainLocal {
    fn sizes(&self) -> PlatformSizes {
        self.sizes
    }

    fn reserve(&self, size: usize) -> CoreResult<SharedMemPtr> {
        self.arena.allocate(size)
    }

    fn write(&self, ptr: SharedMemPtr, offset: usize, data: &[u8]) -> CoreResult<()> {
        self.arena.write(ptr, offset, data)
    }

    fn release(&self, ptr: SharedMemPtr) {
        self.arena.release(ptr);
    }

    fn store_pointer(&self, ptr: SharedMemPtr) -> CoreResult<Vec<u8>> {
        store_width(ptr, self.sizes.pointer_size)
    }

    fn store_size(&self, size: u64) -> CoreResult<Vec<u8>> {
        store_width(size, self.sizes.size_size)
    }

    fn read(&self, ptr: SharedMemPtr) -> CoreResult<Bytes> {
        self.arena.read(ptr)
    }
}

/// Encodes `value` into `width` bytes, refusing unrepresentable values.
fn store_width(value: u64, width: u8) -> CoreResult<Vec<u8>> {
    let width = width as usize;
    let bytes = value.to_ne_bytes();
    if width < 8 && value >= 1u64 << (width * 8) {
        return Err(SystemException::marshal(0));
    }
    if width > 8 {
        let mut wide = bytes.to_vec();
        wide.resize(width, 0);
        return Ok(wide);
    }
    #[cfg(target_endian = "little")]
    {
        Ok(bytes[..width].to_vec())
    }
    #[cfg(target_endian = "big")]
    {
        Ok(bytes[8 - width..].to_vec())
    }
}

/// Decodes a value stored by [`store_width`].
pub fn load_width(data: &[u8]) -> CoreResult<u64> {
    if data.len() > 8 {
        return Err(SystemException::marshal(0));
    }
    let mut bytes = [0u8; 8];
    #[cfg(target_endian = "little")]
    bytes[..data.len()].copy_from_slice(data);
    #[cfg(target_endian = "big")]
    bytes[8 - data.len()..].copy_from_slice(data);
    Ok(u64::from_ne_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_mem::HostMemory;

    #[test]
    fn copy_and_read_round_trip() {
        let host = HostMemory::new();
        let helper = OtherDomainLocal::new(host.arena(4));
        let ptr = helper.copy(b"payload in the peer").unwrap();
        assert_eq!(&helper.read(ptr).unwrap()[..], b"payload in the peer");
        helper.release(ptr);
        assert!(helper.read(ptr).is_err());
    }

    #[test]
    fn pointer_width_round_trip() {
        let host = HostMemory::new();
        let helper = OtherDomainLocal::new(host.arena(5));
        let encoded = helper.store_pointer(0xDEAD_BEEF).unwrap();
        assert_eq!(encoded.len(), 8);
        assert_eq!(load_width(&encoded).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn narrow_peer_refuses_wide_pointers() {
        let host = HostMemory::new();
        let helper = OtherDomainLocal::with_sizes(
            host.arena(6),
            PlatformSizes {
                pointer_size: 4,
                size_size: 4,
            },
        );
        assert!(helper.store_pointer(0xFFFF_FFFF).is_ok());
        assert!(helper.store_pointer(0x1_0000_0000).is_err());
        let encoded = helper.store_size(77).unwrap();
        assert_eq!(encoded.len(), 4);
        assert_eq!(load_width(&encoded).unwrap(), 77);
    }

    #[test]
    fn failed_copy_releases_the_block() {
        let host = HostMemory::new();
        let arena = host.arena(7);
        let helper = OtherDomainLocal::new(arena.clone());
        arena.set_allocation_quota(0);
        assert!(helper.copy(b"never lands").is_err());
        assert_eq!(arena.live_blocks(), 0);
    }
}
