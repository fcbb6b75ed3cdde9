//! Shared-memory block arenas.
//!
//! Each protection domain owns an arena of numbered blocks standing in for
//! regions of mapped shared memory; a block handle plays the role of a
//! pointer in that domain's address space. Peers allocate into each
//! other's arenas through the [`crate::other_domain::OtherDomain`] helper.

use bytes::Bytes;
use dashmap::DashMap;
use orb_core::error::{CoreResult, SystemException};
use orb_io::ior::ProtDomainId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::messages::SharedMemPtr;

/// Allocation unit of the block streams.
pub const ALLOCATION_UNIT: usize = 4096;

/// One domain's mapped memory.
pub struct DomainArena {
    domain: ProtDomainId,
    next_ptr: AtomicU64,
    blocks: Mutex<HashMap<SharedMemPtr, Vec<u8>>>,
    // Optional allocation quota, for failure-path tests.
    quota: AtomicU64,
}

impl DomainArena {
    fn new(domain: ProtDomainId) -> Arc<Self> {
        Arc::new(Self {
            domain,
            next_ptr: AtomicU64::new(1),
            blocks: Mutex::new(HashMap::new()),
            quota: AtomicU64::new(u64::MAX),
        })
    }

    pub fn domain(&self) -> ProtDomainId {
        self.domain
    }

    /// Caps the number of further allocations; used to exercise the
    /// partial-failure unwind.
    pub fn set_allocation_quota(&self, remaining: u64) {
        self.quota.store(remaining, Ordering::SeqCst);
    }

    /// Reserves an uninitialized block.
    pub fn allocate(&self, size: usize) -> CoreResult<SharedMemPtr> {
        loop {
            let left = self.quota.load(Ordering::SeqCst);
            if left == 0 {
                return Err(SystemException::new(
                    orb_core::error::ExceptionKind::NoMemory,
                    0,
                    orb_core::error::CompletionStatus::No,
                ));
            }
            if self
                .quota
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        let ptr = self.next_ptr.fetch_add(1, Ordering::SeqCst);
        self.blocks.lock().insert(ptr, vec![0; size]);
        Ok(ptr)
    }

    /// Writes into a block at an offset.
    pub fn write(&self, ptr: SharedMemPtr, offset: usize, data: &[u8]) -> CoreResult<()> {
        let mut blocks = self.blocks.lock();
        let block = blocks
            .get_mut(&ptr)
            .ok_or_else(|| SystemException::marshal(0))?;
        if offset + data.len() > block.len() {
            return Err(SystemException::marshal(0));
        }
        block[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Reads a whole block.
    pub fn read(&self, ptr: SharedMemPtr) -> CoreResult<Bytes> {
        self.blocks
            .lock()
            .get(&ptr)
            .map(|b| Bytes::copy_from_slice(b))
            .ok_or_else(|| SystemException::marshal(0))
    }

    /// Releases a block.
    pub fn release(&self, ptr: SharedMemPtr) {
        self.blocks.lock().remove(&ptr);
    }

    /// Count of live blocks; the working-set bound under test.
    pub fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Total blocks ever allocated; distinguishes the no-allocation reply
    /// path from the shared-memory path.
    pub fn total_allocated(&self) -> u64 {
        self.next_ptr.load(Ordering::SeqCst) - 1
    }
}

/// Host-wide registry of domain arenas, standing in for the platform's
/// shared-memory mapping service.
#[derive(Default)]
pub struct HostMemory {
    arenas: DashMap<ProtDomainId, Arc<DomainArena>>,
}

impl HostMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The arena of `domain`, mapping it on first use.
    pub fn arena(&self, domain: ProtDomainId) -> Arc<DomainArena> {
        self.arenas
            .entry(domain)
            .or_insert_with(|| DomainArena::new(domain))
            .clone()
    }

    /// Unmaps a dead domain's arena.
    pub fn remove(&self, domain: ProtDomainId) {
        self.arenas.remove(&domain);
    }
}
