//! Memory contexts.
//!
//! A memory context identifies the user heap and TLS arena an activity works
//! against. Heap swapping itself is a platform-port concern; the core tracks
//! the identity and accounting so that requests keep their heap across sync
//! context changes and sync frames swap contexts in lockstep.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static FREE_CONTEXT: Lazy<Arc<MemContext>> = Lazy::new(|| MemContext::new("free"));

/// Identity of a user heap.
#[derive(Debug)]
pub struct MemContext {
    id: u64,
    label: String,
    allocated: AtomicUsize,
}

impl MemContext {
    /// Creates a fresh memory context.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            allocated: AtomicUsize::new(0),
        })
    }

    /// The shared heap used by the free sync context.
    pub fn free_context() -> Arc<Self> {
        FREE_CONTEXT.clone()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Records an allocation against this heap.
    pub fn account_alloc(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records a release against this heap.
    pub fn account_release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Bytes currently accounted to this heap.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl PartialEq for MemContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MemContext {}
