//! Remote object references.
//!
//! A `ReferenceRemote` points across domains: its canonical IOR, the peer
//! domain it resolved to, and the domain-relative object key. Invocations
//! allocate GIOP requests bound to the peer; garbage-collected references
//! are confirmed through the peer's heartbeat batching and linger for the
//! release window after the last local handle drops.

use crate::domain::Domain;
use crate::request_giop::{CodecEnv, RequestGiop};
use orb_core::deadline::{Clock, DeadlineTime};
use orb_core::error::CoreResult;
use orb_io::ior::{Ior, REF_FLAG_GARBAGE_COLLECTION};
use orb_io::object_key::ObjectKey;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A reference to an object in another domain.
pub struct ReferenceRemote {
    ior: Ior,
    domain: Arc<Domain>,
    object_key: ObjectKey,
    primary_id: String,
    flags: u8,
    env: CodecEnv,
    ref_cnt: AtomicUsize,
    // Set when the last local handle dropped; cleared on revival.
    released_at: Mutex<Option<DeadlineTime>>,
}

impl ReferenceRemote {
    pub(crate) fn new(
        ior: Ior,
        domain: Arc<Domain>,
        object_key: ObjectKey,
        primary_id: String,
        flags: u8,
        env: CodecEnv,
    ) -> Arc<Self> {
        Arc::new(Self {
            ior,
            domain,
            object_key,
            primary_id,
            flags,
            env,
            ref_cnt: AtomicUsize::new(0),
            released_at: Mutex::new(None),
        })
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub fn object_key(&self) -> &ObjectKey {
        &self.object_key
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn garbage_collected(&self) -> bool {
        self.flags & REF_FLAG_GARBAGE_COLLECTION != 0
    }

    /// Creates an outgoing request against this object.
    pub fn create_request(
        self: &Arc<Self>,
        operation: impl Into<String>,
        response_expected: bool,
    ) -> CoreResult<RequestGiop> {
        if self.garbage_collected() {
            // The marshaled reference set of the request confirms
            // liveness through the peer's heartbeat batch.
            self.domain.observe_dgc_reference(self.object_key.clone());
        }
        RequestGiop::new(
            self.domain.clone(),
            self.object_key.clone(),
            operation,
            response_expected,
            self.env.clone(),
        )
    }

    pub fn add_ref(&self) -> usize {
        *self.released_at.lock() = None;
        self.ref_cnt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn remove_ref(&self) -> usize {
        let prev = self.ref_cnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        let now = prev - 1;
        if now == 0 {
            *self.released_at.lock() = Some(Clock::now());
        }
        now
    }

    pub fn ref_count(&self) -> usize {
        self.ref_cnt.load(Ordering::SeqCst)
    }

    /// Whether the reference is unused and its release window has passed.
    pub fn release_expired(&self, window: DeadlineTime) -> bool {
        if self.ref_cnt.load(Ordering::SeqCst) > 0 {
            return false;
        }
        match *self.released_at.lock() {
            Some(at) => Clock::now().saturating_sub(at) >= window,
            None => false,
        }
    }
}

impl orb_poa::request::ObjectInterface for ReferenceRemote {
    fn primary_interface(&self) -> String {
        self.primary_id.clone()
    }

    fn interfaces(&self) -> Vec<String> {
        vec![self.primary_id.clone()]
    }

    fn ior(&self) -> CoreResult<Ior> {
        Ok(self.ior.clone())
    }

    fn is_local(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for ReferenceRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceRemote")
            .field("key", &self.object_key.to_string())
            .field("domain", self.domain.address())
            .finish()
    }
}

/// A counted user handle over a remote reference.
pub struct RemoteHandle {
    reference: Arc<ReferenceRemote>,
}

impl RemoteHandle {
    pub fn new(reference: Arc<ReferenceRemote>) -> Self {
        reference.add_ref();
        Self { reference }
    }

    pub fn reference(&self) -> &Arc<ReferenceRemote> {
        &self.reference
    }
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        self.reference.remove_ref();
    }
}
