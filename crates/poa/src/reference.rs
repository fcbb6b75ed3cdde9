//! Local object references.
//!
//! A `ReferenceLocal` is a POA entry: the canonical object key, the
//! interface metadata, flags, an optional policy map, and a slot holding
//! the active servant proxy. At most one reference per canonical key exists
//! in a process; the root POA owns the map and hands out shared handles.
//!
//! While a reference is active and garbage collection is enabled, it holds
//! one count on the servant proxy through a typed guard released on drop.
//! A reference whose last external count drops while collectable schedules
//! a deferred revive-or-die pass in the root POA context.

use crate::policy::PolicySet;
use crate::proxy::ServantProxyObject;
use crate::root::PoaRoot;
use orb_core::error::{CoreResult, SystemException};
use orb_io::ior::{Ior, REF_FLAG_GARBAGE_COLLECTION};
use orb_io::object_key::ObjectKey;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// One count on a servant proxy, released on drop.
pub struct ProxyCountGuard {
    proxy: Arc<ServantProxyObject>,
}

impl ProxyCountGuard {
    pub fn new(proxy: Arc<ServantProxyObject>) -> Self {
        proxy.add_ref();
        Self { proxy }
    }
}

impl Drop for ProxyCountGuard {
    fn drop(&mut self) {
        self.proxy.remove_ref();
    }
}

/// The active-servant slot of a reference.
pub struct ServantHold {
    proxy: Arc<ServantProxyObject>,
    _count: ProxyCountGuard,
}

impl ServantHold {
    fn new(proxy: Arc<ServantProxyObject>) -> Self {
        let count = ProxyCountGuard::new(proxy.clone());
        Self {
            proxy,
            _count: count,
        }
    }
}

/// A local object reference owned by the root POA's map.
pub struct ReferenceLocal {
    key: ObjectKey,
    primary_id: String,
    interfaces: Vec<String>,
    flags: u8,
    policies: Mutex<PolicySet>,
    ref_cnt: AtomicUsize,
    servant: Mutex<Option<ServantHold>>,
    adapter: Mutex<Weak<crate::poa::Poa>>,
    root: Weak<PoaRoot>,
}

impl ReferenceLocal {
    pub(crate) fn new(
        root: Weak<PoaRoot>,
        key: ObjectKey,
        primary_id: String,
        interfaces: Vec<String>,
        flags: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            primary_id,
            interfaces,
            flags,
            policies: Mutex::new(PolicySet::new()),
            ref_cnt: AtomicUsize::new(0),
            servant: Mutex::new(None),
            adapter: Mutex::new(Weak::new()),
            root,
        })
    }

    /// The adapter currently holding this reference active.
    pub fn adapter(&self) -> Option<Arc<crate::poa::Poa>> {
        self.adapter.lock().upgrade()
    }

    pub(crate) fn set_adapter(&self, adapter: &Arc<crate::poa::Poa>) {
        *self.adapter.lock() = Arc::downgrade(adapter);
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn garbage_collected(&self) -> bool {
        self.flags & REF_FLAG_GARBAGE_COLLECTION != 0
    }

    /// The policy map attached to this reference.
    pub fn policies(&self) -> PolicySet {
        self.policies.lock().clone()
    }

    pub fn set_policies(&self, policies: PolicySet) {
        *self.policies.lock() = policies;
    }

    pub fn get_policy(&self, policy_type: u32) -> Option<crate::policy::PolicyValue> {
        self.policies.lock().get(policy_type).cloned()
    }

    /// The domain managers governing this reference: the owning
    /// protection domain.
    pub fn domain_managers(&self) -> Vec<orb_io::ior::DomainAddress> {
        match self.root.upgrade() {
            Some(root) => vec![root.domain_address()],
            None => Vec::new(),
        }
    }

    /// Binds an active servant proxy into the slot. The reference takes one
    /// count on the proxy for as long as the slot is occupied.
    pub(crate) fn bind_servant(self: &Arc<Self>, proxy: Arc<ServantProxyObject>) {
        proxy.attach_reference(self);
        *self.servant.lock() = Some(ServantHold::new(proxy));
    }

    /// Clears the slot, returning the proxy for etherealization.
    pub(crate) fn unbind_servant(&self) -> Option<Arc<ServantProxyObject>> {
        let hold = self.servant.lock().take()?;
        hold.proxy.detach_reference(self);
        Some(hold.proxy.clone())
    }

    /// The active servant proxy, if any. Dispatch clones the handle before
    /// invoking, so an in-flight operation always holds a strong reference.
    pub fn servant_proxy(&self) -> Option<Arc<ServantProxyObject>> {
        self.servant.lock().as_ref().map(|h| h.proxy.clone())
    }

    pub fn is_active(&self) -> bool {
        self.servant.lock().is_some()
    }

    /// Adds one external count.
    pub fn add_ref(&self) -> usize {
        self.ref_cnt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Removes one external count. Dropping the last count on a
    /// collectable, still-active reference schedules the deferred
    /// revive-or-die pass.
    pub fn remove_ref(self: &Arc<Self>) -> usize {
        let prev = self.ref_cnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        let now = prev - 1;
        if now == 0 && self.garbage_collected() && self.is_active() {
            if let Some(root) = self.root.upgrade() {
                root.schedule_proxy_gc(self.clone());
            }
        }
        now
    }

    pub fn ref_count(&self) -> usize {
        self.ref_cnt.load(Ordering::SeqCst)
    }
}

impl crate::request::ObjectInterface for ReferenceLocal {
    fn primary_interface(&self) -> String {
        self.primary_id.clone()
    }

    fn interfaces(&self) -> Vec<String> {
        self.interfaces.clone()
    }

    fn ior(&self) -> CoreResult<Ior> {
        let root = self.root.upgrade().ok_or_else(SystemException::initialize)?;
        Ok(Ior::for_domain(
            self.primary_id.clone(),
            &root.domain_address(),
            &self.key,
            self.flags,
        ))
    }

    fn is_local(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for ReferenceLocal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceLocal")
            .field("key", &self.key.to_string())
            .field("active", &self.is_active())
            .field("ref_cnt", &self.ref_count())
            .finish()
    }
}
