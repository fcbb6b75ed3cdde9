//! Servant proxies.
//!
//! A `ServantProxyObject` wraps a user servant with its sync context and
//! interface metadata, and tracks the local references activated over it. A
//! servant may be active in several adapters when policy permits, so the
//! proxy keeps the set of back-pointers rather than a single slot.

use crate::reference::ReferenceLocal;
use crate::servant::Servant;
use orb_core::sync::SyncContext;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// A user servant bound to its sync context and invocation machinery.
pub struct ServantProxyObject {
    servant: Arc<dyn Servant>,
    sync_context: SyncContext,
    primary_id: String,
    interfaces: Vec<String>,
    external_refs: AtomicUsize,
    references: Mutex<Vec<Weak<ReferenceLocal>>>,
}

impl ServantProxyObject {
    /// Wraps `servant`, caching its interface metadata.
    pub fn new(servant: Arc<dyn Servant>, sync_context: SyncContext) -> Arc<Self> {
        let primary_id = servant.primary_interface();
        let interfaces = servant.interfaces();
        Arc::new(Self {
            servant,
            sync_context,
            primary_id,
            interfaces,
            external_refs: AtomicUsize::new(0),
            references: Mutex::new(Vec::new()),
        })
    }

    pub fn servant(&self) -> Arc<dyn Servant> {
        self.servant.clone()
    }

    pub fn sync_context(&self) -> SyncContext {
        self.sync_context.clone()
    }

    pub fn primary_interface(&self) -> &str {
        &self.primary_id
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Interface lookup over the cached metadata.
    pub fn query_interface(&self, repository_id: &str) -> bool {
        self.interfaces.iter().any(|id| id == repository_id)
    }

    /// Adds one external reference; returns the new count.
    pub fn add_ref(&self) -> usize {
        self.external_refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Removes one external reference; returns the new count.
    pub fn remove_ref(&self) -> usize {
        let prev = self.external_refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        prev - 1
    }

    pub fn ref_count(&self) -> usize {
        self.external_refs.load(Ordering::SeqCst)
    }

    /// Records an activation over this servant.
    pub fn attach_reference(&self, reference: &Arc<ReferenceLocal>) {
        let mut refs = self.references.lock();
        refs.retain(|w| w.upgrade().is_some());
        refs.push(Arc::downgrade(reference));
    }

    /// Drops the record of one activation.
    pub fn detach_reference(&self, reference: &ReferenceLocal) {
        let mut refs = self.references.lock();
        refs.retain(|w| match w.upgrade() {
            Some(r) => r.key() != reference.key(),
            None => false,
        });
    }

    /// The live references activated over this servant.
    pub fn references(&self) -> Vec<Arc<ReferenceLocal>> {
        self.references
            .lock()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    /// A policy attached to any reference activated over this servant.
    pub fn get_policy(&self, policy_type: u32) -> Option<crate::policy::PolicyValue> {
        self.references()
            .iter()
            .find_map(|r| r.get_policy(policy_type))
    }

    /// The domain managers governing this servant's references.
    pub fn domain_managers(&self) -> Vec<orb_io::ior::DomainAddress> {
        self.references()
            .first()
            .map(|r| r.domain_managers())
            .unwrap_or_default()
    }

    /// Identity or shared-activation equivalence.
    pub fn is_equivalent(self: &Arc<Self>, other: &Arc<Self>) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }
        let mine = self.references();
        let theirs = other.references();
        mine.iter()
            .any(|a| theirs.iter().any(|b| a.key() == b.key()))
    }
}

impl std::fmt::Debug for ServantProxyObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServantProxyObject")
            .field("primary_id", &self.primary_id)
            .field("external_refs", &self.ref_count())
            .finish()
    }
}
