//! The root POA scope.
//!
//! The root owns what is process-wide: the local-reference map (one
//! reference per canonical key), the root adapter, the default manager, the
//! root sync domain serializing adapter bookkeeping, and the deferred
//! revive-or-die pass over dropped references.

use crate::error::{PoaError, PoaResult};
use crate::manager::{PoaManager, PoaManagerFactory};
use crate::poa::{current_ed, Poa};
use crate::policy::PolicyTuple;
use crate::reference::ReferenceLocal;
use crate::request::InboundRequest;
use orb_core::error::SystemException;
use orb_core::mem_context::MemContext;
use orb_core::omg_minor;
use orb_core::scheduler::Scheduler;
use orb_core::sync::{SyncContext, SyncDomain};
use orb_io::ior::DomainAddress;
use orb_io::object_key::ObjectKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Process-wide adapter state and the root of the POA tree.
pub struct PoaRoot {
    self_weak: std::sync::Weak<PoaRoot>,
    scheduler: Arc<Scheduler>,
    sync_domain: Arc<SyncDomain>,
    domain_address: DomainAddress,
    manager_factory: Arc<PoaManagerFactory>,
    default_manager: Arc<PoaManager>,
    root_poa: Mutex<Option<Arc<Poa>>>,
    references: Mutex<HashMap<ObjectKey, Arc<ReferenceLocal>>>,
}

impl PoaRoot {
    /// Creates the root scope and the root adapter with its default
    /// manager (initially HOLDING).
    pub fn new(scheduler: Arc<Scheduler>, domain_address: DomainAddress) -> PoaResult<Arc<Self>> {
        let manager_factory = PoaManagerFactory::new(scheduler.clone());
        let default_manager = manager_factory.create("RootPOAManager")?;
        let root = Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            scheduler,
            sync_domain: SyncDomain::new("poa-root"),
            domain_address,
            manager_factory,
            default_manager: default_manager.clone(),
            root_poa: Mutex::new(None),
            references: Mutex::new(HashMap::new()),
        });
        let root_poa = Poa::new(
            "RootPOA".to_owned(),
            None,
            Arc::downgrade(&root),
            default_manager.clone(),
            PolicyTuple::root(),
        );
        default_manager.on_adapter_create(&root_poa);
        *root.root_poa.lock() = Some(root_poa);
        info!("root POA created");
        Ok(root)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The sync context owning adapter bookkeeping.
    pub fn sync_context(&self) -> SyncContext {
        SyncContext::Domain(self.sync_domain.clone())
    }

    pub fn domain_address(&self) -> DomainAddress {
        self.domain_address.clone()
    }

    pub fn root_poa(&self) -> Arc<Poa> {
        self.root_poa
            .lock()
            .clone()
            .expect("root POA exists for the root's lifetime")
    }

    pub fn manager_factory(&self) -> &Arc<PoaManagerFactory> {
        &self.manager_factory
    }

    pub fn default_manager(&self) -> Arc<PoaManager> {
        self.default_manager.clone()
    }

    // Local-reference map.

    /// Finds or creates the one reference for `key`.
    pub(crate) fn get_or_create_reference(
        &self,
        key: ObjectKey,
        primary_id: String,
        interfaces: Vec<String>,
        flags: u8,
    ) -> Arc<ReferenceLocal> {
        let mut references = self.references.lock();
        if let Some(existing) = references.get(&key) {
            return existing.clone();
        }
        let reference = ReferenceLocal::new(
            self.self_weak.clone(),
            key.clone(),
            primary_id,
            interfaces,
            flags,
        );
        references.insert(key, reference.clone());
        reference
    }

    /// Looks up the reference for `key`.
    pub fn find_reference(&self, key: &ObjectKey) -> Option<Arc<ReferenceLocal>> {
        self.references.lock().get(key).cloned()
    }

    pub(crate) fn remove_reference(&self, key: &ObjectKey) {
        self.references.lock().remove(key);
    }

    /// Count of live local references.
    pub fn reference_count(&self) -> usize {
        self.references.lock().len()
    }

    /// Schedules the deferred revive-or-die pass for a dropped reference.
    pub fn schedule_proxy_gc(self: &Arc<Self>, reference: Arc<ReferenceLocal>) {
        let window = Duration::from_nanos(
            self.scheduler.config().proxy_gc_deadline.saturating_mul(100),
        );
        let root = self.clone();
        let deadline = orb_core::deadline::Clock::make_deadline(
            self.scheduler.config().proxy_gc_deadline,
        );
        let _ = self
            .scheduler
            .async_call(deadline, SyncContext::Free, None, async move {
                tokio::time::sleep(window).await;
                // Revive-or-die: a reference re-acquired during the window
                // survives; an untouched one is deactivated in the root
                // context.
                if reference.ref_count() > 0 || !reference.is_active() {
                    return Ok(());
                }
                let ed = current_ed();
                orb_core::sync::synchronized(&ed, &root.sync_context(), async {
                    if reference.ref_count() == 0 {
                        if let Some(adapter) = reference.adapter() {
                            debug!(key = %reference.key(), "proxy GC deactivating");
                            if let Err(e) =
                                adapter.deactivate_object(reference.key().object_id()).await
                            {
                                debug!(error = %e, "proxy GC skipped");
                            }
                        }
                    }
                    Ok(())
                })
                .await
            });
    }

    // Dispatch entry.

    /// Routes an inbound request to its adapter: walks the key's adapter
    /// path (activating missing steps), then hands the request to the
    /// adapter's manager.
    pub async fn invoke(
        self: &Arc<Self>,
        mut inbound: InboundRequest,
        memory: Arc<MemContext>,
    ) -> PoaResult<()> {
        let ed = current_ed();
        let mut adapter = self.root_poa();
        for step in inbound.key.adapter_path().to_vec() {
            adapter = match adapter.find_poa(&step, true).await {
                Ok(next) => next,
                Err(e) => {
                    let e = match e {
                        PoaError::AdapterNonExistent => PoaError::System(
                            SystemException::object_not_exist(omg_minor(2)),
                        ),
                        other => other,
                    };
                    crate::request::fail_request(&mut *inbound.request, &e);
                    return Err(e);
                }
            };
        }
        let manager = adapter.the_poa_manager();
        manager.invoke(&ed, adapter, inbound, memory).await
    }

    /// Blocks incoming requests and completes in-flight ones.
    pub async fn shutdown(self: &Arc<Self>) -> PoaResult<()> {
        info!("root POA shutting down");
        let root_poa = self.root_poa();
        root_poa.destroy(true, true).await
    }
}
