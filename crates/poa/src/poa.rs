//! The Portable Object Adapter.
//!
//! One `Poa` struct serves every policy mix; behavior is selected by small
//! matches on the policy tuple at each decision point. An adapter owns its
//! children map, an active object map under RETAIN, and the id generators
//! for SYSTEM_ID; the root POA owns the process-wide local-reference map.

use crate::current::{CurrentGuard, DispatchContext};
use crate::error::{PoaError, PoaResult};
use crate::manager::PoaManager;
use crate::policy::{
    IdAssignment, IdUniqueness, ImplicitActivation, Lifespan, PolicyTuple, RequestProcessing,
    ServantRetention,
};
use crate::proxy::ServantProxyObject;
use crate::reference::ReferenceLocal;
use crate::request::{fail_request, InboundRequest};
use crate::root::PoaRoot;
use crate::servant::{AdapterActivator, Servant, ServantManager};
use bytes::Bytes;
use orb_core::deadline::{DEFAULT_CONSTRUCTION_DEADLINE, INFINITE_DEADLINE};
use orb_core::error::{RequestException, SystemException};
use orb_core::event::EventSync;
use orb_core::exec_domain::ExecDomain;
use orb_core::omg_minor;
use orb_core::sync::{SyncContext, SyncDomain, SyncFrame};
use orb_core::waitable::WaitableRef;
use orb_io::ior::{REF_FLAG_GARBAGE_COLLECTION, REF_FLAG_PERSISTENT};
use orb_io::object_key::ObjectKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// The ED of the running task, or a detached one for direct API use.
pub(crate) fn current_ed() -> Arc<ExecDomain> {
    ExecDomain::current().unwrap_or_else(|_| ExecDomain::new(INFINITE_DEADLINE))
}

fn servant_ptr(servant: &Arc<dyn Servant>) -> usize {
    Arc::as_ptr(servant) as *const () as usize
}

struct PoaState {
    destroyed: bool,
    children: HashMap<String, Arc<Poa>>,
    // Adapter-activator dedup: one unknown_adapter call per missing name.
    pending_children: HashMap<String, Arc<WaitableRef<bool>>>,
    // RETAIN: object id -> active proxy.
    aom: HashMap<Bytes, Arc<ServantProxyObject>>,
    // UNIQUE_ID: servant identity -> its one object id.
    servant_ids: HashMap<usize, Bytes>,
    // Servant identity -> proxy, reused across MULTIPLE_ID activations.
    proxies: HashMap<usize, Weak<ServantProxyObject>>,
    // Servant-activator dedup: one incarnate call per missing id.
    pending_incarnations: HashMap<Bytes, Arc<WaitableRef<Arc<ServantProxyObject>>>>,
}

/// One adapter node in the POA tree.
pub struct Poa {
    name: String,
    path: Vec<String>,
    parent: Weak<Poa>,
    root: Weak<PoaRoot>,
    manager: Arc<PoaManager>,
    policies: PolicyTuple,
    request_cnt: AtomicUsize,
    destroy_completed: EventSync,
    system_id_counter: AtomicU64,
    activator: Mutex<Option<Arc<dyn AdapterActivator>>>,
    servant_manager: Mutex<Option<ServantManager>>,
    default_servant: Mutex<Option<Arc<ServantProxyObject>>>,
    state: Mutex<PoaState>,
}

impl Poa {
    pub(crate) fn new(
        name: String,
        parent: Option<&Arc<Poa>>,
        root: Weak<PoaRoot>,
        manager: Arc<PoaManager>,
        policies: PolicyTuple,
    ) -> Arc<Self> {
        let path = match parent {
            None => Vec::new(),
            Some(p) => {
                let mut path = p.path.clone();
                path.push(name.clone());
                path
            }
        };
        Arc::new(Self {
            name,
            path,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            root,
            manager,
            policies,
            request_cnt: AtomicUsize::new(0),
            destroy_completed: EventSync::new(),
            system_id_counter: AtomicU64::new(0),
            activator: Mutex::new(None),
            servant_manager: Mutex::new(None),
            default_servant: Mutex::new(None),
            state: Mutex::new(PoaState {
                destroyed: false,
                children: HashMap::new(),
                pending_children: HashMap::new(),
                aom: HashMap::new(),
                servant_ids: HashMap::new(),
                proxies: HashMap::new(),
                pending_incarnations: HashMap::new(),
            }),
        })
    }

    // Attribute accessors.

    pub fn the_name(&self) -> &str {
        &self.name
    }

    pub fn the_parent(&self) -> Option<Arc<Poa>> {
        self.parent.upgrade()
    }

    pub fn the_children(&self) -> Vec<Arc<Poa>> {
        self.state.lock().children.values().cloned().collect()
    }

    pub fn the_poa_manager(&self) -> Arc<PoaManager> {
        self.manager.clone()
    }

    pub fn the_activator(&self) -> Option<Arc<dyn AdapterActivator>> {
        self.activator.lock().clone()
    }

    pub fn set_activator(&self, activator: Option<Arc<dyn AdapterActivator>>) {
        *self.activator.lock() = activator;
    }

    pub fn policies(&self) -> PolicyTuple {
        self.policies
    }

    /// The adapter path from the root.
    pub fn id(&self) -> &[String] {
        &self.path
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Requests currently dispatched into this adapter.
    pub fn outstanding_requests(&self) -> usize {
        self.request_cnt.load(Ordering::SeqCst)
    }

    fn root(&self) -> PoaResult<Arc<PoaRoot>> {
        self.root
            .upgrade()
            .ok_or(PoaError::System(SystemException::initialize()))
    }

    fn object_key(&self, object_id: Bytes) -> ObjectKey {
        ObjectKey::new(self.path.clone(), object_id)
    }

    // Child management.

    /// Creates a child adapter under this POA.
    pub fn create_poa(
        self: &Arc<Self>,
        name: &str,
        manager: Option<Arc<PoaManager>>,
        policies: PolicyTuple,
    ) -> PoaResult<Arc<Poa>> {
        policies.validate()?;
        let root = self.root()?;
        let manager = match manager {
            Some(m) => m,
            None => root.default_manager(),
        };
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(PoaError::AdapterNonExistent);
        }
        if state.children.contains_key(name) {
            return Err(PoaError::AdapterAlreadyExists);
        }
        let child = Poa::new(
            name.to_owned(),
            Some(self),
            self.root.clone(),
            manager.clone(),
            policies,
        );
        state.children.insert(name.to_owned(), child.clone());
        manager.on_adapter_create(&child);
        debug!(adapter = %child.path.join("/"), "created POA");
        Ok(child)
    }

    /// Finds a child, invoking the adapter activator on a miss when
    /// requested. Concurrent misses on one name produce exactly one
    /// `unknown_adapter` call.
    pub async fn find_poa(self: &Arc<Self>, name: &str, activate_it: bool) -> PoaResult<Arc<Poa>> {
        let ed = current_ed();
        loop {
            let (activator, slot) = {
                let mut state = self.state.lock();
                if state.destroyed {
                    return Err(PoaError::AdapterNonExistent);
                }
                if let Some(child) = state.children.get(name) {
                    return Ok(child.clone());
                }
                if !activate_it {
                    return Err(PoaError::AdapterNonExistent);
                }
                let activator = match self.activator.lock().clone() {
                    Some(a) => a,
                    None => return Err(PoaError::AdapterNonExistent),
                };
                let slot = state
                    .pending_children
                    .entry(name.to_owned())
                    .or_insert_with(|| {
                        Arc::new(WaitableRef::new(DEFAULT_CONSTRUCTION_DEADLINE))
                    })
                    .clone();
                (activator, slot)
            };

            if let Some(guard) = slot.initialize(&ed) {
                let created = activator.unknown_adapter(self, name).await;
                let mut state = self.state.lock();
                state.pending_children.remove(name);
                match created {
                    Ok(created) => {
                        guard.finish(created);
                        if !created || !state.children.contains_key(name) {
                            return Err(PoaError::AdapterNonExistent);
                        }
                        return Ok(state.children[name].clone());
                    }
                    Err(e) => {
                        guard.fail(e.to_system());
                        return Err(e);
                    }
                }
            }

            match slot.get(&ed).await {
                Ok(true) => continue,
                Ok(false) => return Err(PoaError::AdapterNonExistent),
                Err(e) => return Err(PoaError::System(e)),
            }
        }
    }

    // Id generation.

    /// Generates a SYSTEM_ID object id.
    pub(crate) fn generate_object_id(&self) -> Bytes {
        match self.policies.lifespan {
            Lifespan::Transient => {
                // Monotonic counter, big-endian for stable ordering.
                let n = self.system_id_counter.fetch_add(1, Ordering::SeqCst);
                Bytes::copy_from_slice(&n.to_be_bytes())
            }
            Lifespan::Persistent => {
                // Time prefix plus random bits: unique across process lives.
                let micros = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_micros() as u64)
                    .unwrap_or(0);
                let random: [u8; 8] = rand::random();
                let mut id = Vec::with_capacity(16);
                id.extend_from_slice(&micros.to_be_bytes());
                id.extend_from_slice(&random);
                Bytes::from(id)
            }
        }
    }

    fn reference_flags(&self) -> u8 {
        let mut flags = REF_FLAG_GARBAGE_COLLECTION;
        if self.policies.lifespan == Lifespan::Persistent {
            flags |= REF_FLAG_PERSISTENT;
        }
        flags
    }

    // Activation.

    fn get_or_create_proxy(
        &self,
        state: &mut PoaState,
        servant: &Arc<dyn Servant>,
    ) -> Arc<ServantProxyObject> {
        let ptr = servant_ptr(servant);
        if let Some(proxy) = state.proxies.get(&ptr).and_then(|w| w.upgrade()) {
            return proxy;
        }
        let label = format!("servant:{}", servant.primary_interface());
        let proxy = ServantProxyObject::new(
            servant.clone(),
            SyncContext::Domain(SyncDomain::new(label)),
        );
        state.proxies.insert(ptr, Arc::downgrade(&proxy));
        proxy
    }

    /// Activates `servant` under a generated id (SYSTEM_ID + RETAIN).
    pub fn activate_object(self: &Arc<Self>, servant: Arc<dyn Servant>) -> PoaResult<Bytes> {
        if self.policies.id_assignment != IdAssignment::SystemId {
            return Err(PoaError::WrongPolicy);
        }
        let id = self.generate_object_id();
        self.activate_object_with_id(id.clone(), servant)?;
        Ok(id)
    }

    /// Activates `servant` under `object_id`.
    pub fn activate_object_with_id(
        self: &Arc<Self>,
        object_id: Bytes,
        servant: Arc<dyn Servant>,
    ) -> PoaResult<()> {
        if self.policies.servant_retention != ServantRetention::Retain {
            return Err(PoaError::WrongPolicy);
        }
        let root = self.root()?;
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(PoaError::AdapterNonExistent);
        }
        if state.aom.contains_key(&object_id) {
            return Err(PoaError::ObjectAlreadyActive);
        }
        if self.policies.id_uniqueness == IdUniqueness::UniqueId
            && state.servant_ids.contains_key(&servant_ptr(&servant))
        {
            return Err(PoaError::ServantAlreadyActive);
        }
        let proxy = self.get_or_create_proxy(&mut state, &servant);
        let key = self.object_key(object_id.clone());
        let reference = root.get_or_create_reference(
            key,
            proxy.primary_interface().to_owned(),
            proxy.interfaces().to_vec(),
            self.reference_flags(),
        );
        reference.set_adapter(self);
        reference.bind_servant(proxy.clone());
        state.aom.insert(object_id.clone(), proxy);
        if self.policies.id_uniqueness == IdUniqueness::UniqueId {
            state.servant_ids.insert(servant_ptr(&servant), object_id);
        }
        Ok(())
    }

    /// Deactivates `object_id`, etherealizing through the servant
    /// activator when one is attached.
    pub async fn deactivate_object(self: &Arc<Self>, object_id: &Bytes) -> PoaResult<()> {
        if self.policies.servant_retention != ServantRetention::Retain {
            return Err(PoaError::WrongPolicy);
        }
        let root = self.root()?;
        let proxy = {
            let mut state = self.state.lock();
            let proxy = state
                .aom
                .remove(object_id)
                .ok_or(PoaError::ObjectNotActive)?;
            state.servant_ids.remove(&servant_ptr(&proxy.servant()));
            proxy
        };
        let key = self.object_key(object_id.clone());
        let remaining = {
            let reference = root.find_reference(&key);
            if let Some(reference) = &reference {
                reference.unbind_servant();
            }
            root.remove_reference(&key);
            !proxy.references().is_empty()
        };
        let manager = self.servant_manager.lock().clone();
        if let Some(ServantManager::Activator(activator)) = manager {
            activator
                .etherealize(object_id, self, proxy.servant(), false, remaining)
                .await;
        }
        Ok(())
    }

    /// Retires every active object; used by manager deactivation and
    /// destroy.
    pub(crate) async fn etherealize_objects(self: &Arc<Self>) {
        let ids: Vec<Bytes> = self.state.lock().aom.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.deactivate_object(&id).await {
                warn!(error = %e, "etherealize failed");
            }
        }
    }

    // Identity mappings.

    /// The id `servant` is active under, activating implicitly when the
    /// policy mix allows it.
    pub fn servant_to_id(self: &Arc<Self>, servant: &Arc<dyn Servant>) -> PoaResult<Bytes> {
        if self.policies.servant_retention == ServantRetention::Retain
            && self.policies.id_uniqueness == IdUniqueness::UniqueId
        {
            if let Some(id) = self.state.lock().servant_ids.get(&servant_ptr(servant)) {
                return Ok(id.clone());
            }
        }
        if self.policies.implicit_activation == ImplicitActivation::Implicit {
            return self.activate_object(servant.clone());
        }
        Err(PoaError::ServantNotActive)
    }

    /// The reference `servant` is reachable through.
    pub fn servant_to_reference(
        self: &Arc<Self>,
        servant: &Arc<dyn Servant>,
    ) -> PoaResult<Arc<ReferenceLocal>> {
        let id = self.servant_to_id(servant)?;
        self.id_to_reference(&id)
    }

    pub fn id_to_servant(&self, object_id: &Bytes) -> PoaResult<Arc<dyn Servant>> {
        if self.policies.servant_retention == ServantRetention::Retain {
            if let Some(proxy) = self.state.lock().aom.get(object_id) {
                return Ok(proxy.servant());
            }
        }
        if self.policies.request_processing == RequestProcessing::UseDefaultServant {
            if let Some(proxy) = self.default_servant.lock().clone() {
                return Ok(proxy.servant());
            }
        }
        Err(PoaError::ObjectNotActive)
    }

    pub fn id_to_reference(&self, object_id: &Bytes) -> PoaResult<Arc<ReferenceLocal>> {
        if self.policies.servant_retention != ServantRetention::Retain {
            return Err(PoaError::WrongPolicy);
        }
        if !self.state.lock().aom.contains_key(object_id) {
            return Err(PoaError::ObjectNotActive);
        }
        let root = self.root()?;
        root.find_reference(&self.object_key(object_id.clone()))
            .ok_or(PoaError::ObjectNotActive)
    }

    pub fn reference_to_id(&self, reference: &ReferenceLocal) -> PoaResult<Bytes> {
        if reference.key().adapter_path() != self.path.as_slice() {
            return Err(PoaError::WrongAdapter);
        }
        Ok(reference.key().object_id().clone())
    }

    pub fn reference_to_servant(&self, reference: &ReferenceLocal) -> PoaResult<Arc<dyn Servant>> {
        let id = self.reference_to_id(reference)?;
        self.id_to_servant(&id)
    }

    /// Creates an inactive reference under a generated id.
    pub fn create_reference(self: &Arc<Self>, interface: &str) -> PoaResult<Arc<ReferenceLocal>> {
        if self.policies.id_assignment != IdAssignment::SystemId {
            return Err(PoaError::WrongPolicy);
        }
        let id = self.generate_object_id();
        self.create_reference_with_id(id, interface)
    }

    /// Creates an inactive reference under `object_id`.
    pub fn create_reference_with_id(
        self: &Arc<Self>,
        object_id: Bytes,
        interface: &str,
    ) -> PoaResult<Arc<ReferenceLocal>> {
        let root = self.root()?;
        let reference = root.get_or_create_reference(
            self.object_key(object_id),
            interface.to_owned(),
            vec![interface.to_owned()],
            self.reference_flags(),
        );
        reference.set_adapter(self);
        Ok(reference)
    }

    // Servant manager and default servant.

    pub fn set_servant_manager(&self, manager: ServantManager) -> PoaResult<()> {
        if self.policies.request_processing != RequestProcessing::UseServantManager {
            return Err(PoaError::WrongPolicy);
        }
        let mut slot = self.servant_manager.lock();
        if slot.is_some() {
            // Set-once.
            return Err(PoaError::System(SystemException::bad_inv_order(
                omg_minor(6),
            )));
        }
        *slot = Some(manager);
        Ok(())
    }

    pub fn get_servant_manager(&self) -> PoaResult<ServantManager> {
        if self.policies.request_processing != RequestProcessing::UseServantManager {
            return Err(PoaError::WrongPolicy);
        }
        self.servant_manager.lock().clone().ok_or(PoaError::NoServant)
    }

    pub fn set_servant(&self, servant: Arc<dyn Servant>) -> PoaResult<()> {
        if self.policies.request_processing != RequestProcessing::UseDefaultServant {
            return Err(PoaError::WrongPolicy);
        }
        let label = format!("default:{}", servant.primary_interface());
        let proxy =
            ServantProxyObject::new(servant, SyncContext::Domain(SyncDomain::new(label)));
        *self.default_servant.lock() = Some(proxy);
        Ok(())
    }

    pub fn get_servant(&self) -> PoaResult<Arc<dyn Servant>> {
        if self.policies.request_processing != RequestProcessing::UseDefaultServant {
            return Err(PoaError::WrongPolicy);
        }
        self.default_servant
            .lock()
            .as_ref()
            .map(|p| p.servant())
            .ok_or(PoaError::NoServant)
    }

    // Dispatch.

    /// Serves one inbound request: resolves the servant per the policy
    /// matrix, pushes the dispatch context, enters the servant's sync
    /// context, and invokes the operation. Failures become the request's
    /// outcome.
    pub async fn serve(self: &Arc<Self>, mut inbound: InboundRequest) {
        if let Err(e) = self.serve_inner(&mut inbound).await {
            fail_request(&mut *inbound.request, &e);
        }
    }

    async fn serve_inner(self: &Arc<Self>, inbound: &mut InboundRequest) -> PoaResult<()> {
        if self.is_destroyed() {
            return Err(PoaError::AdapterNonExistent);
        }
        let ed = current_ed();
        let object_id = inbound.object_id();

        enum Resolved {
            Proxy(Arc<ServantProxyObject>),
            Located {
                servant: Arc<dyn Servant>,
                locator: Arc<dyn crate::servant::ServantLocator>,
                cookie: crate::servant::LocatorCookie,
            },
        }

        let resolved = match self.policies.servant_retention {
            ServantRetention::Retain => {
                let hit = self.state.lock().aom.get(&object_id).cloned();
                match hit {
                    Some(proxy) => Resolved::Proxy(proxy),
                    None => match self.policies.request_processing {
                        RequestProcessing::UseAomOnly => {
                            return Err(PoaError::ObjectNotActive)
                        }
                        RequestProcessing::UseDefaultServant => {
                            let proxy = self
                                .default_servant
                                .lock()
                                .clone()
                                .ok_or(PoaError::NoServant)?;
                            Resolved::Proxy(proxy)
                        }
                        RequestProcessing::UseServantManager => {
                            Resolved::Proxy(self.incarnate(&ed, &object_id).await?)
                        }
                    },
                }
            }
            ServantRetention::NonRetain => match self.policies.request_processing {
                RequestProcessing::UseDefaultServant => {
                    let proxy = self
                        .default_servant
                        .lock()
                        .clone()
                        .ok_or(PoaError::NoServant)?;
                    Resolved::Proxy(proxy)
                }
                RequestProcessing::UseServantManager => {
                    let locator = match self.servant_manager.lock().clone() {
                        Some(ServantManager::Locator(l)) => l,
                        _ => return Err(PoaError::NoServant),
                    };
                    let (servant, cookie) = locator
                        .preinvoke(&object_id, self, inbound.request.operation())
                        .await?;
                    Resolved::Located {
                        servant,
                        locator,
                        cookie,
                    }
                }
                RequestProcessing::UseAomOnly => return Err(PoaError::ObjectNotActive),
            },
        };

        match resolved {
            Resolved::Proxy(proxy) => {
                self.dispatch_to(&ed, inbound, proxy, &object_id).await
            }
            Resolved::Located {
                servant,
                locator,
                cookie,
            } => {
                // Locator-provided servants run without an AOM entry; the
                // postinvoke bracket runs on every path.
                let proxy = ServantProxyObject::new(servant.clone(), SyncContext::Free);
                let operation = inbound.request.operation().to_owned();
                let result = self.dispatch_to(&ed, inbound, proxy, &object_id).await;
                locator
                    .postinvoke(&object_id, self, &operation, cookie, servant)
                    .await;
                result
            }
        }
    }

    async fn incarnate(
        self: &Arc<Self>,
        ed: &Arc<ExecDomain>,
        object_id: &Bytes,
    ) -> PoaResult<Arc<ServantProxyObject>> {
        let activator = match self.servant_manager.lock().clone() {
            Some(ServantManager::Activator(a)) => a,
            _ => return Err(PoaError::NoServant),
        };
        let slot = {
            let mut state = self.state.lock();
            if let Some(proxy) = state.aom.get(object_id) {
                return Ok(proxy.clone());
            }
            state
                .pending_incarnations
                .entry(object_id.clone())
                .or_insert_with(|| Arc::new(WaitableRef::new(DEFAULT_CONSTRUCTION_DEADLINE)))
                .clone()
        };

        let outcome = if let Some(guard) = slot.initialize(ed) {
            let incarnated = activator.incarnate(object_id, self).await;
            let result = match incarnated {
                Ok(servant) => self.register_incarnation(object_id.clone(), servant),
                Err(e) => Err(e),
            };
            self.state.lock().pending_incarnations.remove(object_id);
            match result {
                Ok(proxy) => {
                    guard.finish(proxy.clone());
                    Ok(proxy)
                }
                Err(e) => {
                    // Incarnation failures surface as OBJECT_NOT_EXIST.
                    guard.fail(SystemException::object_not_exist(omg_minor(2)));
                    Err(e)
                }
            }
        } else {
            slot.get(ed).await.map_err(PoaError::System)
        };
        outcome
    }

    fn register_incarnation(
        self: &Arc<Self>,
        object_id: Bytes,
        servant: Arc<dyn Servant>,
    ) -> PoaResult<Arc<ServantProxyObject>> {
        let root = self.root()?;
        let mut state = self.state.lock();
        if self.policies.id_uniqueness == IdUniqueness::UniqueId
            && state.servant_ids.contains_key(&servant_ptr(&servant))
        {
            return Err(PoaError::ServantAlreadyActive);
        }
        let proxy = self.get_or_create_proxy(&mut state, &servant);
        let key = self.object_key(object_id.clone());
        let reference = root.get_or_create_reference(
            key,
            proxy.primary_interface().to_owned(),
            proxy.interfaces().to_vec(),
            self.reference_flags(),
        );
        reference.set_adapter(self);
        reference.bind_servant(proxy.clone());
        state.aom.insert(object_id.clone(), proxy.clone());
        if self.policies.id_uniqueness == IdUniqueness::UniqueId {
            state.servant_ids.insert(servant_ptr(&servant), object_id);
        }
        Ok(proxy)
    }

    async fn dispatch_to(
        self: &Arc<Self>,
        ed: &Arc<ExecDomain>,
        inbound: &mut InboundRequest,
        proxy: Arc<ServantProxyObject>,
        object_id: &Bytes,
    ) -> PoaResult<()> {
        let root = self.root()?;
        let reference = root.find_reference(&self.object_key(object_id.clone()));
        let servant = proxy.servant();
        let operation = inbound.request.operation().to_owned();

        self.request_cnt.fetch_add(1, Ordering::SeqCst);
        let count_guard = RequestCountGuard { poa: self.clone() };
        let current_guard = CurrentGuard::push(
            ed.clone(),
            DispatchContext {
                adapter: self.clone(),
                object_id: object_id.clone(),
                reference,
                servant: servant.clone(),
            },
        );

        let target = proxy.sync_context();
        let frame = SyncFrame::enter(ed, &target)
            .await
            .map_err(PoaError::System)?;
        let outcome = servant.dispatch(&operation, &mut *inbound.request).await;
        drop(frame);
        drop(current_guard);
        drop(count_guard);

        match outcome {
            Ok(()) => {
                if !inbound.request.has_exception() {
                    inbound.request.success().map_err(PoaError::System)?;
                }
                Ok(())
            }
            Err(e) => {
                inbound
                    .request
                    .set_exception(RequestException::System(e.clone()));
                Err(PoaError::System(e))
            }
        }
    }

    // Destruction.

    /// Destroys this adapter and its subtree, bottom-up. Idempotent.
    pub async fn destroy(
        self: &Arc<Self>,
        etherealize: bool,
        wait_for_completion: bool,
    ) -> PoaResult<()> {
        let ed = current_ed();
        if wait_for_completion && ed.in_dispatch() {
            return Err(PoaError::System(SystemException::bad_inv_order(
                omg_minor(3),
            )));
        }

        // Collect the subtree post-order so leaves unwind first.
        let mut ordered: Vec<Arc<Poa>> = Vec::new();
        let mut stack: Vec<Arc<Poa>> = vec![self.clone()];
        while let Some(adapter) = stack.pop() {
            ordered.push(adapter.clone());
            for child in adapter.the_children() {
                stack.push(child);
            }
        }
        ordered.reverse();

        if let Some(parent) = self.the_parent() {
            parent.state.lock().children.remove(&self.name);
        }

        for adapter in &ordered {
            let first = {
                let mut state = adapter.state.lock();
                let first = !state.destroyed;
                state.destroyed = true;
                state.children.clear();
                first
            };
            if !first {
                continue;
            }
            adapter.manager.on_adapter_destroy(adapter);
            if etherealize {
                adapter.etherealize_objects().await;
            } else {
                // Deactivate without etherealizing: clear maps and
                // references.
                let ids: Vec<Bytes> = adapter.state.lock().aom.keys().cloned().collect();
                if let Ok(root) = adapter.root() {
                    for id in ids {
                        let key = adapter.object_key(id.clone());
                        if let Some(reference) = root.find_reference(&key) {
                            reference.unbind_servant();
                        }
                        root.remove_reference(&key);
                    }
                }
                let mut state = adapter.state.lock();
                state.aom.clear();
                state.servant_ids.clear();
            }
        }

        if wait_for_completion {
            for adapter in &ordered {
                if adapter.outstanding_requests() > 0 {
                    adapter
                        .destroy_completed
                        .wait(&ed)
                        .await
                        .map_err(PoaError::System)?;
                } else {
                    adapter.destroy_completed.signal();
                }
            }
        }
        debug!(adapter = %self.path.join("/"), "destroyed POA");
        Ok(())
    }
}

struct RequestCountGuard {
    poa: Arc<Poa>,
}

impl Drop for RequestCountGuard {
    fn drop(&mut self) {
        let left = self.poa.request_cnt.fetch_sub(1, Ordering::SeqCst) - 1;
        if left == 0 && self.poa.is_destroyed() {
            self.poa.destroy_completed.signal();
        }
    }
}
