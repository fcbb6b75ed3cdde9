//! The binder.
//!
//! Name-to-interface resolution with lazy module loading. The binder owns
//! a dedicated sync domain with its own heap; the object map is keyed by
//! `(name, major)` with minor-compatible selection (highest satisfying
//! minor wins), the module map deduplicates concurrent loads through
//! waitable references with sticky failures, and the remote-reference
//! registry lives behind the same sync domain.

use crate::module::{BindingName, Module, ModuleProvider};
use crate::reference_remote::ReferenceRemote;
use crate::remote_refs::RemoteReferences;
use crate::request_giop::{current_ed, CodecEnv};
use crate::transport::EsiopTransport;
use orb_core::deadline::SECOND;
use orb_core::error::{CoreResult, SystemException};
use orb_core::exec_domain::ExecDomain;
use orb_core::omg_minor;
use orb_core::sync::{synchronized, SyncContext, SyncDomain, SyncFrame};
use orb_core::waitable::WaitableRef;
use orb_io::ior::{DomainAddress, Ior};
use orb_io::value::ValueFactoryRegistry;
use orb_poa::request::{ObjectRef, ObjectResolver};
use orb_poa::root::PoaRoot;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Module construction deadline; bounds priority inversion on loads.
pub const MODULE_LOADING_DEADLINE: u64 = SECOND;

type ModuleSlot = Arc<WaitableRef<Arc<Module>>>;

/// Name-to-interface resolver and module loader.
pub struct Binder {
    sync_domain: Arc<SyncDomain>,
    // (name, major) -> minor -> export. Handles are owned clones, so map
    // growth never invalidates anything held across a mutation.
    object_map: Mutex<BTreeMap<(String, u16), BTreeMap<u16, ObjectRef>>>,
    module_map: Mutex<HashMap<String, ModuleSlot>>,
    provider: Mutex<Option<Arc<dyn ModuleProvider>>>,
    poa_root: Mutex<Option<Arc<PoaRoot>>>,
    own_address: DomainAddress,
    remote: RemoteReferences,
    value_factories: Arc<ValueFactoryRegistry>,
}

impl Binder {
    pub fn new(transport: Arc<EsiopTransport>) -> Arc<Self> {
        let own_address = DomainAddress::Esiop(transport.own_domain());
        let binder = Arc::new(Self {
            // The binder is a high-load service and gets its own heap.
            sync_domain: SyncDomain::new("binder"),
            object_map: Mutex::new(BTreeMap::new()),
            module_map: Mutex::new(HashMap::new()),
            provider: Mutex::new(None),
            poa_root: Mutex::new(None),
            own_address,
            remote: RemoteReferences::new(transport),
            value_factories: Arc::new(ValueFactoryRegistry::new()),
        });
        let env = CodecEnv {
            value_factories: binder.value_factories.clone(),
            resolver: Some(binder.clone() as Arc<dyn ObjectResolver>),
        };
        binder.remote.set_env(env);
        binder
    }

    pub fn sync_context(&self) -> SyncContext {
        SyncContext::Domain(self.sync_domain.clone())
    }

    pub fn value_factories(&self) -> &Arc<ValueFactoryRegistry> {
        &self.value_factories
    }

    /// The marshaling environment handed to request codecs.
    pub fn codec_env(self: &Arc<Self>) -> CodecEnv {
        CodecEnv {
            value_factories: self.value_factories.clone(),
            resolver: Some(self.clone() as Arc<dyn ObjectResolver>),
        }
    }

    /// Installs the package-store boundary.
    pub fn set_provider(&self, provider: Arc<dyn ModuleProvider>) {
        *self.provider.lock() = Some(provider);
    }

    /// Wires the local adapter tree for resolving own-domain references.
    pub fn set_poa_root(&self, root: Arc<PoaRoot>) {
        *self.poa_root.lock() = Some(root);
    }

    pub fn remote_references(&self) -> &RemoteReferences {
        &self.remote
    }

    /// Resolves `name` to an interface, loading its module on demand.
    pub async fn bind(self: &Arc<Self>, name: &str) -> CoreResult<ObjectRef> {
        let binding = BindingName::parse(name)?;
        let ed = current_ed();
        let this = self.clone();
        let ed_inner = ed.clone();
        synchronized(&ed, &self.sync_context(), async move {
            if let Some(found) = this.lookup(&binding) {
                return Ok(found);
            }
            let module_name = {
                let provider = this.provider.lock().clone();
                provider.and_then(|p| p.module_for(&binding.name))
            };
            match module_name {
                Some(module_name) => {
                    this.load_in_sync(&ed_inner, &module_name).await?;
                    this.lookup(&binding)
                        .ok_or_else(|| SystemException::object_not_exist(omg_minor(2)))
                }
                None => Err(SystemException::object_not_exist(omg_minor(2))),
            }
        })
        .await
    }

    /// Resolves `name` and checks the result supports `iid`.
    pub async fn bind_interface(self: &Arc<Self>, name: &str, iid: &str) -> CoreResult<ObjectRef> {
        let object = self.bind(name).await?;
        if !object.interfaces().iter().any(|id| id == iid) {
            return Err(SystemException::inv_objref());
        }
        Ok(object)
    }

    fn lookup(&self, binding: &BindingName) -> Option<ObjectRef> {
        let map = self.object_map.lock();
        let minors = map.get(&(binding.name.clone(), binding.version.major))?;
        // Highest compatible minor wins.
        minors
            .range(binding.version.minor..)
            .next_back()
            .map(|(_, object)| object.clone())
    }

    /// Loads a module by name with at-most-once semantics under
    /// concurrent demand. Failures are sticky until [`unload`].
    pub async fn load(self: &Arc<Self>, module_name: &str) -> CoreResult<Arc<Module>> {
        let ed = current_ed();
        let this = self.clone();
        let ed_inner = ed.clone();
        let module_name = module_name.to_owned();
        synchronized(&ed, &self.sync_context(), async move {
            this.load_in_sync(&ed_inner, &module_name).await
        })
        .await
    }

    // Runs inside the binder sync domain.
    async fn load_in_sync(
        self: &Arc<Self>,
        ed: &Arc<ExecDomain>,
        module_name: &str,
    ) -> CoreResult<Arc<Module>> {
        let slot = self
            .module_map
            .lock()
            .entry(module_name.to_owned())
            .or_insert_with(|| Arc::new(WaitableRef::new(MODULE_LOADING_DEADLINE)))
            .clone();
        let guard = match slot.initialize(ed) {
            Some(guard) => guard,
            None => return slot.get(ed).await,
        };

        let provider = match self.provider.lock().clone() {
            Some(p) => p,
            None => {
                let e = SystemException::object_not_exist(omg_minor(2));
                guard.fail(e.clone());
                return Err(e);
            }
        };
        let singleton = provider.is_singleton(module_name);
        let context = if singleton {
            SyncContext::Singleton(SyncDomain::new(module_name))
        } else {
            SyncContext::Free
        };

        // Construction happens outside the binder domain so other binds
        // may proceed; the frame re-acquires on leave.
        let constructed = {
            let frame = SyncFrame::enter(ed, &SyncContext::Free).await?;
            let result = provider.construct(module_name, &context).await;
            frame.leave().await?;
            result
        };

        match constructed {
            Ok(exports) => {
                let module = Module::new(
                    module_name.to_owned(),
                    singleton,
                    context,
                    exports,
                );
                self.merge_exports(&module);
                self.resolve_imports(&module);
                info!(module = module_name, "module loaded");
                guard.finish(module.clone());
                Ok(module)
            }
            Err(e) => {
                warn!(module = module_name, error = %e, "module construction failed");
                guard.fail(e.clone());
                Err(e)
            }
        }
    }

    fn merge_exports(&self, module: &Arc<Module>) {
        let mut map = self.object_map.lock();
        for (binding, object) in module.exports() {
            map.entry((binding.name.clone(), binding.version.major))
                .or_default()
                .insert(binding.version.minor, object.clone());
        }
    }

    fn resolve_imports(&self, module: &Arc<Module>) {
        for import in module.imports() {
            match BindingName::parse(import).ok().and_then(|b| self.lookup(&b)) {
                Some(object) => module.hold_import(object),
                None => warn!(module = module.name(), import, "unresolved import"),
            }
        }
    }

    /// Unloads a module: removes its exports and releases import holds.
    /// This is also the eviction point for sticky load failures.
    pub async fn unload(self: &Arc<Self>, module_name: &str) -> CoreResult<()> {
        let ed = current_ed();
        let this = self.clone();
        let module_name = module_name.to_owned();
        synchronized(&ed, &self.sync_context(), async move {
            let slot = this.module_map.lock().remove(&module_name);
            if let Some(slot) = slot {
                if let Some(module) = slot.get_if_constructed() {
                    let mut map = this.object_map.lock();
                    for (binding, _) in module.exports() {
                        if let Some(minors) =
                            map.get_mut(&(binding.name.clone(), binding.version.major))
                        {
                            minors.remove(&binding.version.minor);
                            if minors.is_empty() {
                                map.remove(&(binding.name.clone(), binding.version.major));
                            }
                        }
                    }
                    drop(map);
                    module.release_imports();
                    if let Some(domain) = module.sync_context().domain() {
                        domain.begin_termination();
                    }
                    debug!(module = module_name, "module unloaded");
                }
            }
            Ok(())
        })
        .await
    }

    /// Unmarshals a remote reference: canonicalizes the address, then
    /// finds or creates the peer domain and the reference.
    pub async fn unmarshal_remote_reference(
        self: &Arc<Self>,
        ior: Ior,
    ) -> CoreResult<Arc<ReferenceRemote>> {
        let ed = current_ed();
        let this = self.clone();
        let ed_inner = ed.clone();
        synchronized(&ed, &self.sync_context(), async move {
            this.remote.unmarshal(&ed_inner, ior).await
        })
        .await
    }

    /// The peer domain at `address`, created on first use.
    pub async fn get_domain(
        self: &Arc<Self>,
        address: DomainAddress,
    ) -> CoreResult<Arc<crate::domain::Domain>> {
        let ed = current_ed();
        let this = self.clone();
        let ed_inner = ed.clone();
        synchronized(&ed, &self.sync_context(), async move {
            this.remote.get_domain(&ed_inner, &address).await
        })
        .await
    }

    /// Publishes an export directly (system services, tests).
    pub fn publish(&self, binding: BindingName, object: ObjectRef) {
        self.object_map
            .lock()
            .entry((binding.name.clone(), binding.version.major))
            .or_default()
            .insert(binding.version.minor, object);
    }

    /// Removes a direct export.
    pub fn withdraw(&self, binding: &BindingName) {
        let mut map = self.object_map.lock();
        if let Some(minors) = map.get_mut(&(binding.name.clone(), binding.version.major)) {
            minors.remove(&binding.version.minor);
            if minors.is_empty() {
                map.remove(&(binding.name.clone(), binding.version.major));
            }
        }
    }

    /// Tears down at terminate: remote references cleared, exports
    /// dropped.
    pub fn terminate(&self) {
        self.remote.clear();
        self.object_map.lock().clear();
        self.module_map.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleExports;
    use async_trait::async_trait;
    use orb_esiop::post_office::PostOffice;
    use orb_esiop::shared_mem::HostMemory;
    use orb_poa::request::ObjectInterface;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubObject {
        id: String,
    }

    impl ObjectInterface for StubObject {
        fn primary_interface(&self) -> String {
            self.id.clone()
        }

        fn interfaces(&self) -> Vec<String> {
            vec![self.id.clone()]
        }

        fn ior(&self) -> CoreResult<Ior> {
            Ok(Ior::nil())
        }

        fn is_local(&self) -> bool {
            true
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn stub(id: &str) -> ObjectRef {
        Arc::new(StubObject { id: id.into() })
    }

    struct StubProvider {
        constructions: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ModuleProvider for StubProvider {
        fn module_for(&self, object_name: &str) -> Option<String> {
            object_name
                .starts_with("acme/")
                .then(|| "acme".to_owned())
        }

        fn is_singleton(&self, _module_name: &str) -> bool {
            false
        }

        async fn construct(
            &self,
            _module_name: &str,
            _context: &SyncContext,
        ) -> CoreResult<ModuleExports> {
            self.constructions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if self.fail {
                return Err(SystemException::initialize());
            }
            Ok(ModuleExports {
                exports: vec![
                    (BindingName::parse("acme/widget:1.0")?, stub("w10")),
                    (BindingName::parse("acme/widget:1.4")?, stub("w14")),
                    (BindingName::parse("acme/widget:2.0")?, stub("w20")),
                ],
                imports: Vec::new(),
            })
        }
    }

    fn fresh_binder() -> Arc<Binder> {
        let post = PostOffice::new();
        let host = HostMemory::new();
        Binder::new(EsiopTransport::new(1, post, host))
    }

    #[tokio::test]
    async fn bind_loads_module_once_under_concurrency() {
        let binder = fresh_binder();
        let provider = Arc::new(StubProvider {
            constructions: AtomicUsize::new(0),
            fail: false,
        });
        binder.set_provider(provider.clone());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let binder = binder.clone();
            tasks.push(tokio::spawn(async move {
                binder.bind("acme/widget").await.map(|o| o.primary_interface())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "w14");
        }
        assert_eq!(provider.constructions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn version_selection_prefers_highest_compatible_minor() {
        let binder = fresh_binder();
        binder.set_provider(Arc::new(StubProvider {
            constructions: AtomicUsize::new(0),
            fail: false,
        }));
        // Major 1, minor >= 0: the 1.4 export wins over 1.0.
        let found = binder.bind("acme/widget:1.2").await.unwrap();
        assert_eq!(found.primary_interface(), "w14");
        // Major 2 is its own family.
        let found = binder.bind("acme/widget:2.0").await.unwrap();
        assert_eq!(found.primary_interface(), "w20");
        // Minor above anything exported: unresolved.
        assert!(binder.bind("acme/widget:1.9").await.is_err());
    }

    #[tokio::test]
    async fn load_failure_is_sticky_until_unload() {
        let binder = fresh_binder();
        let provider = Arc::new(StubProvider {
            constructions: AtomicUsize::new(0),
            fail: true,
        });
        binder.set_provider(provider.clone());

        assert!(binder.bind("acme/widget").await.is_err());
        assert!(binder.bind("acme/widget").await.is_err());
        // The failed construction ran once; later binds saw the sticky
        // outcome.
        assert_eq!(provider.constructions.load(Ordering::SeqCst), 1);

        binder.unload("acme").await.unwrap();
        assert!(binder.bind("acme/widget").await.is_err());
        assert_eq!(provider.constructions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_names_report_object_not_exist() {
        let binder = fresh_binder();
        let err = binder.bind("nowhere/at-all").await.expect_err("unresolved");
        assert_eq!(err.kind, orb_core::error::ExceptionKind::ObjectNotExist);
    }

    #[tokio::test]
    async fn unload_withdraws_exports() {
        let binder = fresh_binder();
        binder.set_provider(Arc::new(StubProvider {
            constructions: AtomicUsize::new(0),
            fail: false,
        }));
        binder.bind("acme/widget").await.unwrap();
        binder.unload("acme").await.unwrap();
        // The module map slot is gone; the next bind reloads.
        binder.bind("acme/widget").await.unwrap();
    }
}

impl ObjectResolver for Binder {
    fn resolve(&self, ior: &Ior) -> CoreResult<ObjectRef> {
        let (address, key, _) = ior.primary_address()?;
        if address == self.own_address {
            // Our own object coming back around: hand out the local
            // reference.
            let root = self
                .poa_root
                .lock()
                .clone()
                .ok_or_else(SystemException::initialize)?;
            return root
                .find_reference(&key)
                .map(|r| r as ObjectRef)
                .ok_or_else(|| SystemException::object_not_exist(omg_minor(2)));
        }
        // Cross-domain: codec unmarshal paths cannot suspend; use the
        // registry's synchronous resolution against the shared cache.
        let reference = self.remote.resolve_sync(ior)?;
        Ok(reference as ObjectRef)
    }
}
