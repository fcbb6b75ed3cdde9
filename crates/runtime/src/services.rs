//! Initial services.
//!
//! A fixed, lexicographically ordered table of service ids, each slot a
//! waitable reference resolved through the standard publish-once pattern.
//! Service servants are activated under the `_sys` adapter; construction
//! runs in the free context under the slot's deadline. Shutdown tears the
//! slots down in inverse order and blocks further binds.

use crate::request_giop::current_ed;
use async_trait::async_trait;
use bytes::Bytes;
use orb_core::deadline::{DeadlineTime, MILLISECOND};
use orb_core::error::{CoreResult, SystemException};
use orb_core::omg_minor;
use orb_core::scheduler::{Scheduler, SchedulerState};
use orb_core::waitable::WaitableRef;
use orb_io::ior::ProtDomainId;
use orb_poa::policy::{
    IdAssignment, IdUniqueness, ImplicitActivation, Lifespan, PolicyTuple, RequestProcessing,
    ServantRetention,
};
use orb_poa::request::{ObjectRef, Request};
use orb_poa::root::PoaRoot;
use orb_poa::servant::Servant;
use orb_poa::Poa;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Resolvable initial-service names. Must stay lexicographically ordered.
const USER_SERVICES: [&str; 6] = [
    "Console",
    "NameService",
    "POACurrent",
    "ProtDomain",
    "RootPOA",
    "SysDomain",
];

/// Slot indices; user services first, internal services after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ServiceId {
    Console = 0,
    NameService = 1,
    PoaCurrent = 2,
    ProtDomain = 3,
    RootPoa = 4,
    SysDomain = 5,
    /// Internal TypeCode factory; not name-resolvable.
    TcFactory = 6,
}

const SERVICE_COUNT: usize = 7;

fn construction_deadline(id: ServiceId) -> DeadlineTime {
    match id {
        // May cause an inter-domain call.
        ServiceId::SysDomain => 10 * MILLISECOND,
        _ => MILLISECOND,
    }
}

fn service_from_index(index: usize) -> ServiceId {
    match index {
        0 => ServiceId::Console,
        1 => ServiceId::NameService,
        2 => ServiceId::PoaCurrent,
        3 => ServiceId::ProtDomain,
        4 => ServiceId::RootPoa,
        5 => ServiceId::SysDomain,
        _ => ServiceId::TcFactory,
    }
}

/// What service factories need to construct their servants.
pub struct ServiceHost {
    pub scheduler: Arc<Scheduler>,
    pub poa_root: Arc<PoaRoot>,
    pub domain_id: ProtDomainId,
    pub is_system_domain: bool,
}

/// The initial-service table.
pub struct Services {
    host: ServiceHost,
    sys_adapter: Mutex<Option<Arc<Poa>>>,
    slots: Vec<Arc<WaitableRef<ObjectRef>>>,
    shut: AtomicBool,
}

impl Services {
    pub fn new(host: ServiceHost) -> Arc<Self> {
        let slots = (0..SERVICE_COUNT)
            .map(|index| {
                Arc::new(WaitableRef::new(construction_deadline(service_from_index(
                    index,
                ))))
            })
            .collect();
        Arc::new(Self {
            host,
            sys_adapter: Mutex::new(None),
            slots,
            shut: AtomicBool::new(false),
        })
    }

    /// Whether `name` is a resolvable initial-service id.
    pub fn is_service_name(name: &str) -> bool {
        USER_SERVICES.binary_search(&name).is_ok()
    }

    /// Resolves a service by name. Unknown names report BAD_PARAM.
    pub async fn bind(self: &Arc<Self>, name: &str) -> CoreResult<ObjectRef> {
        let index = USER_SERVICES
            .binary_search(&name)
            .map_err(|_| SystemException::bad_param(omg_minor(30)))?;
        self.bind_service(service_from_index(index)).await
    }

    /// Resolves a service slot; constructs at most once.
    pub async fn bind_service(self: &Arc<Self>, id: ServiceId) -> CoreResult<ObjectRef> {
        if self.shut.load(Ordering::Acquire)
            || self.host.scheduler.state() != SchedulerState::Running
        {
            return Err(SystemException::initialize());
        }
        let ed = current_ed();
        let slot = self.slots[id as usize].clone();
        if let Some(found) = slot.get_if_constructed() {
            return Ok(found);
        }
        let outcome = match slot.initialize(&ed) {
            Some(guard) => match self.construct(id) {
                Ok(object) => {
                    debug!(service = ?id, "service constructed");
                    guard.finish(object.clone());
                    Ok(object)
                }
                Err(e) => {
                    guard.fail(e.clone());
                    // Service failures are retriable: evict the failure.
                    slot.reset();
                    Err(e)
                }
            },
            None => slot.get(&ed).await,
        };
        outcome
    }

    fn sys_adapter(&self) -> CoreResult<Arc<Poa>> {
        let mut slot = self.sys_adapter.lock();
        if let Some(adapter) = slot.clone() {
            return Ok(adapter);
        }
        let policies = PolicyTuple {
            lifespan: Lifespan::Transient,
            id_uniqueness: IdUniqueness::UniqueId,
            id_assignment: IdAssignment::UserId,
            implicit_activation: ImplicitActivation::NoImplicit,
            servant_retention: ServantRetention::Retain,
            request_processing: RequestProcessing::UseAomOnly,
        };
        let adapter = self
            .host
            .poa_root
            .root_poa()
            .create_poa("_sys", None, policies)
            .map_err(|e| e.to_system())?;
        *slot = Some(adapter.clone());
        Ok(adapter)
    }

    fn activate(&self, id: &[u8], servant: Arc<dyn Servant>) -> CoreResult<ObjectRef> {
        let adapter = self.sys_adapter()?;
        let object_id = Bytes::copy_from_slice(id);
        adapter
            .activate_object_with_id(object_id.clone(), servant)
            .map_err(|e| e.to_system())?;
        let reference = adapter
            .id_to_reference(&object_id)
            .map_err(|e| e.to_system())?;
        Ok(reference as ObjectRef)
    }

    fn construct(&self, id: ServiceId) -> CoreResult<ObjectRef> {
        match id {
            ServiceId::Console => self.activate(b"Console", Arc::new(ConsoleServant)),
            ServiceId::NameService => {
                if !self.host.is_system_domain {
                    // Worker domains reach the name service through the
                    // system domain.
                    return Err(SystemException::transient(omg_minor(1)));
                }
                self.activate(b"NameService", Arc::new(NameServiceServant::default()))
            }
            ServiceId::PoaCurrent => self.activate(b"POACurrent", Arc::new(PoaCurrentServant)),
            ServiceId::ProtDomain => self.activate(
                b"ProtDomain",
                Arc::new(ProtDomainServant {
                    domain_id: self.host.domain_id,
                }),
            ),
            ServiceId::RootPoa => self.activate(
                b"RootPOA",
                Arc::new(RootPoaServant {
                    root: self.host.poa_root.clone(),
                }),
            ),
            ServiceId::SysDomain => self.activate(
                b"SysDomain",
                Arc::new(SysDomainServant {
                    domain_id: self.host.domain_id,
                    is_system: self.host.is_system_domain,
                }),
            ),
            ServiceId::TcFactory => self.activate(b"TCFactory", Arc::new(TcFactoryServant)),
        }
    }

    /// Blocks further binds and tears the table down in inverse order.
    pub async fn shutdown(&self) {
        self.shut.store(true, Ordering::Release);
        let adapter = self.sys_adapter.lock().clone();
        for index in (0..SERVICE_COUNT).rev() {
            if self.slots[index].get_if_constructed().is_some() {
                if let Some(adapter) = &adapter {
                    let id = service_object_id(service_from_index(index));
                    let _ = adapter.deactivate_object(&Bytes::copy_from_slice(id)).await;
                }
                self.slots[index].reset();
            }
        }
        info!("initial services torn down");
    }
}

fn service_object_id(id: ServiceId) -> &'static [u8] {
    match id {
        ServiceId::Console => b"Console",
        ServiceId::NameService => b"NameService",
        ServiceId::PoaCurrent => b"POACurrent",
        ServiceId::ProtDomain => b"ProtDomain",
        ServiceId::RootPoa => b"RootPOA",
        ServiceId::SysDomain => b"SysDomain",
        ServiceId::TcFactory => b"TCFactory",
    }
}

// Service servants.

/// Sink for diagnostic text.
struct ConsoleServant;

#[async_trait]
impl Servant for ConsoleServant {
    fn primary_interface(&self) -> String {
        "IDL:orb/Console:1.0".into()
    }

    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
        match operation {
            "write" => {
                let text = request.codec_mut().read_string()?;
                info!(target: "console", "{text}");
                Ok(())
            }
            _ => Err(SystemException::new(
                orb_core::error::ExceptionKind::BadOperation,
                0,
                orb_core::error::CompletionStatus::No,
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Flat in-memory naming, hosted by the system domain.
#[derive(Default)]
struct NameServiceServant {
    bindings: Mutex<HashMap<String, ObjectRef>>,
}

#[async_trait]
impl Servant for NameServiceServant {
    fn primary_interface(&self) -> String {
        "IDL:orb/NameService:1.0".into()
    }

    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
        match operation {
            "bind" => {
                let name = request.codec_mut().read_string()?;
                let object = request
                    .codec_mut()
                    .read_object()?
                    .ok_or_else(|| SystemException::bad_param(omg_minor(43)))?;
                self.bindings.lock().insert(name, object);
                Ok(())
            }
            "resolve" => {
                let name = request.codec_mut().read_string()?;
                let object = self.bindings.lock().get(&name).cloned();
                match object {
                    Some(object) => request.codec_mut().write_object(Some(&object)),
                    None => Err(SystemException::object_not_exist(omg_minor(2))),
                }
            }
            "unbind" => {
                let name = request.codec_mut().read_string()?;
                self.bindings.lock().remove(&name);
                Ok(())
            }
            _ => Err(SystemException::new(
                orb_core::error::ExceptionKind::BadOperation,
                0,
                orb_core::error::CompletionStatus::No,
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Pseudo-object slot for `PortableServer::Current`; the typed accessors
/// live on [`orb_poa::Current`].
struct PoaCurrentServant;

#[async_trait]
impl Servant for PoaCurrentServant {
    fn primary_interface(&self) -> String {
        "IDL:orb/POACurrent:1.0".into()
    }

    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
        match operation {
            "get_object_id" => {
                let ed = current_ed();
                let id = orb_poa::Current::get_object_id(&ed).map_err(|e| e.to_system())?;
                request.codec_mut().out().write_octet_seq(&id);
                Ok(())
            }
            _ => Err(SystemException::new(
                orb_core::error::ExceptionKind::BadOperation,
                0,
                orb_core::error::CompletionStatus::No,
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// This protection domain.
struct ProtDomainServant {
    domain_id: ProtDomainId,
}

#[async_trait]
impl Servant for ProtDomainServant {
    fn primary_interface(&self) -> String {
        "IDL:orb/ProtDomain:1.0".into()
    }

    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
        match operation {
            "id" => {
                request.codec_mut().out().write_u32(self.domain_id);
                Ok(())
            }
            _ => Err(SystemException::new(
                orb_core::error::ExceptionKind::BadOperation,
                0,
                orb_core::error::CompletionStatus::No,
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The adapter-tree entry point.
pub struct RootPoaServant {
    root: Arc<PoaRoot>,
}

impl RootPoaServant {
    /// The root scope behind the service object.
    pub fn poa_root(&self) -> Arc<PoaRoot> {
        self.root.clone()
    }
}

#[async_trait]
impl Servant for RootPoaServant {
    fn primary_interface(&self) -> String {
        "IDL:orb/RootPOA:1.0".into()
    }

    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
        match operation {
            "the_name" => {
                request
                    .codec_mut()
                    .out()
                    .write_string(self.root.root_poa().the_name());
                Ok(())
            }
            _ => Err(SystemException::new(
                orb_core::error::ExceptionKind::BadOperation,
                0,
                orb_core::error::CompletionStatus::No,
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The system-domain face of this host.
struct SysDomainServant {
    domain_id: ProtDomainId,
    is_system: bool,
}

#[async_trait]
impl Servant for SysDomainServant {
    fn primary_interface(&self) -> String {
        "IDL:orb/SysDomain:1.0".into()
    }

    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
        match operation {
            "domain_id" => {
                request.codec_mut().out().write_u32(self.domain_id);
                Ok(())
            }
            "is_system" => {
                request.codec_mut().out().write_bool(self.is_system);
                Ok(())
            }
            _ => Err(SystemException::new(
                orb_core::error::ExceptionKind::BadOperation,
                0,
                orb_core::error::CompletionStatus::No,
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Internal TypeCode factory slot. The dynamic factory surface is an
/// external collaborator; the slot only anchors lifetime ordering.
struct TcFactoryServant;

#[async_trait]
impl Servant for TcFactoryServant {
    fn primary_interface(&self) -> String {
        "IDL:orb/TypeCodeFactory:1.0".into()
    }

    async fn dispatch(&self, _operation: &str, _request: &mut dyn Request) -> CoreResult<()> {
        Err(SystemException::no_implement())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
