//! The remote-reference registry.
//!
//! Owned by the binder's sync domain: a map of peer domains and a map of
//! remote references, each entry a waitable reference so concurrent
//! unmarshals of the same address construct exactly one peer and one
//! reference.

use crate::domain::Domain;
use crate::reference_remote::ReferenceRemote;
use crate::request_giop::CodecEnv;
use crate::transport::EsiopTransport;
use orb_core::deadline::{DeadlineTime, CROSS_DOMAIN_DEADLINE};
use orb_core::error::CoreResult;
use orb_core::exec_domain::ExecDomain;
use orb_core::waitable::WaitableRef;
use orb_esiop::other_domain::PlatformSizes;
use orb_io::ior::{DomainAddress, Ior};
use orb_io::object_key::ObjectKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type DomainSlot = Arc<WaitableRef<Arc<Domain>>>;
type ReferenceSlot = Arc<WaitableRef<Arc<ReferenceRemote>>>;

/// Registry of peer domains and remote references.
pub struct RemoteReferences {
    transport: Arc<EsiopTransport>,
    env: Mutex<Option<CodecEnv>>,
    domains: Mutex<HashMap<DomainAddress, DomainSlot>>,
    references: Mutex<HashMap<(DomainAddress, ObjectKey), ReferenceSlot>>,
}

impl RemoteReferences {
    pub fn new(transport: Arc<EsiopTransport>) -> Self {
        Self {
            transport,
            env: Mutex::new(None),
            domains: Mutex::new(HashMap::new()),
            references: Mutex::new(HashMap::new()),
        }
    }

    /// Installs the marshaling environment once the binder exists.
    pub fn set_env(&self, env: CodecEnv) {
        *self.env.lock() = Some(env);
    }

    fn env(&self) -> CodecEnv {
        self.env.lock().clone().unwrap_or_else(CodecEnv::bare)
    }

    /// Finds or creates the peer domain at `address`. Platform sizes come
    /// from the handshake; same-width is assumed for local peers.
    pub async fn get_domain(
        &self,
        ed: &Arc<ExecDomain>,
        address: &DomainAddress,
    ) -> CoreResult<Arc<Domain>> {
        let slot = self
            .domains
            .lock()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(WaitableRef::new(CROSS_DOMAIN_DEADLINE)))
            .clone();
        let outcome = if let Some(guard) = slot.initialize(ed) {
            let domain = match address {
                DomainAddress::Esiop(peer) => {
                    Domain::local(*peer, self.transport.clone(), PlatformSizes::default())
                }
                DomainAddress::Iiop { host, port } => {
                    Domain::remote(host.clone(), *port, PlatformSizes::default())
                }
            };
            debug!(address = ?address, "peer domain created");
            guard.finish(domain.clone());
            Ok(domain)
        } else {
            slot.get(ed).await
        };
        outcome
    }

    /// Finds or creates the remote reference behind `ior`.
    pub async fn unmarshal(
        &self,
        ed: &Arc<ExecDomain>,
        mut ior: Ior,
    ) -> CoreResult<Arc<ReferenceRemote>> {
        ior.canonicalize();
        let (address, key, flags) = ior.primary_address()?;
        let domain = self.get_domain(ed, &address).await?;
        let slot = self
            .references
            .lock()
            .entry((address.clone(), key.clone()))
            .or_insert_with(|| Arc::new(WaitableRef::new(CROSS_DOMAIN_DEADLINE)))
            .clone();
        let outcome = if let Some(guard) = slot.initialize(ed) {
            let reference = ReferenceRemote::new(
                ior.clone(),
                domain,
                key,
                ior.type_id.clone(),
                flags,
                self.env(),
            );
            guard.finish(reference.clone());
            Ok(reference)
        } else {
            slot.get(ed).await
        };
        outcome
    }

    /// Synchronous resolution for codec unmarshal paths, which cannot
    /// suspend. Domain and reference construction are themselves
    /// synchronous; the waitable slots are still consulted first so the
    /// cache stays shared with the async path. A writer racing mid-
    /// construction yields an equivalent unregistered instance.
    pub fn resolve_sync(&self, ior: &Ior) -> CoreResult<Arc<ReferenceRemote>> {
        let ed = crate::request_giop::current_ed();
        let mut ior = ior.clone();
        ior.canonicalize();
        let (address, key, flags) = ior.primary_address()?;

        let make_domain = || match &address {
            DomainAddress::Esiop(peer) => {
                Domain::local(*peer, self.transport.clone(), PlatformSizes::default())
            }
            DomainAddress::Iiop { host, port } => {
                Domain::remote(host.clone(), *port, PlatformSizes::default())
            }
        };
        let domain_slot = self
            .domains
            .lock()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(WaitableRef::new(CROSS_DOMAIN_DEADLINE)))
            .clone();
        let domain = match domain_slot.get_if_constructed() {
            Some(domain) => domain,
            None => match domain_slot.initialize(&ed) {
                Some(guard) => {
                    let domain = make_domain();
                    guard.finish(domain.clone());
                    domain
                }
                None => make_domain(),
            },
        };

        let reference_slot = self
            .references
            .lock()
            .entry((address.clone(), key.clone()))
            .or_insert_with(|| Arc::new(WaitableRef::new(CROSS_DOMAIN_DEADLINE)))
            .clone();
        let make_reference = || {
            ReferenceRemote::new(
                ior.clone(),
                domain.clone(),
                key.clone(),
                ior.type_id.clone(),
                flags,
                self.env(),
            )
        };
        let reference = match reference_slot.get_if_constructed() {
            Some(reference) => reference,
            None => match reference_slot.initialize(&ed) {
                Some(guard) => {
                    let reference = make_reference();
                    guard.finish(reference.clone());
                    reference
                }
                None => make_reference(),
            },
        };
        Ok(reference)
    }

    /// Drops a dead peer and fails everything pending to it.
    pub fn erase_domain(&self, address: &DomainAddress) {
        self.domains.lock().remove(address);
        self.references
            .lock()
            .retain(|(domain_address, _), _| domain_address != address);
        self.transport.fail_all_pending();
    }

    /// Drops one cached reference.
    pub fn erase_reference(&self, address: &DomainAddress, key: &ObjectKey) {
        self.references
            .lock()
            .remove(&(address.clone(), key.clone()));
    }

    /// Evicts unused references whose release window has expired.
    pub fn sweep(&self, window: DeadlineTime) {
        self.references.lock().retain(|_, slot| {
            match slot.get_if_constructed() {
                Some(reference) => !reference.release_expired(window),
                None => true,
            }
        });
    }

    /// The cached peer at `address`, if constructed.
    pub fn find_domain(&self, address: &DomainAddress) -> Option<Arc<Domain>> {
        self.domains
            .lock()
            .get(address)
            .and_then(|slot| slot.get_if_constructed())
    }

    /// Live peer domains (diagnostics).
    pub fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains
            .lock()
            .values()
            .filter_map(|slot| slot.get_if_constructed())
            .collect()
    }

    pub fn reference_count(&self) -> usize {
        self.references.lock().len()
    }

    /// Clears everything at terminate.
    pub fn clear(&self) {
        self.references.lock().clear();
        self.domains.lock().clear();
        self.transport.fail_all_pending();
    }
}
