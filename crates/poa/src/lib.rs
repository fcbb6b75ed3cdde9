//! Portable Object Adapter for the ORB runtime.
//!
//! The POA tree maps object keys to servants under the six-axis policy
//! mix: lifespan, id uniqueness, id assignment, implicit activation,
//! servant retention, and request processing. Managers gate dispatch with
//! a deadline-ordered pending queue; servant proxies carry the sync
//! context; local references are owned by the root scope, one per
//! canonical key.

pub mod current;
pub mod error;
pub mod manager;
pub mod poa;
pub mod policy;
pub mod proxy;
pub mod reference;
pub mod request;
pub mod request_local;
pub mod root;
pub mod servant;

pub use current::{Current, CurrentGuard, DispatchContext};
pub use error::{PoaError, PoaResult};
pub use manager::{ManagerState, PoaManager, PoaManagerFactory};
pub use poa::Poa;
pub use policy::{
    IdAssignment, IdUniqueness, ImplicitActivation, Lifespan, PolicySet, PolicyTuple,
    PolicyValue, RequestProcessing, ServantRetention,
};
pub use proxy::ServantProxyObject;
pub use reference::{ProxyCountGuard, ReferenceLocal};
pub use request::{
    ExceptionHolder, InboundRequest, ObjectInterface, ObjectRef, ObjectResolver, Request,
    RequestCodec,
};
pub use request_local::{AsyncCallHandle, RequestLocal, RequestLocalPoa};
pub use root::PoaRoot;
pub use servant::{
    AdapterActivator, Servant, ServantActivator, ServantLocator, ServantManager,
};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use orb_core::config::RuntimeConfig;
    use orb_core::deadline::INFINITE_DEADLINE;
    use orb_core::error::CoreResult;
    use orb_core::exec_domain::ExecDomain;
    use orb_core::scheduler::Scheduler;
    use orb_io::ior::DomainAddress;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct EchoServant;

    #[async_trait]
    impl Servant for EchoServant {
        fn primary_interface(&self) -> String {
            "IDL:acme/Echo:1.0".into()
        }

        async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
            match operation {
                "bump" => {
                    let value = request.codec_mut().input()?.read_u32()?;
                    request.codec_mut().out().write_u32(value + 1);
                    Ok(())
                }
                _ => Err(orb_core::error::SystemException::new(
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

    fn fresh_root() -> Arc<PoaRoot> {
        let scheduler = Scheduler::new(RuntimeConfig::default());
        PoaRoot::new(scheduler, DomainAddress::Esiop(1)).expect("root")
    }

    async fn in_ed<F: std::future::Future>(fut: F) -> F::Output {
        ExecDomain::new(INFINITE_DEADLINE).scope(fut).await
    }

    #[tokio::test]
    async fn transient_system_ids_embed_the_counter() {
        in_ed(async {
            let root = fresh_root();
            let poa = root.root_poa();

            let s1: Arc<dyn Servant> = Arc::new(EchoServant);
            let s2: Arc<dyn Servant> = Arc::new(EchoServant);

            // Implicit activation through servant_to_id; the id is stable.
            let id1 = poa.servant_to_id(&s1).unwrap();
            assert_eq!(poa.servant_to_id(&s1).unwrap(), id1);
            let id2 = poa.servant_to_id(&s2).unwrap();
            assert_ne!(id1, id2);

            let c1 = u64::from_be_bytes(id1.as_ref().try_into().unwrap());
            let c2 = u64::from_be_bytes(id2.as_ref().try_into().unwrap());
            assert_eq!(c1, 0);
            assert_eq!(c2, 1);
        })
        .await;
    }

    #[tokio::test]
    async fn unique_id_rejects_second_activation() {
        in_ed(async {
            let root = fresh_root();
            let poa = root.root_poa();
            let servant: Arc<dyn Servant> = Arc::new(EchoServant);
            poa.activate_object_with_id(Bytes::from_static(b"a"), servant.clone())
                .unwrap();
            let err = poa
                .activate_object_with_id(Bytes::from_static(b"b"), servant)
                .expect_err("unique id");
            assert_eq!(err, PoaError::ServantAlreadyActive);
        })
        .await;
    }

    #[tokio::test]
    async fn activate_deactivate_activate_again() {
        in_ed(async {
            let root = fresh_root();
            let poa = root.root_poa();
            let servant: Arc<dyn Servant> = Arc::new(EchoServant);
            let id = Bytes::from_static(b"stable-id");
            poa.activate_object_with_id(id.clone(), servant.clone())
                .unwrap();
            poa.deactivate_object(&id).await.unwrap();
            poa.activate_object_with_id(id.clone(), servant).unwrap();
            assert!(poa.id_to_servant(&id).is_ok());
        })
        .await;
    }

    #[tokio::test]
    async fn duplicate_child_names_are_rejected() {
        in_ed(async {
            let root = fresh_root();
            let poa = root.root_poa();
            poa.create_poa("workers", None, PolicyTuple::default())
                .unwrap();
            let err = poa
                .create_poa("workers", None, PolicyTuple::default())
                .expect_err("duplicate");
            assert_eq!(err, PoaError::AdapterAlreadyExists);
        })
        .await;
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        in_ed(async {
            let root = fresh_root();
            let poa = root.root_poa();
            let child = poa
                .create_poa("ephemeral", None, PolicyTuple::default())
                .unwrap();
            child.destroy(true, true).await.unwrap();
            child.destroy(true, true).await.unwrap();
            assert!(child.is_destroyed());
            assert!(poa.find_poa("ephemeral", false).await.is_err());
        })
        .await;
    }

    #[tokio::test]
    async fn local_request_round_trip() {
        in_ed(async {
            let root = fresh_root();
            let poa = root.root_poa();
            let servant: Arc<dyn Servant> = Arc::new(EchoServant);
            let id = poa.activate_object(servant.clone()).unwrap();
            let reference = poa.id_to_reference(&id).unwrap();
            let proxy = reference.servant_proxy().expect("active");

            let mut request = RequestLocal::new(proxy, "bump");
            request.codec_mut().out().write_u32(41);
            request.invoke().await.unwrap();
            assert_eq!(request.codec_mut().input().unwrap().read_u32().unwrap(), 42);
        })
        .await;
    }

    #[tokio::test]
    async fn active_reference_holds_one_servant_count() {
        in_ed(async {
            let root = fresh_root();
            let poa = root.root_poa();
            let servant: Arc<dyn Servant> = Arc::new(EchoServant);
            let id = poa.activate_object(servant).unwrap();
            let reference = poa.id_to_reference(&id).unwrap();
            let proxy = reference.servant_proxy().expect("active");
            // The activation contributes exactly one count.
            assert_eq!(proxy.ref_count(), 1);
            poa.deactivate_object(&id).await.unwrap();
            assert_eq!(proxy.ref_count(), 0);
        })
        .await;
    }

    #[tokio::test]
    async fn dropped_collectable_reference_is_reaped() {
        use orb_core::deadline::MILLISECOND;
        let scheduler = Scheduler::new(RuntimeConfig {
            proxy_gc_deadline: MILLISECOND,
            ..RuntimeConfig::default()
        });
        let root = PoaRoot::new(scheduler, DomainAddress::Esiop(1)).expect("root");
        let poa = root.root_poa();
        let reference = ExecDomain::new(INFINITE_DEADLINE)
            .scope(async {
                let servant: Arc<dyn Servant> = Arc::new(EchoServant);
                let id = poa.activate_object(servant).unwrap();
                poa.id_to_reference(&id).unwrap()
            })
            .await;
        assert!(reference.is_active());

        // The last external count drops: the revive-or-die pass runs
        // after the GC window and deactivates the untouched reference.
        reference.add_ref();
        reference.remove_ref();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert!(!reference.is_active());
    }

    #[tokio::test]
    async fn concurrent_adapter_misses_activate_once() {
        struct CountingActivator {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl AdapterActivator for CountingActivator {
            async fn unknown_adapter(&self, parent: &Arc<Poa>, name: &str) -> PoaResult<bool> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                parent.create_poa(name, None, PolicyTuple::default())?;
                Ok(true)
            }
        }

        let root = fresh_root();
        let poa = root.root_poa();
        let activator = Arc::new(CountingActivator {
            calls: AtomicUsize::new(0),
        });
        poa.set_activator(Some(activator.clone()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let poa = poa.clone();
            tasks.push(tokio::spawn(async move {
                ExecDomain::new(INFINITE_DEADLINE)
                    .scope(async move { poa.find_poa("lazy", true).await.map(|p| p.the_name().to_owned()) })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "lazy");
        }
        assert_eq!(activator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manager_releases_held_requests_in_deadline_order() {
        use orb_core::deadline::{Clock, MILLISECOND};

        struct RecordingServant {
            seen: Arc<parking_lot::Mutex<Vec<u32>>>,
        }

        #[async_trait]
        impl Servant for RecordingServant {
            fn primary_interface(&self) -> String {
                "IDL:acme/Recorder:1.0".into()
            }

            async fn dispatch(
                &self,
                _operation: &str,
                request: &mut dyn Request,
            ) -> CoreResult<()> {
                let tag = request.codec_mut().input()?.read_u32()?;
                self.seen.lock().push(tag);
                Ok(())
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let root = fresh_root();
        let poa = root.root_poa();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let servant: Arc<dyn Servant> = Arc::new(RecordingServant { seen: seen.clone() });
        let id = ExecDomain::new(INFINITE_DEADLINE)
            .scope(async { poa.activate_object(servant.clone()) })
            .await
            .unwrap();
        let key = orb_io::object_key::ObjectKey::new(Vec::new(), id);

        // Manager starts HOLDING; submit three requests with deadlines
        // 100 ms, 50 ms, 75 ms.
        for (tag, deadline_ms) in [(100u32, 100u64), (50, 50), (75, 75)] {
            let root = root.clone();
            let key = key.clone();
            let ed = ExecDomain::new(Clock::make_deadline(deadline_ms * MILLISECOND));
            ed.scope(async move {
                let (mut request, _handle) = RequestLocalPoa::new("record");
                request.codec_mut().out().write_u32(tag);
                request.submit(&root, key).await.unwrap();
            })
            .await;
        }

        assert!(seen.lock().is_empty());
        root.default_manager().activate().unwrap();
        // Drained dispatches run as scheduler activities.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(*seen.lock(), vec![50, 75, 100]);
    }
}
