//! End-to-end scenarios across the request-and-object plane.

use async_trait::async_trait;
use bytes::Bytes;
use orb_core::config::RuntimeConfig;
use orb_core::deadline::{Clock, INFINITE_DEADLINE, MILLISECOND};
use orb_core::error::{CoreResult, ExceptionKind, RequestException, SystemException};
use orb_core::exec_domain::ExecDomain;
use orb_esiop::post_office::PostOffice;
use orb_esiop::shared_mem::HostMemory;
use orb_io::ior::{DomainAddress, Ior};
use orb_io::object_key::ObjectKey;
use orb_io::typecode::{tc_equal, tc_equivalent, StructMember, TypeCode};
use orb_poa::policy::{
    IdAssignment, IdUniqueness, ImplicitActivation, Lifespan, PolicyTuple, RequestProcessing,
    ServantRetention,
};
use orb_poa::request::{InboundRequest, Request, RequestCodec};
use orb_poa::request_local::RequestLocalPoa;
use orb_poa::servant::{Servant, ServantActivator, ServantManager};
use orb_poa::{Poa, PoaError, PoaResult};
use orb_runtime::system::OrbSystem;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

fn fabric() -> (Arc<PostOffice>, Arc<HostMemory>) {
    (PostOffice::new(), HostMemory::new())
}

fn start_domain(
    id: u32,
    is_system: bool,
    post: &Arc<PostOffice>,
    host: &Arc<HostMemory>,
) -> Arc<OrbSystem> {
    OrbSystem::start(
        RuntimeConfig::default(),
        id,
        is_system,
        post.clone(),
        host.clone(),
    )
    .expect("domain starts")
}

async fn in_ed<F: std::future::Future>(deadline: u64, fut: F) -> F::Output {
    ExecDomain::new(deadline).scope(fut).await
}

struct EchoBytesServant;

#[async_trait]
impl Servant for EchoBytesServant {
    fn primary_interface(&self) -> String {
        "IDL:acme/Blob:1.0".into()
    }

    async fn dispatch(&self, operation: &str, request: &mut dyn Request) -> CoreResult<()> {
        match operation {
            "blob" => {
                let n = request.codec_mut().input()?.read_u32()? as usize;
                request.codec_mut().out().write_octets(&vec![0xE5; n]);
                Ok(())
            }
            "short" => {
                let v = request.codec_mut().input()?.read_i16()?;
                request.codec_mut().out().write_i16(v + 1);
                Ok(())
            }
            _ => Err(SystemException::new(
                ExceptionKind::BadOperation,
                0,
                orb_core::error::CompletionStatus::No,
            )),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// S1: two racing binds construct the service once and observe the same
// reference.
#[tokio::test]
async fn s1_lazy_service_bind_races_once() {
    let (post, host) = fabric();
    let system = start_domain(1, true, &post, &host);

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let system = system.clone();
        tasks.push(tokio::spawn(async move {
            in_ed(INFINITE_DEADLINE, async move { system.bind("RootPOA").await }).await
        }));
    }
    let mut refs = Vec::new();
    for task in tasks {
        refs.push(task.await.unwrap().expect("bind succeeds"));
    }
    assert!(Arc::ptr_eq(&refs[0], &refs[1]));

    // A later bind still sees the same slot.
    let again = in_ed(INFINITE_DEADLINE, async { system.bind("RootPOA").await })
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&refs[0], &again));
}

// S2: TRANSIENT SYSTEM_ID unique-id activation with stable embedded
// counters.
#[tokio::test]
async fn s2_transient_system_id_activation() {
    let (post, host) = fabric();
    let system = start_domain(1, true, &post, &host);
    let poa = system.poa_root().root_poa();

    in_ed(INFINITE_DEADLINE, async {
        let s1: Arc<dyn Servant> = Arc::new(EchoBytesServant);
        let s2: Arc<dyn Servant> = Arc::new(EchoBytesServant);

        // Implicit activation on first use; the id is stable afterwards.
        let id1 = poa.servant_to_id(&s1).unwrap();
        assert_eq!(poa.servant_to_id(&s1).unwrap(), id1);

        let id2 = poa.servant_to_id(&s2).unwrap();
        assert_ne!(id1, id2);

        let c1 = u64::from_be_bytes(id1.as_ref().try_into().unwrap());
        let c2 = u64::from_be_bytes(id2.as_ref().try_into().unwrap());
        assert_eq!((c1, c2), (0, 1));
    })
    .await;
}

// S3: USER_ID + PERSISTENT + servant manager under a HOLDING manager:
// incarnate runs once, dispatch order follows deadlines.
#[tokio::test]
async fn s3_holding_manager_dispatches_in_deadline_order() {
    struct OrderActivator {
        incarnations: AtomicUsize,
        seen: Arc<parking_lot::Mutex<Vec<u32>>>,
    }

    struct OrderServant {
        seen: Arc<parking_lot::Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl Servant for OrderServant {
        fn primary_interface(&self) -> String {
            "IDL:acme/Ordered:1.0".into()
        }

        async fn dispatch(&self, _operation: &str, request: &mut dyn Request) -> CoreResult<()> {
            let tag = request.codec_mut().input()?.read_u32()?;
            self.seen.lock().push(tag);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[async_trait]
    impl ServantActivator for OrderActivator {
        async fn incarnate(
            &self,
            _object_id: &Bytes,
            _adapter: &Arc<Poa>,
        ) -> PoaResult<Arc<dyn Servant>> {
            self.incarnations.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(OrderServant {
                seen: self.seen.clone(),
            }))
        }

        async fn etherealize(
            &self,
            _object_id: &Bytes,
            _adapter: &Arc<Poa>,
            _servant: Arc<dyn Servant>,
            _cleanup_in_progress: bool,
            _remaining_activations: bool,
        ) {
        }
    }

    let (post, host) = fabric();
    let system = start_domain(1, true, &post, &host);
    let root = system.poa_root();

    let manager = root.manager_factory().create("held").unwrap();
    let policies = PolicyTuple {
        lifespan: Lifespan::Persistent,
        id_uniqueness: IdUniqueness::UniqueId,
        id_assignment: IdAssignment::UserId,
        implicit_activation: ImplicitActivation::NoImplicit,
        servant_retention: ServantRetention::Retain,
        request_processing: RequestProcessing::UseServantManager,
    };
    let poa = root
        .root_poa()
        .create_poa("P", Some(manager.clone()), policies)
        .unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let activator = Arc::new(OrderActivator {
        incarnations: AtomicUsize::new(0),
        seen: seen.clone(),
    });
    poa.set_servant_manager(ServantManager::Activator(activator.clone()))
        .unwrap();

    let key = ObjectKey::new(vec!["P".into()], Bytes::from_static(b"abc"));
    for (tag, deadline_ms) in [(100u32, 100u64), (50, 50), (75, 75)] {
        let root = root.clone();
        let key = key.clone();
        in_ed(Clock::make_deadline(deadline_ms * MILLISECOND), async move {
            let (mut request, _handle) = RequestLocalPoa::new("record");
            request.codec_mut().out().write_u32(tag);
            request.submit(&root, key).await.unwrap();
        })
        .await;
    }
    assert!(seen.lock().is_empty());

    manager.activate().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    assert_eq!(activator.incarnations.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), vec![50, 75, 100]);
}

// S4: a small reply rides the immediate path with no shared-memory
// allocation; a 48-byte reply takes the shared-memory path.
#[tokio::test]
async fn s4_immediate_reply_fast_path() {
    let (post, host) = fabric();
    let domain_a = start_domain(1, true, &post, &host);
    let domain_b = start_domain(2, false, &post, &host);
    domain_b.run().unwrap();

    // Activate the target servant in B.
    let key = in_ed(INFINITE_DEADLINE, async {
        let poa = domain_b.poa_root().root_poa();
        let id = poa
            .activate_object(Arc::new(EchoBytesServant) as Arc<dyn Servant>)
            .unwrap();
        ObjectKey::root(id)
    })
    .await;
    let ior = Ior::for_domain("IDL:acme/Blob:1.0", &DomainAddress::Esiop(2), &key, 0);

    let a_arena = host.arena(1);

    // Two-way request whose reply body is one short: immediate path.
    let reference = domain_a
        .binder()
        .unmarshal_remote_reference(ior.clone())
        .await
        .unwrap();
    let allocated_before = a_arena.total_allocated();
    let value = in_ed(Clock::make_deadline(500 * MILLISECOND), async {
        let mut request = reference.create_request("short", true).unwrap();
        request.codec_mut().out().write_i16(20);
        request.invoke().await.unwrap();
        request.codec_mut().input().unwrap().read_i16()
    })
    .await
    .unwrap();
    assert_eq!(value, 21);
    // No shared memory was allocated in A for the reply.
    assert_eq!(a_arena.total_allocated(), allocated_before);

    // A 48-byte reply exceeds the immediate budget: shared-memory path.
    let allocated_before = a_arena.total_allocated();
    let body = in_ed(Clock::make_deadline(500 * MILLISECOND), async {
        let mut request = reference.create_request("blob", true).unwrap();
        request.codec_mut().out().write_u32(48);
        request.invoke().await.unwrap();
        request.codec_mut().input().unwrap().read_octets(48)
    })
    .await
    .unwrap();
    assert_eq!(body.len(), 48);
    assert!(body.iter().all(|&b| b == 0xE5));
    assert!(a_arena.total_allocated() > allocated_before);
    // The caller freed the block after unmarshal.
    assert_eq!(a_arena.live_blocks(), 0);
}

// S5: a self-referential TypeCode survives a marshal round trip.
#[tokio::test]
async fn s5_typecode_cycle_round_trip() {
    let id = "IDL:acme/S:1.0";
    let tc = TypeCode::structure(
        id,
        "S",
        vec![
            StructMember {
                name: "x".into(),
                tc: TypeCode::long(),
            },
            StructMember {
                name: "next".into(),
                tc: TypeCode::sequence(TypeCode::recursive(id), 0),
            },
        ],
    );

    let mut codec = RequestCodec::cdr(
        orb_io::stream::StreamOut::new(),
        2,
        Arc::new(orb_io::value::ValueFactoryRegistry::new()),
        None,
    );
    codec.write_typecode(&tc).unwrap();
    codec.flip();
    let decoded = codec.read_typecode().unwrap();

    assert!(tc_equal(&tc, &decoded));
    assert!(tc_equivalent(&tc, &decoded));
}

// S6: destroy with wait_for_completion blocks on the in-flight request;
// new requests to the destroyed adapter get OBJ_ADAPTER; destroying from
// inside a dispatched request raises BAD_INV_ORDER(3).
#[tokio::test]
async fn s6_shutdown_during_in_flight_request() {
    struct SlowServant {
        release: Arc<Notify>,
        adapter: parking_lot::Mutex<Weak<Poa>>,
    }

    #[async_trait]
    impl Servant for SlowServant {
        fn primary_interface(&self) -> String {
            "IDL:acme/Slow:1.0".into()
        }

        async fn dispatch(&self, operation: &str, _request: &mut dyn Request) -> CoreResult<()> {
            match operation {
                "wait" => {
                    self.release.notified().await;
                    Ok(())
                }
                "self_destroy" => {
                    let adapter = self
                        .adapter
                        .lock()
                        .upgrade()
                        .ok_or_else(|| SystemException::internal(0))?;
                    // Destroying with wait-for-completion from inside the
                    // dispatched request must refuse.
                    match adapter.destroy(true, true).await {
                        Err(PoaError::System(e)) => {
                            assert_eq!(e.kind, ExceptionKind::BadInvOrder);
                            assert_eq!(e.minor, orb_core::omg_minor(3));
                            Ok(())
                        }
                        other => panic!("expected BAD_INV_ORDER, got {other:?}"),
                    }
                }
                _ => Err(SystemException::no_implement()),
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let (post, host) = fabric();
    let system = start_domain(1, true, &post, &host);
    system.run().unwrap();
    let root = system.poa_root();

    let poa = root
        .root_poa()
        .create_poa("P", None, PolicyTuple::root())
        .unwrap();
    let release = Arc::new(Notify::new());
    let servant = Arc::new(SlowServant {
        release: release.clone(),
        adapter: parking_lot::Mutex::new(Arc::downgrade(&poa)),
    });

    let id = in_ed(INFINITE_DEADLINE, async {
        poa.activate_object(servant.clone() as Arc<dyn Servant>)
    })
    .await
    .unwrap();
    let key = ObjectKey::new(vec!["P".into()], id.clone());

    // Launch the in-flight request.
    let inflight = {
        let root = root.clone();
        let key = key.clone();
        tokio::spawn(async move {
            in_ed(INFINITE_DEADLINE, async move {
                let (request, handle) = RequestLocalPoa::new("wait");
                request.submit(&root, key).await.unwrap();
                handle
            })
            .await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(poa.outstanding_requests(), 1);

    // Destroy from a non-dispatched ED blocks until the request drains.
    let destroyer = {
        let poa = poa.clone();
        tokio::spawn(async move {
            in_ed(INFINITE_DEADLINE, async move { poa.destroy(true, true).await }).await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(!destroyer.is_finished());

    release.notify_one();
    destroyer.await.unwrap().unwrap();
    let handle = inflight.await.unwrap();
    assert!(handle.wait().await.is_ok());

    // A new request to the destroyed adapter reports OBJ_ADAPTER.
    let refusal = in_ed(INFINITE_DEADLINE, async {
        let (request, handle) = RequestLocalPoa::new("wait");
        let inbound = InboundRequest::new(key.clone(), Box::new(request));
        poa.serve(inbound).await;
        handle.wait().await
    })
    .await;
    match refusal {
        Err(RequestException::System(e)) => assert_eq!(e.kind, ExceptionKind::ObjAdapter),
        other => panic!("expected OBJ_ADAPTER, got {other:?}"),
    }

    // Destroy is idempotent.
    in_ed(INFINITE_DEADLINE, async { poa.destroy(true, true).await })
        .await
        .unwrap();

    // Destroying with wait_for_completion from inside a dispatched request
    // refuses with BAD_INV_ORDER(3); the servant asserts the refusal.
    let poa2 = root
        .root_poa()
        .create_poa("P2", None, PolicyTuple::root())
        .unwrap();
    let servant2 = Arc::new(SlowServant {
        release: Arc::new(Notify::new()),
        adapter: parking_lot::Mutex::new(Arc::downgrade(&poa2)),
    });
    let id2 = in_ed(INFINITE_DEADLINE, async {
        poa2.activate_object(servant2.clone() as Arc<dyn Servant>)
    })
    .await
    .unwrap();
    let key2 = ObjectKey::new(vec!["P2".into()], id2);
    in_ed(INFINITE_DEADLINE, async {
        let (request, handle) = RequestLocalPoa::new("self_destroy");
        request.submit(&root, key2).await.unwrap();
        handle.wait().await.expect("servant observed the refusal");
    })
    .await;
}

// A POA manager queue at its cap refuses further requests with TRANSIENT.
#[tokio::test]
async fn manager_queue_cap_returns_transient() {
    let (post, host) = fabric();
    let config = RuntimeConfig {
        manager_queue_cap: 1,
        ..RuntimeConfig::default()
    };
    let system = OrbSystem::start(config, 1, true, post, host).unwrap();
    let root = system.poa_root();
    let poa = root.root_poa();

    let id = in_ed(INFINITE_DEADLINE, async {
        poa.activate_object(Arc::new(EchoBytesServant) as Arc<dyn Servant>)
    })
    .await
    .unwrap();
    let key = ObjectKey::root(id);

    // Manager starts HOLDING; the first request queues, the second hits
    // the cap.
    in_ed(INFINITE_DEADLINE, async {
        let (mut request, _h) = RequestLocalPoa::new("short");
        request.codec_mut().out().write_i16(1);
        request.submit(&root, key.clone()).await.unwrap();
    })
    .await;

    let err = in_ed(INFINITE_DEADLINE, async {
        let (mut request, _h) = RequestLocalPoa::new("short");
        request.codec_mut().out().write_i16(2);
        request.submit(&root, key.clone()).await
    })
    .await
    .expect_err("cap exceeded");
    match err {
        PoaError::System(e) => assert_eq!(e.kind, ExceptionKind::Transient),
        other => panic!("unexpected {other:?}"),
    }
}

// Cancel racing ahead of its request tombstones and cancels on arrival;
// exercised at the map level in unit tests, here end-to-end over the
// post office.
#[tokio::test]
async fn cancel_before_request_is_applied_on_arrival() {
    use orb_esiop::messages::Message;

    let (post, host) = fabric();
    let domain_a = start_domain(1, true, &post, &host);
    let domain_b = start_domain(2, false, &post, &host);
    domain_b.run().unwrap();

    let key = in_ed(INFINITE_DEADLINE, async {
        let poa = domain_b.poa_root().root_poa();
        let id = poa
            .activate_object(Arc::new(EchoBytesServant) as Arc<dyn Servant>)
            .unwrap();
        ObjectKey::root(id)
    })
    .await;
    let ior = Ior::for_domain("IDL:acme/Blob:1.0", &DomainAddress::Esiop(2), &key, 0);
    let reference = domain_a
        .binder()
        .unmarshal_remote_reference(ior)
        .await
        .unwrap();

    // Force the cancel ahead of the request by sending it directly.
    let mut request = reference.create_request("short", true).unwrap();
    request.codec_mut().out().write_i16(5);
    post.send(
        2,
        &Message::CancelRequest {
            client_domain: 1,
            request_id: request.request_id(),
        },
    )
    .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let outcome = in_ed(Clock::make_deadline(200 * MILLISECOND), async move {
        request.invoke().await
    })
    .await;
    // The tombstoned cancel rejects the arrival with TRANSIENT.
    let err = outcome.expect_err("cancelled before arrival");
    assert!(matches!(
        err.kind,
        ExceptionKind::Transient | ExceptionKind::Timeout
    ));
    let _ = domain_a;
}

// User exceptions travel through the remote channel typed by repository
// id.
#[tokio::test]
async fn user_exception_round_trip_cross_domain() {
    struct FailingServant;

    #[async_trait]
    impl Servant for FailingServant {
        fn primary_interface(&self) -> String {
            "IDL:acme/Fails:1.0".into()
        }

        async fn dispatch(&self, _operation: &str, request: &mut dyn Request) -> CoreResult<()> {
            let mut payload = orb_io::stream::StreamOut::new();
            payload.write_u32(99);
            request.set_exception(RequestException::User(orb_core::error::UserException::new(
                "IDL:acme/Broken:1.0",
                payload.finish(),
            )));
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    let (post, host) = fabric();
    let domain_a = start_domain(1, true, &post, &host);
    let domain_b = start_domain(2, false, &post, &host);
    domain_b.run().unwrap();

    let key = in_ed(INFINITE_DEADLINE, async {
        let poa = domain_b.poa_root().root_poa();
        let id = poa
            .activate_object(Arc::new(FailingServant) as Arc<dyn Servant>)
            .unwrap();
        ObjectKey::root(id)
    })
    .await;
    let ior = Ior::for_domain("IDL:acme/Fails:1.0", &DomainAddress::Esiop(2), &key, 0);
    let reference = domain_a
        .binder()
        .unmarshal_remote_reference(ior)
        .await
        .unwrap();

    let exception = in_ed(Clock::make_deadline(500 * MILLISECOND), async {
        let mut request = reference.create_request("break", true).unwrap();
        request.invoke().await.unwrap();
        request.get_exception()
    })
    .await;
    match exception {
        Some(RequestException::User(user)) => {
            assert_eq!(user.repository_id, "IDL:acme/Broken:1.0");
            let mut input = orb_io::stream::StreamIn::new(
                user.payload.clone(),
                orb_io::stream::native_little_endian(),
            );
            assert_eq!(input.read_u32().unwrap(), 99);
        }
        other => panic!("expected user exception, got {other:?}"),
    }
}
