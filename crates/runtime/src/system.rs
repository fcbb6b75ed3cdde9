//! The protection-domain runtime.
//!
//! `OrbSystem` assembles one process image: the scheduler, the POA root,
//! the binder, the initial services, and the ESIOP receive loop. A
//! teardown monitor watches the scheduler's lifecycle and unwinds the
//! services, the adapter tree, and the binder as the state machine
//! advances; a periodic task flushes DGC heartbeats and sweeps expired
//! remote references and cancel tombstones.

use crate::binder::Binder;
use crate::domain::{DGC_HEARTBEAT_OP, DGC_OBJECT_ID};
use crate::incoming::IncomingRequests;
use crate::request_giop::RequestGiop;
use crate::request_in::{answer_locate, RequestInEsiop};
use crate::services::{ServiceHost, Services};
use crate::transport::{EsiopTransport, ReplyData};
use bytes::Bytes;
use orb_core::config::RuntimeConfig;
use orb_core::deadline::MILLISECOND;
use orb_core::error::{CoreResult, SystemException};
use orb_core::exec_domain::ExecDomain;
use orb_core::omg_minor;
use orb_core::scheduler::{Scheduler, SchedulerState};
use orb_core::sync::SyncContext;
use orb_esiop::messages::Message;
use orb_esiop::post_office::PostOffice;
use orb_esiop::shared_mem::HostMemory;
use orb_io::giop::{GiopHeader, MsgType, ReplyHeader};
use orb_io::ior::{DomainAddress, ProtDomainId};
use orb_io::object_key::ObjectKey;
use orb_io::stream::StreamIn;
use orb_poa::request::{InboundRequest, ObjectRef, Request};
use orb_poa::root::PoaRoot;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One protection domain's runtime.
pub struct OrbSystem {
    domain_id: ProtDomainId,
    is_system_domain: bool,
    scheduler: Arc<Scheduler>,
    transport: Arc<EsiopTransport>,
    poa_root: Arc<PoaRoot>,
    binder: Arc<Binder>,
    services: Arc<Services>,
    incoming: Arc<IncomingRequests>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrbSystem {
    /// Brings a domain up on the host fabric and starts its receive loop.
    pub fn start(
        config: RuntimeConfig,
        domain_id: ProtDomainId,
        is_system_domain: bool,
        post: Arc<PostOffice>,
        host_mem: Arc<HostMemory>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;
        let scheduler = Scheduler::new(config);
        let transport = EsiopTransport::new(domain_id, post.clone(), host_mem);
        let poa_root = PoaRoot::new(scheduler.clone(), DomainAddress::Esiop(domain_id))
            .map_err(|e| e.to_system())?;
        let binder = Binder::new(transport.clone());
        binder.set_poa_root(poa_root.clone());
        let services = Services::new(ServiceHost {
            scheduler: scheduler.clone(),
            poa_root: poa_root.clone(),
            domain_id,
            is_system_domain,
        });
        let incoming = IncomingRequests::new();

        let system = Arc::new(Self {
            domain_id,
            is_system_domain,
            scheduler,
            transport,
            poa_root,
            binder,
            services,
            incoming,
            tasks: Mutex::new(Vec::new()),
        });

        let mailbox = post.register(domain_id);
        let receive = tokio::spawn(Self::receive_loop(system.clone(), mailbox));
        let monitor = tokio::spawn(Self::teardown_monitor(system.clone(), post));
        let periodic = tokio::spawn(Self::periodic_loop(system.clone()));
        {
            let mut tasks = system.tasks.lock();
            tasks.push(receive);
            tasks.push(monitor);
            tasks.push(periodic);
        }
        info!(domain_id, is_system_domain, "protection domain started");
        Ok(system)
    }

    pub fn domain_id(&self) -> ProtDomainId {
        self.domain_id
    }

    pub fn is_system_domain(&self) -> bool {
        self.is_system_domain
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn poa_root(&self) -> &Arc<PoaRoot> {
        &self.poa_root
    }

    pub fn binder(&self) -> &Arc<Binder> {
        &self.binder
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn transport(&self) -> &Arc<EsiopTransport> {
        &self.transport
    }

    pub fn incoming(&self) -> &Arc<IncomingRequests> {
        &self.incoming
    }

    /// Opens the gates: activates the default POA manager.
    pub fn run(&self) -> CoreResult<()> {
        self.poa_root
            .default_manager()
            .activate()
            .map_err(|e| e.to_system())
    }

    /// Resolves an initial service or a binder name.
    pub async fn bind(self: &Arc<Self>, name: &str) -> CoreResult<ObjectRef> {
        if Services::is_service_name(name) {
            return self.services.bind(name).await;
        }
        self.binder.bind(name).await
    }

    /// Initiates shutdown of this domain.
    pub fn shutdown(&self, flags: u32) {
        self.scheduler.shutdown(flags);
    }

    /// Suspends until the shutdown state machine finishes.
    pub async fn wait_shutdown(&self) {
        let mut watch = self.scheduler.subscribe();
        while *watch.borrow() != SchedulerState::ShutdownFinish {
            if watch.changed().await.is_err() {
                return;
            }
        }
    }

    // The ESIOP receive loop: decodes control messages and routes them.
    async fn receive_loop(self: Arc<Self>, mut mailbox: orb_esiop::post_office::Mailbox) {
        while let Some(message) = mailbox.recv().await {
            let message = match message {
                Ok(m) => m,
                Err(_) => continue,
            };
            match message {
                Message::Request {
                    client_domain,
                    giop_message,
                } => {
                    let bytes = match self.transport.collect_message(giop_message) {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(error = %e, "incoming message unreadable");
                            continue;
                        }
                    };
                    self.clone().handle_request(client_domain, bytes);
                }
                Message::Reply { giop_message } => {
                    match self.transport.collect_message(giop_message) {
                        Ok(bytes) => match peek_reply_id(&bytes) {
                            Some(request_id) => self
                                .transport
                                .complete(request_id, ReplyData::Message(bytes)),
                            None => warn!("reply without readable request id"),
                        },
                        Err(e) => warn!(error = %e, "reply message unreadable"),
                    }
                }
                Message::ReplyImmediate { request_id, data } => {
                    self.transport.complete(
                        request_id,
                        ReplyData::Immediate(Bytes::copy_from_slice(data.as_slice())),
                    );
                }
                Message::ReplySystemException {
                    request_id,
                    completed,
                    code,
                    minor,
                } => {
                    let e = Message::decode_system_exception(completed, code, minor);
                    self.transport
                        .complete(request_id, ReplyData::SystemException(e));
                }
                Message::CancelRequest {
                    client_domain,
                    request_id,
                } => {
                    self.incoming.cancel(client_domain, request_id);
                }
                Message::LocateReply {
                    request_id,
                    locate_status,
                } => {
                    self.transport
                        .complete(request_id, ReplyData::Locate(locate_status));
                }
            }
        }
        debug!(domain = self.domain_id, "receive loop ended");
    }

    // Parses and dispatches one incoming GIOP message.
    fn handle_request(self: Arc<Self>, client_domain: ProtDomainId, bytes: Bytes) {
        let header = match GiopHeader::from_bytes(&bytes) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "bad GIOP header");
                return;
            }
        };
        if header.msg_type == MsgType::LocateRequest {
            if let Err(e) =
                answer_locate(&self.transport, client_domain, &bytes, &self.poa_root)
            {
                debug!(error = %e, "locate reply not sent");
            }
            return;
        }

        let request = match RequestInEsiop::parse(
            self.transport.clone(),
            self.binder.codec_env(),
            client_domain,
            bytes.clone(),
        ) {
            Ok(request) => request,
            Err(e) => {
                if let Some(request_id) = peek_request_id(&bytes) {
                    let message = Message::system_exception_reply(request_id, &e);
                    let _ = self.transport.post_office().send(client_domain, &message);
                }
                warn!(error = %e, "incoming request rejected at parse");
                return;
            }
        };

        // Heartbeats confirm peer liveness and never reach the adapters.
        if request.object_key().object_id().as_ref() == DGC_OBJECT_ID
            && request.operation() == DGC_HEARTBEAT_OP
        {
            let address = DomainAddress::Esiop(client_domain);
            if let Some(domain) = self.binder.remote_references().find_domain(&address) {
                domain.heartbeat_received();
            }
            return;
        }

        let guard = match self.scheduler.request_begin() {
            Ok(guard) => guard,
            Err(e) => {
                request.reject(&e);
                return;
            }
        };

        let system = self.clone();
        let deadline = request.deadline();
        let memory = request.memory();
        let _ = self.scheduler.async_call(
            deadline,
            SyncContext::Free,
            Some(memory.clone()),
            async move {
                let _guard = guard;
                let ed = ExecDomain::current()?;
                ed.set_security(request.security());

                let request_id = request.request_id();
                let was_cancelled = system.incoming.begin(
                    client_domain,
                    request_id,
                    request.cancel_flag(),
                    ed.clone(),
                )?;
                if was_cancelled {
                    request.reject(&SystemException::transient(omg_minor(1)));
                    return Ok(());
                }

                let key = request.object_key().clone();
                let inbound = InboundRequest::new(key, Box::new(request));
                let outcome = system.poa_root.invoke(inbound, memory).await;
                system.incoming.finish(client_domain, request_id);
                if let Err(e) = outcome {
                    debug!(error = %e, request_id, "request completed with error");
                }
                Ok(())
            },
        );
    }

    // Unwinds the domain as the lifecycle advances.
    async fn teardown_monitor(self: Arc<Self>, post: Arc<PostOffice>) {
        let mut watch = self.scheduler.subscribe();
        loop {
            if watch.changed().await.is_err() {
                return;
            }
            let state = *watch.borrow();
            match state {
                SchedulerState::ShutdownStarted => {
                    let activity = self.scheduler.activity_begin();
                    self.services.shutdown().await;
                    if let Err(e) = self.poa_root.shutdown().await {
                        debug!(error = %e, "adapter teardown reported");
                    }
                    drop(activity);
                    self.scheduler.pulse();
                }
                SchedulerState::Terminate => {
                    // Outgoing messages may still flow; no new incoming.
                    self.binder.terminate();
                    post.unregister(self.domain_id);
                    self.scheduler.pulse();
                }
                SchedulerState::ShutdownFinish => {
                    info!(domain = self.domain_id, "shutdown finished");
                    return;
                }
                _ => {}
            }
        }
    }

    // Flushes DGC heartbeats and sweeps expired state.
    async fn periodic_loop(self: Arc<Self>) {
        let interval_ms = self.scheduler.config().heartbeat_interval_ms.max(100);
        let release_window = self.scheduler.config().release_window_ms * MILLISECOND;
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.scheduler.state() >= SchedulerState::Terminate {
                return;
            }
            let heartbeat_interval = interval_ms * MILLISECOND;
            for domain in self.binder.remote_references().domains() {
                if let Some(keys) = domain.take_heartbeat_batch(heartbeat_interval) {
                    if let Err(e) = self.send_heartbeat(&domain, keys).await {
                        debug!(error = %e, "heartbeat not delivered");
                    }
                }
            }
            self.binder.remote_references().sweep(release_window);
            self.incoming.sweep_tombstones(release_window);
        }
    }

    async fn send_heartbeat(
        self: &Arc<Self>,
        domain: &Arc<crate::domain::Domain>,
        keys: Vec<ObjectKey>,
    ) -> CoreResult<()> {
        let mut request = RequestGiop::new(
            domain.clone(),
            ObjectKey::root(Bytes::from_static(DGC_OBJECT_ID)),
            DGC_HEARTBEAT_OP,
            false,
            self.binder.codec_env(),
        )?;
        request.codec_mut().out().write_size(keys.len());
        for key in &keys {
            key.marshal(request.codec_mut().out());
        }
        request.invoke().await
    }
}

/// Extracts the request id from a Request message for error replies.
fn peek_request_id(bytes: &Bytes) -> Option<u32> {
    let header = GiopHeader::from_bytes(bytes).ok()?;
    if header.msg_type != MsgType::Request {
        return None;
    }
    let mut input = StreamIn::new(bytes.clone(), header.little_endian());
    input.read_octets(GiopHeader::SIZE).ok()?;
    if header.version >= orb_io::giop::GiopVersion::V1_2 {
        input.read_u32().ok()
    } else {
        let count = input.read_size().ok()?;
        for _ in 0..count {
            input.read_u32().ok()?;
            let len = input.read_size().ok()?;
            input.read_octets(len).ok()?;
        }
        input.read_u32().ok()
    }
}

/// Extracts the request id from a Reply message.
fn peek_reply_id(bytes: &Bytes) -> Option<u32> {
    let header = GiopHeader::from_bytes(bytes).ok()?;
    if header.msg_type != MsgType::Reply {
        return None;
    }
    let mut input = StreamIn::new(bytes.clone(), header.little_endian());
    input.read_octets(GiopHeader::SIZE).ok()?;
    ReplyHeader::decode(&mut input, header.version)
        .ok()
        .map(|h| h.request_id)
}
