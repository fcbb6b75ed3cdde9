//! ESIOP transport binding for one protection domain.
//!
//! Owns this domain's post-office identity, the process-wide request-id
//! counter, and the map of pending requests awaiting replies. Outgoing
//! GIOP messages are published into the recipient's arena through the
//! shared-memory streams; replies complete the matching pending slot.

use bytes::Bytes;
use orb_core::error::{CoreResult, SystemException};
use orb_core::exec_domain::ExecDomain;
use orb_esiop::messages::{Message, SharedMemPtr};
use orb_esiop::other_domain::{OtherDomain, OtherDomainLocal, PlatformSizes};
use orb_esiop::post_office::PostOffice;
use orb_esiop::shared_mem::HostMemory;
use orb_esiop::stream_sm::{StreamInSm, StreamOutSm};
use orb_io::ior::ProtDomainId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A decoded reply outcome delivered to a pending request.
#[derive(Debug)]
pub enum ReplyData {
    /// Full GIOP reply bytes (shared-memory path).
    Message(Bytes),
    /// Reply body only, carried inline; status is NO_EXCEPTION.
    Immediate(Bytes),
    /// A system exception, no body.
    SystemException(SystemException),
    /// A locate status.
    Locate(u32),
}

/// This domain's view of the ESIOP fabric.
pub struct EsiopTransport {
    own_domain: ProtDomainId,
    post: Arc<PostOffice>,
    host_mem: Arc<HostMemory>,
    next_request_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<ReplyData>>>,
}

impl EsiopTransport {
    pub fn new(
        own_domain: ProtDomainId,
        post: Arc<PostOffice>,
        host_mem: Arc<HostMemory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_domain,
            post,
            host_mem,
            next_request_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn own_domain(&self) -> ProtDomainId {
        self.own_domain
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post
    }

    pub fn host_memory(&self) -> &Arc<HostMemory> {
        &self.host_mem
    }

    /// A helper writing into `peer`'s arena.
    pub fn peer_helper(&self, peer: ProtDomainId) -> Arc<dyn OtherDomain> {
        Arc::new(OtherDomainLocal::new(self.host_mem.arena(peer)))
    }

    /// This domain's own arena, for incoming messages.
    pub fn own_arena(&self) -> Arc<orb_esiop::shared_mem::DomainArena> {
        self.host_mem.arena(self.own_domain)
    }

    pub fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Publishes `message` into `peer`'s arena and sends the REQUEST
    /// control message. Returns once the message is on the wire.
    pub fn send_request(&self, peer: ProtDomainId, giop: &[u8]) -> CoreResult<SharedMemPtr> {
        let helper = self.peer_helper(peer);
        let mut stream = StreamOutSm::new(helper);
        stream.write(giop)?;
        let head = stream.finish()?;
        let message = Message::Request {
            client_domain: self.own_domain,
            giop_message: head,
        };
        if let Err(e) = self.post.send(peer, &message) {
            // Peer never saw the blocks; reclaim them.
            let arena = self.host_mem.arena(peer);
            let _ = StreamInSm::read_all(&arena, head, PlatformSizes::default());
            return Err(e);
        }
        Ok(head)
    }

    /// Registers a pending reply slot for `request_id`.
    pub fn expect_reply(&self, request_id: u32) -> oneshot::Receiver<ReplyData> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        rx
    }

    /// Suspends until the reply for `request_id` arrives, honoring the ED
    /// deadline and yielding the ED's sync domain while waiting; a lapse
    /// withdraws the slot and cancels remotely.
    pub async fn await_reply(
        &self,
        ed: &Arc<ExecDomain>,
        peer: ProtDomainId,
        request_id: u32,
        rx: oneshot::Receiver<ReplyData>,
    ) -> CoreResult<ReplyData> {
        let wait = async {
            match orb_core::deadline::Clock::remaining(ed.deadline()) {
                None => rx.await.map_err(|_| SystemException::comm_failure()),
                Some(left) => match tokio::time::timeout(left, rx).await {
                    Ok(r) => r.map_err(|_| SystemException::comm_failure()),
                    Err(_) => Err(SystemException::timeout()),
                },
            }
        };
        match orb_core::sync::suspended(ed, wait).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if e.kind == orb_core::error::ExceptionKind::Timeout {
                    self.pending.lock().remove(&request_id);
                    self.cancel_request(peer, request_id);
                }
                Err(e)
            }
        }
    }

    /// Sends a CANCEL_REQUEST for an in-flight request.
    pub fn cancel_request(&self, peer: ProtDomainId, request_id: u32) {
        let message = Message::CancelRequest {
            client_domain: self.own_domain,
            request_id,
        };
        if let Err(e) = self.post.send(peer, &message) {
            debug!(error = %e, request_id, "cancel not delivered");
        }
    }

    /// Completes a pending request with reply data.
    pub fn complete(&self, request_id: u32, data: ReplyData) {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => warn!(request_id, "reply for unknown request"),
        }
    }

    /// Fails every pending request; used when a peer dies.
    pub fn fail_all_pending(&self) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (request_id, tx) in pending {
            debug!(request_id, "failing pending request: peer died");
            let _ = tx.send(ReplyData::SystemException(SystemException::comm_failure()));
        }
    }

    /// Collects incoming GIOP bytes published into this domain's arena.
    pub fn collect_message(&self, head: SharedMemPtr) -> CoreResult<Bytes> {
        StreamInSm::read_all(&self.own_arena(), head, PlatformSizes::default())
    }
}
