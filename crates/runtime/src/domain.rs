//! Peer domains.
//!
//! A `Domain` is this process's view of one peer: where it lives (a
//! sibling protection domain over shared memory, or an IIOP listen point),
//! the platform sizes discovered at handshake, and the DGC bookkeeping —
//! references observed while marshaling requests are batched into periodic
//! heartbeat confirmations.

use crate::transport::{EsiopTransport, ReplyData};
use orb_core::deadline::{Clock, DeadlineTime};
use orb_core::error::{CoreResult, SystemException};
use orb_core::exec_domain::ExecDomain;
use orb_esiop::other_domain::PlatformSizes;
use orb_io::ior::{DomainAddress, ProtDomainId};
use orb_io::object_key::ObjectKey;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// The reserved object id addressed by DGC heartbeat requests.
pub const DGC_OBJECT_ID: &[u8] = b"DGC";
/// The heartbeat operation name.
pub const DGC_HEARTBEAT_OP: &str = "heartbeat";

struct DgcState {
    // Keys confirmed-alive since the last heartbeat flush.
    observed: HashSet<ObjectKey>,
    last_sent: DeadlineTime,
    last_received: DeadlineTime,
}

/// One peer domain.
pub struct Domain {
    address: DomainAddress,
    sizes: PlatformSizes,
    transport: Option<Arc<EsiopTransport>>,
    dgc: Mutex<DgcState>,
}

impl Domain {
    /// A sibling protection domain reached over shared memory. The
    /// platform sizes come from the handshake; same-width is the exercised
    /// configuration.
    pub fn local(
        peer: ProtDomainId,
        transport: Arc<EsiopTransport>,
        sizes: PlatformSizes,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: DomainAddress::Esiop(peer),
            sizes,
            transport: Some(transport),
            dgc: Mutex::new(DgcState {
                observed: HashSet::new(),
                last_sent: Clock::now(),
                last_received: Clock::now(),
            }),
        })
    }

    /// A cross-host IIOP peer. The socket plumbing is a platform port;
    /// sends through this domain report COMM_FAILURE until one is wired.
    pub fn remote(host: String, port: u16, sizes: PlatformSizes) -> Arc<Self> {
        Arc::new(Self {
            address: DomainAddress::Iiop { host, port },
            sizes,
            transport: None,
            dgc: Mutex::new(DgcState {
                observed: HashSet::new(),
                last_sent: Clock::now(),
                last_received: Clock::now(),
            }),
        })
    }

    pub fn address(&self) -> &DomainAddress {
        &self.address
    }

    pub fn sizes(&self) -> PlatformSizes {
        self.sizes
    }

    pub fn esiop_peer(&self) -> Option<ProtDomainId> {
        match &self.address {
            DomainAddress::Esiop(id) => Some(*id),
            DomainAddress::Iiop { .. } => None,
        }
    }

    /// Allocates a request id on the process-wide counter.
    pub fn next_request_id(&self) -> CoreResult<u32> {
        match &self.transport {
            Some(t) => Ok(t.next_request_id()),
            None => Err(SystemException::comm_failure()),
        }
    }

    /// Sends a GIOP request and suspends for its reply.
    pub async fn invoke_giop(
        &self,
        ed: &Arc<ExecDomain>,
        request_id: u32,
        giop: &[u8],
        response_expected: bool,
    ) -> CoreResult<Option<ReplyData>> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(SystemException::comm_failure)?;
        let peer = self
            .esiop_peer()
            .ok_or_else(SystemException::comm_failure)?;
        if !response_expected {
            transport.send_request(peer, giop)?;
            return Ok(None);
        }
        let rx = transport.expect_reply(request_id);
        transport.send_request(peer, giop)?;
        let reply = transport.await_reply(ed, peer, request_id, rx).await?;
        Ok(Some(reply))
    }

    /// Sends a cancel for an in-flight request.
    pub fn cancel(&self, request_id: u32) {
        if let (Some(transport), Some(peer)) = (&self.transport, self.esiop_peer()) {
            transport.cancel_request(peer, request_id);
        }
    }

    // DGC bookkeeping.

    /// Records a reference observed during request marshaling.
    pub fn observe_dgc_reference(&self, key: ObjectKey) {
        self.dgc.lock().observed.insert(key);
    }

    /// Takes the batch due for confirmation if the heartbeat interval has
    /// elapsed.
    pub fn take_heartbeat_batch(&self, interval: DeadlineTime) -> Option<Vec<ObjectKey>> {
        let mut dgc = self.dgc.lock();
        if dgc.observed.is_empty() {
            return None;
        }
        let now = Clock::now();
        if now.saturating_sub(dgc.last_sent) < interval {
            return None;
        }
        dgc.last_sent = now;
        Some(dgc.observed.drain().collect())
    }

    /// Notes a heartbeat received from this peer.
    pub fn heartbeat_received(&self) {
        let mut dgc = self.dgc.lock();
        dgc.last_received = Clock::now();
        debug!(address = ?self.address, "peer heartbeat");
    }

    /// Monotonic time of the last heartbeat from this peer.
    pub fn last_heartbeat(&self) -> DeadlineTime {
        self.dgc.lock().last_received
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("address", &self.address)
            .finish()
    }
}
