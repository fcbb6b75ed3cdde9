//! Server-side ESIOP requests.
//!
//! An incoming REQUEST message is parsed into a `RequestInEsiop`: the GIOP
//! headers are consumed, the deadline / RT-priority / security service
//! contexts are applied to the serving execution domain, and the request is
//! handed to the root POA. The reply chooses among the immediate inline
//! path, the shared-memory path, and the allocation-free system-exception
//! message; oneway requests skip reply framing entirely.

use crate::request_giop::CodecEnv;
use crate::transport::EsiopTransport;
use async_trait::async_trait;
use bytes::Bytes;
use orb_core::deadline::{Clock, DeadlineTime, INFINITE_DEADLINE};
use orb_core::error::{CoreResult, RequestException, SystemException, UserException};
use orb_core::exec_domain::SecurityContext;
use orb_core::mem_context::MemContext;
use orb_esiop::messages::{ImmediateData, Message};
use orb_esiop::stream_sm::StreamOutSm;
use orb_io::giop::{
    priority_to_deadline, GiopHeader, GiopVersion, MsgType, ReplyHeader, ReplyStatus,
    RequestHeader, SC_DEADLINE, SC_RT_CORBA_PRIORITY, SC_SECURITY_ATTRIBUTE,
};
use orb_io::ior::ProtDomainId;
use orb_io::object_key::ObjectKey;
use orb_io::stream::{native_little_endian, StreamIn, StreamOut};
use orb_poa::request::{Request, RequestCodec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Reply routing back to the caller; consumed on the first completion.
struct ReplySender {
    transport: Arc<EsiopTransport>,
    client_domain: ProtDomainId,
    request_id: u32,
}

impl ReplySender {
    fn reply_header_bytes(&self, status: ReplyStatus) -> StreamOut {
        let little = native_little_endian();
        let mut out = StreamOut::with_order(little);
        let header = GiopHeader::new(GiopVersion::V1_2, MsgType::Reply, little, 0);
        out.write_octets(&header.to_bytes());
        ReplyHeader {
            request_id: self.request_id,
            status,
            service_contexts: Vec::new(),
        }
        .encode(&mut out, GiopVersion::V1_2);
        // Empty context list leaves the header at 24 bytes, an 8-byte
        // boundary, so body-relative and message-relative alignment agree.
        out.align(8);
        out
    }

    fn send_shared(self, out: StreamOut) -> CoreResult<()> {
        let helper = self.transport.peer_helper(self.client_domain);
        let mut stream = StreamOutSm::new(helper);
        stream.write(out.data())?;
        let head = stream.finish()?;
        self.transport.post_office().send(
            self.client_domain,
            &Message::Reply { giop_message: head },
        )
    }

    fn send_success(self, body: &[u8]) -> CoreResult<()> {
        if let Some(data) = ImmediateData::new(body) {
            // Fast path: no shared-memory allocation at all.
            return self.transport.post_office().send(
                self.client_domain,
                &Message::ReplyImmediate {
                    request_id: self.request_id,
                    data,
                },
            );
        }
        let mut out = self.reply_header_bytes(ReplyStatus::NoException);
        out.write_octets(body);
        self.send_shared(out)
    }

    fn send_user_exception(self, exception: &UserException) -> CoreResult<()> {
        let mut out = self.reply_header_bytes(ReplyStatus::UserException);
        out.write_string(&exception.repository_id);
        out.write_octets(&exception.payload);
        self.send_shared(out)
    }

    fn send_system_exception(self, exception: &SystemException) -> CoreResult<()> {
        self.transport.post_office().send(
            self.client_domain,
            &Message::system_exception_reply(self.request_id, exception),
        )
    }
}

/// A parsed incoming request ready for POA dispatch.
pub struct RequestInEsiop {
    operation: String,
    request_id: u32,
    client_domain: ProtDomainId,
    key: ObjectKey,
    response_expected: bool,
    deadline: DeadlineTime,
    security: Option<SecurityContext>,
    codec: RequestCodec,
    memory: Arc<MemContext>,
    reply: Option<ReplySender>,
    exception: Option<RequestException>,
    cancelled: Arc<AtomicBool>,
}

impl RequestInEsiop {
    /// Parses a GIOP Request message received from `client_domain`.
    ///
    /// Applies the deadline or RT-priority context; a present but invalid
    /// security context fails with NO_PERMISSION before any dispatch.
    pub fn parse(
        transport: Arc<EsiopTransport>,
        env: CodecEnv,
        client_domain: ProtDomainId,
        bytes: Bytes,
    ) -> CoreResult<Self> {
        let header = GiopHeader::from_bytes(&bytes)?;
        if header.msg_type != MsgType::Request {
            return Err(SystemException::marshal(0));
        }
        let little = header.little_endian();
        let mut input = StreamIn::new(bytes, little);
        input.read_octets(GiopHeader::SIZE)?;
        let request_header = RequestHeader::decode(&mut input, header.version)?;

        let mut deadline = INFINITE_DEADLINE;
        let mut security = None;
        for sc in &request_header.service_contexts {
            match sc.context_id {
                SC_DEADLINE => deadline = sc.parse_deadline(little)?,
                SC_RT_CORBA_PRIORITY => {
                    let priority = sc.parse_rt_priority()?;
                    deadline = Clock::make_deadline(priority_to_deadline(priority));
                }
                SC_SECURITY_ATTRIBUTE => {
                    let context_id = sc.parse_security_attribute()?;
                    if context_id == 0 {
                        return Err(SystemException::no_permission());
                    }
                    security = Some(SecurityContext { context_id });
                }
                _ => {}
            }
        }

        if header.version >= GiopVersion::V1_2 && input.remaining() > 0 {
            input.align(8)?;
        }
        let key = ObjectKey::decode(&request_header.object_key)?;
        let response_expected = request_header.response_expected();
        let request_id = request_header.request_id;
        let operation = request_header.operation;

        let mut codec = RequestCodec::cdr(
            StreamOut::with_order(native_little_endian()),
            header.version.minor,
            env.value_factories,
            env.resolver,
        );
        codec.attach_input(input);

        Ok(Self {
            operation,
            request_id,
            client_domain,
            key,
            response_expected,
            deadline,
            security,
            codec,
            memory: MemContext::new("request-in"),
            reply: Some(ReplySender {
                transport,
                client_domain,
                request_id,
            }),
            exception: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn client_domain(&self) -> ProtDomainId {
        self.client_domain
    }

    pub fn object_key(&self) -> &ObjectKey {
        &self.key
    }

    /// Invocation deadline extracted from the service contexts.
    pub fn deadline(&self) -> DeadlineTime {
        self.deadline
    }

    pub fn security(&self) -> Option<SecurityContext> {
        self.security.clone()
    }

    /// Shared cancellation flag, observed at suspension points.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    fn take_reply(&mut self) -> Option<ReplySender> {
        if self.response_expected {
            self.reply.take()
        } else {
            // Oneway: no reply was ever allocated for sending.
            self.reply = None;
            None
        }
    }

    /// Emits an exception reply without dispatching; used for parse-stage
    /// failures and duplicate arrivals.
    pub fn reject(mut self, exception: &SystemException) {
        if let Some(reply) = self.take_reply() {
            if let Err(e) = reply.send_system_exception(exception) {
                debug!(error = %e, "exception reply not delivered");
            }
        }
    }
}

#[async_trait]
impl Request for RequestInEsiop {
    fn operation(&self) -> &str {
        &self.operation
    }

    fn memory(&self) -> Arc<MemContext> {
        self.memory.clone()
    }

    fn codec_mut(&mut self) -> &mut RequestCodec {
        &mut self.codec
    }

    fn response_expected(&self) -> bool {
        self.response_expected
    }

    async fn invoke(&mut self) -> CoreResult<()> {
        // Server side: dispatch happens through the POA.
        Err(SystemException::bad_inv_order(0))
    }

    fn success(&mut self) -> CoreResult<()> {
        if let Some(reply) = self.take_reply() {
            let body = std::mem::take(self.codec.out()).finish();
            reply.send_success(&body)?;
        }
        Ok(())
    }

    fn set_exception(&mut self, exception: RequestException) {
        if self.exception.is_some() {
            return;
        }
        self.exception = Some(exception.clone());
        if let Some(reply) = self.take_reply() {
            let sent = match &exception {
                RequestException::System(e) => reply.send_system_exception(e),
                RequestException::User(e) => reply.send_user_exception(e),
            };
            if let Err(e) = sent {
                debug!(error = %e, "exception reply not delivered");
            }
        }
    }

    fn get_exception(&mut self) -> Option<RequestException> {
        self.exception.take()
    }

    fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handles a LocateRequest: answers ObjectHere when the key resolves to a
/// live local reference.
pub fn answer_locate(
    transport: &Arc<EsiopTransport>,
    client_domain: ProtDomainId,
    bytes: &Bytes,
    root: &Arc<orb_poa::root::PoaRoot>,
) -> CoreResult<()> {
    use orb_io::giop::{LocateRequestHeader, LocateStatus};
    let header = GiopHeader::from_bytes(bytes)?;
    let mut input = StreamIn::new(bytes.clone(), header.little_endian());
    input.read_octets(GiopHeader::SIZE)?;
    let locate = LocateRequestHeader::decode(&mut input, header.version)?;
    let key = ObjectKey::decode(&locate.object_key)?;
    let status = if root.find_reference(&key).is_some() {
        LocateStatus::ObjectHere
    } else {
        LocateStatus::UnknownObject
    };
    transport.post_office().send(
        client_domain,
        &Message::LocateReply {
            request_id: locate.request_id,
            locate_status: status as u32,
        },
    )
}
