//! Client-side GIOP requests.
//!
//! A `RequestGiop` frames one outgoing invocation: the GIOP header and
//! request header are written at construction (capturing the caller's
//! deadline and security context), arguments marshal into the aligned body,
//! `invoke` publishes the message to the peer and suspends on the reply
//! slot, and the decoded reply status becomes the request outcome.

use crate::domain::Domain;
use crate::transport::ReplyData;
use async_trait::async_trait;
use bytes::Bytes;
use orb_core::deadline::INFINITE_DEADLINE;
use orb_core::error::{
    CompletionStatus, CoreResult, ExceptionKind, RequestException, SystemException, UserException,
};
use orb_core::exec_domain::ExecDomain;
use orb_core::mem_context::MemContext;
use orb_io::giop::{
    GiopHeader, GiopVersion, MsgType, ReplyHeader, ReplyStatus, RequestHeader, ServiceContext,
    RESPONSE_EXPECTED, RESPONSE_NONE,
};
use orb_io::object_key::ObjectKey;
use orb_io::stream::{native_little_endian, StreamIn, StreamOut};
use orb_io::value::ValueFactoryRegistry;
use orb_poa::request::{ObjectResolver, Request, RequestCodec};
use std::sync::Arc;

pub(crate) fn current_ed() -> Arc<ExecDomain> {
    ExecDomain::current().unwrap_or_else(|_| ExecDomain::new(INFINITE_DEADLINE))
}

/// Marshaling environment shared by requests of one runtime: the value
/// factories and the reference resolver (the binder).
#[derive(Clone)]
pub struct CodecEnv {
    pub value_factories: Arc<ValueFactoryRegistry>,
    pub resolver: Option<Arc<dyn ObjectResolver>>,
}

impl CodecEnv {
    pub fn bare() -> Self {
        Self {
            value_factories: Arc::new(ValueFactoryRegistry::new()),
            resolver: None,
        }
    }
}

/// One outgoing GIOP request.
pub struct RequestGiop {
    operation: String,
    request_id: u32,
    domain: Arc<Domain>,
    codec: RequestCodec,
    memory: Arc<MemContext>,
    response_expected: bool,
    exception: Option<RequestException>,
    cancelled: bool,
}

impl RequestGiop {
    /// Frames a request against `key` in `domain`. The caller's deadline
    /// and security context ride as service contexts.
    pub fn new(
        domain: Arc<Domain>,
        key: ObjectKey,
        operation: impl Into<String>,
        response_expected: bool,
        env: CodecEnv,
    ) -> CoreResult<Self> {
        let operation = operation.into();
        let ed = current_ed();
        let request_id = domain.next_request_id()?;
        let little = native_little_endian();

        let mut service_contexts = vec![ServiceContext::default_code_sets()];
        if ed.deadline() != INFINITE_DEADLINE {
            service_contexts.push(ServiceContext::deadline(ed.deadline(), little));
        }
        if let Some(security) = ed.security() {
            service_contexts.push(ServiceContext::security_attribute(security.context_id));
        }

        let mut out = StreamOut::with_order(little);
        // ESIOP leaves the size field zero; length travels out-of-band.
        let header = GiopHeader::new(GiopVersion::V1_2, MsgType::Request, little, 0);
        out.write_octets(&header.to_bytes());
        let request_header = RequestHeader {
            request_id,
            response_flags: if response_expected {
                RESPONSE_EXPECTED
            } else {
                RESPONSE_NONE
            },
            object_key: key.encode(),
            operation: operation.clone(),
            service_contexts,
        };
        request_header.encode(&mut out, GiopVersion::V1_2);
        // GIOP 1.2 bodies start on an 8-byte boundary.
        out.align(8);

        Ok(Self {
            operation,
            request_id,
            domain,
            codec: RequestCodec::cdr(out, 2, env.value_factories, env.resolver),
            memory: ed.mem_context(),
            response_expected,
            exception: None,
            cancelled: false,
        })
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    fn process_reply(&mut self, reply: ReplyData) -> CoreResult<()> {
        match reply {
            ReplyData::Immediate(body) => {
                // Same-host fast path: body only, native order, status
                // NO_EXCEPTION.
                self.codec
                    .attach_input(StreamIn::new(body, native_little_endian()));
                Ok(())
            }
            ReplyData::Message(bytes) => {
                let header = GiopHeader::from_bytes(&bytes)?;
                if header.msg_type != MsgType::Reply {
                    return Err(SystemException::marshal(0));
                }
                let mut input = StreamIn::new(bytes, header.little_endian());
                input.read_octets(GiopHeader::SIZE)?;
                let reply_header = ReplyHeader::decode(&mut input, header.version)?;
                if reply_header.request_id != self.request_id {
                    return Err(SystemException::marshal(0));
                }
                input.align(8)?;
                match reply_header.status {
                    ReplyStatus::NoException => {
                        self.codec.attach_input(input);
                        Ok(())
                    }
                    ReplyStatus::UserException => {
                        let repository_id = input.read_string()?;
                        let payload = input.read_octets(input.remaining())?;
                        self.exception = Some(RequestException::User(UserException::new(
                            repository_id,
                            payload,
                        )));
                        Ok(())
                    }
                    ReplyStatus::SystemException => {
                        let repository_id = input.read_string()?;
                        let minor = input.read_u32()?;
                        let completed = CompletionStatus::from_u8(input.read_u32()? as u8)
                            .unwrap_or(CompletionStatus::Maybe);
                        let kind = ExceptionKind::from_repository_id(&repository_id)
                            .unwrap_or(ExceptionKind::Unknown);
                        let e = SystemException::new(kind, minor, completed);
                        self.exception = Some(RequestException::System(e.clone()));
                        Err(e)
                    }
                    ReplyStatus::LocationForward => {
                        // Rebinding through forwards is not carried.
                        Err(SystemException::no_implement())
                    }
                }
            }
            ReplyData::SystemException(e) => {
                self.exception = Some(RequestException::System(e.clone()));
                Err(e)
            }
            ReplyData::Locate(_) => Err(SystemException::internal(0)),
        }
    }
}

#[async_trait]
impl Request for RequestGiop {
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
        if self.cancelled {
            return Err(SystemException::transient(0));
        }
        let ed = current_ed();
        ed.check_cancelled()?;
        let bytes: Bytes = std::mem::take(self.codec.out()).finish();
        let reply = self
            .domain
            .invoke_giop(&ed, self.request_id, &bytes, self.response_expected)
            .await?;
        match reply {
            None => Ok(()),
            Some(data) => self.process_reply(data),
        }
    }

    fn success(&mut self) -> CoreResult<()> {
        Ok(())
    }

    fn set_exception(&mut self, exception: RequestException) {
        if self.exception.is_none() {
            self.exception = Some(exception);
        }
    }

    fn get_exception(&mut self) -> Option<RequestException> {
        self.exception.take()
    }

    fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.domain.cancel(self.request_id);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}
