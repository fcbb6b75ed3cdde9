//! ESIOP control messages.
//!
//! Fixed-size messages exchanged through the post office. Every message
//! fits one 32-byte slot; the first octet is the type. A reply whose body
//! fits `ReplyImmediate::MAX_DATA_SIZE` travels inline with no
//! shared-memory allocation; larger replies carry a pointer to a GIOP
//! message published into the recipient's address space.

use orb_core::error::{CompletionStatus, CoreResult, ExceptionKind, SystemException};
use orb_io::ior::ProtDomainId;

/// A pointer in a peer's address space (an arena block handle here).
pub type SharedMemPtr = u64;

/// One post-office slot.
pub const MESSAGE_SIZE: usize = 32;

/// Raw message slot.
pub type MessageBuffer = [u8; MESSAGE_SIZE];

/// Control-message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// GIOP Request or LocateRequest in shared memory.
    Request = 0,
    /// GIOP Reply in shared memory.
    Reply = 1,
    /// GIOP Reply with small data carried inline.
    ReplyImmediate = 2,
    /// GIOP Reply carrying a system exception, no allocation.
    ReplySystemException = 3,
    /// GIOP CancelRequest.
    CancelRequest = 4,
    /// GIOP LocateReply.
    LocateReply = 5,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MessageType::Request,
            1 => MessageType::Reply,
            2 => MessageType::ReplyImmediate,
            3 => MessageType::ReplySystemException,
            4 => MessageType::CancelRequest,
            5 => MessageType::LocateReply,
            _ => return None,
        })
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request {
        /// Sender protection domain.
        client_domain: ProtDomainId,
        /// The GIOP message in the recipient's memory.
        giop_message: SharedMemPtr,
    },
    Reply {
        giop_message: SharedMemPtr,
    },
    ReplyImmediate {
        request_id: u32,
        data: ImmediateData,
    },
    ReplySystemException {
        request_id: u32,
        completed: CompletionStatus,
        code: u32,
        minor: u32,
    },
    CancelRequest {
        client_domain: ProtDomainId,
        request_id: u32,
    },
    LocateReply {
        request_id: u32,
        locate_status: u32,
    },
}

/// Inline reply bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmediateData {
    len: u8,
    bytes: [u8; ImmediateData::MAX_DATA_SIZE],
}

impl ImmediateData {
    /// Largest inline reply body. Pinned; both sides of the boundary are
    /// tested.
    pub const MAX_DATA_SIZE: usize = 24;

    /// Wraps a body that fits the immediate budget.
    pub fn new(body: &[u8]) -> Option<Self> {
        if body.len() > Self::MAX_DATA_SIZE {
            return None;
        }
        let mut bytes = [0u8; Self::MAX_DATA_SIZE];
        bytes[..body.len()].copy_from_slice(body);
        Some(Self {
            len: body.len() as u8,
            bytes,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request { .. } => MessageType::Request,
            Message::Reply { .. } => MessageType::Reply,
            Message::ReplyImmediate { .. } => MessageType::ReplyImmediate,
            Message::ReplySystemException { .. } => MessageType::ReplySystemException,
            Message::CancelRequest { .. } => MessageType::CancelRequest,
            Message::LocateReply { .. } => MessageType::LocateReply,
        }
    }

    /// Encodes into one post-office slot. Host-local, native byte order.
    pub fn encode(&self) -> MessageBuffer {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = self.message_type() as u8;
        match self {
            Message::Request {
                client_domain,
                giop_message,
            } => {
                buf[4..8].copy_from_slice(&client_domain.to_ne_bytes());
                buf[8..16].copy_from_slice(&giop_message.to_ne_bytes());
            }
            Message::Reply { giop_message } => {
                buf[8..16].copy_from_slice(&giop_message.to_ne_bytes());
            }
            Message::ReplyImmediate { request_id, data } => {
                buf[1] = data.len;
                buf[2..2 + ImmediateData::MAX_DATA_SIZE].copy_from_slice(&data.bytes);
                buf[28..32].copy_from_slice(&request_id.to_ne_bytes());
            }
            Message::ReplySystemException {
                request_id,
                completed,
                code,
                minor,
            } => {
                buf[1] = *completed as u8;
                buf[4..8].copy_from_slice(&code.to_ne_bytes());
                buf[8..12].copy_from_slice(&minor.to_ne_bytes());
                buf[12..16].copy_from_slice(&request_id.to_ne_bytes());
            }
            Message::CancelRequest {
                client_domain,
                request_id,
            } => {
                buf[4..8].copy_from_slice(&client_domain.to_ne_bytes());
                buf[8..12].copy_from_slice(&request_id.to_ne_bytes());
            }
            Message::LocateReply {
                request_id,
                locate_status,
            } => {
                buf[4..8].copy_from_slice(&request_id.to_ne_bytes());
                buf[8..12].copy_from_slice(&locate_status.to_ne_bytes());
            }
        }
        buf
    }

    /// Decodes one post-office slot.
    pub fn decode(buf: &MessageBuffer) -> CoreResult<Self> {
        let read_u32 = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[at..at + 4]);
            u32::from_ne_bytes(b)
        };
        let read_u64 = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_ne_bytes(b)
        };
        let message_type = MessageType::from_u8(buf[0])
            .ok_or_else(|| SystemException::marshal(0))?;
        Ok(match message_type {
            MessageType::Request => Message::Request {
                client_domain: read_u32(4),
                giop_message: read_u64(8),
            },
            MessageType::Reply => Message::Reply {
                giop_message: read_u64(8),
            },
            MessageType::ReplyImmediate => {
                let len = buf[1] as usize;
                if len > ImmediateData::MAX_DATA_SIZE {
                    return Err(SystemException::marshal(0));
                }
                let mut bytes = [0u8; ImmediateData::MAX_DATA_SIZE];
                bytes.copy_from_slice(&buf[2..2 + ImmediateData::MAX_DATA_SIZE]);
                Message::ReplyImmediate {
                    request_id: read_u32(28),
                    data: ImmediateData {
                        len: len as u8,
                        bytes,
                    },
                }
            }
            MessageType::ReplySystemException => Message::ReplySystemException {
                request_id: read_u32(12),
                completed: CompletionStatus::from_u8(buf[1])
                    .ok_or_else(|| SystemException::marshal(0))?,
                code: read_u32(4),
                minor: read_u32(8),
            },
            MessageType::CancelRequest => Message::CancelRequest {
                client_domain: read_u32(4),
                request_id: read_u32(8),
            },
            MessageType::LocateReply => Message::LocateReply {
                request_id: read_u32(4),
                locate_status: read_u32(8),
            },
        })
    }

    /// Builds the no-allocation exception reply for `exception`.
    pub fn system_exception_reply(request_id: u32, exception: &SystemException) -> Self {
        Message::ReplySystemException {
            request_id,
            completed: exception.completed,
            code: exception.kind.code(),
            minor: exception.minor,
        }
    }

    /// Reconstructs the exception carried by a `ReplySystemException`.
    pub fn decode_system_exception(
        completed: CompletionStatus,
        code: u32,
        minor: u32,
    ) -> SystemException {
        SystemException::new(ExceptionKind::from_code(code), minor, completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_message_round_trips() {
        let messages = vec![
            Message::Request {
                client_domain: 9,
                giop_message: 0xAA55,
            },
            Message::Reply {
                giop_message: 0x1234_5678_9ABC,
            },
            Message::ReplyImmediate {
                request_id: 17,
                data: ImmediateData::new(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
            },
            Message::ReplySystemException {
                request_id: 3,
                completed: CompletionStatus::Maybe,
                code: ExceptionKind::Transient.code(),
                minor: 7,
            },
            Message::CancelRequest {
                client_domain: 2,
                request_id: 5,
            },
            Message::LocateReply {
                request_id: 6,
                locate_status: 1,
            },
        ];
        for message in messages {
            let decoded = Message::decode(&message.encode()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn immediate_budget_boundary() {
        let exact = vec![0xAB; ImmediateData::MAX_DATA_SIZE];
        assert!(ImmediateData::new(&exact).is_some());
        let over = vec![0xAB; ImmediateData::MAX_DATA_SIZE + 1];
        assert!(ImmediateData::new(&over).is_none());
    }

    #[test]
    fn immediate_data_preserves_bytes() {
        let body = [9u8, 8, 7];
        let data = ImmediateData::new(&body).unwrap();
        assert_eq!(data.as_slice(), &body);
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = 200;
        assert!(Message::decode(&buf).is_err());
    }

    #[test]
    fn system_exception_reply_round_trip() {
        let exception = SystemException::transient(orb_core::omg_minor(1));
        let message = Message::system_exception_reply(12, &exception);
        match Message::decode(&message.encode()).unwrap() {
            Message::ReplySystemException {
                request_id,
                completed,
                code,
                minor,
            } => {
                assert_eq!(request_id, 12);
                let decoded = Message::decode_system_exception(completed, code, minor);
                assert_eq!(decoded, exception);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
