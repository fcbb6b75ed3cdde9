//! GIOP message framing.
//!
//! Fixed 12-byte header, request/reply/locate/cancel headers for GIOP
//! 1.0–1.2, and the service contexts the runtime consumes: negotiated code
//! sets, the invocation deadline, an RT priority (converted to a deadline),
//! and the security-attribute context.

use crate::codeset::{UTF_16, UTF_8};
use crate::stream::{StreamIn, StreamOut};
use bytes::Bytes;
use orb_core::deadline::{DeadlineTime, MILLISECOND};
use orb_core::error::{CoreResult, SystemException};

/// The four magic octets opening every GIOP message.
pub const GIOP_MAGIC: [u8; 4] = *b"GIOP";

/// Header flag: message body is little-endian.
pub const FLAG_LITTLE_ENDIAN: u8 = 0x01;
/// Header flag (GIOP >= 1.1): more fragments follow.
pub const FLAG_MORE_FRAGMENTS: u8 = 0x02;

/// GIOP message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Request = 0,
    Reply = 1,
    CancelRequest = 2,
    LocateRequest = 3,
    LocateReply = 4,
    CloseConnection = 5,
    MessageError = 6,
    Fragment = 7,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => MsgType::Request,
            1 => MsgType::Reply,
            2 => MsgType::CancelRequest,
            3 => MsgType::LocateRequest,
            4 => MsgType::LocateReply,
            5 => MsgType::CloseConnection,
            6 => MsgType::MessageError,
            7 => MsgType::Fragment,
            _ => return None,
        })
    }
}

/// GIOP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GiopVersion {
    pub major: u8,
    pub minor: u8,
}

impl GiopVersion {
    pub const V1_0: GiopVersion = GiopVersion { major: 1, minor: 0 };
    pub const V1_1: GiopVersion = GiopVersion { major: 1, minor: 1 };
    pub const V1_2: GiopVersion = GiopVersion { major: 1, minor: 2 };
}

/// The fixed 12-byte message header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiopHeader {
    pub version: GiopVersion,
    pub flags: u8,
    pub msg_type: MsgType,
    /// Body size. Zero on the ESIOP transport, which carries the logical
    /// length out-of-band.
    pub size: u32,
}

impl GiopHeader {
    pub const SIZE: usize = 12;

    pub fn new(version: GiopVersion, msg_type: MsgType, little_endian: bool, size: u32) -> Self {
        let mut flags = 0;
        if little_endian {
            flags |= FLAG_LITTLE_ENDIAN;
        }
        Self {
            version,
            flags,
            msg_type,
            size,
        }
    }

    pub fn little_endian(&self) -> bool {
        self.flags & FLAG_LITTLE_ENDIAN != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..4].copy_from_slice(&GIOP_MAGIC);
        bytes[4] = self.version.major;
        bytes[5] = self.version.minor;
        bytes[6] = self.flags;
        bytes[7] = self.msg_type as u8;
        let size = if self.little_endian() {
            self.size.to_le_bytes()
        } else {
            self.size.to_be_bytes()
        };
        bytes[8..].copy_from_slice(&size);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(SystemException::marshal(crate::stream::MINOR_FEWER_BYTES));
        }
        if bytes[..4] != GIOP_MAGIC {
            return Err(SystemException::marshal(0));
        }
        let version = GiopVersion {
            major: bytes[4],
            minor: bytes[5],
        };
        if version.major != 1 || version.minor > 2 {
            return Err(SystemException::no_implement());
        }
        let flags = bytes[6];
        let msg_type = MsgType::from_u8(bytes[7]).ok_or_else(|| SystemException::marshal(0))?;
        let little = flags & FLAG_LITTLE_ENDIAN != 0;
        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&bytes[8..12]);
        let size = if little {
            u32::from_le_bytes(size_bytes)
        } else {
            u32::from_be_bytes(size_bytes)
        };
        Ok(Self {
            version,
            flags,
            msg_type,
            size,
        })
    }
}

// Service context ids consumed by the runtime.

/// Negotiated transmission code sets.
pub const SC_CODE_SETS: u32 = 1;
/// RT priority, converted to a deadline on receipt.
pub const SC_RT_CORBA_PRIORITY: u32 = 10;
/// Security attribute service (client context id).
pub const SC_SECURITY_ATTRIBUTE: u32 = 15;
/// Invocation deadline: eight bytes of monotonic time in the message
/// byte order (ESIOP-specific).
pub const SC_DEADLINE: u32 = 0x4553_4401;

/// One service context entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceContext {
    pub context_id: u32,
    pub data: Bytes,
}

impl ServiceContext {
    pub fn new(context_id: u32, data: Bytes) -> Self {
        Self { context_id, data }
    }

    /// Builds the code-sets context.
    pub fn code_sets(char_data: u32, wchar_data: u32) -> Self {
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_u32(char_data);
        out.write_u32(wchar_data);
        out.end_encapsulation();
        Self::new(SC_CODE_SETS, out.finish().slice(4..))
    }

    /// Default code sets advertised by this runtime.
    pub fn default_code_sets() -> Self {
        Self::code_sets(UTF_8, UTF_16)
    }

    /// Parses a code-sets context into (char, wchar) ids.
    pub fn parse_code_sets(&self) -> CoreResult<(u32, u32)> {
        let mut input = StreamIn::new_encapsulation(self.data.clone())?;
        Ok((input.read_u32()?, input.read_u32()?))
    }

    /// Builds the invocation-deadline context.
    pub fn deadline(deadline: DeadlineTime, little_endian: bool) -> Self {
        let data = if little_endian {
            deadline.to_le_bytes()
        } else {
            deadline.to_be_bytes()
        };
        Self::new(SC_DEADLINE, Bytes::copy_from_slice(&data))
    }

    /// Parses a deadline context using the message byte order.
    pub fn parse_deadline(&self, little_endian: bool) -> CoreResult<DeadlineTime> {
        if self.data.len() != 8 {
            return Err(SystemException::marshal(0));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data);
        Ok(if little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }

    /// Builds the RT-priority context.
    pub fn rt_priority(priority: i16) -> Self {
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_i16(priority);
        out.end_encapsulation();
        Self::new(SC_RT_CORBA_PRIORITY, out.finish().slice(4..))
    }

    /// Parses an RT-priority context.
    pub fn parse_rt_priority(&self) -> CoreResult<i16> {
        let mut input = StreamIn::new_encapsulation(self.data.clone())?;
        input.read_i16()
    }

    /// Builds the security-attribute context carrying a client context id.
    pub fn security_attribute(client_context_id: u64) -> Self {
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_u64(client_context_id);
        out.end_encapsulation();
        Self::new(SC_SECURITY_ATTRIBUTE, out.finish().slice(4..))
    }

    /// Parses a security-attribute context.
    pub fn parse_security_attribute(&self) -> CoreResult<u64> {
        let mut input = StreamIn::new_encapsulation(self.data.clone())?;
        input.read_u64()
    }
}

/// Writes a service-context list.
pub fn write_service_contexts(out: &mut StreamOut, contexts: &[ServiceContext]) {
    out.write_size(contexts.len());
    for sc in contexts {
        out.write_u32(sc.context_id);
        out.write_octet_seq(&sc.data);
    }
}

/// Reads a service-context list.
pub fn read_service_contexts(input: &mut StreamIn) -> CoreResult<Vec<ServiceContext>> {
    let count = input.read_size()?;
    let mut contexts = Vec::with_capacity(count);
    for _ in 0..count {
        let context_id = input.read_u32()?;
        let data = input.read_octet_seq()?;
        contexts.push(ServiceContext::new(context_id, data));
    }
    Ok(contexts)
}

/// Converts an RT priority to a relative deadline interval: higher
/// priority, tighter deadline. Priority 0 maps to roughly three seconds.
pub fn priority_to_deadline(priority: i16) -> DeadlineTime {
    let span = i64::from(i16::MAX) - i64::from(priority);
    (span.max(1) as DeadlineTime) * (MILLISECOND / 10)
}

/// Response-flags values (GIOP 1.2 encoding).
pub const RESPONSE_NONE: u8 = 0x00;
/// The caller expects a reply.
pub const RESPONSE_EXPECTED: u8 = 0x03;

/// A decoded request header, version-independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u32,
    pub response_flags: u8,
    pub object_key: Bytes,
    pub operation: String,
    pub service_contexts: Vec<ServiceContext>,
}

impl RequestHeader {
    pub fn response_expected(&self) -> bool {
        self.response_flags & 0x01 != 0
    }

    /// Encodes after the GIOP header, per version.
    pub fn encode(&self, out: &mut StreamOut, version: GiopVersion) {
        if version >= GiopVersion::V1_2 {
            out.write_u32(self.request_id);
            out.write_u8(self.response_flags);
            out.write_octets(&[0; 3]);
            // TargetAddress, KeyAddr disposition.
            out.write_i16(0);
            out.write_octet_seq(&self.object_key);
            out.write_string(&self.operation);
            write_service_contexts(out, &self.service_contexts);
        } else {
            write_service_contexts(out, &self.service_contexts);
            out.write_u32(self.request_id);
            out.write_bool(self.response_expected());
            out.write_octet_seq(&self.object_key);
            out.write_string(&self.operation);
            // requesting_principal, deprecated and empty.
            out.write_size(0);
        }
    }

    pub fn decode(input: &mut StreamIn, version: GiopVersion) -> CoreResult<Self> {
        if version >= GiopVersion::V1_2 {
            let request_id = input.read_u32()?;
            let response_flags = input.read_u8()?;
            input.read_octets(3)?;
            let disposition = input.read_i16()?;
            if disposition != 0 {
                // Only KeyAddr is supported.
                return Err(SystemException::no_implement());
            }
            let object_key = input.read_octet_seq()?;
            let operation = input.read_string()?;
            let service_contexts = read_service_contexts(input)?;
            Ok(Self {
                request_id,
                response_flags,
                object_key,
                operation,
                service_contexts,
            })
        } else {
            let service_contexts = read_service_contexts(input)?;
            let request_id = input.read_u32()?;
            let response_expected = input.read_bool()?;
            let object_key = input.read_octet_seq()?;
            let operation = input.read_string()?;
            let principal = input.read_size()?;
            input.read_octets(principal)?;
            Ok(Self {
                request_id,
                response_flags: if response_expected {
                    RESPONSE_EXPECTED
                } else {
                    RESPONSE_NONE
                },
                object_key,
                operation,
                service_contexts,
            })
        }
    }
}

/// Reply status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReplyStatus {
    NoException = 0,
    UserException = 1,
    SystemException = 2,
    LocationForward = 3,
}

impl ReplyStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => ReplyStatus::NoException,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::SystemException,
            3 => ReplyStatus::LocationForward,
            _ => return None,
        })
    }
}

/// A decoded reply header, version-independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub request_id: u32,
    pub status: ReplyStatus,
    pub service_contexts: Vec<ServiceContext>,
}

impl ReplyHeader {
    pub fn encode(&self, out: &mut StreamOut, version: GiopVersion) {
        if version >= GiopVersion::V1_2 {
            out.write_u32(self.request_id);
            out.write_u32(self.status as u32);
            write_service_contexts(out, &self.service_contexts);
        } else {
            write_service_contexts(out, &self.service_contexts);
            out.write_u32(self.request_id);
            out.write_u32(self.status as u32);
        }
    }

    pub fn decode(input: &mut StreamIn, version: GiopVersion) -> CoreResult<Self> {
        if version >= GiopVersion::V1_2 {
            let request_id = input.read_u32()?;
            let status = ReplyStatus::from_u32(input.read_u32()?)
                .ok_or_else(|| SystemException::marshal(0))?;
            let service_contexts = read_service_contexts(input)?;
            Ok(Self {
                request_id,
                status,
                service_contexts,
            })
        } else {
            let service_contexts = read_service_contexts(input)?;
            let request_id = input.read_u32()?;
            let status = ReplyStatus::from_u32(input.read_u32()?)
                .ok_or_else(|| SystemException::marshal(0))?;
            Ok(Self {
                request_id,
                status,
                service_contexts,
            })
        }
    }
}

/// Locate request status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LocateStatus {
    UnknownObject = 0,
    ObjectHere = 1,
    ObjectForward = 2,
}

impl LocateStatus {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => LocateStatus::UnknownObject,
            1 => LocateStatus::ObjectHere,
            2 => LocateStatus::ObjectForward,
            _ => return None,
        })
    }
}

/// A locate request: id plus target key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateRequestHeader {
    pub request_id: u32,
    pub object_key: Bytes,
}

impl LocateRequestHeader {
    pub fn encode(&self, out: &mut StreamOut, version: GiopVersion) {
        out.write_u32(self.request_id);
        if version >= GiopVersion::V1_2 {
            out.write_i16(0);
        }
        out.write_octet_seq(&self.object_key);
    }

    pub fn decode(input: &mut StreamIn, version: GiopVersion) -> CoreResult<Self> {
        let request_id = input.read_u32()?;
        if version >= GiopVersion::V1_2 {
            let disposition = input.read_i16()?;
            if disposition != 0 {
                return Err(SystemException::no_implement());
            }
        }
        let object_key = input.read_octet_seq()?;
        Ok(Self {
            request_id,
            object_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::deadline::Clock;

    #[test]
    fn header_round_trip_both_orders() {
        for little in [true, false] {
            let header = GiopHeader::new(GiopVersion::V1_2, MsgType::Request, little, 128);
            let decoded = GiopHeader::from_bytes(&header.to_bytes()).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(decoded.little_endian(), little);
            assert_eq!(decoded.size, 128);
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = GiopHeader::new(GiopVersion::V1_0, MsgType::Reply, true, 0).to_bytes();
        bytes[0] = b'X';
        assert!(GiopHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn unsupported_minor_is_rejected() {
        let mut bytes = GiopHeader::new(GiopVersion::V1_2, MsgType::Reply, true, 0).to_bytes();
        bytes[5] = 9;
        let err = GiopHeader::from_bytes(&bytes).expect_err("minor 9");
        assert_eq!(err.kind, orb_core::error::ExceptionKind::NoImplement);
    }

    #[test]
    fn request_header_round_trip_all_versions() {
        let header = RequestHeader {
            request_id: 42,
            response_flags: RESPONSE_EXPECTED,
            object_key: Bytes::from_static(b"key-bytes"),
            operation: "poll".into(),
            service_contexts: vec![ServiceContext::default_code_sets()],
        };
        for version in [GiopVersion::V1_0, GiopVersion::V1_1, GiopVersion::V1_2] {
            let mut out = StreamOut::with_order(true);
            header.encode(&mut out, version);
            let mut input = StreamIn::new(out.finish(), true);
            let decoded = RequestHeader::decode(&mut input, version).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn reply_header_round_trip() {
        let header = ReplyHeader {
            request_id: 7,
            status: ReplyStatus::UserException,
            service_contexts: Vec::new(),
        };
        for version in [GiopVersion::V1_0, GiopVersion::V1_2] {
            let mut out = StreamOut::with_order(false);
            header.encode(&mut out, version);
            let mut input = StreamIn::new(out.finish(), false);
            assert_eq!(ReplyHeader::decode(&mut input, version).unwrap(), header);
        }
    }

    #[test]
    fn deadline_context_round_trip() {
        let deadline = Clock::make_deadline(5 * MILLISECOND);
        for little in [true, false] {
            let sc = ServiceContext::deadline(deadline, little);
            assert_eq!(sc.data.len(), 8);
            assert_eq!(sc.parse_deadline(little).unwrap(), deadline);
        }
    }

    #[test]
    fn code_sets_context_round_trip() {
        let sc = ServiceContext::default_code_sets();
        assert_eq!(sc.parse_code_sets().unwrap(), (UTF_8, UTF_16));
    }

    #[test]
    fn priority_maps_monotonically_to_deadline() {
        assert!(priority_to_deadline(100) > priority_to_deadline(30000));
        assert!(priority_to_deadline(i16::MAX) >= 1);
    }

    #[test]
    fn security_context_round_trip() {
        let sc = ServiceContext::security_attribute(0xDEAD_BEEF_CAFE);
        assert_eq!(sc.parse_security_attribute().unwrap(), 0xDEAD_BEEF_CAFE);
    }

    #[test]
    fn locate_request_round_trip() {
        let header = LocateRequestHeader {
            request_id: 5,
            object_key: Bytes::from_static(b"abc"),
        };
        let mut out = StreamOut::with_order(true);
        header.encode(&mut out, GiopVersion::V1_2);
        let mut input = StreamIn::new(out.finish(), true);
        assert_eq!(
            LocateRequestHeader::decode(&mut input, GiopVersion::V1_2).unwrap(),
            header
        );
    }
}
