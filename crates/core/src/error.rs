//! System exception types for the ORB runtime.
//!
//! Every fallible core operation reports a `SystemException`, the runtime's
//! single error currency. The kind set mirrors the standard system-exception
//! taxonomy; user-declared exceptions travel separately as [`UserException`]
//! payloads through request objects.

use bytes::Bytes;
use thiserror::Error;

/// Base of the OMG-assigned minor code space.
pub const OMG_MINOR_BASE: u32 = 0x4f4d_0000;

/// Builds a minor code in the OMG-assigned space.
pub const fn omg_minor(code: u32) -> u32 {
    OMG_MINOR_BASE | code
}

/// Completion status reported with a system exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionStatus {
    /// The operation completed before the exception was raised.
    Yes = 0,
    /// The operation did not run.
    #[default]
    No = 1,
    /// Completion state is unknown.
    Maybe = 2,
}

impl CompletionStatus {
    /// Decodes a wire octet into a completion status.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompletionStatus::Yes),
            1 => Some(CompletionStatus::No),
            2 => Some(CompletionStatus::Maybe),
            _ => None,
        }
    }
}

/// Kinds of system exception, in wire-code order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExceptionKind {
    /// Unspecified failure.
    Unknown = 0,
    /// Malformed parameter: bad id, bad policy value, nil where not allowed.
    BadParam = 1,
    /// Resource exhaustion on memory.
    NoMemory = 2,
    /// Implementation limit exceeded.
    ImpLimit = 3,
    /// Peer died or transport broke.
    CommFailure = 4,
    /// Malformed object reference or object key.
    InvObjref = 5,
    /// Missing or invalid security context.
    NoPermission = 6,
    /// Internal runtime inconsistency.
    Internal = 7,
    /// Encoding or decoding violation.
    Marshal = 8,
    /// Runtime not initialized or shutting down.
    Initialize = 9,
    /// Unsupported feature (GIOP minor, policy path).
    NoImplement = 10,
    /// Incomplete or self-inconsistent TypeCode.
    BadTypecode = 11,
    /// Invalid operation requested.
    BadOperation = 12,
    /// Out of non-memory resources (e.g. in-flight request cap).
    NoResources = 13,
    /// Response not yet available.
    NoResponse = 14,
    /// Retriable failure: adapter discarding, peer temporarily unavailable.
    Transient = 17,
    /// Operations were invoked out of order.
    BadInvOrder = 20,
    /// Adapter absent, inactive, or misconfigured.
    ObjAdapter = 25,
    /// Unknown object key under an existing adapter.
    ObjectNotExist = 26,
    /// Invocation deadline exceeded.
    Timeout = 32,
}

impl ExceptionKind {
    /// The repository id used to marshal this exception on the wire.
    pub fn repository_id(&self) -> &'static str {
        match self {
            ExceptionKind::Unknown => "IDL:omg.org/CORBA/UNKNOWN:1.0",
            ExceptionKind::BadParam => "IDL:omg.org/CORBA/BAD_PARAM:1.0",
            ExceptionKind::NoMemory => "IDL:omg.org/CORBA/NO_MEMORY:1.0",
            ExceptionKind::ImpLimit => "IDL:omg.org/CORBA/IMP_LIMIT:1.0",
            ExceptionKind::CommFailure => "IDL:omg.org/CORBA/COMM_FAILURE:1.0",
            ExceptionKind::InvObjref => "IDL:omg.org/CORBA/INV_OBJREF:1.0",
            ExceptionKind::NoPermission => "IDL:omg.org/CORBA/NO_PERMISSION:1.0",
            ExceptionKind::Internal => "IDL:omg.org/CORBA/INTERNAL:1.0",
            ExceptionKind::Marshal => "IDL:omg.org/CORBA/MARSHAL:1.0",
            ExceptionKind::Initialize => "IDL:omg.org/CORBA/INITIALIZE:1.0",
            ExceptionKind::NoImplement => "IDL:omg.org/CORBA/NO_IMPLEMENT:1.0",
            ExceptionKind::BadTypecode => "IDL:omg.org/CORBA/BAD_TYPECODE:1.0",
            ExceptionKind::BadOperation => "IDL:omg.org/CORBA/BAD_OPERATION:1.0",
            ExceptionKind::NoResources => "IDL:omg.org/CORBA/NO_RESOURCES:1.0",
            ExceptionKind::NoResponse => "IDL:omg.org/CORBA/NO_RESPONSE:1.0",
            ExceptionKind::Transient => "IDL:omg.org/CORBA/TRANSIENT:1.0",
            ExceptionKind::BadInvOrder => "IDL:omg.org/CORBA/BAD_INV_ORDER:1.0",
            ExceptionKind::ObjAdapter => "IDL:omg.org/CORBA/OBJ_ADAPTER:1.0",
            ExceptionKind::ObjectNotExist => "IDL:omg.org/CORBA/OBJECT_NOT_EXIST:1.0",
            ExceptionKind::Timeout => "IDL:omg.org/CORBA/TIMEOUT:1.0",
        }
    }

    /// The numeric wire code carried in `REPLY_SYSTEM_EXCEPTION` messages.
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Decodes a wire code back to a kind. Unrecognized codes map to `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => ExceptionKind::BadParam,
            2 => ExceptionKind::NoMemory,
            3 => ExceptionKind::ImpLimit,
            4 => ExceptionKind::CommFailure,
            5 => ExceptionKind::InvObjref,
            6 => ExceptionKind::NoPermission,
            7 => ExceptionKind::Internal,
            8 => ExceptionKind::Marshal,
            9 => ExceptionKind::Initialize,
            10 => ExceptionKind::NoImplement,
            11 => ExceptionKind::BadTypecode,
            12 => ExceptionKind::BadOperation,
            13 => ExceptionKind::NoResources,
            14 => ExceptionKind::NoResponse,
            17 => ExceptionKind::Transient,
            20 => ExceptionKind::BadInvOrder,
            25 => ExceptionKind::ObjAdapter,
            26 => ExceptionKind::ObjectNotExist,
            32 => ExceptionKind::Timeout,
            _ => ExceptionKind::Unknown,
        }
    }

    /// Looks up a kind from a marshaled repository id.
    pub fn from_repository_id(id: &str) -> Option<Self> {
        const ALL: &[ExceptionKind] = &[
            ExceptionKind::Unknown,
            ExceptionKind::BadParam,
            ExceptionKind::NoMemory,
            ExceptionKind::ImpLimit,
            ExceptionKind::CommFailure,
            ExceptionKind::InvObjref,
            ExceptionKind::NoPermission,
            ExceptionKind::Internal,
            ExceptionKind::Marshal,
            ExceptionKind::Initialize,
            ExceptionKind::NoImplement,
            ExceptionKind::BadTypecode,
            ExceptionKind::BadOperation,
            ExceptionKind::NoResources,
            ExceptionKind::NoResponse,
            ExceptionKind::Transient,
            ExceptionKind::BadInvOrder,
            ExceptionKind::ObjAdapter,
            ExceptionKind::ObjectNotExist,
            ExceptionKind::Timeout,
        ];
        ALL.iter().copied().find(|k| k.repository_id() == id)
    }
}

/// A system exception: kind plus minor code and completion status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} (minor 0x{minor:08x}, completed {completed:?})")]
pub struct SystemException {
    /// The exception kind.
    pub kind: ExceptionKind,
    /// Minor code qualifying the failure.
    pub minor: u32,
    /// Whether the operation completed.
    pub completed: CompletionStatus,
}

impl SystemException {
    /// Creates an exception with an explicit minor code.
    pub fn new(kind: ExceptionKind, minor: u32, completed: CompletionStatus) -> Self {
        Self {
            kind,
            minor,
            completed,
        }
    }

    pub fn bad_param(minor: u32) -> Self {
        Self::new(ExceptionKind::BadParam, minor, CompletionStatus::No)
    }

    pub fn inv_objref() -> Self {
        Self::new(ExceptionKind::InvObjref, 0, CompletionStatus::No)
    }

    pub fn object_not_exist(minor: u32) -> Self {
        Self::new(ExceptionKind::ObjectNotExist, minor, CompletionStatus::No)
    }

    pub fn obj_adapter(minor: u32) -> Self {
        Self::new(ExceptionKind::ObjAdapter, minor, CompletionStatus::No)
    }

    pub fn transient(minor: u32) -> Self {
        Self::new(ExceptionKind::Transient, minor, CompletionStatus::No)
    }

    pub fn comm_failure() -> Self {
        Self::new(ExceptionKind::CommFailure, 0, CompletionStatus::Maybe)
    }

    pub fn marshal(minor: u32) -> Self {
        Self::new(ExceptionKind::Marshal, minor, CompletionStatus::No)
    }

    pub fn bad_typecode() -> Self {
        Self::new(ExceptionKind::BadTypecode, 0, CompletionStatus::No)
    }

    pub fn no_permission() -> Self {
        Self::new(ExceptionKind::NoPermission, 0, CompletionStatus::No)
    }

    pub fn bad_inv_order(minor: u32) -> Self {
        Self::new(ExceptionKind::BadInvOrder, minor, CompletionStatus::No)
    }

    pub fn no_implement() -> Self {
        Self::new(ExceptionKind::NoImplement, 0, CompletionStatus::No)
    }

    pub fn no_resources() -> Self {
        Self::new(ExceptionKind::NoResources, 0, CompletionStatus::No)
    }

    pub fn timeout() -> Self {
        Self::new(ExceptionKind::Timeout, 0, CompletionStatus::No)
    }

    pub fn initialize() -> Self {
        Self::new(ExceptionKind::Initialize, 0, CompletionStatus::No)
    }

    pub fn internal(minor: u32) -> Self {
        Self::new(ExceptionKind::Internal, minor, CompletionStatus::Maybe)
    }

    pub fn unknown() -> Self {
        Self::new(ExceptionKind::Unknown, 0, CompletionStatus::Maybe)
    }

    /// Marks the exception with an explicit completion status.
    pub fn completed(mut self, status: CompletionStatus) -> Self {
        self.completed = status;
        self
    }
}

/// Result alias used throughout the runtime.
pub type CoreResult<T> = Result<T, SystemException>;

/// A user-declared exception carried opaquely through request channels.
///
/// The payload is the CDR-encoded exception body; the repository id lets the
/// caller match it against the operation's declared raises list. Receivers
/// that do not recognize the id surface `UNKNOWN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserException {
    /// Repository id of the exception type.
    pub repository_id: String,
    /// CDR-encoded exception body.
    pub payload: Bytes,
}

impl UserException {
    /// Creates a user exception from its id and encoded body.
    pub fn new(repository_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            repository_id: repository_id.into(),
            payload,
        }
    }
}

/// Either outcome of a failed request: system or user exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestException {
    /// A runtime-level failure.
    System(SystemException),
    /// A user-declared exception.
    User(UserException),
}

impl From<SystemException> for RequestException {
    fn from(e: SystemException) -> Self {
        RequestException::System(e)
    }
}

impl From<UserException> for RequestException {
    fn from(e: UserException) -> Self {
        RequestException::User(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_code_round_trip() {
        for kind in [
            ExceptionKind::BadParam,
            ExceptionKind::Transient,
            ExceptionKind::ObjAdapter,
            ExceptionKind::ObjectNotExist,
            ExceptionKind::Timeout,
        ] {
            assert_eq!(ExceptionKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn repository_id_round_trip() {
        let kind = ExceptionKind::BadInvOrder;
        assert_eq!(
            ExceptionKind::from_repository_id(kind.repository_id()),
            Some(kind)
        );
        assert_eq!(ExceptionKind::from_repository_id("IDL:acme/X:1.0"), None);
    }

    #[test]
    fn omg_minor_sets_high_bits() {
        assert_eq!(omg_minor(3), 0x4f4d_0003);
    }
}
