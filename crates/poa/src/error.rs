//! Adapter-level errors.
//!
//! These mirror the PortableServer user exceptions; runtime-level failures
//! ride along as system exceptions.

use orb_core::error::SystemException;
use thiserror::Error;

/// Errors raised by POA operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoaError {
    #[error("adapter already exists")]
    AdapterAlreadyExists,

    #[error("adapter non-existent")]
    AdapterNonExistent,

    #[error("adapter inactive")]
    AdapterInactive,

    #[error("invalid policy at index {0}")]
    InvalidPolicy(u16),

    #[error("no servant")]
    NoServant,

    #[error("object already active")]
    ObjectAlreadyActive,

    #[error("object not active")]
    ObjectNotActive,

    #[error("servant already active")]
    ServantAlreadyActive,

    #[error("servant not active")]
    ServantNotActive,

    #[error("reference belongs to another adapter")]
    WrongAdapter,

    #[error("operation not allowed under this policy mix")]
    WrongPolicy,

    #[error("no dispatch context")]
    NoContext,

    #[error("POA manager already exists")]
    ManagerAlreadyExists,

    #[error(transparent)]
    System(#[from] SystemException),
}

impl PoaError {
    /// Maps adapter errors to the system exception reported at the request
    /// boundary.
    pub fn to_system(&self) -> SystemException {
        match self {
            PoaError::AdapterNonExistent | PoaError::AdapterInactive => {
                SystemException::obj_adapter(orb_core::omg_minor(1))
            }
            PoaError::ObjectNotActive | PoaError::ServantNotActive => {
                SystemException::object_not_exist(orb_core::omg_minor(2))
            }
            PoaError::NoServant => SystemException::obj_adapter(orb_core::omg_minor(3)),
            PoaError::System(e) => e.clone(),
            _ => SystemException::bad_param(0),
        }
    }
}

/// Result alias for adapter operations.
pub type PoaResult<T> = Result<T, PoaError>;
