//! POA policies.
//!
//! The six policy axes determine an adapter's dispatch behavior. The source
//! of truth is a plain tuple of enums validated at POA creation; the
//! encapsulated `PolicyValue` form exists for references and the wire, with
//! a registry of read/write/create triples keyed by policy type.

use crate::error::{PoaError, PoaResult};
use bytes::Bytes;
use orb_core::error::{CoreResult, SystemException};
use orb_io::stream::{StreamIn, StreamOut};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Policy type id: lifespan.
pub const LIFESPAN_POLICY_ID: u32 = 17;
/// Policy type id: id uniqueness.
pub const ID_UNIQUENESS_POLICY_ID: u32 = 18;
/// Policy type id: id assignment.
pub const ID_ASSIGNMENT_POLICY_ID: u32 = 19;
/// Policy type id: implicit activation.
pub const IMPLICIT_ACTIVATION_POLICY_ID: u32 = 20;
/// Policy type id: servant retention.
pub const SERVANT_RETENTION_POLICY_ID: u32 = 21;
/// Policy type id: request processing.
pub const REQUEST_PROCESSING_POLICY_ID: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifespan {
    /// Objects die with the adapter that created them.
    #[default]
    Transient = 0,
    /// Objects outlive the process.
    Persistent = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdUniqueness {
    /// A servant may be active under at most one id.
    #[default]
    UniqueId = 0,
    /// A servant may be active under several ids.
    MultipleId = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdAssignment {
    /// Object ids are supplied by the application.
    UserId = 0,
    /// Object ids are generated by the adapter.
    #[default]
    SystemId = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImplicitActivation {
    Implicit = 0,
    #[default]
    NoImplicit = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServantRetention {
    /// Activations are recorded in the active object map.
    #[default]
    Retain = 0,
    /// No active object map is kept.
    NonRetain = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestProcessing {
    /// Only the active object map is consulted.
    #[default]
    UseAomOnly = 0,
    /// Fall back to the default servant.
    UseDefaultServant = 1,
    /// Fall back to the servant manager.
    UseServantManager = 2,
}

/// The six-axis policy tuple of one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyTuple {
    pub lifespan: Lifespan,
    pub id_uniqueness: IdUniqueness,
    pub id_assignment: IdAssignment,
    pub implicit_activation: ImplicitActivation,
    pub servant_retention: ServantRetention,
    pub request_processing: RequestProcessing,
}

impl PolicyTuple {
    /// The root POA's policy mix.
    pub fn root() -> Self {
        Self {
            implicit_activation: ImplicitActivation::Implicit,
            ..Self::default()
        }
    }

    /// Rejects conflicting combinations. The reported index follows the
    /// canonical axis order (lifespan first).
    pub fn validate(&self) -> PoaResult<()> {
        if self.servant_retention == ServantRetention::NonRetain
            && self.request_processing == RequestProcessing::UseAomOnly
        {
            return Err(PoaError::InvalidPolicy(5));
        }
        if self.implicit_activation == ImplicitActivation::Implicit {
            if self.id_assignment != IdAssignment::SystemId {
                return Err(PoaError::InvalidPolicy(3));
            }
            if self.servant_retention != ServantRetention::Retain {
                return Err(PoaError::InvalidPolicy(3));
            }
        }
        Ok(())
    }

    /// Builds a tuple from encapsulated policy values, axis by axis.
    /// Unknown policy types and out-of-range values report the offending
    /// list index.
    pub fn from_values(values: &[PolicyValue]) -> PoaResult<Self> {
        let mut tuple = Self::default();
        for (index, value) in values.iter().enumerate() {
            let index = index as u16;
            let v = value.read_u32().map_err(|_| PoaError::InvalidPolicy(index))?;
            match value.policy_type {
                LIFESPAN_POLICY_ID => {
                    tuple.lifespan = match v {
                        0 => Lifespan::Transient,
                        1 => Lifespan::Persistent,
                        _ => return Err(PoaError::InvalidPolicy(index)),
                    }
                }
                ID_UNIQUENESS_POLICY_ID => {
                    tuple.id_uniqueness = match v {
                        0 => IdUniqueness::UniqueId,
                        1 => IdUniqueness::MultipleId,
                        _ => return Err(PoaError::InvalidPolicy(index)),
                    }
                }
                ID_ASSIGNMENT_POLICY_ID => {
                    tuple.id_assignment = match v {
                        0 => IdAssignment::UserId,
                        1 => IdAssignment::SystemId,
                        _ => return Err(PoaError::InvalidPolicy(index)),
                    }
                }
                IMPLICIT_ACTIVATION_POLICY_ID => {
                    tuple.implicit_activation = match v {
                        0 => ImplicitActivation::Implicit,
                        1 => ImplicitActivation::NoImplicit,
                        _ => return Err(PoaError::InvalidPolicy(index)),
                    }
                }
                SERVANT_RETENTION_POLICY_ID => {
                    tuple.servant_retention = match v {
                        0 => ServantRetention::Retain,
                        1 => ServantRetention::NonRetain,
                        _ => return Err(PoaError::InvalidPolicy(index)),
                    }
                }
                REQUEST_PROCESSING_POLICY_ID => {
                    tuple.request_processing = match v {
                        0 => RequestProcessing::UseAomOnly,
                        1 => RequestProcessing::UseDefaultServant,
                        2 => RequestProcessing::UseServantManager,
                        _ => return Err(PoaError::InvalidPolicy(index)),
                    }
                }
                _ => return Err(PoaError::InvalidPolicy(index)),
            }
        }
        tuple.validate()?;
        Ok(tuple)
    }
}

/// An encapsulated policy value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyValue {
    pub policy_type: u32,
    pub data: Bytes,
}

impl PolicyValue {
    /// Encapsulates an enum-valued policy.
    pub fn from_u32(policy_type: u32, value: u32) -> Self {
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_u32(value);
        out.end_encapsulation();
        Self {
            policy_type,
            data: out.finish().slice(4..),
        }
    }

    /// Decodes an enum-valued policy.
    pub fn read_u32(&self) -> CoreResult<u32> {
        let mut input = StreamIn::new_encapsulation(self.data.clone())?;
        input.read_u32()
    }
}

/// A policy map attached to a reference or adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySet {
    values: BTreeMap<u32, PolicyValue>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: PolicyValue) {
        self.values.insert(value.policy_type, value);
    }

    pub fn get(&self, policy_type: u32) -> Option<&PolicyValue> {
        self.values.get(&policy_type)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolicyValue> {
        self.values.values()
    }
}

/// Read/write/create triple registered per policy type.
pub struct PolicyFactoryEntry {
    /// Decodes the encapsulated value (validation only).
    pub read: fn(&PolicyValue) -> CoreResult<u32>,
    /// Encodes a raw value.
    pub write: fn(u32) -> PolicyValue,
    /// Validates and creates a policy value.
    pub create: fn(u32) -> CoreResult<PolicyValue>,
}

/// Registry of policy factories. Unknown policy types are rejected.
pub struct PolicyFactoryRegistry {
    entries: RwLock<BTreeMap<u32, PolicyFactoryEntry>>,
}

fn enum_entry(policy_type: u32) -> PolicyFactoryEntry {
    PolicyFactoryEntry {
        read: |v| v.read_u32(),
        write: writer_for(policy_type),
        create: creator_for(policy_type),
    }
}

// fn pointers cannot capture, so the triples dispatch on the type id.
fn writer_for(policy_type: u32) -> fn(u32) -> PolicyValue {
    match policy_type {
        LIFESPAN_POLICY_ID => |v| PolicyValue::from_u32(LIFESPAN_POLICY_ID, v),
        ID_UNIQUENESS_POLICY_ID => |v| PolicyValue::from_u32(ID_UNIQUENESS_POLICY_ID, v),
        ID_ASSIGNMENT_POLICY_ID => |v| PolicyValue::from_u32(ID_ASSIGNMENT_POLICY_ID, v),
        IMPLICIT_ACTIVATION_POLICY_ID => {
            |v| PolicyValue::from_u32(IMPLICIT_ACTIVATION_POLICY_ID, v)
        }
        SERVANT_RETENTION_POLICY_ID => |v| PolicyValue::from_u32(SERVANT_RETENTION_POLICY_ID, v),
        _ => |v| PolicyValue::from_u32(REQUEST_PROCESSING_POLICY_ID, v),
    }
}

fn creator_for(policy_type: u32) -> fn(u32) -> CoreResult<PolicyValue> {
    match policy_type {
        LIFESPAN_POLICY_ID => |v| {
            if v > 1 {
                return Err(SystemException::bad_param(0));
            }
            Ok(PolicyValue::from_u32(LIFESPAN_POLICY_ID, v))
        },
        ID_UNIQUENESS_POLICY_ID => |v| {
            if v > 1 {
                return Err(SystemException::bad_param(0));
            }
            Ok(PolicyValue::from_u32(ID_UNIQUENESS_POLICY_ID, v))
        },
        ID_ASSIGNMENT_POLICY_ID => |v| {
            if v > 1 {
                return Err(SystemException::bad_param(0));
            }
            Ok(PolicyValue::from_u32(ID_ASSIGNMENT_POLICY_ID, v))
        },
        IMPLICIT_ACTIVATION_POLICY_ID => |v| {
            if v > 1 {
                return Err(SystemException::bad_param(0));
            }
            Ok(PolicyValue::from_u32(IMPLICIT_ACTIVATION_POLICY_ID, v))
        },
        SERVANT_RETENTION_POLICY_ID => |v| {
            if v > 1 {
                return Err(SystemException::bad_param(0));
            }
            Ok(PolicyValue::from_u32(SERVANT_RETENTION_POLICY_ID, v))
        },
        _ => |v| {
            if v > 2 {
                return Err(SystemException::bad_param(0));
            }
            Ok(PolicyValue::from_u32(REQUEST_PROCESSING_POLICY_ID, v))
        },
    }
}

impl Default for PolicyFactoryRegistry {
    fn default() -> Self {
        let registry = Self {
            entries: RwLock::new(BTreeMap::new()),
        };
        for policy_type in [
            LIFESPAN_POLICY_ID,
            ID_UNIQUENESS_POLICY_ID,
            ID_ASSIGNMENT_POLICY_ID,
            IMPLICIT_ACTIVATION_POLICY_ID,
            SERVANT_RETENTION_POLICY_ID,
            REQUEST_PROCESSING_POLICY_ID,
        ] {
            registry
                .entries
                .write()
                .insert(policy_type, enum_entry(policy_type));
        }
        registry
    }
}

impl PolicyFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, policy_type: u32, entry: PolicyFactoryEntry) {
        self.entries.write().insert(policy_type, entry);
    }

    /// Creates a policy value; unknown types are rejected with BAD_PARAM.
    pub fn create(&self, policy_type: u32, value: u32) -> CoreResult<PolicyValue> {
        let entries = self.entries.read();
        let entry = entries
            .get(&policy_type)
            .ok_or_else(|| SystemException::bad_param(orb_core::omg_minor(30)))?;
        (entry.create)(value)
    }

    /// Validates an incoming policy value against its registered reader.
    pub fn read(&self, value: &PolicyValue) -> CoreResult<u32> {
        let entries = self.entries.read();
        let entry = entries
            .get(&value.policy_type)
            .ok_or_else(|| SystemException::bad_param(orb_core::omg_minor(30)))?;
        (entry.read)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tuple_is_valid() {
        PolicyTuple::default().validate().expect("default");
        PolicyTuple::root().validate().expect("root");
    }

    #[test]
    fn non_retain_with_aom_only_is_rejected() {
        let tuple = PolicyTuple {
            servant_retention: ServantRetention::NonRetain,
            implicit_activation: ImplicitActivation::NoImplicit,
            ..Default::default()
        };
        assert_eq!(tuple.validate(), Err(PoaError::InvalidPolicy(5)));
    }

    #[test]
    fn implicit_requires_system_id_and_retain() {
        let tuple = PolicyTuple {
            implicit_activation: ImplicitActivation::Implicit,
            id_assignment: IdAssignment::UserId,
            ..Default::default()
        };
        assert_eq!(tuple.validate(), Err(PoaError::InvalidPolicy(3)));
    }

    #[test]
    fn tuple_from_values_round_trip() {
        let values = vec![
            PolicyValue::from_u32(LIFESPAN_POLICY_ID, 1),
            PolicyValue::from_u32(ID_ASSIGNMENT_POLICY_ID, 0),
            PolicyValue::from_u32(IMPLICIT_ACTIVATION_POLICY_ID, 1),
            PolicyValue::from_u32(REQUEST_PROCESSING_POLICY_ID, 2),
        ];
        let tuple = PolicyTuple::from_values(&values).unwrap();
        assert_eq!(tuple.lifespan, Lifespan::Persistent);
        assert_eq!(tuple.id_assignment, IdAssignment::UserId);
        assert_eq!(tuple.request_processing, RequestProcessing::UseServantManager);
    }

    #[test]
    fn unknown_policy_type_reports_index() {
        let values = vec![
            PolicyValue::from_u32(LIFESPAN_POLICY_ID, 0),
            PolicyValue::from_u32(999, 0),
        ];
        assert_eq!(
            PolicyTuple::from_values(&values),
            Err(PoaError::InvalidPolicy(1))
        );
    }

    #[test]
    fn registry_rejects_unknown_and_out_of_range() {
        let registry = PolicyFactoryRegistry::new();
        assert!(registry.create(999, 0).is_err());
        assert!(registry.create(LIFESPAN_POLICY_ID, 7).is_err());
        let value = registry.create(REQUEST_PROCESSING_POLICY_ID, 2).unwrap();
        assert_eq!(registry.read(&value).unwrap(), 2);
    }
}
