//! Interoperable object references.
//!
//! An IOR is a repository id string plus a sequence of tagged profiles.
//! Canonical form sorts profiles by tag and tagged components by component
//! id, so reference identity survives re-marshaling. The ESIOP transport
//! addresses a peer by protection-domain id carried in a tagged component;
//! IIOP peers are addressed by listen point.

use crate::object_key::ObjectKey;
use crate::stream::{StreamIn, StreamOut};
use bytes::Bytes;
use orb_core::error::{CoreResult, SystemException};

/// IIOP profile tag.
pub const TAG_INTERNET_IOP: u32 = 0;
/// Multiple-components profile tag.
pub const TAG_MULTIPLE_COMPONENTS: u32 = 1;

/// Component: ORB type identifier.
pub const TAG_ORB_TYPE: u32 = 0;
/// Component: negotiated code sets.
pub const TAG_CODE_SETS: u32 = 1;
/// Component: the peer's protection-domain id within the local system
/// domain (ESIOP-specific).
pub const TAG_DOMAIN_ADDRESS: u32 = 0x4553_0001;
/// Component: per-reference flag octet (ESIOP-specific).
pub const TAG_FLAGS: u32 = 0x4553_0002;

/// ORB type advertised in `TAG_ORB_TYPE` components.
pub const ORB_TYPE_ID: u32 = 0x4f52_4253;

/// Reference flag: the peer garbage-collects this reference.
pub const REF_FLAG_GARBAGE_COLLECTION: u8 = 0x01;
/// Reference flag: the object survives its creating process.
pub const REF_FLAG_PERSISTENT: u8 = 0x02;
/// Reference flag: the object is local-only.
pub const REF_FLAG_LOCAL: u8 = 0x04;

/// Identifier of a protection domain within one host's system domain.
pub type ProtDomainId = u32;

/// A tagged component within a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedComponent {
    pub tag: u32,
    pub data: Bytes,
}

impl TaggedComponent {
    pub fn new(tag: u32, data: Bytes) -> Self {
        Self { tag, data }
    }

    /// An ORB-type component for this runtime.
    pub fn orb_type() -> Self {
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_u32(ORB_TYPE_ID);
        out.end_encapsulation();
        Self::new(TAG_ORB_TYPE, out.finish().slice(4..))
    }

    /// A domain-address component for a local ESIOP peer.
    pub fn domain_address(domain: ProtDomainId) -> Self {
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_u32(domain);
        out.end_encapsulation();
        Self::new(TAG_DOMAIN_ADDRESS, out.finish().slice(4..))
    }

    /// A flags component carrying the per-reference flag octet.
    pub fn flags(flags: u8) -> Self {
        Self::new(TAG_FLAGS, Bytes::copy_from_slice(&[flags]))
    }

    /// Decodes a u32 payload written as an encapsulation.
    pub fn read_u32(&self) -> CoreResult<u32> {
        let mut input = StreamIn::new_encapsulation(self.data.clone())?;
        input.read_u32()
    }

    /// Decodes a bare flag octet payload.
    pub fn read_flags(&self) -> CoreResult<u8> {
        self.data
            .first()
            .copied()
            .ok_or_else(SystemException::inv_objref)
    }
}

/// A tagged profile within an IOR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedProfile {
    pub tag: u32,
    pub data: Bytes,
}

/// The body of an IIOP profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IiopProfile {
    pub iiop_version: (u8, u8),
    pub host: String,
    pub port: u16,
    pub object_key: ObjectKey,
    pub components: Vec<TaggedComponent>,
}

impl IiopProfile {
    /// Encodes into a tagged profile, components in canonical order.
    pub fn into_tagged(mut self) -> TaggedProfile {
        self.components.sort_by_key(|c| c.tag);
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_u8(self.iiop_version.0);
        out.write_u8(self.iiop_version.1);
        out.write_string(&self.host);
        out.write_u16(self.port);
        self.object_key.marshal(&mut out);
        out.write_size(self.components.len());
        for component in &self.components {
            out.write_u32(component.tag);
            out.write_octet_seq(&component.data);
        }
        out.end_encapsulation();
        TaggedProfile {
            tag: TAG_INTERNET_IOP,
            data: out.finish().slice(4..),
        }
    }

    /// Decodes a `TAG_INTERNET_IOP` profile body.
    pub fn from_tagged(profile: &TaggedProfile) -> CoreResult<Self> {
        if profile.tag != TAG_INTERNET_IOP {
            return Err(SystemException::inv_objref());
        }
        let mut input = StreamIn::new_encapsulation(profile.data.clone())?;
        let major = input.read_u8()?;
        let minor = input.read_u8()?;
        let host = input.read_string()?;
        let port = input.read_u16()?;
        let object_key = ObjectKey::unmarshal(&mut input)?;
        let count = input.read_size()?;
        let mut components = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = input.read_u32()?;
            let data = input.read_octet_seq()?;
            components.push(TaggedComponent::new(tag, data));
        }
        Ok(Self {
            iiop_version: (major, minor),
            host,
            port,
            object_key,
            components,
        })
    }

    /// The component with the given tag, if present.
    pub fn component(&self, tag: u32) -> Option<&TaggedComponent> {
        self.components.iter().find(|c| c.tag == tag)
    }
}

/// Where a reference's target domain lives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DomainAddress {
    /// A sibling protection domain on this host, via shared memory.
    Esiop(ProtDomainId),
    /// A remote peer, via IIOP.
    Iiop { host: String, port: u16 },
}

/// An interoperable object reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ior {
    pub type_id: String,
    pub profiles: Vec<TaggedProfile>,
}

impl Ior {
    /// The nil reference.
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn is_nil(&self) -> bool {
        self.type_id.is_empty() && self.profiles.is_empty()
    }

    /// Builds a reference addressing `key` in `domain`.
    ///
    /// The local ESIOP form writes an IIOP profile with an empty host and
    /// the domain id in a tagged component, plus ORB type and flags.
    pub fn for_domain(
        type_id: impl Into<String>,
        address: &DomainAddress,
        key: &ObjectKey,
        flags: u8,
    ) -> Self {
        let (host, port, mut components) = match address {
            DomainAddress::Esiop(domain) => (
                String::new(),
                0u16,
                vec![
                    TaggedComponent::orb_type(),
                    TaggedComponent::domain_address(*domain),
                ],
            ),
            DomainAddress::Iiop { host, port } => {
                (host.clone(), *port, vec![TaggedComponent::orb_type()])
            }
        };
        if flags != 0 {
            components.push(TaggedComponent::flags(flags));
        }
        let profile = IiopProfile {
            iiop_version: (1, 2),
            host,
            port,
            object_key: key.clone(),
            components,
        };
        let mut ior = Self {
            type_id: type_id.into(),
            profiles: vec![profile.into_tagged()],
        };
        ior.canonicalize();
        ior
    }

    /// Sorts profiles into canonical order.
    pub fn canonicalize(&mut self) {
        self.profiles.sort_by(|a, b| {
            a.tag.cmp(&b.tag).then_with(|| a.data.cmp(&b.data))
        });
    }

    /// The address and object key of the first IIOP profile.
    pub fn primary_address(&self) -> CoreResult<(DomainAddress, ObjectKey, u8)> {
        let profile = self
            .profiles
            .iter()
            .find(|p| p.tag == TAG_INTERNET_IOP)
            .ok_or_else(SystemException::inv_objref)?;
        let body = IiopProfile::from_tagged(profile)?;
        let flags = body
            .component(TAG_FLAGS)
            .map(|c| c.read_flags())
            .transpose()?
            .unwrap_or(0);
        let address = match body.component(TAG_DOMAIN_ADDRESS) {
            Some(component) => DomainAddress::Esiop(component.read_u32()?),
            None => DomainAddress::Iiop {
                host: body.host.clone(),
                port: body.port,
            },
        };
        Ok((address, body.object_key, flags))
    }

    /// Marshals the reference: repository id string + tagged profiles.
    pub fn marshal(&self, out: &mut StreamOut) {
        out.write_string(&self.type_id);
        out.write_size(self.profiles.len());
        for profile in &self.profiles {
            out.write_u32(profile.tag);
            out.write_octet_seq(&profile.data);
        }
    }

    /// Unmarshals a reference and restores canonical ordering.
    pub fn unmarshal(input: &mut StreamIn) -> CoreResult<Self> {
        let type_id = input.read_string()?;
        let count = input.read_size()?;
        let mut profiles = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = input.read_u32()?;
            let data = input.read_octet_seq()?;
            profiles.push(TaggedProfile { tag, data });
        }
        let mut ior = Self { type_id, profiles };
        ior.canonicalize();
        Ok(ior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> ObjectKey {
        ObjectKey::new(vec!["sensors".into()], Bytes::from_static(b"thermo"))
    }

    #[test]
    fn esiop_reference_round_trip() {
        let ior = Ior::for_domain(
            "IDL:acme/Thermometer:1.0",
            &DomainAddress::Esiop(7),
            &sample_key(),
            REF_FLAG_GARBAGE_COLLECTION,
        );
        let mut out = StreamOut::with_order(true);
        ior.marshal(&mut out);
        let mut input = StreamIn::new(out.finish(), true);
        let decoded = Ior::unmarshal(&mut input).unwrap();
        assert_eq!(decoded, ior);

        let (address, key, flags) = decoded.primary_address().unwrap();
        assert_eq!(address, DomainAddress::Esiop(7));
        assert_eq!(key, sample_key());
        assert_eq!(flags, REF_FLAG_GARBAGE_COLLECTION);
    }

    #[test]
    fn iiop_reference_address() {
        let ior = Ior::for_domain(
            "IDL:acme/Thermometer:1.0",
            &DomainAddress::Iiop {
                host: "peer.example".into(),
                port: 2809,
            },
            &sample_key(),
            0,
        );
        let (address, _, flags) = ior.primary_address().unwrap();
        assert_eq!(
            address,
            DomainAddress::Iiop {
                host: "peer.example".into(),
                port: 2809
            }
        );
        assert_eq!(flags, 0);
    }

    #[test]
    fn components_are_sorted_by_id() {
        let ior = Ior::for_domain(
            "IDL:acme/X:1.0",
            &DomainAddress::Esiop(1),
            &sample_key(),
            REF_FLAG_PERSISTENT,
        );
        let body = IiopProfile::from_tagged(&ior.profiles[0]).unwrap();
        let tags: Vec<u32> = body.components.iter().map(|c| c.tag).collect();
        let mut sorted = tags.clone();
        sorted.sort_unstable();
        assert_eq!(tags, sorted);
    }

    #[test]
    fn nil_reference_round_trip() {
        let mut out = StreamOut::with_order(true);
        Ior::nil().marshal(&mut out);
        let mut input = StreamIn::new(out.finish(), true);
        let decoded = Ior::unmarshal(&mut input).unwrap();
        assert!(decoded.is_nil());
        assert!(decoded.primary_address().is_err());
    }
}
