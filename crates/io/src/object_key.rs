//! Object keys.
//!
//! An object key names an object within a domain: the adapter path from the
//! root POA plus an opaque object id. The canonical in-memory form is this
//! pair; the wire admits two encodings (a bare short id, or a
//! self-delimited encapsulation), and both decode to the same canonical
//! value. The short form exists only at the wire boundary and is never
//! stored.

use crate::stream::{StreamIn, StreamOut};
use bytes::Bytes;
use orb_core::error::{CoreResult, SystemException};

/// Longest object id still eligible for the short wire form.
pub const SHORT_FORM_MAX_ID: usize = 4;

/// Canonical object key: adapter path plus object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ObjectKey {
    adapter_path: Vec<String>,
    object_id: Bytes,
}

impl ObjectKey {
    pub fn new(adapter_path: Vec<String>, object_id: Bytes) -> Self {
        Self {
            adapter_path,
            object_id,
        }
    }

    /// A key directly under the root POA.
    pub fn root(object_id: Bytes) -> Self {
        Self::new(Vec::new(), object_id)
    }

    pub fn adapter_path(&self) -> &[String] {
        &self.adapter_path
    }

    pub fn object_id(&self) -> &Bytes {
        &self.object_id
    }

    /// Encodes the canonical wire form.
    ///
    /// A key with an empty path and an id of at most four bytes is sent as
    /// the bare id; anything else is a self-delimited encapsulation. The
    /// encapsulation is always at least eight bytes, so the two forms never
    /// collide.
    pub fn encode(&self) -> Bytes {
        if self.adapter_path.is_empty() && self.object_id.len() <= SHORT_FORM_MAX_ID {
            return self.object_id.clone();
        }
        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_octet_seq(&self.object_id);
        out.write_size(self.adapter_path.len());
        for name in &self.adapter_path {
            out.write_string(name);
        }
        out.end_encapsulation();
        // Strip the outer length field: the wire key is self-delimited by
        // the transport.
        out.finish().slice(4..)
    }

    /// Decodes either wire form back to the canonical key.
    pub fn decode(raw: &[u8]) -> CoreResult<Self> {
        if raw.len() < 8 {
            return Ok(Self::root(Bytes::copy_from_slice(raw)));
        }
        let mut input = StreamIn::new_encapsulation(Bytes::copy_from_slice(raw))
            .map_err(|_| SystemException::inv_objref())?;
        let object_id = input
            .read_octet_seq()
            .map_err(|_| SystemException::inv_objref())?;
        let count = input.read_size().map_err(|_| SystemException::inv_objref())?;
        let mut adapter_path = Vec::with_capacity(count);
        for _ in 0..count {
            adapter_path.push(
                input
                    .read_string()
                    .map_err(|_| SystemException::inv_objref())?,
            );
        }
        if input.end() != 0 {
            return Err(SystemException::inv_objref());
        }
        Ok(Self::new(adapter_path, object_id))
    }

    /// Writes the key as an octet sequence into a CDR stream.
    pub fn marshal(&self, out: &mut StreamOut) {
        let encoded = self.encode();
        out.write_octet_seq(&encoded);
    }

    /// Reads a key written by [`marshal`](Self::marshal).
    pub fn unmarshal(input: &mut StreamIn) -> CoreResult<Self> {
        let raw = input.read_octet_seq()?;
        Self::decode(&raw)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for name in &self.adapter_path {
            write!(f, "{name}/")?;
        }
        for byte in self.object_id.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &ObjectKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn short_ids_use_the_bare_form() {
        let key = ObjectKey::root(Bytes::from_static(&[1, 2, 3]));
        let encoded = key.encode();
        assert_eq!(&encoded[..], &[1, 2, 3]);
        assert_eq!(ObjectKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn long_ids_use_the_encapsulated_form() {
        let key = ObjectKey::root(Bytes::from_static(&[1, 2, 3, 4, 5]));
        let encoded = key.encode();
        assert!(encoded.len() >= 8);
        assert_eq!(ObjectKey::decode(&encoded).unwrap(), key);
    }

    #[test]
    fn both_encodings_of_one_key_compare_and_hash_equal() {
        // A short-eligible key forced through the encapsulated path must
        // decode to the same canonical value as the short form.
        let canonical = ObjectKey::root(Bytes::from_static(&[9]));

        let mut out = StreamOut::new();
        out.begin_encapsulation();
        out.write_octet_seq(&[9]);
        out.write_size(0);
        out.end_encapsulation();
        let encapsulated = out.finish().slice(4..);

        let from_long = ObjectKey::decode(&encapsulated).unwrap();
        let from_short = ObjectKey::decode(&[9]).unwrap();
        assert_eq!(from_long, canonical);
        assert_eq!(from_short, canonical);
        assert_eq!(hash_of(&from_long), hash_of(&from_short));
    }

    #[test]
    fn pathed_keys_round_trip() {
        let key = ObjectKey::new(
            vec!["services".into(), "logging".into()],
            Bytes::from_static(b"sink-01"),
        );
        let decoded = ObjectKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(decoded.adapter_path(), ["services", "logging"]);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let key = ObjectKey::new(vec!["a".into()], Bytes::from_static(b"id"));
        let mut raw = key.encode().to_vec();
        raw.push(0xFF);
        assert!(ObjectKey::decode(&raw).is_err());
    }

    #[test]
    fn stream_marshal_round_trip() {
        let key = ObjectKey::new(vec!["root".into()], Bytes::from_static(b"object"));
        let mut out = StreamOut::with_order(true);
        key.marshal(&mut out);
        let mut input = StreamIn::new(out.finish(), true);
        assert_eq!(ObjectKey::unmarshal(&mut input).unwrap(), key);
    }
}
