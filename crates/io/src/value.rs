//! Valuetype and abstract-interface marshaling.
//!
//! Values are written with a tagged start carrying chunked/single-id/id-list
//! flag bits. Sharing and cycles are preserved through the same
//! `0xFFFF_FFFF` indirection mechanism as TypeCodes, applied to both value
//! identities and repository-id strings; the maps are explicit and scoped
//! to one request. Truncatable values (more than one repository id) are
//! chunk-encoded so an unknowing receiver can skip derived state; a value
//! nested inside an already-chunked body is written unchunked and simply
//! rides the enclosing chunks.

use crate::ior::Ior;
use crate::stream::{StreamIn, StreamOut, MINOR_BAD_INDIRECTION, MINOR_BAD_STRING};
use crate::typecode_marshal::INDIRECTION_TAG;
use orb_core::error::{CoreResult, SystemException};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Base of the value-tag range.
pub const VALUE_TAG_BASE: u32 = 0x7FFF_FF00;
/// Flag: a codebase URL follows (never written by this runtime).
pub const VALUE_FLAG_CODEBASE: u32 = 0x01;
/// Flag: a single repository id follows.
pub const VALUE_FLAG_SINGLE_ID: u32 = 0x02;
/// Flag: a counted repository-id list follows.
pub const VALUE_FLAG_ID_LIST: u32 = 0x06;
/// Flag: the state is chunk-encoded.
pub const VALUE_FLAG_CHUNKED: u32 = 0x08;

/// Chunk boundary enforced on chunk-encoded value state.
pub const CHUNK_SIZE_LIMIT: usize = 4096;

/// A marshalable valuetype instance.
pub trait ValueBase: Send + Sync {
    /// Repository ids, most derived first. More than one id marks the
    /// value truncatable to its bases.
    fn repository_ids(&self) -> Vec<String>;

    /// Writes the state members in order.
    fn marshal(&self, out: &mut StreamOut, ctx: &mut ValueWriteContext) -> CoreResult<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a value instance.
pub type ValueRef = Arc<dyn ValueBase>;

/// Reconstructs value instances for one repository id.
pub trait ValueFactory: Send + Sync {
    fn unmarshal(&self, input: &mut StreamIn, ctx: &mut ValueReadContext) -> CoreResult<ValueRef>;
}

/// Process-wide registry of value factories keyed by repository id.
#[derive(Default)]
pub struct ValueFactoryRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ValueFactory>>>,
}

impl ValueFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, repository_id: impl Into<String>, factory: Arc<dyn ValueFactory>) {
        self.factories.write().insert(repository_id.into(), factory);
    }

    pub fn unregister(&self, repository_id: &str) {
        self.factories.write().remove(repository_id);
    }

    pub fn lookup(&self, repository_id: &str) -> Option<Arc<dyn ValueFactory>> {
        self.factories.read().get(repository_id).cloned()
    }
}

/// Writer-side indirection maps, scoped to one request.
#[derive(Default)]
pub struct ValueWriteContext {
    // Value identity -> absolute position of its value tag.
    value_positions: HashMap<usize, usize>,
    // Repository id -> absolute position of its first occurrence.
    repid_positions: HashMap<String, usize>,
}

/// Reader-side indirection maps, scoped to one request.
#[derive(Default)]
pub struct ValueReadContext {
    values: HashMap<usize, ValueRef>,
    repids: HashMap<usize, String>,
}

fn value_ptr(value: &ValueRef) -> usize {
    Arc::as_ptr(value) as *const () as usize
}

fn write_indirection(out: &mut StreamOut, target: usize) -> CoreResult<()> {
    out.write_u32(INDIRECTION_TAG);
    let offset_pos = out.pos();
    let offset = target as i64 - offset_pos as i64;
    if offset >= -4 || offset < i32::MIN as i64 {
        return Err(SystemException::marshal(MINOR_BAD_INDIRECTION));
    }
    out.write_i32(offset as i32);
    Ok(())
}

fn write_repid(out: &mut StreamOut, id: &str, ctx: &mut ValueWriteContext) -> CoreResult<()> {
    out.align(4);
    if let Some(&target) = ctx.repid_positions.get(id) {
        return write_indirection(out, target);
    }
    ctx.repid_positions.insert(id.to_owned(), out.pos());
    out.write_string(id);
    Ok(())
}

fn read_repid(input: &mut StreamIn, ctx: &mut ValueReadContext) -> CoreResult<String> {
    input.align(4)?;
    let pos = input.pos();
    let first = input.read_u32()?;
    if first == INDIRECTION_TAG {
        let offset_pos = input.pos();
        let offset = input.read_i32()?;
        if offset >= -4 {
            return Err(SystemException::marshal(MINOR_BAD_INDIRECTION));
        }
        let target = offset_pos as i64 + offset as i64;
        return ctx
            .repids
            .get(&(target as usize))
            .cloned()
            .ok_or_else(|| SystemException::marshal(MINOR_BAD_INDIRECTION));
    }
    // `first` is the string length including the terminator.
    let len = first as usize;
    if len == 0 {
        return Err(SystemException::marshal(MINOR_BAD_STRING));
    }
    let bytes = input.read_octets(len)?;
    if bytes[len - 1] != 0 {
        return Err(SystemException::marshal(MINOR_BAD_STRING));
    }
    let id = std::str::from_utf8(&bytes[..len - 1])
        .map_err(|_| SystemException::marshal(MINOR_BAD_STRING))?
        .to_owned();
    ctx.repids.insert(pos, id.clone());
    Ok(id)
}

/// Writes a value reference (nil allowed).
pub fn write_value(
    out: &mut StreamOut,
    value: Option<&ValueRef>,
    ctx: &mut ValueWriteContext,
) -> CoreResult<()> {
    let value = match value {
        None => {
            out.write_u32(0);
            return Ok(());
        }
        Some(v) => v,
    };
    out.align(4);
    if let Some(&target) = ctx.value_positions.get(&value_ptr(value)) {
        return write_indirection(out, target);
    }
    let tag_pos = out.pos();
    ctx.value_positions.insert(value_ptr(value), tag_pos);

    let ids = value.repository_ids();
    if ids.is_empty() {
        return Err(SystemException::marshal(0));
    }
    let truncatable = ids.len() > 1;
    let chunked = truncatable && !out.in_chunk_mode();
    let mut tag = VALUE_TAG_BASE;
    tag |= if truncatable {
        VALUE_FLAG_ID_LIST
    } else {
        VALUE_FLAG_SINGLE_ID
    };
    if chunked {
        tag |= VALUE_FLAG_CHUNKED;
    }
    out.write_u32(tag);

    if truncatable {
        out.write_size(ids.len());
        for id in &ids {
            write_repid(out, id, ctx)?;
        }
    } else {
        write_repid(out, &ids[0], ctx)?;
    }

    if chunked {
        out.begin_chunk_mode(CHUNK_SIZE_LIMIT);
        value.marshal(out, ctx)?;
        out.end_chunk_mode();
    } else {
        value.marshal(out, ctx)?;
    }
    Ok(())
}

/// Reads a value reference written by [`write_value`].
pub fn read_value(
    input: &mut StreamIn,
    registry: &ValueFactoryRegistry,
    ctx: &mut ValueReadContext,
) -> CoreResult<Option<ValueRef>> {
    input.align(4)?;
    let tag_pos = input.pos();
    let tag = input.read_u32()?;
    if tag == 0 {
        return Ok(None);
    }
    if tag == INDIRECTION_TAG {
        let offset_pos = input.pos();
        let offset = input.read_i32()?;
        if offset >= -4 {
            return Err(SystemException::marshal(MINOR_BAD_INDIRECTION));
        }
        let target = offset_pos as i64 + offset as i64;
        return ctx
            .values
            .get(&(target as usize))
            .cloned()
            .map(Some)
            .ok_or_else(|| SystemException::marshal(MINOR_BAD_INDIRECTION));
    }
    if !(VALUE_TAG_BASE..=VALUE_TAG_BASE | 0xFF).contains(&tag) {
        return Err(SystemException::marshal(0));
    }
    if tag & VALUE_FLAG_CODEBASE != 0 {
        return Err(SystemException::no_implement());
    }

    let id_bits = tag & VALUE_FLAG_ID_LIST;
    let chunked = tag & VALUE_FLAG_CHUNKED != 0;
    let ids = match id_bits {
        VALUE_FLAG_ID_LIST => {
            let count = input.read_size()?;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(read_repid(input, ctx)?);
            }
            ids
        }
        VALUE_FLAG_SINGLE_ID => vec![read_repid(input, ctx)?],
        _ => return Err(SystemException::marshal(0)),
    };

    // Truncate to the most derived id we can reconstruct.
    let factory = ids
        .iter()
        .find_map(|id| registry.lookup(id))
        .ok_or_else(|| SystemException::marshal(0))?;

    if chunked {
        input.begin_chunk_mode();
    }
    let value = factory.unmarshal(input, ctx)?;
    if chunked {
        input.end_chunk_mode()?;
    }
    ctx.values.insert(tag_pos, value.clone());
    Ok(Some(value))
}

/// The payload of an abstract interface: object reference or value.
#[derive(Clone)]
pub enum AbstractRef {
    /// An object reference.
    Object(Ior),
    /// A value (possibly nil).
    Value(Option<ValueRef>),
}

impl AbstractRef {
    /// The nil abstract interface: discriminator 0 followed by a null
    /// value.
    pub fn nil() -> Self {
        AbstractRef::Value(None)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, AbstractRef::Value(None))
    }
}

/// Writes an abstract interface: a discriminator octet (1 = object,
/// 0 = value) followed by the payload.
pub fn write_abstract(
    out: &mut StreamOut,
    value: &AbstractRef,
    ctx: &mut ValueWriteContext,
) -> CoreResult<()> {
    match value {
        AbstractRef::Object(ior) => {
            out.write_bool(true);
            ior.marshal(out);
            Ok(())
        }
        AbstractRef::Value(v) => {
            out.write_bool(false);
            write_value(out, v.as_ref(), ctx)
        }
    }
}

/// Reads an abstract interface written by [`write_abstract`].
pub fn read_abstract(
    input: &mut StreamIn,
    registry: &ValueFactoryRegistry,
    ctx: &mut ValueReadContext,
) -> CoreResult<AbstractRef> {
    if input.read_bool()? {
        Ok(AbstractRef::Object(Ior::unmarshal(input)?))
    } else {
        Ok(AbstractRef::Value(read_value(input, registry, ctx)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Point {
        x: i32,
        y: i32,
    }

    impl ValueBase for Point {
        fn repository_ids(&self) -> Vec<String> {
            vec!["IDL:acme/Point:1.0".into()]
        }

        fn marshal(&self, out: &mut StreamOut, _ctx: &mut ValueWriteContext) -> CoreResult<()> {
            out.write_i32(self.x);
            out.write_i32(self.y);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct PointFactory;

    impl ValueFactory for PointFactory {
        fn unmarshal(
            &self,
            input: &mut StreamIn,
            _ctx: &mut ValueReadContext,
        ) -> CoreResult<ValueRef> {
            let x = input.read_i32()?;
            let y = input.read_i32()?;
            Ok(Arc::new(Point { x, y }))
        }
    }

    // A derived point that truncates to Point.
    struct Point3 {
        x: i32,
        y: i32,
        z: i32,
    }

    impl ValueBase for Point3 {
        fn repository_ids(&self) -> Vec<String> {
            vec!["IDL:acme/Point3:1.0".into(), "IDL:acme/Point:1.0".into()]
        }

        fn marshal(&self, out: &mut StreamOut, _ctx: &mut ValueWriteContext) -> CoreResult<()> {
            out.write_i32(self.x);
            out.write_i32(self.y);
            out.write_i32(self.z);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry_with_point() -> ValueFactoryRegistry {
        let registry = ValueFactoryRegistry::new();
        registry.register("IDL:acme/Point:1.0", Arc::new(PointFactory));
        registry
    }

    #[test]
    fn nil_value_round_trip() {
        let mut out = StreamOut::with_order(true);
        write_value(&mut out, None, &mut ValueWriteContext::default()).unwrap();
        let mut input = StreamIn::new(out.finish(), true);
        let decoded = read_value(
            &mut input,
            &registry_with_point(),
            &mut ValueReadContext::default(),
        )
        .unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn value_round_trip() {
        let value: ValueRef = Arc::new(Point { x: 3, y: -9 });
        let mut out = StreamOut::with_order(true);
        write_value(&mut out, Some(&value), &mut ValueWriteContext::default()).unwrap();
        let mut input = StreamIn::new(out.finish(), true);
        let decoded = read_value(
            &mut input,
            &registry_with_point(),
            &mut ValueReadContext::default(),
        )
        .unwrap()
        .expect("non-nil");
        let point = decoded.as_any().downcast_ref::<Point>().unwrap();
        assert_eq!((point.x, point.y), (3, -9));
    }

    #[test]
    fn shared_value_preserves_identity() {
        let shared: ValueRef = Arc::new(Point { x: 1, y: 2 });
        let mut out = StreamOut::with_order(true);
        let mut wctx = ValueWriteContext::default();
        write_value(&mut out, Some(&shared), &mut wctx).unwrap();
        write_value(&mut out, Some(&shared), &mut wctx).unwrap();
        let mut input = StreamIn::new(out.finish(), true);
        let registry = registry_with_point();
        let mut rctx = ValueReadContext::default();
        let first = read_value(&mut input, &registry, &mut rctx)
            .unwrap()
            .expect("first");
        let second = read_value(&mut input, &registry, &mut rctx)
            .unwrap()
            .expect("second");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(input.end(), 0);
    }

    #[test]
    fn unknown_derived_value_truncates_to_base() {
        // Only the Point factory is registered; Point3 state must be
        // chunk-skipped past the unread z member.
        let value: ValueRef = Arc::new(Point3 { x: 7, y: 8, z: 9 });
        let mut out = StreamOut::with_order(true);
        write_value(&mut out, Some(&value), &mut ValueWriteContext::default()).unwrap();
        out.write_u32(0xFEED);
        let mut input = StreamIn::new(out.finish(), true);
        let registry = registry_with_point();
        let decoded = read_value(&mut input, &registry, &mut ValueReadContext::default())
            .unwrap()
            .expect("truncated");
        let point = decoded.as_any().downcast_ref::<Point>().unwrap();
        assert_eq!((point.x, point.y), (7, 8));
        assert_eq!(input.read_u32().unwrap(), 0xFEED);
    }

    #[test]
    fn unknown_value_reports_marshal() {
        let value: ValueRef = Arc::new(Point { x: 0, y: 0 });
        let mut out = StreamOut::with_order(true);
        write_value(&mut out, Some(&value), &mut ValueWriteContext::default()).unwrap();
        let mut input = StreamIn::new(out.finish(), true);
        let empty = ValueFactoryRegistry::new();
        assert!(read_value(&mut input, &empty, &mut ValueReadContext::default()).is_err());
    }

    #[test]
    fn repeated_rep_ids_are_indirected() {
        let a: ValueRef = Arc::new(Point { x: 1, y: 1 });
        let b: ValueRef = Arc::new(Point { x: 2, y: 2 });
        let mut out = StreamOut::with_order(true);
        let mut wctx = ValueWriteContext::default();
        write_value(&mut out, Some(&a), &mut wctx).unwrap();
        write_value(&mut out, Some(&b), &mut wctx).unwrap();
        let data = out.finish();
        let needle = b"IDL:acme/Point:1.0";
        let count = data
            .windows(needle.len())
            .filter(|w| w == needle)
            .count();
        assert_eq!(count, 1);

        let mut input = StreamIn::new(data, true);
        let registry = registry_with_point();
        let mut rctx = ValueReadContext::default();
        let first = read_value(&mut input, &registry, &mut rctx)
            .unwrap()
            .expect("a");
        let second = read_value(&mut input, &registry, &mut rctx)
            .unwrap()
            .expect("b");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn nil_abstract_interface_is_discriminator_zero_then_null() {
        let mut out = StreamOut::with_order(true);
        write_abstract(&mut out, &AbstractRef::nil(), &mut ValueWriteContext::default()).unwrap();
        let data = out.finish();
        assert_eq!(&data[..1], &[0]);
        let mut input = StreamIn::new(data, true);
        let decoded = read_abstract(
            &mut input,
            &registry_with_point(),
            &mut ValueReadContext::default(),
        )
        .unwrap();
        assert!(decoded.is_nil());
    }

    #[test]
    fn abstract_object_round_trip() {
        use crate::ior::DomainAddress;
        use crate::object_key::ObjectKey;
        let ior = Ior::for_domain(
            "IDL:acme/Widget:1.0",
            &DomainAddress::Esiop(3),
            &ObjectKey::root(bytes::Bytes::from_static(b"w1")),
            0,
        );
        let mut out = StreamOut::with_order(true);
        write_abstract(
            &mut out,
            &AbstractRef::Object(ior.clone()),
            &mut ValueWriteContext::default(),
        )
        .unwrap();
        let mut input = StreamIn::new(out.finish(), true);
        match read_abstract(
            &mut input,
            &registry_with_point(),
            &mut ValueReadContext::default(),
        )
        .unwrap()
        {
            AbstractRef::Object(decoded) => assert_eq!(decoded, ior),
            AbstractRef::Value(_) => panic!("expected object"),
        }
    }
}
