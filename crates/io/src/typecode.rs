//! TypeCodes.
//!
//! The runtime's model of IDL types: an immutable tree with explicit
//! recursion markers instead of reference cycles. A `Recursive` node names
//! the repository id of an enclosing type and is resolved against the
//! traversal environment, which keeps the tree acyclic and droppable while
//! still expressing self-referential structs, unions, and values.

use orb_core::error::{CoreResult, SystemException};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// TypeCode kind numbering used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TcKind {
    Null = 0,
    Void = 1,
    Short = 2,
    Long = 3,
    UShort = 4,
    ULong = 5,
    Float = 6,
    Double = 7,
    Boolean = 8,
    Char = 9,
    Octet = 10,
    Any = 11,
    TypeCode = 12,
    Principal = 13,
    ObjRef = 14,
    Struct = 15,
    Union = 16,
    Enum = 17,
    String = 18,
    Sequence = 19,
    Array = 20,
    Alias = 21,
    Except = 22,
    LongLong = 23,
    ULongLong = 24,
    LongDouble = 25,
    WChar = 26,
    WString = 27,
    Fixed = 28,
    Value = 29,
    ValueBox = 30,
    Native = 31,
    AbstractInterface = 32,
}

impl TcKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        use TcKind::*;
        Some(match v {
            0 => Null,
            1 => Void,
            2 => Short,
            3 => Long,
            4 => UShort,
            5 => ULong,
            6 => Float,
            7 => Double,
            8 => Boolean,
            9 => Char,
            10 => Octet,
            11 => Any,
            12 => TypeCode,
            13 => Principal,
            14 => ObjRef,
            15 => Struct,
            16 => Union,
            17 => Enum,
            18 => String,
            19 => Sequence,
            20 => Array,
            21 => Alias,
            22 => Except,
            23 => LongLong,
            24 => ULongLong,
            25 => LongDouble,
            26 => WChar,
            27 => WString,
            28 => Fixed,
            29 => Value,
            30 => ValueBox,
            31 => Native,
            32 => AbstractInterface,
            _ => return None,
        })
    }
}

/// A struct or exception member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructMember {
    pub name: String,
    pub tc: TypeCode,
}

/// A union case label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnionLabel {
    /// A concrete discriminator value.
    Value(i64),
    /// The default case.
    Default,
}

/// A union member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionMember {
    pub label: UnionLabel,
    pub name: String,
    pub tc: TypeCode,
}

/// A valuetype state member with visibility (0 private, 1 public).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueMember {
    pub name: String,
    pub tc: TypeCode,
    pub visibility: i16,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TcRepr {
    Primitive(TcKind),
    String { bound: u32 },
    WString { bound: u32 },
    Fixed { digits: u16, scale: i16 },
    ObjRef { id: String, name: String },
    AbstractInterface { id: String, name: String },
    Struct { id: String, name: String, members: Vec<StructMember> },
    Except { id: String, name: String, members: Vec<StructMember> },
    Union {
        id: String,
        name: String,
        discriminator: TypeCode,
        default_index: i32,
        members: Vec<UnionMember>,
    },
    Enum { id: String, name: String, members: Vec<String> },
    Sequence { element: TypeCode, bound: u32 },
    Array { element: TypeCode, length: u32 },
    Alias { id: String, name: String, content: TypeCode },
    Value {
        id: String,
        name: String,
        modifier: i16,
        concrete_base: Option<TypeCode>,
        members: Vec<ValueMember>,
    },
    ValueBox { id: String, name: String, content: TypeCode },
    /// Reference to an enclosing type under construction, by repository id.
    Recursive { id: String },
}

/// An immutable, shareable TypeCode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeCode(pub(crate) Arc<TcRepr>);

impl TypeCode {
    fn repr(repr: TcRepr) -> Self {
        Self(Arc::new(repr))
    }

    pub fn primitive(kind: TcKind) -> Self {
        Self::repr(TcRepr::Primitive(kind))
    }

    pub fn null() -> Self {
        Self::primitive(TcKind::Null)
    }

    pub fn void() -> Self {
        Self::primitive(TcKind::Void)
    }

    pub fn short() -> Self {
        Self::primitive(TcKind::Short)
    }

    pub fn long() -> Self {
        Self::primitive(TcKind::Long)
    }

    pub fn ulong() -> Self {
        Self::primitive(TcKind::ULong)
    }

    pub fn longlong() -> Self {
        Self::primitive(TcKind::LongLong)
    }

    pub fn boolean() -> Self {
        Self::primitive(TcKind::Boolean)
    }

    pub fn octet() -> Self {
        Self::primitive(TcKind::Octet)
    }

    pub fn double() -> Self {
        Self::primitive(TcKind::Double)
    }

    pub fn string(bound: u32) -> Self {
        Self::repr(TcRepr::String { bound })
    }

    pub fn wstring(bound: u32) -> Self {
        Self::repr(TcRepr::WString { bound })
    }

    pub fn fixed(digits: u16, scale: i16) -> Self {
        Self::repr(TcRepr::Fixed { digits, scale })
    }

    pub fn objref(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::repr(TcRepr::ObjRef {
            id: id.into(),
            name: name.into(),
        })
    }

    pub fn abstract_interface(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::repr(TcRepr::AbstractInterface {
            id: id.into(),
            name: name.into(),
        })
    }

    pub fn structure(
        id: impl Into<String>,
        name: impl Into<String>,
        members: Vec<StructMember>,
    ) -> Self {
        Self::repr(TcRepr::Struct {
            id: id.into(),
            name: name.into(),
            members,
        })
    }

    pub fn exception(
        id: impl Into<String>,
        name: impl Into<String>,
        members: Vec<StructMember>,
    ) -> Self {
        Self::repr(TcRepr::Except {
            id: id.into(),
            name: name.into(),
            members,
        })
    }

    pub fn union(
        id: impl Into<String>,
        name: impl Into<String>,
        discriminator: TypeCode,
        default_index: i32,
        members: Vec<UnionMember>,
    ) -> Self {
        Self::repr(TcRepr::Union {
            id: id.into(),
            name: name.into(),
            discriminator,
            default_index,
            members,
        })
    }

    pub fn enumeration(
        id: impl Into<String>,
        name: impl Into<String>,
        members: Vec<String>,
    ) -> Self {
        Self::repr(TcRepr::Enum {
            id: id.into(),
            name: name.into(),
            members,
        })
    }

    pub fn sequence(element: TypeCode, bound: u32) -> Self {
        Self::repr(TcRepr::Sequence { element, bound })
    }

    pub fn array(element: TypeCode, length: u32) -> Self {
        Self::repr(TcRepr::Array { element, length })
    }

    pub fn alias(id: impl Into<String>, name: impl Into<String>, content: TypeCode) -> Self {
        Self::repr(TcRepr::Alias {
            id: id.into(),
            name: name.into(),
            content,
        })
    }

    pub fn value(
        id: impl Into<String>,
        name: impl Into<String>,
        modifier: i16,
        concrete_base: Option<TypeCode>,
        members: Vec<ValueMember>,
    ) -> Self {
        Self::repr(TcRepr::Value {
            id: id.into(),
            name: name.into(),
            modifier,
            concrete_base,
            members,
        })
    }

    pub fn value_box(id: impl Into<String>, name: impl Into<String>, content: TypeCode) -> Self {
        Self::repr(TcRepr::ValueBox {
            id: id.into(),
            name: name.into(),
            content,
        })
    }

    /// A marker naming an enclosing type under construction. Must be
    /// embedded in a type whose repository id matches, or marshaling
    /// reports BAD_TYPECODE.
    pub fn recursive(id: impl Into<String>) -> Self {
        Self::repr(TcRepr::Recursive { id: id.into() })
    }

    /// The kind tag of this TypeCode.
    pub fn kind(&self) -> TcKind {
        match &*self.0 {
            TcRepr::Primitive(k) => *k,
            TcRepr::String { .. } => TcKind::String,
            TcRepr::WString { .. } => TcKind::WString,
            TcRepr::Fixed { .. } => TcKind::Fixed,
            TcRepr::ObjRef { .. } => TcKind::ObjRef,
            TcRepr::AbstractInterface { .. } => TcKind::AbstractInterface,
            TcRepr::Struct { .. } => TcKind::Struct,
            TcRepr::Except { .. } => TcKind::Except,
            TcRepr::Union { .. } => TcKind::Union,
            TcRepr::Enum { .. } => TcKind::Enum,
            TcRepr::Sequence { .. } => TcKind::Sequence,
            TcRepr::Array { .. } => TcKind::Array,
            TcRepr::Alias { .. } => TcKind::Alias,
            TcRepr::Value { .. } => TcKind::Value,
            TcRepr::ValueBox { .. } => TcKind::ValueBox,
            // A recursion marker stands for its enclosing type; kind is
            // resolved in context. Report it as Null standalone.
            TcRepr::Recursive { .. } => TcKind::Null,
        }
    }

    /// The repository id, for id-bearing kinds.
    pub fn id(&self) -> Option<&str> {
        match &*self.0 {
            TcRepr::ObjRef { id, .. }
            | TcRepr::AbstractInterface { id, .. }
            | TcRepr::Struct { id, .. }
            | TcRepr::Except { id, .. }
            | TcRepr::Union { id, .. }
            | TcRepr::Enum { id, .. }
            | TcRepr::Alias { id, .. }
            | TcRepr::Value { id, .. }
            | TcRepr::ValueBox { id, .. }
            | TcRepr::Recursive { id } => Some(id),
            _ => None,
        }
    }

    /// The member count, for aggregate kinds.
    pub fn member_count(&self) -> usize {
        match &*self.0 {
            TcRepr::Struct { members, .. } | TcRepr::Except { members, .. } => members.len(),
            TcRepr::Union { members, .. } => members.len(),
            TcRepr::Enum { members, .. } => members.len(),
            TcRepr::Value { members, .. } => members.len(),
            _ => 0,
        }
    }

    /// The content type of sequences, arrays, aliases, and value boxes.
    pub fn content_type(&self) -> Option<&TypeCode> {
        match &*self.0 {
            TcRepr::Sequence { element, .. } | TcRepr::Array { element, .. } => Some(element),
            TcRepr::Alias { content, .. } | TcRepr::ValueBox { content, .. } => Some(content),
            _ => None,
        }
    }

    fn ptr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

#[derive(Default)]
struct EqCtx {
    visited: HashSet<(usize, usize)>,
    env_a: HashMap<String, TypeCode>,
    env_b: HashMap<String, TypeCode>,
}

/// Structural equality: kinds, ids, names, and members must all match.
pub fn tc_equal(a: &TypeCode, b: &TypeCode) -> bool {
    equal_impl(a, b, true, &mut EqCtx::default())
}

/// Equivalence: unwinds aliases and ignores names; ids compared when both
/// are set.
pub fn tc_equivalent(a: &TypeCode, b: &TypeCode) -> bool {
    equal_impl(a, b, false, &mut EqCtx::default())
}

fn resolve<'a>(tc: &'a TypeCode, env: &HashMap<String, TypeCode>) -> Option<TypeCode> {
    match &*tc.0 {
        TcRepr::Recursive { id } => env.get(id).cloned(),
        _ => Some(tc.clone()),
    }
}

fn unalias(mut tc: TypeCode) -> TypeCode {
    loop {
        let next = match &*tc.0 {
            TcRepr::Alias { content, .. } => content.clone(),
            _ => return tc,
        };
        tc = next;
    }
}

fn equal_impl(a: &TypeCode, b: &TypeCode, strict: bool, ctx: &mut EqCtx) -> bool {
    // Unresolvable markers compare by id alone.
    let (a, b) = match (resolve(a, &ctx.env_a), resolve(b, &ctx.env_b)) {
        (Some(a), Some(b)) => (a, b),
        _ => return a.id().is_some() && a.id() == b.id(),
    };
    let (a, b) = if strict { (a, b) } else { (unalias(a), unalias(b)) };

    if a.ptr() == b.ptr() {
        return true;
    }
    let key = (a.ptr(), b.ptr());
    if !ctx.visited.insert(key) {
        // Coinductive: a revisited pair is equal unless something else
        // disproves it.
        return true;
    }

    let names_match = |x: &str, y: &str| !strict || x == y;
    let ids_match = |x: &str, y: &str| {
        if strict {
            x == y
        } else {
            x.is_empty() || y.is_empty() || x == y
        }
    };

    // Register id-bearing aggregates for recursion resolution.
    if let Some(id) = a.id() {
        ctx.env_a.entry(id.to_owned()).or_insert_with(|| a.clone());
    }
    if let Some(id) = b.id() {
        ctx.env_b.entry(id.to_owned()).or_insert_with(|| b.clone());
    }

    match (&*a.0, &*b.0) {
        (TcRepr::Primitive(x), TcRepr::Primitive(y)) => x == y,
        (TcRepr::String { bound: x }, TcRepr::String { bound: y }) => x == y,
        (TcRepr::WString { bound: x }, TcRepr::WString { bound: y }) => x == y,
        (
            TcRepr::Fixed { digits: dx, scale: sx },
            TcRepr::Fixed { digits: dy, scale: sy },
        ) => dx == dy && sx == sy,
        (
            TcRepr::ObjRef { id: ix, name: nx },
            TcRepr::ObjRef { id: iy, name: ny },
        )
        | (
            TcRepr::AbstractInterface { id: ix, name: nx },
            TcRepr::AbstractInterface { id: iy, name: ny },
        ) => ids_match(ix, iy) && names_match(nx, ny),
        (
            TcRepr::Struct { id: ix, name: nx, members: mx },
            TcRepr::Struct { id: iy, name: ny, members: my },
        )
        | (
            TcRepr::Except { id: ix, name: nx, members: mx },
            TcRepr::Except { id: iy, name: ny, members: my },
        ) => {
            ids_match(ix, iy)
                && names_match(nx, ny)
                && mx.len() == my.len()
                && mx.iter().zip(my).all(|(p, q)| {
                    names_match(&p.name, &q.name) && equal_impl(&p.tc, &q.tc, strict, ctx)
                })
        }
        (
            TcRepr::Union {
                id: ix,
                name: nx,
                discriminator: dx,
                default_index: dix,
                members: mx,
            },
            TcRepr::Union {
                id: iy,
                name: ny,
                discriminator: dy,
                default_index: diy,
                members: my,
            },
        ) => {
            ids_match(ix, iy)
                && names_match(nx, ny)
                && dix == diy
                && equal_impl(dx, dy, strict, ctx)
                && mx.len() == my.len()
                && mx.iter().zip(my).all(|(p, q)| {
                    p.label == q.label
                        && names_match(&p.name, &q.name)
                        && equal_impl(&p.tc, &q.tc, strict, ctx)
                })
        }
        (
            TcRepr::Enum { id: ix, name: nx, members: mx },
            TcRepr::Enum { id: iy, name: ny, members: my },
        ) => {
            ids_match(ix, iy)
                && names_match(nx, ny)
                && mx.len() == my.len()
                && mx.iter().zip(my).all(|(p, q)| names_match(p, q))
        }
        (
            TcRepr::Sequence { element: ex, bound: bx },
            TcRepr::Sequence { element: ey, bound: by },
        ) => bx == by && equal_impl(ex, ey, strict, ctx),
        (
            TcRepr::Array { element: ex, length: lx },
            TcRepr::Array { element: ey, length: ly },
        ) => lx == ly && equal_impl(ex, ey, strict, ctx),
        (
            TcRepr::Alias { id: ix, name: nx, content: cx },
            TcRepr::Alias { id: iy, name: ny, content: cy },
        ) => ids_match(ix, iy) && names_match(nx, ny) && equal_impl(cx, cy, strict, ctx),
        (
            TcRepr::Value {
                id: ix,
                name: nx,
                modifier: mox,
                concrete_base: bx,
                members: mx,
            },
            TcRepr::Value {
                id: iy,
                name: ny,
                modifier: moy,
                concrete_base: by,
                members: my,
            },
        ) => {
            ids_match(ix, iy)
                && names_match(nx, ny)
                && mox == moy
                && match (bx, by) {
                    (None, None) => true,
                    (Some(p), Some(q)) => equal_impl(p, q, strict, ctx),
                    _ => false,
                }
                && mx.len() == my.len()
                && mx.iter().zip(my).all(|(p, q)| {
                    p.visibility == q.visibility
                        && names_match(&p.name, &q.name)
                        && equal_impl(&p.tc, &q.tc, strict, ctx)
                })
        }
        (
            TcRepr::ValueBox { id: ix, name: nx, content: cx },
            TcRepr::ValueBox { id: iy, name: ny, content: cy },
        ) => ids_match(ix, iy) && names_match(nx, ny) && equal_impl(cx, cy, strict, ctx),
        _ => false,
    }
}

/// Validates that every recursion marker resolves to an enclosing type.
pub fn validate(tc: &TypeCode) -> CoreResult<()> {
    fn walk(tc: &TypeCode, open: &mut HashSet<String>) -> CoreResult<()> {
        match &*tc.0 {
            TcRepr::Recursive { id } => {
                if open.contains(id) {
                    Ok(())
                } else {
                    Err(SystemException::bad_typecode())
                }
            }
            TcRepr::Struct { id, members, .. } | TcRepr::Except { id, members, .. } => {
                let added = open.insert(id.clone());
                for m in members {
                    walk(&m.tc, open)?;
                }
                if added {
                    open.remove(id);
                }
                Ok(())
            }
            TcRepr::Union {
                id,
                discriminator,
                members,
                ..
            } => {
                let added = open.insert(id.clone());
                walk(discriminator, open)?;
                for m in members {
                    walk(&m.tc, open)?;
                }
                if added {
                    open.remove(id);
                }
                Ok(())
            }
            TcRepr::Value {
                id,
                concrete_base,
                members,
                ..
            } => {
                let added = open.insert(id.clone());
                if let Some(base) = concrete_base {
                    walk(base, open)?;
                }
                for m in members {
                    walk(&m.tc, open)?;
                }
                if added {
                    open.remove(id);
                }
                Ok(())
            }
            TcRepr::Sequence { element, .. } | TcRepr::Array { element, .. } => {
                walk(element, open)
            }
            TcRepr::Alias { content, .. } | TcRepr::ValueBox { content, .. } => {
                walk(content, open)
            }
            _ => Ok(()),
        }
    }
    walk(tc, &mut HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_tc() -> TypeCode {
        let id = "IDL:acme/Node:1.0";
        TypeCode::structure(
            id,
            "Node",
            vec![
                StructMember {
                    name: "x".into(),
                    tc: TypeCode::long(),
                },
                StructMember {
                    name: "next".into(),
                    tc: TypeCode::sequence(TypeCode::recursive(id), 0),
                },
            ],
        )
    }

    #[test]
    fn identical_trees_are_equal() {
        assert!(tc_equal(&node_tc(), &node_tc()));
        assert!(tc_equivalent(&node_tc(), &node_tc()));
    }

    #[test]
    fn names_matter_for_equal_not_equivalent() {
        let a = TypeCode::structure(
            "IDL:acme/P:1.0",
            "P",
            vec![StructMember {
                name: "v".into(),
                tc: TypeCode::long(),
            }],
        );
        let b = TypeCode::structure(
            "IDL:acme/P:1.0",
            "Q",
            vec![StructMember {
                name: "w".into(),
                tc: TypeCode::long(),
            }],
        );
        assert!(!tc_equal(&a, &b));
        assert!(tc_equivalent(&a, &b));
    }

    #[test]
    fn equivalent_unwinds_aliases() {
        let plain = TypeCode::ulong();
        let aliased = TypeCode::alias("IDL:acme/Count:1.0", "Count", TypeCode::ulong());
        assert!(!tc_equal(&plain, &aliased));
        assert!(tc_equivalent(&plain, &aliased));
    }

    #[test]
    fn union_default_label_round() {
        let make = |name: &str| {
            TypeCode::union(
                "IDL:acme/U:1.0",
                name,
                TypeCode::long(),
                1,
                vec![
                    UnionMember {
                        label: UnionLabel::Value(4),
                        name: "four".into(),
                        tc: TypeCode::string(0),
                    },
                    UnionMember {
                        label: UnionLabel::Default,
                        name: "other".into(),
                        tc: TypeCode::boolean(),
                    },
                ],
            )
        };
        assert!(tc_equal(&make("U"), &make("U")));
        assert!(!tc_equal(&make("U"), &make("V")));
        assert!(tc_equivalent(&make("U"), &make("V")));
    }

    #[test]
    fn dangling_recursion_is_invalid() {
        let tc = TypeCode::sequence(TypeCode::recursive("IDL:acme/Nowhere:1.0"), 0);
        assert!(validate(&tc).is_err());
        assert!(validate(&node_tc()).is_ok());
    }

    #[test]
    fn recursion_compares_against_expansion() {
        // A marker-based tree and a one-level unrolled tree describe the
        // same type.
        let id = "IDL:acme/Node:1.0";
        let unrolled = TypeCode::structure(
            id,
            "Node",
            vec![
                StructMember {
                    name: "x".into(),
                    tc: TypeCode::long(),
                },
                StructMember {
                    name: "next".into(),
                    tc: TypeCode::sequence(node_tc(), 0),
                },
            ],
        );
        assert!(tc_equal(&node_tc(), &unrolled));
    }
}
