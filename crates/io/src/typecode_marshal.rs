//! TypeCode marshaling.
//!
//! Simple kinds are written inline; parametrized kinds carry their
//! parameters in a nested encapsulation. A TypeCode already written in the
//! same message is re-emitted as the indirection tag `0xFFFF_FFFF` followed
//! by a signed offset, measured from the position of the offset field back
//! to the referenced kind tag; offsets of `-4` or more are malformed.
//! Recursive types resolve through the same mechanism: the writer tracks
//! open aggregates by repository id, the reader tracks tag positions still
//! under construction and materializes markers for them.

use crate::stream::{StreamIn, StreamOut, MINOR_BAD_INDIRECTION};
use crate::typecode::{
    validate, StructMember, TcKind, TcRepr, TypeCode, UnionLabel, UnionMember, ValueMember,
};
use orb_core::error::{CoreResult, SystemException};
use std::collections::HashMap;

/// The indirection tag shared by TypeCode and value marshaling.
pub const INDIRECTION_TAG: u32 = 0xFFFF_FFFF;

/// Per-message writer state: positions of everything already emitted.
#[derive(Default)]
pub struct TcWriteContext {
    // Arc identity -> absolute position of the kind tag.
    positions: HashMap<usize, usize>,
    // Repository id -> tag position, for aggregates (open or completed).
    id_positions: HashMap<String, usize>,
}

/// Per-message reader state: decoded TypeCodes by tag position.
#[derive(Default)]
pub struct TcReadContext {
    completed: HashMap<usize, TypeCode>,
    // Tag positions of aggregates still being decoded, by repository id.
    open: HashMap<usize, String>,
}

/// Marshals a TypeCode, validating recursion markers first.
pub fn write_typecode(
    out: &mut StreamOut,
    tc: &TypeCode,
    ctx: &mut TcWriteContext,
) -> CoreResult<()> {
    validate(tc)?;
    write_tc(out, tc, ctx)
}

fn tc_ptr(tc: &TypeCode) -> usize {
    std::sync::Arc::as_ptr(&tc.0) as *const () as usize
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

fn write_tc(out: &mut StreamOut, tc: &TypeCode, ctx: &mut TcWriteContext) -> CoreResult<()> {
    out.align(4);

    if let TcRepr::Recursive { id } = &*tc.0 {
        let target = *ctx
            .id_positions
            .get(id)
            .ok_or_else(SystemException::bad_typecode)?;
        return write_indirection(out, target);
    }

    if let Some(&target) = ctx.positions.get(&tc_ptr(tc)) {
        return write_indirection(out, target);
    }

    let tag_pos = out.pos();
    ctx.positions.insert(tc_ptr(tc), tag_pos);
    if let Some(id) = tc.id() {
        ctx.id_positions.insert(id.to_owned(), tag_pos);
    }

    match &*tc.0 {
        TcRepr::Primitive(kind) => {
            out.write_u32(*kind as u32);
        }
        TcRepr::String { bound } => {
            out.write_u32(TcKind::String as u32);
            out.write_u32(*bound);
        }
        TcRepr::WString { bound } => {
            out.write_u32(TcKind::WString as u32);
            out.write_u32(*bound);
        }
        TcRepr::Fixed { digits, scale } => {
            out.write_u32(TcKind::Fixed as u32);
            out.write_u16(*digits);
            out.write_i16(*scale);
        }
        TcRepr::ObjRef { id, name } | TcRepr::AbstractInterface { id, name } => {
            out.write_u32(tc.kind() as u32);
            out.begin_encapsulation();
            out.write_string(id);
            out.write_string(name);
            out.end_encapsulation();
        }
        TcRepr::Struct { id, name, members } | TcRepr::Except { id, name, members } => {
            out.write_u32(tc.kind() as u32);
            out.begin_encapsulation();
            out.write_string(id);
            out.write_string(name);
            out.write_size(members.len());
            for member in members {
                out.write_string(&member.name);
                write_tc(out, &member.tc, ctx)?;
            }
            out.end_encapsulation();
        }
        TcRepr::Union {
            id,
            name,
            discriminator,
            default_index,
            members,
        } => {
            out.write_u32(TcKind::Union as u32);
            out.begin_encapsulation();
            out.write_string(id);
            out.write_string(name);
            write_tc(out, discriminator, ctx)?;
            out.write_i32(*default_index);
            out.write_size(members.len());
            for member in members {
                // Labels are written as long long regardless of the
                // discriminator kind; the default case writes zero.
                match member.label {
                    UnionLabel::Value(v) => out.write_i64(v),
                    UnionLabel::Default => out.write_i64(0),
                }
                out.write_string(&member.name);
                write_tc(out, &member.tc, ctx)?;
            }
            out.end_encapsulation();
        }
        TcRepr::Enum { id, name, members } => {
            out.write_u32(TcKind::Enum as u32);
            out.begin_encapsulation();
            out.write_string(id);
            out.write_string(name);
            out.write_size(members.len());
            for member in members {
                out.write_string(member);
            }
            out.end_encapsulation();
        }
        TcRepr::Sequence { element, bound } => {
            out.write_u32(TcKind::Sequence as u32);
            out.begin_encapsulation();
            write_tc(out, element, ctx)?;
            out.write_u32(*bound);
            out.end_encapsulation();
        }
        TcRepr::Array { element, length } => {
            out.write_u32(TcKind::Array as u32);
            out.begin_encapsulation();
            write_tc(out, element, ctx)?;
            out.write_u32(*length);
            out.end_encapsulation();
        }
        TcRepr::Alias { id, name, content } | TcRepr::ValueBox { id, name, content } => {
            out.write_u32(tc.kind() as u32);
            out.begin_encapsulation();
            out.write_string(id);
            out.write_string(name);
            write_tc(out, content, ctx)?;
            out.end_encapsulation();
        }
        TcRepr::Value {
            id,
            name,
            modifier,
            concrete_base,
            members,
        } => {
            out.write_u32(TcKind::Value as u32);
            out.begin_encapsulation();
            out.write_string(id);
            out.write_string(name);
            out.write_i16(*modifier);
            match concrete_base {
                Some(base) => write_tc(out, base, ctx)?,
                None => write_tc(out, &TypeCode::null(), ctx)?,
            }
            out.write_size(members.len());
            for member in members {
                out.write_string(&member.name);
                write_tc(out, &member.tc, ctx)?;
                out.write_i16(member.visibility);
            }
            out.end_encapsulation();
        }
        TcRepr::Recursive { .. } => unreachable!("handled above"),
    }
    Ok(())
}

/// Unmarshals a TypeCode.
pub fn read_typecode(input: &mut StreamIn, ctx: &mut TcReadContext) -> CoreResult<TypeCode> {
    input.align(4)?;
    let tag_pos = input.pos();
    let raw_kind = input.read_u32()?;

    if raw_kind == INDIRECTION_TAG {
        let offset_pos = input.pos();
        let offset = input.read_i32()?;
        if offset >= -4 {
            return Err(SystemException::marshal(MINOR_BAD_INDIRECTION));
        }
        let target = offset_pos as i64 + offset as i64;
        if target < 0 {
            return Err(SystemException::marshal(MINOR_BAD_INDIRECTION));
        }
        let target = target as usize;
        if let Some(tc) = ctx.completed.get(&target) {
            return Ok(tc.clone());
        }
        if let Some(id) = ctx.open.get(&target) {
            return Ok(TypeCode::recursive(id.clone()));
        }
        return Err(SystemException::marshal(MINOR_BAD_INDIRECTION));
    }

    let kind = TcKind::from_u32(raw_kind).ok_or_else(SystemException::bad_typecode)?;
    let tc = match kind {
        TcKind::Null
        | TcKind::Void
        | TcKind::Short
        | TcKind::Long
        | TcKind::UShort
        | TcKind::ULong
        | TcKind::Float
        | TcKind::Double
        | TcKind::Boolean
        | TcKind::Char
        | TcKind::Octet
        | TcKind::Any
        | TcKind::TypeCode
        | TcKind::Principal
        | TcKind::LongLong
        | TcKind::ULongLong
        | TcKind::LongDouble
        | TcKind::WChar
        | TcKind::Native => TypeCode::primitive(kind),
        TcKind::String => TypeCode::string(input.read_u32()?),
        TcKind::WString => TypeCode::wstring(input.read_u32()?),
        TcKind::Fixed => {
            let digits = input.read_u16()?;
            let scale = input.read_i16()?;
            TypeCode::fixed(digits, scale)
        }
        TcKind::ObjRef | TcKind::AbstractInterface => {
            let state = input.enter_encapsulation()?;
            let id = input.read_string()?;
            let name = input.read_string()?;
            input.leave_encapsulation(state)?;
            if kind == TcKind::ObjRef {
                TypeCode::objref(id, name)
            } else {
                TypeCode::abstract_interface(id, name)
            }
        }
        TcKind::Struct | TcKind::Except => {
            let state = input.enter_encapsulation()?;
            let id = input.read_string()?;
            let name = input.read_string()?;
            ctx.open.insert(tag_pos, id.clone());
            let count = input.read_size()?;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let member_name = input.read_string()?;
                let member_tc = read_typecode(input, ctx)?;
                members.push(StructMember {
                    name: member_name,
                    tc: member_tc,
                });
            }
            ctx.open.remove(&tag_pos);
            input.leave_encapsulation(state)?;
            if kind == TcKind::Struct {
                TypeCode::structure(id, name, members)
            } else {
                TypeCode::exception(id, name, members)
            }
        }
        TcKind::Union => {
            let state = input.enter_encapsulation()?;
            let id = input.read_string()?;
            let name = input.read_string()?;
            ctx.open.insert(tag_pos, id.clone());
            let discriminator = read_typecode(input, ctx)?;
            let default_index = input.read_i32()?;
            let count = input.read_size()?;
            let mut members = Vec::with_capacity(count);
            for index in 0..count {
                let raw_label = input.read_i64()?;
                let member_name = input.read_string()?;
                let member_tc = read_typecode(input, ctx)?;
                let label = if default_index >= 0 && index == default_index as usize {
                    UnionLabel::Default
                } else {
                    UnionLabel::Value(raw_label)
                };
                members.push(UnionMember {
                    label,
                    name: member_name,
                    tc: member_tc,
                });
            }
            ctx.open.remove(&tag_pos);
            input.leave_encapsulation(state)?;
            TypeCode::union(id, name, discriminator, default_index, members)
        }
        TcKind::Enum => {
            let state = input.enter_encapsulation()?;
            let id = input.read_string()?;
            let name = input.read_string()?;
            let count = input.read_size()?;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                members.push(input.read_string()?);
            }
            input.leave_encapsulation(state)?;
            TypeCode::enumeration(id, name, members)
        }
        TcKind::Sequence => {
            let state = input.enter_encapsulation()?;
            let element = read_typecode(input, ctx)?;
            let bound = input.read_u32()?;
            input.leave_encapsulation(state)?;
            TypeCode::sequence(element, bound)
        }
        TcKind::Array => {
            let state = input.enter_encapsulation()?;
            let element = read_typecode(input, ctx)?;
            let length = input.read_u32()?;
            input.leave_encapsulation(state)?;
            TypeCode::array(element, length)
        }
        TcKind::Alias | TcKind::ValueBox => {
            let state = input.enter_encapsulation()?;
            let id = input.read_string()?;
            let name = input.read_string()?;
            ctx.open.insert(tag_pos, id.clone());
            let content = read_typecode(input, ctx)?;
            ctx.open.remove(&tag_pos);
            input.leave_encapsulation(state)?;
            if kind == TcKind::Alias {
                TypeCode::alias(id, name, content)
            } else {
                TypeCode::value_box(id, name, content)
            }
        }
        TcKind::Value => {
            let state = input.enter_encapsulation()?;
            let id = input.read_string()?;
            let name = input.read_string()?;
            ctx.open.insert(tag_pos, id.clone());
            let modifier = input.read_i16()?;
            let base = read_typecode(input, ctx)?;
            let concrete_base = match base.kind() {
                TcKind::Null => None,
                _ => Some(base),
            };
            let count = input.read_size()?;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let member_name = input.read_string()?;
                let member_tc = read_typecode(input, ctx)?;
                let visibility = input.read_i16()?;
                members.push(ValueMember {
                    name: member_name,
                    tc: member_tc,
                    visibility,
                });
            }
            ctx.open.remove(&tag_pos);
            input.leave_encapsulation(state)?;
            TypeCode::value(id, name, modifier, concrete_base, members)
        }
    };
    ctx.completed.insert(tag_pos, tc.clone());
    Ok(tc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typecode::{tc_equal, tc_equivalent};
    use bytes::Bytes;

    fn round_trip(tc: &TypeCode, little: bool) -> TypeCode {
        let mut out = StreamOut::with_order(little);
        let mut wctx = TcWriteContext::default();
        write_typecode(&mut out, tc, &mut wctx).expect("write");
        let mut input = StreamIn::new(out.finish(), little);
        let mut rctx = TcReadContext::default();
        let decoded = read_typecode(&mut input, &mut rctx).expect("read");
        assert_eq!(input.end(), 0);
        decoded
    }

    #[test]
    fn primitives_round_trip() {
        for tc in [
            TypeCode::long(),
            TypeCode::boolean(),
            TypeCode::double(),
            TypeCode::string(0),
            TypeCode::wstring(16),
            TypeCode::fixed(10, 2),
        ] {
            let decoded = round_trip(&tc, true);
            assert!(tc_equal(&tc, &decoded));
        }
    }

    #[test]
    fn aggregate_round_trip_both_orders() {
        let tc = TypeCode::structure(
            "IDL:acme/Reading:1.0",
            "Reading",
            vec![
                StructMember {
                    name: "label".into(),
                    tc: TypeCode::string(0),
                },
                StructMember {
                    name: "values".into(),
                    tc: TypeCode::sequence(TypeCode::double(), 0),
                },
                StructMember {
                    name: "unit".into(),
                    tc: TypeCode::enumeration(
                        "IDL:acme/Unit:1.0",
                        "Unit",
                        vec!["CELSIUS".into(), "KELVIN".into()],
                    ),
                },
            ],
        );
        for little in [true, false] {
            let decoded = round_trip(&tc, little);
            assert!(tc_equal(&tc, &decoded));
            assert!(tc_equivalent(&tc, &decoded));
        }
    }

    #[test]
    fn recursive_struct_round_trip() {
        // S { x: long; next: sequence<S> } — the S5 scenario.
        let id = "IDL:acme/S:1.0";
        let tc = TypeCode::structure(
            id,
            "S",
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
        );
        let decoded = round_trip(&tc, true);
        assert!(tc_equal(&tc, &decoded));
        assert!(tc_equivalent(&tc, &decoded));
    }

    #[test]
    fn shared_typecode_uses_indirection() {
        let inner = TypeCode::structure(
            "IDL:acme/Inner:1.0",
            "Inner",
            vec![StructMember {
                name: "v".into(),
                tc: TypeCode::long(),
            }],
        );
        let tc = TypeCode::structure(
            "IDL:acme/Outer:1.0",
            "Outer",
            vec![
                StructMember {
                    name: "a".into(),
                    tc: inner.clone(),
                },
                StructMember {
                    name: "b".into(),
                    tc: inner.clone(),
                },
            ],
        );
        let mut out = StreamOut::with_order(true);
        let mut wctx = TcWriteContext::default();
        write_typecode(&mut out, &tc, &mut wctx).unwrap();
        let data = out.finish();
        // The second member must be an indirection, so "Inner" appears once.
        let hay = data.to_vec();
        let needle = b"IDL:acme/Inner:1.0";
        let count = hay
            .windows(needle.len())
            .filter(|w| w == needle)
            .count();
        assert_eq!(count, 1);

        let mut input = StreamIn::new(data, true);
        let decoded = read_typecode(&mut input, &mut TcReadContext::default()).unwrap();
        assert!(tc_equal(&tc, &decoded));
    }

    #[test]
    fn dangling_recursion_reports_bad_typecode() {
        let tc = TypeCode::sequence(TypeCode::recursive("IDL:acme/Missing:1.0"), 0);
        let mut out = StreamOut::with_order(true);
        let err = write_typecode(&mut out, &tc, &mut TcWriteContext::default())
            .expect_err("dangling marker");
        assert_eq!(err.kind, orb_core::error::ExceptionKind::BadTypecode);
    }

    #[test]
    fn shallow_indirection_offset_is_rejected() {
        let mut out = StreamOut::with_order(true);
        out.write_u32(INDIRECTION_TAG);
        out.write_i32(-4);
        let mut input = StreamIn::new(out.finish(), true);
        let err = read_typecode(&mut input, &mut TcReadContext::default())
            .expect_err("offset >= -4");
        assert_eq!(err.kind, orb_core::error::ExceptionKind::Marshal);
        assert_eq!(err.minor, MINOR_BAD_INDIRECTION);
    }

    #[test]
    fn truncated_typecode_reports_fewer_bytes() {
        let tc = TypeCode::structure(
            "IDL:acme/T:1.0",
            "T",
            vec![StructMember {
                name: "x".into(),
                tc: TypeCode::long(),
            }],
        );
        let mut out = StreamOut::with_order(true);
        write_typecode(&mut out, &tc, &mut TcWriteContext::default()).unwrap();
        let data = out.finish();
        let cut = Bytes::copy_from_slice(&data[..data.len() - 6]);
        let mut input = StreamIn::new(cut, true);
        assert!(read_typecode(&mut input, &mut TcReadContext::default()).is_err());
    }
}
