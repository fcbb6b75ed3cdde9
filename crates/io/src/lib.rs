//! Wire encoding for the ORB runtime.
//!
//! This crate provides CDR streams with both byte orders, the GIOP message
//! headers and service contexts, canonical object keys, IORs with tagged
//! profiles and components, TypeCodes with indirection-aware marshaling,
//! and valuetype/abstract-interface encoding.

pub mod codeset;
pub mod giop;
pub mod ior;
pub mod object_key;
pub mod stream;
pub mod typecode;
pub mod typecode_marshal;
pub mod value;

pub use codeset::{CharConverter, WCharConverter};
pub use giop::{
    GiopHeader, GiopVersion, LocateStatus, MsgType, ReplyHeader, ReplyStatus, RequestHeader,
    ServiceContext,
};
pub use ior::{DomainAddress, Ior, ProtDomainId, TaggedComponent, TaggedProfile};
pub use object_key::ObjectKey;
pub use stream::{StreamIn, StreamOut};
pub use typecode::{tc_equal, tc_equivalent, TcKind, TypeCode};
pub use typecode_marshal::{read_typecode, write_typecode, TcReadContext, TcWriteContext};
pub use value::{
    read_abstract, read_value, write_abstract, write_value, AbstractRef, ValueBase, ValueFactory,
    ValueFactoryRegistry, ValueReadContext, ValueRef, ValueWriteContext,
};
