//! The common request contract.
//!
//! All three request flavors (in-process, GIOP, ESIOP) share one abstract
//! shape: marshal/unmarshal primitives over a codec, `invoke` on the caller
//! side, `success`/`set_exception` on the callee side, `cancel`, and a
//! memory context captured at construction. Requests outlive sync-context
//! changes but keep their heap.

use async_trait::async_trait;
use bytes::Bytes;
use orb_core::error::{CoreResult, RequestException, SystemException};
use orb_core::mem_context::MemContext;
use orb_io::codeset::{CharConverter, WCharConverter};
use orb_io::ior::Ior;
use orb_io::stream::{StreamIn, StreamOut};
use orb_io::typecode::TypeCode;
use orb_io::typecode_marshal::{read_typecode, write_typecode, TcReadContext, TcWriteContext};
use orb_io::value::{
    read_abstract, read_value, write_abstract, write_value, AbstractRef, ValueFactoryRegistry,
    ValueReadContext, ValueRef, ValueWriteContext,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// The one invocation contract shared by in-process, cross-domain, and
/// cross-host objects.
pub trait ObjectInterface: Send + Sync {
    /// Primary repository id.
    fn primary_interface(&self) -> String;

    /// All supported repository ids.
    fn interfaces(&self) -> Vec<String>;

    /// The marshaled reference form.
    fn ior(&self) -> CoreResult<Ior>;

    /// Whether invocations stay inside this protection domain.
    fn is_local(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to an invocable object.
pub type ObjectRef = Arc<dyn ObjectInterface>;

/// Resolves a marshaled reference back to an invocable object. Supplied by
/// the binder; absent in reduced test setups.
pub trait ObjectResolver: Send + Sync {
    fn resolve(&self, ior: &Ior) -> CoreResult<ObjectRef>;
}

/// How a codec carries objects and values.
enum CodecMode {
    /// In-process: no marshaling; identity maps keyed by live pointer
    /// preserve sharing and cycles across one invocation.
    Local {
        objects: Vec<ObjectRef>,
        object_index: HashMap<usize, u32>,
        values: Vec<ValueRef>,
        value_index: HashMap<usize, u32>,
    },
    /// CDR: full wire encoding with per-request indirection maps.
    Cdr {
        tc_write: TcWriteContext,
        tc_read: TcReadContext,
        value_write: ValueWriteContext,
        value_read: ValueReadContext,
        value_factories: Arc<ValueFactoryRegistry>,
        resolver: Option<Arc<dyn ObjectResolver>>,
    },
}

/// Parameter codec owned by a request: an output stream while building,
/// flipped to an input stream for the reading side.
pub struct RequestCodec {
    out: StreamOut,
    input: Option<StreamIn>,
    char_conv: CharConverter,
    wchar_conv: WCharConverter,
    mode: CodecMode,
}

impl std::fmt::Debug for RequestCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCodec").finish_non_exhaustive()
    }
}

impl RequestCodec {
    /// A local (no-marshaling) codec in native byte order.
    pub fn local() -> Self {
        Self {
            out: StreamOut::new(),
            input: None,
            char_conv: CharConverter::utf8(),
            wchar_conv: WCharConverter::utf16(2),
            mode: CodecMode::Local {
                objects: Vec::new(),
                object_index: HashMap::new(),
                values: Vec::new(),
                value_index: HashMap::new(),
            },
        }
    }

    /// A CDR codec for a GIOP stream.
    pub fn cdr(
        out: StreamOut,
        giop_minor: u8,
        value_factories: Arc<ValueFactoryRegistry>,
        resolver: Option<Arc<dyn ObjectResolver>>,
    ) -> Self {
        Self {
            out,
            input: None,
            char_conv: CharConverter::utf8(),
            wchar_conv: WCharConverter::utf16(giop_minor),
            mode: CodecMode::Cdr {
                tc_write: TcWriteContext::default(),
                tc_read: TcReadContext::default(),
                value_write: ValueWriteContext::default(),
                value_read: ValueReadContext::default(),
                value_factories,
                resolver,
            },
        }
    }

    /// A CDR codec over received bytes.
    pub fn cdr_input(
        input: StreamIn,
        giop_minor: u8,
        value_factories: Arc<ValueFactoryRegistry>,
        resolver: Option<Arc<dyn ObjectResolver>>,
    ) -> Self {
        let mut codec = Self::cdr(StreamOut::new(), giop_minor, value_factories, resolver);
        codec.input = Some(input);
        codec
    }

    /// The write stream.
    pub fn out(&mut self) -> &mut StreamOut {
        &mut self.out
    }

    /// The read stream; fails before [`flip`](Self::flip) (or input
    /// attachment) made one available.
    pub fn input(&mut self) -> CoreResult<&mut StreamIn> {
        self.input
            .as_mut()
            .ok_or_else(|| SystemException::marshal(0))
    }

    /// Turns everything written so far into the readable side and resets
    /// the write side. Used at the local caller/callee handoff.
    pub fn flip(&mut self) {
        let little = self.out.little_endian();
        let data = std::mem::take(&mut self.out).finish();
        self.input = Some(StreamIn::new(data, little));
    }

    /// Replaces the readable side with received bytes.
    pub fn attach_input(&mut self, input: StreamIn) {
        self.input = Some(input);
    }

    /// Extracts the written bytes plus the identity tables of a local
    /// codec, for handing a completed reply across task boundaries.
    pub fn take_local_payload(&mut self) -> CoreResult<LocalPayload> {
        let little_endian = self.out.little_endian();
        let data = std::mem::take(&mut self.out).finish();
        match &mut self.mode {
            CodecMode::Local {
                objects, values, ..
            } => Ok(LocalPayload {
                data,
                little_endian,
                objects: std::mem::take(objects),
                values: std::mem::take(values),
            }),
            CodecMode::Cdr { .. } => Err(SystemException::internal(0)),
        }
    }

    /// Rebuilds a readable local codec from a completed payload.
    pub fn local_from_payload(payload: LocalPayload) -> Self {
        let mut codec = Self::local();
        if let CodecMode::Local {
            objects, values, ..
        } = &mut codec.mode
        {
            *objects = payload.objects;
            *values = payload.values;
        }
        codec.input = Some(StreamIn::new(payload.data, payload.little_endian));
        codec
    }

    pub fn write_string(&mut self, value: &str) -> CoreResult<()> {
        let conv = self.char_conv;
        conv.write_string(&mut self.out, value)
    }

    pub fn read_string(&mut self) -> CoreResult<String> {
        let conv = self.char_conv;
        conv.read_string(self.input()?)
    }

    pub fn write_wstring(&mut self, value: &str) -> CoreResult<()> {
        let conv = self.wchar_conv;
        conv.write_wstring(&mut self.out, value)
    }

    pub fn read_wstring(&mut self) -> CoreResult<String> {
        let conv = self.wchar_conv;
        conv.read_wstring(self.input()?)
    }

    /// Writes an object reference.
    pub fn write_object(&mut self, object: Option<&ObjectRef>) -> CoreResult<()> {
        match &mut self.mode {
            CodecMode::Local {
                objects,
                object_index,
                ..
            } => {
                // Identity-indexed; a nil writes the sentinel.
                match object {
                    None => self.out.write_u32(u32::MAX),
                    Some(obj) => {
                        let ptr = Arc::as_ptr(obj) as *const () as usize;
                        let index = *object_index.entry(ptr).or_insert_with(|| {
                            objects.push(obj.clone());
                            (objects.len() - 1) as u32
                        });
                        self.out.write_u32(index);
                    }
                }
                Ok(())
            }
            CodecMode::Cdr { .. } => {
                let ior = match object {
                    None => Ior::nil(),
                    Some(obj) => obj.ior()?,
                };
                ior.marshal(&mut self.out);
                Ok(())
            }
        }
    }

    /// Reads an object reference.
    pub fn read_object(&mut self) -> CoreResult<Option<ObjectRef>> {
        match &mut self.mode {
            CodecMode::Local { objects, .. } => {
                let input = self
                    .input
                    .as_mut()
                    .ok_or_else(|| SystemException::marshal(0))?;
                let index = input.read_u32()?;
                if index == u32::MAX {
                    return Ok(None);
                }
                objects
                    .get(index as usize)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| SystemException::marshal(0))
            }
            CodecMode::Cdr { resolver, .. } => {
                let input = self
                    .input
                    .as_mut()
                    .ok_or_else(|| SystemException::marshal(0))?;
                let ior = Ior::unmarshal(input)?;
                if ior.is_nil() {
                    return Ok(None);
                }
                let resolver = resolver.clone().ok_or_else(SystemException::inv_objref)?;
                Ok(Some(resolver.resolve(&ior)?))
            }
        }
    }

    /// Writes a TypeCode with per-request indirection tracking.
    pub fn write_typecode(&mut self, tc: &TypeCode) -> CoreResult<()> {
        match &mut self.mode {
            CodecMode::Cdr { tc_write, .. } => write_typecode(&mut self.out, tc, tc_write),
            CodecMode::Local { .. } => {
                // Local requests still use the wire form; sharing is
                // per-write only.
                let mut ctx = TcWriteContext::default();
                write_typecode(&mut self.out, tc, &mut ctx)
            }
        }
    }

    /// Reads a TypeCode.
    pub fn read_typecode(&mut self) -> CoreResult<TypeCode> {
        match &mut self.mode {
            CodecMode::Cdr { tc_read, .. } => {
                let input = self
                    .input
                    .as_mut()
                    .ok_or_else(|| SystemException::marshal(0))?;
                read_typecode(input, tc_read)
            }
            CodecMode::Local { .. } => {
                let input = self
                    .input
                    .as_mut()
                    .ok_or_else(|| SystemException::marshal(0))?;
                read_typecode(input, &mut TcReadContext::default())
            }
        }
    }

    /// Writes a valuetype.
    pub fn write_value(&mut self, value: Option<&ValueRef>) -> CoreResult<()> {
        match &mut self.mode {
            CodecMode::Local {
                values,
                value_index,
                ..
            } => {
                match value {
                    None => self.out.write_u32(u32::MAX),
                    Some(v) => {
                        let ptr = Arc::as_ptr(v) as *const () as usize;
                        let index = *value_index.entry(ptr).or_insert_with(|| {
                            values.push(v.clone());
                            (values.len() - 1) as u32
                        });
                        self.out.write_u32(index);
                    }
                }
                Ok(())
            }
            CodecMode::Cdr { value_write, .. } => write_value(&mut self.out, value, value_write),
        }
    }

    /// Reads a valuetype.
    pub fn read_value(&mut self) -> CoreResult<Option<ValueRef>> {
        match &mut self.mode {
            CodecMode::Local { values, .. } => {
                let input = self
                    .input
                    .as_mut()
                    .ok_or_else(|| SystemException::marshal(0))?;
                let index = input.read_u32()?;
                if index == u32::MAX {
                    return Ok(None);
                }
                values
                    .get(index as usize)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| SystemException::marshal(0))
            }
            CodecMode::Cdr {
                value_read,
                value_factories,
                ..
            } => {
                let factories = value_factories.clone();
                let input = self
                    .input
                    .as_mut()
                    .ok_or_else(|| SystemException::marshal(0))?;
                read_value(input, &factories, value_read)
            }
        }
    }

    /// Writes an abstract interface (discriminated object or value).
    pub fn write_abstract(&mut self, value: &AbstractRef) -> CoreResult<()> {
        if matches!(self.mode, CodecMode::Local { .. }) {
            return match value {
                AbstractRef::Object(_) => {
                    // Local invocations pass references through the object
                    // index path, not the abstract-interface wire form.
                    Err(SystemException::no_implement())
                }
                AbstractRef::Value(v) => {
                    self.out.write_bool(false);
                    let v = v.clone();
                    self.write_value(v.as_ref())
                }
            };
        }
        if let CodecMode::Cdr { value_write, .. } = &mut self.mode {
            write_abstract(&mut self.out, value, value_write)
        } else {
            Err(SystemException::internal(0))
        }
    }

    /// Reads an abstract interface.
    pub fn read_abstract(&mut self) -> CoreResult<AbstractRef> {
        if matches!(self.mode, CodecMode::Local { .. }) {
            let is_object = self.input()?.read_bool()?;
            if is_object {
                return Err(SystemException::no_implement());
            }
            return Ok(AbstractRef::Value(self.read_value()?));
        }
        if let CodecMode::Cdr {
            value_read,
            value_factories,
            ..
        } = &mut self.mode
        {
            let factories = value_factories.clone();
            let input = self
                .input
                .as_mut()
                .ok_or_else(|| SystemException::marshal(0))?;
            read_abstract(input, &factories, value_read)
        } else {
            Err(SystemException::internal(0))
        }
    }

}

/// A completed local reply: the raw bytes plus the identity tables that
/// carry objects and values across the task boundary unmarshaled.
pub struct LocalPayload {
    pub data: Bytes,
    pub little_endian: bool,
    pub objects: Vec<ObjectRef>,
    pub values: Vec<ValueRef>,
}

/// The abstract request object.
#[async_trait]
pub trait Request: Send {
    /// The operation name.
    fn operation(&self) -> &str;

    /// The memory context captured at construction.
    fn memory(&self) -> Arc<MemContext>;

    /// Parameter codec access.
    fn codec_mut(&mut self) -> &mut RequestCodec;

    /// Whether the caller expects a reply.
    fn response_expected(&self) -> bool {
        true
    }

    /// Caller side: performs the invocation. Completion or exception is
    /// observable through [`get_exception`](Self::get_exception) and the
    /// codec's readable side.
    async fn invoke(&mut self) -> CoreResult<()>;

    /// Callee side: marks normal completion and releases the reply.
    fn success(&mut self) -> CoreResult<()>;

    /// Callee side: records an exception outcome.
    fn set_exception(&mut self, exception: RequestException);

    /// Takes the recorded exception outcome, if any.
    fn get_exception(&mut self) -> Option<RequestException>;

    /// Whether an exception outcome is recorded, without consuming it.
    fn has_exception(&self) -> bool;

    /// Flags the request cancelled; the next suspension point inside the
    /// request observes it.
    fn cancel(&mut self);

    fn is_cancelled(&self) -> bool;
}

/// Holds a deferred outcome for asynchronous completions.
///
/// Either the exception or the completed marker is set exactly once;
/// `raise_exception` rethrows a held exception.
#[derive(Default)]
pub struct ExceptionHolder {
    outcome: parking_lot::Mutex<Option<Result<(), RequestException>>>,
}

impl ExceptionHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_completed(&self) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(Ok(()));
        }
    }

    pub fn set_exception(&self, exception: RequestException) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(Err(exception));
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Rethrows the held exception, or reports success.
    pub fn raise_exception(&self) -> Result<(), RequestException> {
        match self.outcome.lock().clone() {
            None => Err(RequestException::System(SystemException::new(
                orb_core::error::ExceptionKind::NoResponse,
                0,
                orb_core::error::CompletionStatus::No,
            ))),
            Some(outcome) => outcome,
        }
    }
}

/// Server-side view of an incoming request: the target key plus the
/// request object to dispatch.
pub struct InboundRequest {
    pub key: orb_io::object_key::ObjectKey,
    pub request: Box<dyn Request>,
}

impl InboundRequest {
    pub fn new(key: orb_io::object_key::ObjectKey, request: Box<dyn Request>) -> Self {
        Self { key, request }
    }

    pub fn object_id(&self) -> Bytes {
        self.key.object_id().clone()
    }
}

/// Routes an adapter-level failure into a request as its outcome.
pub fn fail_request(request: &mut dyn Request, error: &crate::error::PoaError) {
    request.set_exception(RequestException::System(error.to_system()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_codec_preserves_value_identity() {
        struct Leaf;
        impl orb_io::value::ValueBase for Leaf {
            fn repository_ids(&self) -> Vec<String> {
                vec!["IDL:acme/Leaf:1.0".into()]
            }
            fn marshal(
                &self,
                _out: &mut StreamOut,
                _ctx: &mut ValueWriteContext,
            ) -> CoreResult<()> {
                Ok(())
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let mut codec = RequestCodec::local();
        let value: ValueRef = Arc::new(Leaf);
        codec.write_value(Some(&value)).unwrap();
        codec.write_value(Some(&value)).unwrap();
        codec.write_value(None).unwrap();
        codec.flip();
        let a = codec.read_value().unwrap().expect("first");
        let b = codec.read_value().unwrap().expect("second");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &value));
        assert!(codec.read_value().unwrap().is_none());
    }

    #[test]
    fn exception_holder_publishes_once() {
        let holder = ExceptionHolder::new();
        assert!(holder.raise_exception().is_err());
        holder.set_completed();
        holder.set_exception(RequestException::System(SystemException::unknown()));
        assert!(holder.raise_exception().is_ok());
    }

    #[test]
    fn codec_flip_reads_back_primitives() {
        let mut codec = RequestCodec::local();
        codec.out().write_u32(11);
        codec.write_string("op-arg").unwrap();
        codec.flip();
        assert_eq!(codec.input().unwrap().read_u32().unwrap(), 11);
        assert_eq!(codec.read_string().unwrap(), "op-arg");
    }
}
