//! `PortableServer::Current`.
//!
//! During a dispatched invocation, the execution domain carries a stack of
//! dispatch contexts; the innermost one answers which adapter, object id,
//! reference, and servant the running operation belongs to. Outside a
//! dispatch every accessor raises `NoContext`.

use crate::error::{PoaError, PoaResult};
use crate::poa::Poa;
use crate::reference::ReferenceLocal;
use crate::servant::Servant;
use bytes::Bytes;
use orb_core::exec_domain::ExecDomain;
use std::sync::Arc;

/// The dispatch context pushed for each invocation.
pub struct DispatchContext {
    pub adapter: Arc<Poa>,
    pub object_id: Bytes,
    pub reference: Option<Arc<ReferenceLocal>>,
    pub servant: Arc<dyn Servant>,
}

/// Accessors over the innermost dispatch context of an ED.
pub struct Current;

impl Current {
    fn context(ed: &Arc<ExecDomain>) -> PoaResult<Arc<DispatchContext>> {
        ed.peek_call_context()
            .and_then(|ctx| ctx.downcast::<DispatchContext>().ok())
            .ok_or(PoaError::NoContext)
    }

    /// The adapter dispatching the current request.
    pub fn get_poa(ed: &Arc<ExecDomain>) -> PoaResult<Arc<Poa>> {
        Ok(Self::context(ed)?.adapter.clone())
    }

    /// The object id the current request targets.
    pub fn get_object_id(ed: &Arc<ExecDomain>) -> PoaResult<Bytes> {
        Ok(Self::context(ed)?.object_id.clone())
    }

    /// The reference the current request arrived through.
    pub fn get_reference(ed: &Arc<ExecDomain>) -> PoaResult<Arc<ReferenceLocal>> {
        Self::context(ed)?.reference.clone().ok_or(PoaError::NoContext)
    }

    /// The servant executing the current request.
    pub fn get_servant(ed: &Arc<ExecDomain>) -> PoaResult<Arc<dyn Servant>> {
        Ok(Self::context(ed)?.servant.clone())
    }
}

/// Pushes a dispatch context for the duration of a call; pops on drop.
pub struct CurrentGuard {
    ed: Arc<ExecDomain>,
}

impl CurrentGuard {
    pub fn push(ed: Arc<ExecDomain>, context: DispatchContext) -> Self {
        ed.push_call_context(Arc::new(context));
        Self { ed }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        self.ed.pop_call_context();
    }
}
