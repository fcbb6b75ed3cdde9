//! In-process request objects.
//!
//! Local requests keep the common request shape with no wire marshaling:
//! the parameter buffer lives in the caller's memory context and objects
//! and values cross by identity. Three variants: synchronous in-place,
//! oneway (no reply), and async-POA (dispatched through the adapter
//! machinery, completion observed through a one-slot handle).

use crate::error::PoaError;
use crate::poa::current_ed;
use crate::proxy::ServantProxyObject;
use crate::request::{
    InboundRequest, LocalPayload, Request, RequestCodec,
};
use crate::root::PoaRoot;
use async_trait::async_trait;
use orb_core::error::{CoreResult, RequestException, SystemException};
use orb_core::event::EventSync;
use orb_core::mem_context::MemContext;
use orb_core::sync::{SyncContext, SyncFrame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A synchronous (or oneway) in-process request against a servant proxy.
pub struct RequestLocal {
    operation: String,
    target: Arc<ServantProxyObject>,
    codec: RequestCodec,
    memory: Arc<MemContext>,
    exception: Option<RequestException>,
    cancelled: bool,
    completed: bool,
    oneway: bool,
    scheduler: Option<Arc<orb_core::scheduler::Scheduler>>,
}

impl RequestLocal {
    /// A two-way in-place request.
    pub fn new(target: Arc<ServantProxyObject>, operation: impl Into<String>) -> Self {
        let memory = current_ed().mem_context();
        Self {
            operation: operation.into(),
            target,
            codec: RequestCodec::local(),
            memory,
            exception: None,
            cancelled: false,
            completed: false,
            oneway: false,
            scheduler: None,
        }
    }

    /// A oneway request; `invoke` detaches execution onto the scheduler
    /// and never produces a reply.
    pub fn new_oneway(
        target: Arc<ServantProxyObject>,
        operation: impl Into<String>,
        scheduler: Arc<orb_core::scheduler::Scheduler>,
    ) -> Self {
        let mut request = Self::new(target, operation);
        request.oneway = true;
        request.scheduler = Some(scheduler);
        request
    }

    async fn dispatch_body(&mut self) -> CoreResult<()> {
        let ed = current_ed();
        ed.check_cancelled()?;
        let servant = self.target.servant();
        let operation = self.operation.clone();
        let context = self.target.sync_context();
        let frame = SyncFrame::enter(&ed, &context).await?;
        let outcome = servant.dispatch(&operation, self).await;
        frame.leave().await?;
        match outcome {
            Ok(()) => {
                if !self.has_exception() {
                    self.success()?;
                }
                Ok(())
            }
            Err(e) => {
                self.set_exception(RequestException::System(e.clone()));
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Request for RequestLocal {
    fn operation(&self) -> &str {
        &self.operation
    }

    fn memory(&self) -> Arc<MemContext> {
        self.memory.clone()
    }

    fn codec_mut(&mut self) -> &mut RequestCodec {
        &mut self.codec
    }

    fn response_expected(&self) -> bool {
        !self.oneway
    }

    async fn invoke(&mut self) -> CoreResult<()> {
        if self.cancelled {
            return Err(SystemException::transient(0));
        }
        self.codec.flip();
        if self.oneway {
            let scheduler = self
                .scheduler
                .clone()
                .ok_or_else(|| SystemException::internal(0))?;
            let ed = current_ed();
            let mut detached = RequestLocal {
                operation: self.operation.clone(),
                target: self.target.clone(),
                codec: std::mem::replace(&mut self.codec, RequestCodec::local()),
                memory: self.memory.clone(),
                exception: None,
                cancelled: false,
                completed: false,
                oneway: false,
                scheduler: None,
            };
            self.completed = true;
            let _ = scheduler.async_call(
                ed.deadline(),
                SyncContext::Free,
                Some(self.memory.clone()),
                async move {
                    if let Err(e) = detached.dispatch_body().await {
                        // No reply channel; completion is dropped.
                        debug!(error = %e, "oneway request failed");
                    }
                    Ok(())
                },
            );
            return Ok(());
        }
        self.dispatch_body().await?;
        Ok(())
    }

    fn success(&mut self) -> CoreResult<()> {
        // Results written by the callee become the caller's readable side.
        self.codec.flip();
        self.completed = true;
        Ok(())
    }

    fn set_exception(&mut self, exception: RequestException) {
        if self.exception.is_none() {
            self.exception = Some(exception);
            self.completed = true;
        }
    }

    fn get_exception(&mut self) -> Option<RequestException> {
        self.exception.take()
    }

    fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    fn cancel(&mut self) {
        self.cancelled = true;
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Shared completion state of an async-POA request.
struct AsyncShared {
    event: EventSync,
    outcome: Mutex<Option<Result<LocalPayload, RequestException>>>,
    cancelled: AtomicBool,
}

/// Caller-side handle observing an async-POA request.
pub struct AsyncCallHandle {
    shared: Arc<AsyncShared>,
}

impl AsyncCallHandle {
    /// Suspends until completion; returns a codec positioned at the reply.
    pub async fn wait(&self) -> Result<RequestCodec, RequestException> {
        let ed = current_ed();
        self.shared
            .event
            .wait(&ed)
            .await
            .map_err(RequestException::System)?;
        match self.shared.outcome.lock().take() {
            Some(Ok(payload)) => Ok(RequestCodec::local_from_payload(payload)),
            Some(Err(e)) => Err(e),
            None => Err(RequestException::System(SystemException::internal(0))),
        }
    }

    /// Whether the completion has been published.
    pub fn is_completed(&self) -> bool {
        self.shared.event.is_signaled()
    }

    /// Flags the request cancelled; the next suspension point inside the
    /// callee observes it.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }
}

/// An async request dispatched through the POA machinery.
pub struct RequestLocalPoa {
    operation: String,
    codec: RequestCodec,
    memory: Arc<MemContext>,
    exception_taken: Option<RequestException>,
    shared: Arc<AsyncShared>,
}

impl RequestLocalPoa {
    /// Creates the request plus the caller's completion handle.
    pub fn new(operation: impl Into<String>) -> (Self, AsyncCallHandle) {
        let shared = Arc::new(AsyncShared {
            event: EventSync::new(),
            outcome: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        });
        let request = Self {
            operation: operation.into(),
            codec: RequestCodec::local(),
            memory: current_ed().mem_context(),
            exception_taken: None,
            shared: shared.clone(),
        };
        (request, AsyncCallHandle { shared })
    }

    /// Hands the request to the adapter machinery after argument
    /// marshaling. Completion is reported through the handle.
    pub async fn submit(
        mut self,
        root: &Arc<PoaRoot>,
        key: orb_io::object_key::ObjectKey,
    ) -> Result<(), PoaError> {
        self.codec.flip();
        let memory = self.memory.clone();
        let shared = self.shared.clone();
        let inbound = InboundRequest::new(key, Box::new(self));
        match root.invoke(inbound, memory).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Routing failures complete the handle as well.
                let exception = RequestException::System(e.to_system());
                *shared.outcome.lock() = Some(Err(exception));
                shared.event.signal();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Request for RequestLocalPoa {
    fn operation(&self) -> &str {
        &self.operation
    }

    fn memory(&self) -> Arc<MemContext> {
        self.memory.clone()
    }

    fn codec_mut(&mut self) -> &mut RequestCodec {
        &mut self.codec
    }

    async fn invoke(&mut self) -> CoreResult<()> {
        // Caller-side invocation happens through `submit`.
        Err(SystemException::bad_inv_order(0))
    }

    fn success(&mut self) -> CoreResult<()> {
        let payload = self.codec.take_local_payload()?;
        let mut outcome = self.shared.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(Ok(payload));
            self.shared.event.signal();
        }
        Ok(())
    }

    fn set_exception(&mut self, exception: RequestException) {
        let mut outcome = self.shared.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(Err(exception));
            self.shared.event.signal();
        }
    }

    fn get_exception(&mut self) -> Option<RequestException> {
        self.exception_taken.take().or_else(|| {
            match self.shared.outcome.lock().as_ref() {
                Some(Err(e)) => Some(e.clone()),
                _ => None,
            }
        })
    }

    fn has_exception(&self) -> bool {
        matches!(self.shared.outcome.lock().as_ref(), Some(Err(_)))
    }

    fn cancel(&mut self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}
