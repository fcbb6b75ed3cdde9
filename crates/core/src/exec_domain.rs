//! Execution domains.
//!
//! An execution domain (ED) is the unit of scheduling: a logical activity
//! with a deadline, a security context, a memory context, a current sync
//! context, and a per-ED slot for the dispatch-context stack. EDs are
//! multiplexed over the worker pool; at most one worker runs an ED at any
//! instant, and an ED observes cancellation only at suspension points.

use crate::deadline::{Clock, DeadlineTime};
use crate::error::{CoreResult, SystemException};
use crate::mem_context::MemContext;
use crate::sync::SyncContext;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT_ED: Arc<ExecDomain>;
}

/// Handle to a security context established for an activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    /// Peer-assigned client context id.
    pub context_id: u64,
}

/// One logical activity scheduled by deadline.
pub struct ExecDomain {
    id: u64,
    deadline: AtomicU64,
    security: Mutex<Option<SecurityContext>>,
    sync_context: Mutex<SyncContext>,
    mem_context: Mutex<Arc<MemContext>>,
    cancelled: AtomicBool,
    pending_cancel: Mutex<Option<SystemException>>,
    // TLS slot for the PortableServer dispatch-context stack.
    call_stack: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

impl ExecDomain {
    /// Creates an ED starting in the free context with the given deadline.
    pub fn new(deadline: DeadlineTime) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            deadline: AtomicU64::new(deadline),
            security: Mutex::new(None),
            sync_context: Mutex::new(SyncContext::Free),
            mem_context: Mutex::new(MemContext::free_context()),
            cancelled: AtomicBool::new(false),
            pending_cancel: Mutex::new(None),
            call_stack: Mutex::new(Vec::new()),
        })
    }

    /// The ED bound to the running task.
    pub fn current() -> CoreResult<Arc<ExecDomain>> {
        CURRENT_ED
            .try_with(|ed| ed.clone())
            .map_err(|_| SystemException::initialize())
    }

    /// Runs `fut` with this ED installed as the task's current ED.
    pub async fn scope<F: std::future::Future>(self: Arc<Self>, fut: F) -> F::Output {
        CURRENT_ED.scope(self, fut).await
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> DeadlineTime {
        self.deadline.load(Ordering::Acquire)
    }

    /// Replaces the deadline outright.
    pub fn set_deadline(&self, deadline: DeadlineTime) {
        self.deadline.store(deadline, Ordering::Release);
    }

    /// Tightens the deadline to `min(current, deadline)` and returns the
    /// previous value so the caller can restore it.
    pub fn tighten_deadline(&self, deadline: DeadlineTime) -> DeadlineTime {
        let mut prev = self.deadline.load(Ordering::Acquire);
        while deadline < prev {
            match self.deadline.compare_exchange_weak(
                prev,
                deadline,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        prev
    }

    pub fn security(&self) -> Option<SecurityContext> {
        self.security.lock().clone()
    }

    pub fn set_security(&self, ctx: Option<SecurityContext>) {
        *self.security.lock() = ctx;
    }

    pub fn sync_context(&self) -> SyncContext {
        self.sync_context.lock().clone()
    }

    pub(crate) fn set_sync_context(&self, ctx: SyncContext) {
        *self.sync_context.lock() = ctx;
    }

    pub fn mem_context(&self) -> Arc<MemContext> {
        self.mem_context.lock().clone()
    }

    pub(crate) fn set_mem_context(&self, mem: Arc<MemContext>) {
        *self.mem_context.lock() = mem;
    }

    /// Requests cancellation; the ED observes it at its next suspension point.
    pub fn cancel_with(&self, exception: SystemException) {
        let mut pending = self.pending_cancel.lock();
        if pending.is_none() {
            *pending = Some(exception);
            self.cancelled.store(true, Ordering::Release);
        }
    }

    /// Whether a cancellation is pending.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Observes a pending cancellation. Called at every suspension point.
    pub fn check_cancelled(&self) -> CoreResult<()> {
        if self.cancelled.load(Ordering::Acquire) {
            if let Some(e) = self.pending_cancel.lock().take() {
                self.cancelled.store(false, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Suspends on a oneshot outcome, honoring cancellation and the ED
    /// deadline. A lapsed deadline surfaces TIMEOUT; a dropped sender
    /// surfaces INTERNAL.
    pub async fn suspend_on<T>(&self, rx: oneshot::Receiver<CoreResult<T>>) -> CoreResult<T> {
        self.check_cancelled()?;
        let outcome = match Clock::remaining(self.deadline()) {
            None => rx.await.map_err(|_| SystemException::internal(1))?,
            Some(left) => tokio::time::timeout(left, rx)
                .await
                .map_err(|_| SystemException::timeout())?
                .map_err(|_| SystemException::internal(1))?,
        };
        self.check_cancelled()?;
        outcome
    }

    /// Pushes a dispatch context onto the ED's TLS stack.
    pub fn push_call_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        self.call_stack.lock().push(ctx);
    }

    /// Pops the innermost dispatch context.
    pub fn pop_call_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.call_stack.lock().pop()
    }

    /// The innermost dispatch context, if the ED is servicing a request.
    pub fn peek_call_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.call_stack.lock().last().cloned()
    }

    /// Whether this ED is currently inside a dispatched request.
    pub fn in_dispatch(&self) -> bool {
        !self.call_stack.lock().is_empty()
    }
}

impl std::fmt::Debug for ExecDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecDomain")
            .field("id", &self.id)
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Restores an ED's deadline when dropped. Used for temporary urgency boosts.
pub struct DeadlineGuard {
    ed: Arc<ExecDomain>,
    previous: DeadlineTime,
}

impl DeadlineGuard {
    /// Tightens `ed`'s deadline for the guard's lifetime.
    pub fn tighten(ed: Arc<ExecDomain>, deadline: DeadlineTime) -> Self {
        let previous = ed.tighten_deadline(deadline);
        Self { ed, previous }
    }
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.ed.set_deadline(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::INFINITE_DEADLINE;

    #[test]
    fn tighten_only_shrinks() {
        let ed = ExecDomain::new(1000);
        assert_eq!(ed.tighten_deadline(2000), 1000);
        assert_eq!(ed.deadline(), 1000);
        assert_eq!(ed.tighten_deadline(500), 1000);
        assert_eq!(ed.deadline(), 500);
    }

    #[test]
    fn deadline_guard_restores() {
        let ed = ExecDomain::new(1000);
        {
            let _g = DeadlineGuard::tighten(ed.clone(), 10);
            assert_eq!(ed.deadline(), 10);
        }
        assert_eq!(ed.deadline(), 1000);
    }

    #[test]
    fn cancellation_is_observed_once() {
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        ed.cancel_with(SystemException::transient(0));
        assert!(ed.check_cancelled().is_err());
        assert!(ed.check_cancelled().is_ok());
    }

    #[tokio::test]
    async fn current_requires_scope() {
        assert!(ExecDomain::current().is_err());
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        let id = ed.id();
        let seen = ed
            .scope(async move { ExecDomain::current().map(|e| e.id()) })
            .await;
        assert_eq!(seen.ok(), Some(id));
    }

    #[tokio::test]
    async fn suspend_on_times_out() {
        let ed = ExecDomain::new(Clock::make_deadline(1));
        let (_tx, rx) = oneshot::channel::<CoreResult<()>>();
        let err = ed.suspend_on(rx).await.expect_err("deadline must lapse");
        assert_eq!(err.kind, crate::error::ExceptionKind::Timeout);
    }
}
