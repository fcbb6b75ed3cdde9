//! Synchronization contexts and sync frames.
//!
//! Every object lives in a sync context: the free context (parallel, shared
//! heap), a sync domain (single-threaded cooperative island with its own
//! memory context), or a singleton domain with process-wide identity.
//! Entering an occupied domain is a rescheduling point; waiters are admitted
//! in deadline order. Memory contexts swap in lockstep with sync contexts.

use crate::deadline::DeadlineTime;
use crate::error::{CoreResult, SystemException};
use crate::exec_domain::ExecDomain;
use crate::mem_context::MemContext;
use parking_lot::Mutex;
use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Waiter {
    deadline: DeadlineTime,
    seq: u64,
    ed_id: u64,
    tx: oneshot::Sender<CoreResult<()>>,
}

// BinaryHeap is a max-heap; invert so the earliest deadline pops first.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Waiter {}

struct TokenState {
    owner: Option<u64>,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

/// A single-threaded cooperative island owning a memory context.
pub struct SyncDomain {
    id: u64,
    label: String,
    mem: Arc<MemContext>,
    terminating: AtomicBool,
    // Code-lifetime root: keeps the owning module loaded while the domain lives.
    owner_module: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    state: Mutex<TokenState>,
}

impl SyncDomain {
    /// Creates a domain with a fresh memory context.
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let label = label.into();
        let mem = MemContext::new(label.clone());
        Self::with_memory(label, mem)
    }

    /// Creates a domain over an existing memory context.
    pub fn with_memory(label: impl Into<String>, mem: Arc<MemContext>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            mem,
            terminating: AtomicBool::new(false),
            owner_module: Mutex::new(None),
            state: Mutex::new(TokenState {
                owner: None,
                waiters: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mem_context(&self) -> Arc<MemContext> {
        self.mem.clone()
    }

    /// Roots the owning module for the domain's lifetime.
    pub fn set_owner_module(&self, module: Arc<dyn Any + Send + Sync>) {
        *self.owner_module.lock() = Some(module);
    }

    /// Marks a singleton domain as terminating; further entries are refused.
    pub fn begin_termination(&self) {
        self.terminating.store(true, Ordering::Release);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Acquires the exclusivity token for `ed`, suspending in deadline order
    /// while another ED runs inside the domain.
    pub async fn acquire(&self, ed: &Arc<ExecDomain>) -> CoreResult<()> {
        if self.is_terminating() {
            return Err(SystemException::initialize());
        }
        ed.check_cancelled()?;
        let (seq, mut rx) = {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(ed.id());
                    return Ok(());
                }
                Some(owner) if owner == ed.id() => {
                    // Reentry must be handled by the caller; acquiring twice
                    // would deadlock the domain.
                    return Err(SystemException::bad_inv_order(0));
                }
                Some(_) => {
                    let (tx, rx) = oneshot::channel();
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.waiters.push(Waiter {
                        deadline: ed.deadline(),
                        seq,
                        ed_id: ed.id(),
                        tx,
                    });
                    (seq, rx)
                }
            }
        };

        match crate::deadline::Clock::remaining(ed.deadline()) {
            None => (&mut rx).await.map_err(|_| SystemException::internal(1))?,
            Some(left) => match tokio::time::timeout(left, &mut rx).await {
                Ok(outcome) => outcome.map_err(|_| SystemException::internal(1))?,
                Err(_elapsed) => {
                    if self.remove_waiter(seq) {
                        return Err(SystemException::timeout());
                    }
                    // Granted between the timeout firing and removal: give
                    // the token back and still report the lapse.
                    if matches!(rx.try_recv(), Ok(Ok(()))) {
                        self.release(ed.id());
                    }
                    return Err(SystemException::timeout());
                }
            },
        }
    }

    /// Releases the token held by `ed_id`, admitting the earliest-deadline
    /// waiter still listening.
    pub fn release(&self, ed_id: u64) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(ed_id));
        loop {
            match state.waiters.pop() {
                Some(waiter) => {
                    let next = waiter.ed_id;
                    if waiter.tx.send(Ok(())).is_ok() {
                        state.owner = Some(next);
                        return;
                    }
                    // Receiver gave up (timeout or cancel); try the next one.
                }
                None => {
                    state.owner = None;
                    return;
                }
            }
        }
    }

    /// Wakes a suspended waiter with an exception. Returns false if the ED
    /// is not queued on this domain.
    pub fn resume_with(&self, ed_id: u64, exception: SystemException) -> bool {
        let mut state = self.state.lock();
        let mut kept = Vec::with_capacity(state.waiters.len());
        let mut woken = false;
        while let Some(waiter) = state.waiters.pop() {
            if !woken && waiter.ed_id == ed_id {
                let _ = waiter.tx.send(Err(exception.clone()));
                woken = true;
            } else {
                kept.push(waiter);
            }
        }
        state.waiters.extend(kept);
        woken
    }

    /// Whether some ED currently holds the token.
    pub fn is_occupied(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    fn remove_waiter(&self, seq: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        let kept: Vec<Waiter> = {
            let mut kept = Vec::with_capacity(before);
            while let Some(w) = state.waiters.pop() {
                if w.seq != seq {
                    kept.push(w);
                }
            }
            kept
        };
        state.waiters.extend(kept);
        state.waiters.len() != before
    }
}

impl std::fmt::Debug for SyncDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDomain")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish()
    }
}

/// The sync context an object or activity belongs to.
#[derive(Clone, Default)]
pub enum SyncContext {
    /// Parallel execution over the shared heap.
    #[default]
    Free,
    /// A cooperative single-threaded domain.
    Domain(Arc<SyncDomain>),
    /// A domain with process-wide identity.
    Singleton(Arc<SyncDomain>),
}

impl SyncContext {
    /// The domain behind this context, if any.
    pub fn domain(&self) -> Option<&Arc<SyncDomain>> {
        match self {
            SyncContext::Free => None,
            SyncContext::Domain(d) | SyncContext::Singleton(d) => Some(d),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, SyncContext::Free)
    }

    /// The memory context entered in lockstep with this sync context.
    pub fn mem_context(&self) -> Arc<MemContext> {
        match self.domain() {
            Some(d) => d.mem_context(),
            None => MemContext::free_context(),
        }
    }
}

impl PartialEq for SyncContext {
    fn eq(&self, other: &Self) -> bool {
        match (self.domain(), other.domain()) {
            (None, None) => true,
            (Some(a), Some(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl Eq for SyncContext {}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncContext::Free => write!(f, "SyncContext::Free"),
            SyncContext::Domain(d) => write!(f, "SyncContext::Domain({})", d.label()),
            SyncContext::Singleton(d) => write!(f, "SyncContext::Singleton({})", d.label()),
        }
    }
}

/// A scoped entry into a sync context.
///
/// `enter` records the ED's (context, memory) pair, acquires the target
/// domain's token when the target is a domain (suspending in deadline
/// order), and swaps the memory context. Dropping the frame releases any
/// token it acquired and restores the recorded pair; frames nest and unwind
/// LIFO.
///
/// Entering the free context from inside a domain releases that domain's
/// token so other activities may enter. Returning from such a frame must
/// re-acquire the token, which suspends; use [`SyncFrame::leave`] (or the
/// [`synchronized`] combinator) on that path rather than a bare drop.
pub struct SyncFrame {
    ed: Arc<ExecDomain>,
    prev_context: SyncContext,
    prev_mem: Arc<MemContext>,
    acquired: Option<Arc<SyncDomain>>,
    released_prev: Option<Arc<SyncDomain>>,
    left: bool,
}

impl SyncFrame {
    /// Enters `target` from the ED's current context.
    pub async fn enter(ed: &Arc<ExecDomain>, target: &SyncContext) -> CoreResult<SyncFrame> {
        let prev_context = ed.sync_context();
        let prev_mem = ed.mem_context();

        let mut acquired = None;
        let mut released_prev = None;
        match target {
            SyncContext::Free => {
                // Leaving a domain for parallel execution frees the island.
                if let Some(domain) = prev_context.domain() {
                    domain.release(ed.id());
                    released_prev = Some(domain.clone());
                }
            }
            SyncContext::Domain(domain) | SyncContext::Singleton(domain) => {
                let same = prev_context
                    .domain()
                    .map(|d| d.id() == domain.id())
                    .unwrap_or(false);
                if !same {
                    domain.acquire(ed).await?;
                    acquired = Some(domain.clone());
                }
            }
        }

        ed.set_sync_context(target.clone());
        ed.set_mem_context(target.mem_context());
        Ok(SyncFrame {
            ed: ed.clone(),
            prev_context,
            prev_mem,
            acquired,
            released_prev,
            left: false,
        })
    }

    /// Leaves the frame, re-acquiring the previous domain when this frame
    /// had released it to enter the free context.
    pub async fn leave(mut self) -> CoreResult<()> {
        self.left = true;
        if let Some(domain) = self.acquired.take() {
            domain.release(self.ed.id());
        }
        if let Some(domain) = self.released_prev.take() {
            domain.acquire(&self.ed).await?;
        }
        self.ed.set_sync_context(self.prev_context.clone());
        self.ed.set_mem_context(self.prev_mem.clone());
        Ok(())
    }
}

impl Drop for SyncFrame {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        if let Some(domain) = self.acquired.take() {
            domain.release(self.ed.id());
        }
        // A dropped free-entry frame cannot re-acquire here; the previous
        // domain stays released and the bookkeeping is still restored.
        self.ed.set_sync_context(self.prev_context.clone());
        self.ed.set_mem_context(self.prev_mem.clone());
    }
}

/// Runs `fut` as a suspension of the current sync context: the ED's domain
/// (if any) is released for the duration and re-acquired before returning,
/// so a suspended activity never blocks its island. Every wait primitive
/// funnels through this.
pub async fn suspended<T, Fut>(ed: &Arc<ExecDomain>, fut: Fut) -> CoreResult<T>
where
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    if ed.sync_context().is_free() {
        return fut.await;
    }
    let frame = SyncFrame::enter(ed, &SyncContext::Free).await?;
    let outcome = fut.await;
    let left = frame.leave().await;
    match outcome {
        Ok(value) => {
            left?;
            Ok(value)
        }
        Err(e) => Err(e),
    }
}

/// Runs `fut` inside `target`, restoring the previous context on every exit
/// path including the error path.
pub async fn synchronized<T, Fut>(
    ed: &Arc<ExecDomain>,
    target: &SyncContext,
    fut: Fut,
) -> CoreResult<T>
where
    Fut: std::future::Future<Output = CoreResult<T>>,
{
    let frame = SyncFrame::enter(ed, target).await?;
    let result = fut.await;
    let left = frame.leave().await;
    match result {
        Ok(value) => {
            left?;
            Ok(value)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::{Clock, INFINITE_DEADLINE, MILLISECOND, SECOND};

    #[tokio::test]
    async fn uncontended_acquire_is_immediate() {
        let domain = SyncDomain::new("d");
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        domain.acquire(&ed).await.unwrap();
        assert!(domain.is_occupied());
        domain.release(ed.id());
        assert!(!domain.is_occupied());
    }

    #[tokio::test]
    async fn waiters_admitted_in_deadline_order() {
        let domain = SyncDomain::new("d");
        let holder = ExecDomain::new(0);
        domain.acquire(&holder).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (name, deadline) in [("late", 3 * SECOND), ("early", SECOND), ("mid", 2 * SECOND)] {
            let domain = domain.clone();
            let order = order.clone();
            let ed = ExecDomain::new(Clock::make_deadline(deadline));
            handles.push(tokio::spawn(async move {
                domain.acquire(&ed).await.unwrap();
                order.lock().push(name);
                domain.release(ed.id());
            }));
        }
        // Let all three queue up before releasing the token.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        domain.release(holder.id());
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["early", "mid", "late"]);
    }

    #[tokio::test]
    async fn queued_acquire_times_out() {
        let domain = SyncDomain::new("d");
        let holder = ExecDomain::new(INFINITE_DEADLINE);
        domain.acquire(&holder).await.unwrap();

        let waiter = ExecDomain::new(Clock::make_deadline(MILLISECOND));
        let err = domain.acquire(&waiter).await.expect_err("must time out");
        assert_eq!(err.kind, crate::error::ExceptionKind::Timeout);

        // The token is still transferable afterwards.
        domain.release(holder.id());
        assert!(!domain.is_occupied());
    }

    #[tokio::test]
    async fn resume_with_wakes_waiter_with_exception() {
        let domain = SyncDomain::new("d");
        let holder = ExecDomain::new(INFINITE_DEADLINE);
        domain.acquire(&holder).await.unwrap();

        let waiter = ExecDomain::new(INFINITE_DEADLINE);
        let waiter_id = waiter.id();
        let domain2 = domain.clone();
        let task = tokio::spawn(async move { domain2.acquire(&waiter).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(domain.resume_with(waiter_id, SystemException::transient(0)));
        let err = task.await.unwrap().expect_err("woken with exception");
        assert_eq!(err.kind, crate::error::ExceptionKind::Transient);
    }

    #[tokio::test]
    async fn frame_restores_context_on_drop() {
        let domain = SyncDomain::new("d");
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        let target = SyncContext::Domain(domain.clone());
        {
            let _frame = SyncFrame::enter(&ed, &target).await.unwrap();
            assert_eq!(ed.sync_context(), target);
            assert_eq!(ed.mem_context().id(), domain.mem_context().id());
        }
        assert!(ed.sync_context().is_free());
        assert!(!domain.is_occupied());
    }

    #[tokio::test]
    async fn free_entry_releases_and_leave_reacquires() {
        let domain = SyncDomain::new("d");
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        let target = SyncContext::Domain(domain.clone());
        let outer = SyncFrame::enter(&ed, &target).await.unwrap();

        let inner = SyncFrame::enter(&ed, &SyncContext::Free).await.unwrap();
        assert!(!domain.is_occupied());
        assert!(ed.sync_context().is_free());
        inner.leave().await.unwrap();
        assert!(domain.is_occupied());
        assert_eq!(ed.sync_context(), target);

        outer.leave().await.unwrap();
        assert!(!domain.is_occupied());
    }

    #[tokio::test]
    async fn synchronized_restores_on_error() {
        let domain = SyncDomain::new("d");
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        let target = SyncContext::Domain(domain.clone());
        let result: CoreResult<()> = synchronized(&ed, &target, async {
            Err(SystemException::bad_param(7))
        })
        .await;
        assert!(result.is_err());
        assert!(ed.sync_context().is_free());
        assert!(!domain.is_occupied());
    }

    #[tokio::test]
    async fn terminating_singleton_refuses_entry() {
        let domain = SyncDomain::new("s");
        domain.begin_termination();
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        assert!(domain.acquire(&ed).await.is_err());
    }
}
