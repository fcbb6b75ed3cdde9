//! POA managers.
//!
//! A manager gates request flow into its associated adapters through the
//! state machine {HOLDING, ACTIVE, DISCARDING, INACTIVE}, holding a
//! deadline-ordered pending queue while in HOLDING. Managers are created
//! named through the factory; the root scope creates a default manager when
//! none is supplied.

use crate::error::{PoaError, PoaResult};
use crate::poa::Poa;
use crate::request::InboundRequest;
use orb_core::deadline::DeadlineTime;
use orb_core::error::SystemException;
use orb_core::exec_domain::ExecDomain;
use orb_core::mem_context::MemContext;
use orb_core::omg_minor;
use orb_core::scheduler::Scheduler;
use orb_core::sync::SyncContext;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Manager states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Holding,
    Active,
    Discarding,
    Inactive,
}

struct QueuedRequest {
    deadline: DeadlineTime,
    seq: u64,
    adapter: Arc<Poa>,
    request: InboundRequest,
    memory: Arc<MemContext>,
}

// Min-heap by (deadline, arrival).
impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

struct ManagerInner {
    state: ManagerState,
    queue: BinaryHeap<QueuedRequest>,
    next_seq: u64,
    associated: Vec<Weak<Poa>>,
}

/// Gate between incoming requests and the adapters it manages.
pub struct PoaManager {
    id: String,
    scheduler: Arc<Scheduler>,
    queue_cap: usize,
    inner: Mutex<ManagerInner>,
}

impl PoaManager {
    pub(crate) fn new(id: String, scheduler: Arc<Scheduler>, queue_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            scheduler,
            queue_cap,
            inner: Mutex::new(ManagerInner {
                state: ManagerState::Holding,
                queue: BinaryHeap::new(),
                next_seq: 0,
                associated: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ManagerState {
        self.inner.lock().state
    }

    /// HOLDING/DISCARDING -> ACTIVE. Queued requests are re-dispatched in
    /// non-decreasing deadline order.
    pub fn activate(&self) -> PoaResult<()> {
        let drained = {
            let mut inner = self.inner.lock();
            match inner.state {
                ManagerState::Holding => {
                    inner.state = ManagerState::Active;
                    let mut drained = Vec::with_capacity(inner.queue.len());
                    while let Some(q) = inner.queue.pop() {
                        drained.push(q);
                    }
                    drained
                }
                ManagerState::Discarding => {
                    inner.state = ManagerState::Active;
                    Vec::new()
                }
                ManagerState::Active => Vec::new(),
                ManagerState::Inactive => return Err(PoaError::AdapterInactive),
            }
        };
        for queued in drained {
            if queued.request.request.is_cancelled() {
                continue;
            }
            let adapter = queued.adapter;
            let request = queued.request;
            let _ = self.scheduler.async_call(
                queued.deadline,
                SyncContext::Free,
                Some(queued.memory),
                async move {
                    adapter.serve(request).await;
                    Ok(())
                },
            );
        }
        Ok(())
    }

    /// Any non-INACTIVE state -> HOLDING.
    pub fn hold_requests(&self, wait_for_completion: bool) -> PoaResult<()> {
        if wait_for_completion {
            return Err(PoaError::System(SystemException::bad_inv_order(
                omg_minor(3),
            )));
        }
        let mut inner = self.inner.lock();
        if inner.state == ManagerState::Inactive {
            return Err(PoaError::AdapterInactive);
        }
        inner.state = ManagerState::Holding;
        Ok(())
    }

    /// Any non-INACTIVE state -> DISCARDING; queued requests get TRANSIENT.
    pub fn discard_requests(&self, wait_for_completion: bool) -> PoaResult<()> {
        if wait_for_completion {
            return Err(PoaError::System(SystemException::bad_inv_order(
                omg_minor(3),
            )));
        }
        {
            let mut inner = self.inner.lock();
            if inner.state == ManagerState::Inactive {
                return Err(PoaError::AdapterInactive);
            }
            inner.state = ManagerState::Discarding;
        }
        self.discard_queued();
        Ok(())
    }

    /// Terminal transition to INACTIVE; the queue drains with TRANSIENT.
    pub async fn deactivate(
        &self,
        etherealize_objects: bool,
        wait_for_completion: bool,
    ) -> PoaResult<()> {
        if wait_for_completion {
            return Err(PoaError::System(SystemException::bad_inv_order(
                omg_minor(3),
            )));
        }
        let adapters = {
            let mut inner = self.inner.lock();
            if inner.state == ManagerState::Inactive {
                return Ok(());
            }
            inner.state = ManagerState::Inactive;
            inner
                .associated
                .iter()
                .filter_map(|w| w.upgrade())
                .collect::<Vec<_>>()
        };
        self.discard_queued();
        if etherealize_objects {
            for adapter in adapters {
                adapter.etherealize_objects().await;
            }
        }
        Ok(())
    }

    fn discard_queued(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            let mut drained = Vec::with_capacity(inner.queue.len());
            while let Some(q) = inner.queue.pop() {
                drained.push(q);
            }
            drained
        };
        for mut queued in drained {
            queued.request.request.set_exception(
                SystemException::transient(omg_minor(1)).into(),
            );
        }
    }

    /// Routes one request per the current state. ACTIVE dispatches inline
    /// on the calling ED; HOLDING enqueues by deadline. Gate refusals
    /// become the request's outcome before it is dropped.
    pub async fn invoke(
        &self,
        ed: &Arc<ExecDomain>,
        adapter: Arc<Poa>,
        mut request: InboundRequest,
        memory: Arc<MemContext>,
    ) -> PoaResult<()> {
        let state = self.inner.lock().state;
        let refusal = match state {
            ManagerState::Active => {
                adapter.serve(request).await;
                return Ok(());
            }
            ManagerState::Holding => {
                let mut inner = self.inner.lock();
                if inner.queue.len() >= self.queue_cap {
                    PoaError::System(SystemException::transient(omg_minor(1)))
                } else {
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    debug!(manager = %self.id, deadline = ed.deadline(), "holding request");
                    inner.queue.push(QueuedRequest {
                        deadline: ed.deadline(),
                        seq,
                        adapter,
                        request,
                        memory,
                    });
                    return Ok(());
                }
            }
            ManagerState::Discarding => {
                PoaError::System(SystemException::transient(omg_minor(1)))
            }
            ManagerState::Inactive => {
                PoaError::System(SystemException::obj_adapter(omg_minor(1)))
            }
        };
        crate::request::fail_request(&mut *request.request, &refusal);
        Err(refusal)
    }

    pub(crate) fn on_adapter_create(&self, adapter: &Arc<Poa>) {
        self.inner.lock().associated.push(Arc::downgrade(adapter));
    }

    pub(crate) fn on_adapter_destroy(&self, adapter: &Poa) {
        let mut inner = self.inner.lock();
        inner.associated.retain(|w| match w.upgrade() {
            Some(a) => !std::ptr::eq(Arc::as_ptr(&a), adapter as *const Poa),
            None => false,
        });
    }
}

/// Named-manager registry.
pub struct PoaManagerFactory {
    scheduler: Arc<Scheduler>,
    queue_cap: usize,
    managers: Mutex<HashMap<String, Arc<PoaManager>>>,
}

impl PoaManagerFactory {
    pub fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
        let queue_cap = scheduler.config().manager_queue_cap;
        Arc::new(Self {
            scheduler,
            queue_cap,
            managers: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a named manager; duplicate ids are rejected.
    pub fn create(&self, id: impl Into<String>) -> PoaResult<Arc<PoaManager>> {
        let id = id.into();
        let mut managers = self.managers.lock();
        if managers.contains_key(&id) {
            return Err(PoaError::ManagerAlreadyExists);
        }
        let manager = PoaManager::new(id.clone(), self.scheduler.clone(), self.queue_cap);
        managers.insert(id, manager.clone());
        Ok(manager)
    }

    pub fn find(&self, id: &str) -> Option<Arc<PoaManager>> {
        self.managers.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.managers.lock().keys().cloned().collect()
    }

    pub fn remove(&self, id: &str) {
        self.managers.lock().remove(id);
    }
}
