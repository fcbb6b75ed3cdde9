//! The cooperative scheduler and the process shutdown state machine.
//!
//! Logical activities (execution domains) are multiplexed over the worker
//! pool; the scheduler tracks how many are alive and drives the process
//! through RUNNING → SHUTDOWN_PLANNED → SHUTDOWN_STARTED → TERMINATE →
//! SHUTDOWN_FINISH as the activity count returns to zero at each stage.
//! Teardown work itself is performed by listeners observing the state
//! watch, wrapped in activities so the machine only advances when each
//! stage has drained.

use crate::config::RuntimeConfig;
use crate::deadline::DeadlineTime;
use crate::error::{CoreResult, SystemException};
use crate::exec_domain::ExecDomain;
use crate::mem_context::MemContext;
use crate::sync::{SyncContext, SyncFrame};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Bypass SHUTDOWN_PLANNED and begin unwinding immediately.
pub const SHUTDOWN_FLAG_FORCE: u32 = 0x1;

/// Process-wide lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SchedulerState {
    /// Normal operation.
    Running = 0,
    /// In-flight work drains; new external work is refused.
    ShutdownPlanned = 1,
    /// Services are being unwound.
    ShutdownStarted = 2,
    /// Service proxies dropped, remote references cleared, timers disabled.
    Terminate = 3,
    /// The port takes control back.
    ShutdownFinish = 4,
}

impl SchedulerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SchedulerState::Running,
            1 => SchedulerState::ShutdownPlanned,
            2 => SchedulerState::ShutdownStarted,
            3 => SchedulerState::Terminate,
            _ => SchedulerState::ShutdownFinish,
        }
    }
}

/// The per-process scheduler.
#[derive(Debug)]
pub struct Scheduler {
    config: RuntimeConfig,
    state: AtomicU8,
    state_tx: watch::Sender<SchedulerState>,
    activity_cnt: AtomicU64,
    inflight: AtomicU32,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SchedulerState::Running);
        Arc::new(Self {
            config,
            state: AtomicU8::new(SchedulerState::Running as u8),
            state_tx,
            activity_cnt: AtomicU64::new(0),
            inflight: AtomicU32::new(0),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// A watch over lifecycle transitions, for teardown monitors.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    /// Registers an activity unconditionally (internal work).
    pub fn activity_begin(self: &Arc<Self>) -> ActivityGuard {
        self.activity_cnt.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            scheduler: self.clone(),
        }
    }

    /// Registers an external activity; refused once shutdown is planned.
    pub fn begin_external(self: &Arc<Self>) -> CoreResult<ActivityGuard> {
        if self.state() != SchedulerState::Running {
            return Err(SystemException::initialize());
        }
        Ok(self.activity_begin())
    }

    /// Admits one incoming request against the in-flight cap.
    pub fn request_begin(self: &Arc<Self>) -> CoreResult<RequestGuard> {
        if self.state() != SchedulerState::Running {
            return Err(SystemException::transient(1));
        }
        let cap = self.config.max_inflight_requests;
        let prev = self.inflight.fetch_add(1, Ordering::SeqCst);
        if prev >= cap {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            return Err(SystemException::no_resources());
        }
        Ok(RequestGuard {
            activity: self.activity_begin(),
        })
    }

    /// Current in-flight request count.
    pub fn inflight_requests(&self) -> u32 {
        self.inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn activity_end(&self) {
        if self.activity_cnt.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.advance_when_idle();
        }
    }

    /// Pulses the activity counter so a quiescent machine re-evaluates its
    /// state.
    pub fn pulse(self: &Arc<Self>) {
        let guard = self.activity_begin();
        drop(guard);
    }

    /// Initiates shutdown. With `SHUTDOWN_FLAG_FORCE`, the PLANNED stage is
    /// skipped and unwinding begins immediately.
    pub fn shutdown(self: &Arc<Self>, flags: u32) {
        if flags & SHUTDOWN_FLAG_FORCE != 0 {
            for from in [SchedulerState::Running, SchedulerState::ShutdownPlanned] {
                if self.transition(from, SchedulerState::ShutdownStarted) {
                    info!("forced shutdown: unwinding services");
                    break;
                }
            }
        } else if self.transition(SchedulerState::Running, SchedulerState::ShutdownPlanned) {
            info!("shutdown planned: draining in-flight work");
        }
        self.pulse();
    }

    /// Spawns a new execution domain running `fut` inside `sync_context`.
    ///
    /// The activity is accounted until the runnable completes. Panics are
    /// caught and converted to UNKNOWN; the runnable's own error routing
    /// (e.g. to a request) happens inside `fut`.
    pub fn async_call<F>(
        self: &Arc<Self>,
        deadline: DeadlineTime,
        sync_context: SyncContext,
        memory: Option<Arc<MemContext>>,
        fut: F,
    ) -> JoinHandle<()>
    where
        F: std::future::Future<Output = CoreResult<()>> + Send + 'static,
    {
        let ed = ExecDomain::new(deadline);
        if let Some(mem) = memory {
            ed.set_mem_context(mem);
        }
        let guard = self.activity_begin();
        tokio::spawn(async move {
            let _guard = guard;
            let ed_for_scope = ed.clone();
            let body = async move {
                let frame = SyncFrame::enter(&ed, &sync_context).await?;
                let result = fut.await;
                let left = frame.leave().await;
                result.and(left)
            };
            let outcome = AssertUnwindSafe(ed_for_scope.scope(body)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "runnable completed with exception"),
                Err(_panic) => {
                    // Crash inside a runnable maps to a system exception.
                    let e = SystemException::unknown();
                    error!(error = %e, "runnable crashed");
                }
            }
        })
    }

    fn transition(&self, from: SchedulerState, to: SchedulerState) -> bool {
        let ok = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if ok {
            self.state_tx.send_replace(to);
        }
        ok
    }

    fn advance_when_idle(&self) {
        match self.state() {
            SchedulerState::Running => {}
            SchedulerState::ShutdownPlanned => {
                if self.transition(SchedulerState::ShutdownPlanned, SchedulerState::ShutdownStarted)
                {
                    info!("in-flight work drained: unwinding services");
                }
            }
            SchedulerState::ShutdownStarted => {
                if self.transition(SchedulerState::ShutdownStarted, SchedulerState::Terminate) {
                    info!("services unwound: terminating");
                }
            }
            SchedulerState::Terminate => {
                if self.transition(SchedulerState::Terminate, SchedulerState::ShutdownFinish) {
                    info!("shutdown finished");
                }
            }
            SchedulerState::ShutdownFinish => {}
        }
    }
}

/// One registered activity; ends on drop.
#[derive(Debug)]
pub struct ActivityGuard {
    scheduler: Arc<Scheduler>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.scheduler.activity_end();
    }
}

/// One admitted in-flight request; releases the cap slot on drop.
#[derive(Debug)]
pub struct RequestGuard {
    activity: ActivityGuard,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.activity
            .scheduler
            .inflight
            .fetch_sub(1, Ordering::SeqCst);
    }
}
