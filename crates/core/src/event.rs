//! Wake-all event primitive.
//!
//! Used by request queues, destroy-completion waits, and reply streams.
//! Unlike a bare notification, a signaled event may carry an exception that
//! every present and future waiter observes.

use crate::error::{CoreResult, SystemException};
use crate::exec_domain::ExecDomain;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Default)]
struct EventState {
    outcome: Option<CoreResult<()>>,
    waiters: Vec<oneshot::Sender<CoreResult<()>>>,
}

/// A one-shot, wake-all event with an optional exception outcome.
#[derive(Default)]
pub struct EventSync {
    state: Mutex<EventState>,
}

impl EventSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends until the event signals, honoring the ED deadline. The
    /// ED's sync domain is yielded for the duration of the wait.
    pub async fn wait(&self, ed: &Arc<ExecDomain>) -> CoreResult<()> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        crate::sync::suspended(ed, ed.suspend_on(rx)).await
    }

    /// Signals success, waking all waiters.
    pub fn signal(&self) {
        self.complete(Ok(()));
    }

    /// Signals an exception observed by all present and future waiters.
    pub fn signal_error(&self, exception: SystemException) {
        self.complete(Err(exception));
    }

    /// Whether the event already fired.
    pub fn is_signaled(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// Re-arms a signaled event.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            state.outcome = None;
        }
    }

    fn complete(&self, outcome: CoreResult<()>) {
        let waiters = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.waiters)
        };
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::INFINITE_DEADLINE;

    #[tokio::test]
    async fn signal_wakes_all() {
        let event = Arc::new(EventSync::new());
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let event = event.clone();
            tasks.push(tokio::spawn(async move {
                let ed = ExecDomain::new(INFINITE_DEADLINE);
                event.wait(&ed).await
            }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        event.signal();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(event.is_signaled());
    }

    #[tokio::test]
    async fn late_waiter_sees_exception() {
        let event = EventSync::new();
        event.signal_error(SystemException::comm_failure());
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        let err = event.wait(&ed).await.expect_err("stored exception");
        assert_eq!(err.kind, crate::error::ExceptionKind::CommFailure);
    }

    #[tokio::test]
    async fn reset_rearms() {
        let event = EventSync::new();
        event.signal();
        event.reset();
        assert!(!event.is_signaled());
    }
}
