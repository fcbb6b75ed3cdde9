//! Waitable references: the publish-once lazy-construction primitive.
//!
//! A `WaitableRef` holds either a not-yet-constructed marker with a wait
//! list, the finished value, or a failure. The first caller to `initialize`
//! becomes the writer and receives an exclusive [`ConstructionGuard`];
//! everyone else suspends in `get` until the writer publishes. Readers
//! inherit urgency: the writer's deadline is tightened to the construction
//! deadline and further to any tighter reader deadline, and restored after
//! publication.
//!
//! Used pervasively: module loading, remote-domain creation, servant
//! incarnation, service-slot resolution.

use crate::deadline::{Clock, DeadlineTime};
use crate::error::{CoreResult, SystemException};
use crate::exec_domain::ExecDomain;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

struct WriterInfo {
    ed: Arc<ExecDomain>,
    original_deadline: DeadlineTime,
}

enum State<T> {
    Unconstructed {
        waiters: Vec<oneshot::Sender<CoreResult<()>>>,
        writer: Option<WriterInfo>,
    },
    Ready(T),
    Failed(SystemException),
}

/// A slot constructed exactly once, with waiting readers.
pub struct WaitableRef<T> {
    construction_deadline: DeadlineTime,
    state: Mutex<State<T>>,
}

impl<T: Clone> WaitableRef<T> {
    /// Creates an unconstructed slot. `construction_deadline` is the
    /// relative interval the writer is granted (bounds priority inversion).
    pub fn new(construction_deadline: DeadlineTime) -> Self {
        Self {
            construction_deadline,
            state: Mutex::new(State::Unconstructed {
                waiters: Vec::new(),
                writer: None,
            }),
        }
    }

    /// Claims the writer role. The first caller gets the commit handle and
    /// has its deadline tightened to the construction deadline; later
    /// callers get `None` and should [`get`](Self::get) instead.
    pub fn initialize(&self, ed: &Arc<ExecDomain>) -> Option<ConstructionGuard<'_, T>> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Unconstructed { writer, .. } if writer.is_none() => {
                let original = ed.tighten_deadline(Clock::make_deadline(self.construction_deadline));
                *writer = Some(WriterInfo {
                    ed: ed.clone(),
                    original_deadline: original,
                });
                Some(ConstructionGuard {
                    target: self,
                    committed: false,
                })
            }
            _ => None,
        }
    }

    /// Suspends until publication, then returns the value or the failure.
    /// The writer waiting on its own slot raises BAD_INV_ORDER.
    pub async fn get(&self, ed: &Arc<ExecDomain>) -> CoreResult<T> {
        loop {
            let rx = {
                let mut state = self.state.lock();
                match &mut *state {
                    State::Ready(value) => return Ok(value.clone()),
                    State::Failed(e) => return Err(e.clone()),
                    State::Unconstructed { waiters, writer } => {
                        if let Some(w) = writer {
                            if w.ed.id() == ed.id() {
                                return Err(SystemException::bad_inv_order(0));
                            }
                            // Priority inheritance: a more urgent reader
                            // boosts the writer.
                            w.ed.tighten_deadline(ed.deadline());
                        }
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        rx
                    }
                }
            };
            // Suspension yields the ED's island so the writer can enter
            // it to publish.
            crate::sync::suspended(ed, ed.suspend_on(rx)).await?;
        }
    }

    /// The value, if already constructed.
    pub fn get_if_constructed(&self) -> Option<T> {
        match &*self.state.lock() {
            State::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Whether the slot holds a sticky failure.
    pub fn is_failed(&self) -> bool {
        matches!(&*self.state.lock(), State::Failed(_))
    }

    /// Evicts a published outcome so the slot can be constructed again.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if !matches!(&*state, State::Unconstructed { .. }) {
            *state = State::Unconstructed {
                waiters: Vec::new(),
                writer: None,
            };
        }
    }

    fn publish(&self, outcome: Result<T, SystemException>) {
        let waiters = {
            let mut state = self.state.lock();
            let (waiters, writer) = match &mut *state {
                State::Unconstructed { waiters, writer } => {
                    (std::mem::take(waiters), writer.take())
                }
                // Already terminal; nothing to wake.
                _ => return,
            };
            if let Some(w) = writer {
                w.ed.set_deadline(w.original_deadline);
            }
            *state = match outcome {
                Ok(value) => State::Ready(value),
                Err(e) => State::Failed(e),
            };
            waiters
        };
        for tx in waiters {
            let _ = tx.send(Ok(()));
        }
    }
}

/// Exclusive commit handle held by the writer of a [`WaitableRef`].
///
/// Dropping the guard without publishing fails the slot, so a writer that
/// unwinds early never strands its waiters.
pub struct ConstructionGuard<'a, T: Clone> {
    target: &'a WaitableRef<T>,
    committed: bool,
}

impl<'a, T: Clone> ConstructionGuard<'a, T> {
    /// Publishes the constructed value and wakes all waiters.
    pub fn finish(mut self, value: T) {
        self.committed = true;
        self.target.publish(Ok(value));
    }

    /// Publishes a failure and wakes all waiters. The failure is sticky
    /// until the slot is explicitly [`reset`](WaitableRef::reset).
    pub fn fail(mut self, exception: SystemException) {
        self.committed = true;
        self.target.publish(Err(exception));
    }
}

impl<'a, T: Clone> Drop for ConstructionGuard<'a, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.target.publish(Err(SystemException::bad_inv_order(0)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::{INFINITE_DEADLINE, MILLISECOND, SECOND};

    #[tokio::test]
    async fn single_writer_publishes_to_all_readers() {
        let slot = Arc::new(WaitableRef::<u32>::new(MILLISECOND));
        let writer = ExecDomain::new(INFINITE_DEADLINE);

        let guard = slot.initialize(&writer).expect("first writer wins");
        assert!(slot.initialize(&writer).is_none());

        let mut readers = Vec::new();
        for _ in 0..3 {
            let slot = slot.clone();
            readers.push(tokio::spawn(async move {
                let ed = ExecDomain::new(INFINITE_DEADLINE);
                slot.get(&ed).await
            }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        guard.finish(42);
        for r in readers {
            assert_eq!(r.await.unwrap().unwrap(), 42);
        }
        assert_eq!(slot.get_if_constructed(), Some(42));
    }

    #[tokio::test]
    async fn failure_is_sticky_until_reset() {
        let slot = WaitableRef::<u32>::new(MILLISECOND);
        let writer = ExecDomain::new(INFINITE_DEADLINE);
        slot.initialize(&writer)
            .expect("writer")
            .fail(SystemException::transient(3));

        let reader = ExecDomain::new(INFINITE_DEADLINE);
        let err = slot.get(&reader).await.expect_err("sticky failure");
        assert_eq!(err.kind, crate::error::ExceptionKind::Transient);
        assert!(slot.is_failed());

        slot.reset();
        assert!(!slot.is_failed());
        assert!(slot.initialize(&writer).is_some());
    }

    #[tokio::test]
    async fn writer_deadline_tightened_and_restored() {
        let slot = WaitableRef::<u32>::new(MILLISECOND);
        let writer = ExecDomain::new(INFINITE_DEADLINE);
        let guard = slot.initialize(&writer).expect("writer");
        assert!(writer.deadline() < INFINITE_DEADLINE);
        guard.finish(1);
        assert_eq!(writer.deadline(), INFINITE_DEADLINE);
    }

    #[tokio::test]
    async fn urgent_reader_boosts_writer() {
        let slot = Arc::new(WaitableRef::<u32>::new(SECOND));
        let writer = ExecDomain::new(INFINITE_DEADLINE);
        let guard = slot.initialize(&writer).expect("writer");
        let boosted = writer.deadline();

        let reader = ExecDomain::new(boosted.saturating_sub(SECOND / 2));
        let slot2 = slot.clone();
        let reader2 = reader.clone();
        let task = tokio::spawn(async move { slot2.get(&reader2).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(writer.deadline() <= reader.deadline());
        guard.finish(9);
        assert_eq!(task.await.unwrap().unwrap(), 9);
        assert_eq!(writer.deadline(), INFINITE_DEADLINE);
    }

    #[tokio::test]
    async fn writer_waiting_on_itself_is_rejected() {
        let slot = WaitableRef::<u32>::new(MILLISECOND);
        let writer = ExecDomain::new(INFINITE_DEADLINE);
        let _guard = slot.initialize(&writer).expect("writer");
        let err = slot.get(&writer).await.expect_err("self-wait");
        assert_eq!(err.kind, crate::error::ExceptionKind::BadInvOrder);
    }

    #[tokio::test]
    async fn dropped_guard_fails_waiters() {
        let slot = Arc::new(WaitableRef::<u32>::new(MILLISECOND));
        let writer = ExecDomain::new(INFINITE_DEADLINE);
        drop(slot.initialize(&writer).expect("writer"));
        let reader = ExecDomain::new(INFINITE_DEADLINE);
        let err = slot.get(&reader).await.expect_err("stranded writer");
        assert_eq!(err.kind, crate::error::ExceptionKind::BadInvOrder);
    }
}
