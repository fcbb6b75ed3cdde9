//! The incoming-request map.
//!
//! Requests in flight on the server side are tracked by
//! `(client domain, request id)`. Per-entry timestamps disambiguate
//! message races: a duplicate arrival is dropped, a cancel racing ahead of
//! its request is kept as a tombstone and applied on arrival, and a late
//! cancel after completion is ignored.

use orb_core::deadline::{Clock, DeadlineTime};
use orb_core::error::{CoreResult, SystemException};
use orb_core::exec_domain::ExecDomain;
use orb_io::ior::ProtDomainId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

type Key = (ProtDomainId, u32);

enum Entry {
    Active {
        started: DeadlineTime,
        cancelled: Arc<AtomicBool>,
        ed: Arc<ExecDomain>,
    },
    CancelTombstone {
        at: DeadlineTime,
    },
}

/// Tracks requests being served for remote callers.
#[derive(Default)]
pub struct IncomingRequests {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl IncomingRequests {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an arriving request. Returns an error for duplicates and
    /// reports whether a tombstoned cancel already applies.
    pub fn begin(
        &self,
        client: ProtDomainId,
        request_id: u32,
        cancelled: Arc<AtomicBool>,
        ed: Arc<ExecDomain>,
    ) -> CoreResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get(&(client, request_id)) {
            Some(Entry::Active { .. }) => {
                warn!(client, request_id, "duplicate request arrival dropped");
                return Err(SystemException::bad_inv_order(0));
            }
            Some(Entry::CancelTombstone { at }) => {
                debug!(client, request_id, tombstone = at, "request arrived cancelled");
                cancelled.store(true, Ordering::Release);
                entries.remove(&(client, request_id));
                return Ok(true);
            }
            None => {}
        }
        entries.insert(
            (client, request_id),
            Entry::Active {
                started: Clock::now(),
                cancelled,
                ed,
            },
        );
        Ok(false)
    }

    /// Applies a CANCEL_REQUEST: flips the live request's flag and wakes
    /// it, or leaves a tombstone for a request that has not arrived yet.
    pub fn cancel(&self, client: ProtDomainId, request_id: u32) {
        let mut entries = self.entries.lock();
        match entries.get(&(client, request_id)) {
            Some(Entry::Active { cancelled, ed, .. }) => {
                cancelled.store(true, Ordering::Release);
                ed.cancel_with(SystemException::transient(0));
                debug!(client, request_id, "in-flight request cancelled");
            }
            Some(Entry::CancelTombstone { .. }) => {}
            None => {
                entries.insert(
                    (client, request_id),
                    Entry::CancelTombstone { at: Clock::now() },
                );
                debug!(client, request_id, "cancel tombstoned ahead of request");
            }
        }
    }

    /// Removes a completed request. Late cancels for it are ignored.
    pub fn finish(&self, client: ProtDomainId, request_id: u32) {
        let mut entries = self.entries.lock();
        if matches!(
            entries.get(&(client, request_id)),
            Some(Entry::Active { .. })
        ) {
            entries.remove(&(client, request_id));
        }
    }

    /// Live entry count (tests and diagnostics).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops tombstones older than `max_age`.
    pub fn sweep_tombstones(&self, max_age: DeadlineTime) {
        let now = Clock::now();
        self.entries.lock().retain(|_, entry| match entry {
            Entry::Active { .. } => true,
            Entry::CancelTombstone { at } => now.saturating_sub(*at) < max_age,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orb_core::deadline::INFINITE_DEADLINE;

    fn flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn duplicate_arrival_is_rejected() {
        let map = IncomingRequests::new();
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        assert!(!map.begin(1, 7, flag(), ed.clone()).unwrap());
        assert!(map.begin(1, 7, flag(), ed).is_err());
    }

    #[test]
    fn cancel_before_arrival_leaves_a_tombstone() {
        let map = IncomingRequests::new();
        map.cancel(1, 9);
        let cancelled = flag();
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        let was_cancelled = map.begin(1, 9, cancelled.clone(), ed).unwrap();
        assert!(was_cancelled);
        assert!(cancelled.load(Ordering::Acquire));
        // The tombstone was consumed.
        assert!(map.is_empty());
    }

    #[test]
    fn cancel_flips_live_request() {
        let map = IncomingRequests::new();
        let cancelled = flag();
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        map.begin(2, 3, cancelled.clone(), ed.clone()).unwrap();
        map.cancel(2, 3);
        assert!(cancelled.load(Ordering::Acquire));
        assert!(ed.is_cancelled());
        map.finish(2, 3);
        assert!(map.is_empty());
    }

    #[test]
    fn late_cancel_after_finish_is_ignored_then_swept() {
        let map = IncomingRequests::new();
        let ed = ExecDomain::new(INFINITE_DEADLINE);
        map.begin(4, 1, flag(), ed).unwrap();
        map.finish(4, 1);
        map.cancel(4, 1);
        assert_eq!(map.len(), 1);
        map.sweep_tombstones(0);
        assert!(map.is_empty());
    }
}
