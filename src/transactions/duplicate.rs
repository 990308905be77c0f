//! Fingerprint-keyed detection of requests racing for the same outcome.

use super::types::{TransactionKind, Waiter};
use crate::types::{Fingerprint, RequestId, RequesterRef};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Result of [`DuplicateDetector::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// No decision was pending; the caller owns the downstream request.
    Leader,
    /// Folded into the pending transaction.
    Joined(RequestId),
}

struct Pending {
    transaction: RequestId,
    kind: TransactionKind,
    waiters: Vec<Waiter>,
}

/// Maps a fingerprint to the requesters awaiting a create or delete
/// decision for it.
#[derive(Default)]
pub struct DuplicateDetector {
    pending: Mutex<HashMap<Fingerprint, Pending>>,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pending transaction `requester` is already waiting on, if any.
    /// A hit means the request is a retransmission.
    pub fn lookup(&self, fingerprint: &Fingerprint, requester: &RequesterRef) -> Option<RequestId> {
        let pending = self.pending.lock();
        pending.get(fingerprint).and_then(|p| {
            p.waiters
                .iter()
                .any(|w| &w.requester == requester)
                .then_some(p.transaction)
        })
    }

    /// Register interest in the outcome for `fingerprint`.
    ///
    /// Check and insert happen under one lock: of any number of concurrent
    /// callers exactly one becomes [`Registration::Leader`] with `candidate`
    /// as the pending transaction, and the rest join it. `waiter` is `None`
    /// for internally issued requests nobody waits on.
    pub fn register(
        &self,
        fingerprint: Fingerprint,
        kind: TransactionKind,
        candidate: RequestId,
        waiter: Option<Waiter>,
    ) -> Registration {
        let mut pending = self.pending.lock();
        match pending.get_mut(&fingerprint) {
            Some(existing) => {
                existing.waiters.extend(waiter);
                Registration::Joined(existing.transaction)
            }
            None => {
                pending.insert(
                    fingerprint,
                    Pending {
                        transaction: candidate,
                        kind,
                        waiters: waiter.into_iter().collect(),
                    },
                );
                Registration::Leader
            }
        }
    }

    /// Kind of the pending decision for `fingerprint`.
    pub fn pending_kind(&self, fingerprint: &Fingerprint) -> Option<TransactionKind> {
        self.pending.lock().get(fingerprint).map(|p| p.kind)
    }

    /// Close the pending decision and hand back everyone waiting on it.
    pub fn resolve(&self, fingerprint: &Fingerprint) -> Vec<Waiter> {
        self.pending
            .lock()
            .remove(fingerprint)
            .map(|p| p.waiters)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::from_bytes(tag.as_bytes())
    }

    #[test]
    fn test_first_registration_leads() {
        let detector = DuplicateDetector::new();
        let (a, _ha) = Waiter::new(RequesterRef::new("a", 1), None);
        let (b, _hb) = Waiter::new(RequesterRef::new("b", 1), None);

        let first = detector.register(fp("x"), TransactionKind::Create, RequestId::new(1, 10), Some(a));
        let second = detector.register(fp("x"), TransactionKind::Create, RequestId::new(1, 11), Some(b));
        assert_eq!(first, Registration::Leader);
        assert_eq!(second, Registration::Joined(RequestId::new(1, 10)));

        assert_eq!(
            detector.lookup(&fp("x"), &RequesterRef::new("b", 1)),
            Some(RequestId::new(1, 10))
        );
        assert_eq!(detector.lookup(&fp("x"), &RequesterRef::new("b", 2)), None);

        let waiters = detector.resolve(&fp("x"));
        assert_eq!(waiters.len(), 2);
        assert!(detector.is_empty());
        assert!(detector.resolve(&fp("x")).is_empty());
    }

    #[test]
    fn test_exactly_one_leader_under_contention() {
        let detector = Arc::new(DuplicateDetector::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let detector = Arc::clone(&detector);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let (waiter, _handle) = Waiter::new(RequesterRef::new(format!("xapp-{}", i), 1), None);
                    barrier.wait();
                    detector.register(
                        fp("shared"),
                        TransactionKind::Create,
                        RequestId::new(1, i),
                        Some(waiter),
                    )
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let leaders = results.iter().filter(|r| **r == Registration::Leader).count();
        assert_eq!(leaders, 1);
        assert_eq!(detector.resolve(&fp("shared")).len(), 8);
    }

    #[test]
    fn test_internal_registration_has_no_waiters() {
        let detector = DuplicateDetector::new();
        detector.register(fp("y"), TransactionKind::Delete, RequestId::new(1, 3), None);
        assert_eq!(detector.pending_kind(&fp("y")), Some(TransactionKind::Delete));
        assert!(detector.resolve(&fp("y")).is_empty());
    }
}
