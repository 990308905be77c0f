//! In-flight transaction tracking keyed by correlation id.

use super::types::{Transaction, TransactionKind, TransactionState};
use crate::config::SubmgrConfig;
use crate::error::{Result, SubmgrError};
use crate::timer::TimerEvent;
use crate::transport::RoutedMessage;
use crate::types::RequestId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// What to do about an elapsed timer.
#[derive(Debug)]
pub enum TimeoutOutcome {
    /// The transaction was already resolved, or the event belongs to an
    /// earlier attempt.
    Stale,
    /// Re-send `message` and re-arm at `deadline` with retry count `retry`.
    Retry {
        kind: TransactionKind,
        message: RoutedMessage,
        retry: u32,
        deadline: Instant,
    },
    /// Budget exhausted. The transaction has been removed.
    Expired(Transaction),
}

/// Outstanding transactions, at most one per correlation id.
///
/// Resolution removes the entry under the lock, so when a response and a
/// timer race for the same transaction exactly one of them gets it back.
pub struct TransactionTracker {
    inflight: Mutex<HashMap<RequestId, Transaction>>,
    config: SubmgrConfig,
}

impl TransactionTracker {
    pub fn new(config: &SubmgrConfig) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            config: config.clone(),
        }
    }

    /// Start tracking `transaction`. Returns the deadline of the first
    /// attempt.
    pub fn begin(&self, mut transaction: Transaction) -> Result<Instant> {
        let mut inflight = self.inflight.lock();
        if inflight.contains_key(&transaction.id) {
            return Err(SubmgrError::DuplicateTransaction(transaction.id));
        }
        let deadline = Instant::now() + self.config.attempt_timeout(0);
        transaction.deadline = deadline;
        transaction.retry_count = 0;
        transaction.state = TransactionState::Pending;
        debug!(transaction = %transaction.id, kind = %transaction.kind, "transaction started");
        inflight.insert(transaction.id, transaction);
        Ok(deadline)
    }

    /// Resolve the transaction `id` of the given kind. Only the first
    /// caller gets it; later calls, and calls naming the wrong kind, return
    /// `None`.
    pub fn resolve(&self, id: RequestId, kind: TransactionKind) -> Option<Transaction> {
        let mut inflight = self.inflight.lock();
        if inflight.get(&id)?.kind != kind {
            return None;
        }
        let mut transaction = inflight.remove(&id)?;
        transaction.state = TransactionState::Resolved;
        Some(transaction)
    }

    /// Apply an elapsed timer.
    pub fn on_timeout(&self, event: TimerEvent) -> TimeoutOutcome {
        let mut inflight = self.inflight.lock();
        let transaction = match inflight.get_mut(&event.transaction) {
            Some(t) if t.retry_count == event.retry => t,
            _ => return TimeoutOutcome::Stale,
        };

        if transaction.retry_count >= self.config.max_retries {
            let mut expired = match inflight.remove(&event.transaction) {
                Some(t) => t,
                None => return TimeoutOutcome::Stale,
            };
            expired.state = TransactionState::Expired;
            return TimeoutOutcome::Expired(expired);
        }

        transaction.retry_count += 1;
        transaction.deadline = Instant::now() + self.config.attempt_timeout(transaction.retry_count);
        TimeoutOutcome::Retry {
            kind: transaction.kind,
            message: transaction.message.clone(),
            retry: transaction.retry_count,
            deadline: transaction.deadline,
        }
    }

    pub fn get(&self, id: RequestId) -> Option<Transaction> {
        self.inflight.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.inflight.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2ap::{E2apMessage, SubscriptionDeleteRequest};
    use crate::types::Fingerprint;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn transaction(instance: u32, kind: TransactionKind) -> Transaction {
        let message = E2apMessage::SubscriptionDeleteRequest(SubscriptionDeleteRequest {
            request_id: RequestId::new(123, instance),
            ran_function_id: 1,
            target: "310-410/cell-7".parse().unwrap(),
        });
        Transaction::new(
            Fingerprint::from_bytes(&instance.to_le_bytes()),
            kind,
            None,
            RoutedMessage::from_message(&message).unwrap(),
        )
    }

    fn config(max_retries: u32) -> SubmgrConfig {
        SubmgrConfig {
            max_retries,
            ..Default::default()
        }
    }

    #[test]
    fn test_begin_rejects_duplicate_id() {
        let tracker = TransactionTracker::new(&config(1));
        tracker.begin(transaction(1, TransactionKind::Delete)).unwrap();
        let err = tracker.begin(transaction(1, TransactionKind::Delete)).unwrap_err();
        assert!(matches!(err, SubmgrError::DuplicateTransaction(id) if id == RequestId::new(123, 1)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_resolve_is_exactly_once() {
        let tracker = TransactionTracker::new(&config(1));
        tracker.begin(transaction(2, TransactionKind::Delete)).unwrap();

        assert!(tracker.resolve(RequestId::new(123, 2), TransactionKind::Create).is_none());
        let resolved = tracker.resolve(RequestId::new(123, 2), TransactionKind::Delete).unwrap();
        assert_eq!(resolved.state, TransactionState::Resolved);
        assert!(tracker.resolve(RequestId::new(123, 2), TransactionKind::Delete).is_none());
        assert!(matches!(
            tracker.on_timeout(TimerEvent { transaction: RequestId::new(123, 2), retry: 0 }),
            TimeoutOutcome::Stale
        ));
    }

    #[test]
    fn test_retry_then_expire() {
        let tracker = TransactionTracker::new(&config(2));
        let id = RequestId::new(123, 3);
        tracker.begin(transaction(3, TransactionKind::Delete)).unwrap();

        match tracker.on_timeout(TimerEvent { transaction: id, retry: 0 }) {
            TimeoutOutcome::Retry { retry, .. } => assert_eq!(retry, 1),
            other => panic!("expected retry, got {:?}", other),
        }
        // An event for an attempt already retried is stale.
        assert!(matches!(
            tracker.on_timeout(TimerEvent { transaction: id, retry: 0 }),
            TimeoutOutcome::Stale
        ));
        assert!(matches!(
            tracker.on_timeout(TimerEvent { transaction: id, retry: 1 }),
            TimeoutOutcome::Retry { retry: 2, .. }
        ));
        match tracker.on_timeout(TimerEvent { transaction: id, retry: 2 }) {
            TimeoutOutcome::Expired(t) => {
                assert_eq!(t.retry_count, 2);
                assert_eq!(t.state, TransactionState::Expired);
            }
            other => panic!("expected expiry, got {:?}", other),
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_response_and_timer_race_resolves_once() {
        for _ in 0..50 {
            let tracker = Arc::new(TransactionTracker::new(&config(0)));
            let id = RequestId::new(123, 4);
            tracker.begin(transaction(4, TransactionKind::Delete)).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let by_response = {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    tracker.resolve(id, TransactionKind::Delete).is_some()
                })
            };
            let by_timer = {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    matches!(
                        tracker.on_timeout(TimerEvent { transaction: id, retry: 0 }),
                        TimeoutOutcome::Expired(_)
                    )
                })
            };

            let wins = [by_response.join().unwrap(), by_timer.join().unwrap()];
            assert_eq!(wins.iter().filter(|w| **w).count(), 1);
        }
    }
}
