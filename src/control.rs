//! Request orchestration.
//!
//! The [`Controller`] ties the pieces together: it fingerprints inbound
//! requests, lets the merge engine decide what to do, persists the staged
//! registry state, sends downstream, arms timers, and fans outcomes back to
//! requesters.
//!
//! Lock order is slot → detector → tracker → registry memory. Sends and
//! persistence writes happen only after the slot lock is released.
//!
//! # Example
//!
//! ```ignore
//! let controller = Controller::new(config, sdl, sender, counters)?;
//! controller.recover()?;
//! let _events = controller.start()?;
//!
//! let handle = controller.subscribe(SubscribeRequest {
//!     requester: RequesterRef::new("xapp-kpimon:4560", 1),
//!     target: "310-410/cell-7".parse()?,
//!     details,
//!     idempotency_key: None,
//! });
//! // ... E2Term traffic is fed through controller.handle_e2_message(&bytes)
//! let outcome = handle.recv()?;
//! ```

use crate::config::SubmgrConfig;
use crate::e2ap::{self, details_bytes, E2apMessage, Indication, SubscriptionDetails};
use crate::error::{DecodeError, Result, SubmgrError};
use crate::identifier::Identifier;
use crate::metrics::{Counter, Counters};
use crate::registry::{
    CreateDecision, DeleteDecision, MergeEngine, QueuedOp, RecoveryReport, SubscriptionRegistry,
};
use crate::sdl::PersistenceGateway;
use crate::timer::{TimerEvent, TimerManager};
use crate::transactions::{
    FailureCause, RequestOutcome, ResponseHandle, TimeoutOutcome, Transaction, TransactionKind,
    TransactionTracker, Waiter,
};
use crate::transport::{E2TermSender, RoutedMessage};
use crate::types::{Fingerprint, InstanceId, RequestId, RequesterRef};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// Create request from a requester.
#[derive(Clone, Debug)]
pub struct SubscribeRequest {
    pub requester: RequesterRef,
    pub target: Identifier,
    pub details: SubscriptionDetails,
    /// Retransmissions carrying the same key get the recorded outcome.
    pub idempotency_key: Option<String>,
}

/// Delete request from a requester.
#[derive(Clone, Debug)]
pub struct UnsubscribeRequest {
    pub requester: RequesterRef,
    pub instance_id: InstanceId,
    pub idempotency_key: Option<String>,
}

/// What happened to one inbound E2Term message.
#[derive(Debug)]
pub enum InboundOutcome {
    /// Completed the transaction `request_id`.
    Resolved { request_id: RequestId },
    /// Matched no outstanding transaction and was discarded.
    Stray { request_id: RequestId },
    /// Indication to relay to the member endpoints of its subscription.
    Indication {
        endpoints: Vec<String>,
        indication: Indication,
    },
    Undecodable(DecodeError),
}

/// Drives subscriptions from request to downstream outcome.
pub struct Controller {
    config: SubmgrConfig,
    counters: Arc<Counters>,
    registry: Arc<SubscriptionRegistry>,
    merge: MergeEngine,
    tracker: TransactionTracker,
    timers: TimerManager,
    timer_events: Receiver<TimerEvent>,
    sender: Arc<dyn E2TermSender>,
    completed: Mutex<LruCache<String, RequestOutcome>>,
}

impl Controller {
    pub fn new(
        config: SubmgrConfig,
        sdl: Arc<dyn PersistenceGateway>,
        sender: Arc<dyn E2TermSender>,
        counters: Arc<Counters>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let cache_size = NonZeroUsize::new(config.idempotency_cache_size)
            .ok_or_else(|| SubmgrError::Config("idempotency_cache_size must be > 0".into()))?;

        let registry = Arc::new(SubscriptionRegistry::new(&config, sdl, Arc::clone(&counters)));
        let (events_tx, timer_events) = unbounded();
        let timers = TimerManager::start(events_tx)?;

        Ok(Arc::new(Self {
            merge: MergeEngine::new(Arc::clone(&registry), config.requestor_id),
            tracker: TransactionTracker::new(&config),
            registry,
            timers,
            timer_events,
            sender,
            counters,
            completed: Mutex::new(LruCache::new(cache_size)),
            config,
        }))
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn merge_engine(&self) -> &MergeEngine {
        &self.merge
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn config(&self) -> &SubmgrConfig {
        &self.config
    }

    /// Number of downstream transactions awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Request a subscription. The outcome arrives on the returned handle.
    pub fn subscribe(&self, request: SubscribeRequest) -> ResponseHandle {
        self.counters.inc(Counter::SubReqFromXapp);
        let (waiter, handle) = Waiter::new(request.requester, request.idempotency_key);
        if let Some(waiter) = self.replay_completed(TransactionKind::Create, waiter) {
            self.submit_create(request.target, request.details, waiter);
        }
        handle
    }

    /// Release a subscription.
    pub fn unsubscribe(&self, request: UnsubscribeRequest) -> ResponseHandle {
        self.counters.inc(Counter::SubDelReqFromXapp);
        let (waiter, handle) = Waiter::new(request.requester, request.idempotency_key);
        if let Some(waiter) = self.replay_completed(TransactionKind::Delete, waiter) {
            self.submit_delete(request.instance_id, waiter);
        }
        handle
    }

    /// Process one message received from E2Term.
    pub fn handle_e2_message(&self, bytes: &[u8]) -> InboundOutcome {
        let message = match e2ap::unpack(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.counters.inc(Counter::DecodeFailures);
                warn!(kind = ?e.kind(), error = %e, len = bytes.len(), "undecodable message from E2Term");
                return InboundOutcome::Undecodable(e);
            }
        };

        match message {
            E2apMessage::SubscriptionResponse(resp) => {
                self.counters.inc(Counter::SubRespFromE2);
                if !resp.not_admitted.is_empty() {
                    debug!(
                        instance = resp.request_id.instance,
                        not_admitted = resp.not_admitted.len(),
                        "some actions not admitted"
                    );
                }
                self.complete(resp.request_id, TransactionKind::Create, Ok(()))
            }
            E2apMessage::SubscriptionFailure(fail) => {
                self.counters.inc(Counter::SubFailFromE2);
                self.complete(
                    fail.request_id,
                    TransactionKind::Create,
                    Err(FailureCause::Rejected(fail.cause)),
                )
            }
            E2apMessage::SubscriptionDeleteResponse(resp) => {
                self.counters.inc(Counter::SubDelRespFromE2);
                self.complete(resp.request_id, TransactionKind::Delete, Ok(()))
            }
            E2apMessage::SubscriptionDeleteFailure(fail) => {
                self.counters.inc(Counter::SubDelFailFromE2);
                self.complete(
                    fail.request_id,
                    TransactionKind::Delete,
                    Err(FailureCause::Rejected(fail.cause)),
                )
            }
            E2apMessage::Indication(indication) => {
                self.counters.inc(Counter::IndicationFromE2);
                self.relay(indication)
            }
            other => {
                let request_id = other.request_id();
                self.counters.inc(Counter::StrayMessages);
                warn!(%request_id, message = ?other.message_type(), "unexpected message direction");
                InboundOutcome::Stray { request_id }
            }
        }
    }

    /// Apply an elapsed timer: re-send within budget, otherwise fail the
    /// transaction.
    pub fn handle_timer_event(&self, event: TimerEvent) {
        match self.tracker.on_timeout(event) {
            TimeoutOutcome::Stale => {
                trace!(transaction = %event.transaction, retry = event.retry, "stale timer event");
            }
            TimeoutOutcome::Retry {
                kind,
                message,
                retry,
                deadline,
            } => {
                self.counters.inc(expiry_counter(kind));
                debug!(transaction = %event.transaction, retry, "no response, re-sending");
                self.timers.arm(event.transaction, deadline, retry);
                self.send(kind, &message, retry);
            }
            TimeoutOutcome::Expired(transaction) => {
                self.counters.inc(expiry_counter(transaction.kind));
                let attempts = transaction.retry_count + 1;
                let err = SubmgrError::DownstreamTimeout {
                    request_id: transaction.id,
                    attempts,
                };
                warn!(fingerprint = %transaction.fingerprint.short(), error = %err, "transaction expired");
                self.finish(
                    transaction.fingerprint,
                    transaction.kind,
                    Err(FailureCause::Timeout { attempts }),
                );
            }
        }
    }

    /// Spawn the worker consuming timer events.
    pub fn start(self: &Arc<Self>) -> Result<EventLoop> {
        let (stop_tx, stop_rx) = unbounded::<()>();
        let controller = Arc::clone(self);
        let worker = thread::Builder::new()
            .name("submgr-events".into())
            .spawn(move || loop {
                let event = select! {
                    recv(controller.timer_events) -> event => event.ok(),
                    recv(stop_rx) -> _ => None,
                };
                match event {
                    Some(event) => controller.handle_timer_event(event),
                    None => break,
                }
            })?;
        Ok(EventLoop {
            stop: Some(stop_tx),
            worker: Some(worker),
        })
    }

    /// Rehydrate state from the persistence gateway. Subscriptions left
    /// mid-create or mid-delete are deleted downstream.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = self.registry.rehydrate()?;
        let cleanups = self.merge.restore(&report.restored);
        info!(
            restored = report.restored.len(),
            cleanups = cleanups.len(),
            "recovered subscription state"
        );
        for transaction in cleanups {
            self.persist(&transaction.fingerprint);
            self.dispatch(transaction);
        }
        Ok(report)
    }

    fn submit_create(&self, target: Identifier, details: SubscriptionDetails, waiter: Waiter) {
        let fingerprint = match details_bytes(&target, &details) {
            Ok(bytes) => Fingerprint::from_bytes(&bytes),
            Err(e) => {
                warn!(requester = %waiter.requester, error = %e, "rejecting unencodable request");
                self.reply(
                    TransactionKind::Create,
                    waiter,
                    RequestOutcome::Failure {
                        cause: FailureCause::Encode(e.to_string()),
                    },
                );
                return;
            }
        };

        match self.merge.on_create(fingerprint, target, details, waiter) {
            CreateDecision::Send(transaction) => {
                self.persist(&fingerprint);
                self.dispatch(transaction);
            }
            CreateDecision::Merged { instance_id, waiter } => {
                self.counters.inc(Counter::MergedSubscriptions);
                self.persist(&fingerprint);
                self.reply(
                    TransactionKind::Create,
                    waiter,
                    RequestOutcome::Success { instance_id },
                );
            }
            CreateDecision::Joined {
                transaction,
                retransmit,
            } => {
                let counter = if retransmit {
                    Counter::DuplicateRequests
                } else {
                    Counter::MergedSubscriptions
                };
                self.counters.inc(counter);
                debug!(%transaction, retransmit, "joined pending create");
            }
            CreateDecision::Queued => {
                debug!(fingerprint = %fingerprint.short(), "create queued behind delete");
            }
            CreateDecision::Rejected { waiter, cause } => {
                warn!(requester = %waiter.requester, %cause, "create rejected");
                self.reply(TransactionKind::Create, waiter, RequestOutcome::Failure { cause });
            }
        }
    }

    fn submit_delete(&self, instance_id: InstanceId, waiter: Waiter) {
        let fingerprint = match self.registry.get_by_instance(instance_id) {
            Some(subscription) => subscription.fingerprint,
            None => {
                self.reply_unknown(instance_id, waiter);
                return;
            }
        };

        match self.merge.on_delete(fingerprint, instance_id, waiter) {
            DeleteDecision::Send(transaction) => {
                self.persist(&fingerprint);
                self.dispatch(transaction);
            }
            DeleteDecision::Unmerged { instance_id, waiter } => {
                self.counters.inc(Counter::UnmergedSubscriptions);
                self.persist(&fingerprint);
                self.reply(
                    TransactionKind::Delete,
                    waiter,
                    RequestOutcome::Success { instance_id },
                );
            }
            DeleteDecision::Joined { transaction } => {
                self.counters.inc(Counter::DuplicateRequests);
                debug!(%transaction, "joined pending delete");
            }
            DeleteDecision::Queued => {
                debug!(instance = instance_id, "delete queued behind create");
            }
            DeleteDecision::NotFound(waiter) => self.reply_unknown(instance_id, waiter),
            DeleteDecision::Rejected { waiter, cause } => {
                warn!(requester = %waiter.requester, %cause, "delete rejected");
                self.reply(TransactionKind::Delete, waiter, RequestOutcome::Failure { cause });
            }
        }
    }

    /// Track, arm and send a new downstream transaction.
    fn dispatch(&self, transaction: Transaction) {
        let id = transaction.id;
        let kind = transaction.kind;
        let fingerprint = transaction.fingerprint;
        let message = transaction.message.clone();

        let deadline = match self.tracker.begin(transaction) {
            Ok(deadline) => deadline,
            Err(e) => {
                error!(transaction = %id, error = %e, "cannot track transaction");
                self.finish(fingerprint, kind, Err(FailureCause::Internal(e.to_string())));
                return;
            }
        };
        self.timers.arm(id, deadline, 0);
        self.send(kind, &message, 0);
    }

    /// Send failures are left to the timer, which re-sends within budget.
    /// Hand a request to E2Term. `retry` is 0 for the first attempt.
    fn send(&self, kind: TransactionKind, message: &RoutedMessage, retry: u32) {
        let counter = match (kind, retry > 0) {
            (TransactionKind::Create, false) => Counter::SubReqToE2,
            (TransactionKind::Create, true) => Counter::SubReReqToE2,
            (TransactionKind::Delete, false) => Counter::SubDelReqToE2,
            (TransactionKind::Delete, true) => Counter::SubDelReReqToE2,
        };
        self.counters.inc(counter);
        if let Err(e) = self.sender.send(message) {
            self.counters.inc(Counter::RouteFailure);
            warn!(request_id = %message.request_id, %kind, retry, error = %e, "send to E2Term failed");
        }
    }

    fn complete(
        &self,
        request_id: RequestId,
        kind: TransactionKind,
        result: std::result::Result<(), FailureCause>,
    ) -> InboundOutcome {
        let transaction = match self.tracker.resolve(request_id, kind) {
            Some(transaction) => transaction,
            None => {
                self.counters.inc(Counter::StrayMessages);
                warn!(%request_id, %kind, "response matches no outstanding transaction");
                return InboundOutcome::Stray { request_id };
            }
        };
        self.timers.cancel(request_id);
        self.finish(transaction.fingerprint, kind, result);
        InboundOutcome::Resolved { request_id }
    }

    /// Apply the result of a group's downstream operation and answer
    /// everyone waiting on it.
    fn finish(
        &self,
        fingerprint: Fingerprint,
        kind: TransactionKind,
        result: std::result::Result<(), FailureCause>,
    ) {
        let resolution = match kind {
            TransactionKind::Create => self.merge.on_create_resolved(fingerprint, result),
            TransactionKind::Delete => self.merge.on_delete_resolved(fingerprint, result),
        };
        self.persist(&fingerprint);

        for (waiter, outcome) in resolution.replies {
            self.reply(kind, waiter, outcome);
        }
        for op in resolution.replay {
            match op {
                QueuedOp::Create {
                    target,
                    details,
                    waiter,
                } => self.submit_create(target, details, waiter),
                QueuedOp::Delete { instance_id, waiter } => self.submit_delete(instance_id, waiter),
            }
        }
    }

    fn relay(&self, indication: Indication) -> InboundOutcome {
        let instance = indication.request_id.instance;
        match self.registry.get_by_instance(instance) {
            Some(subscription) if subscription.requestor_id == indication.request_id.requestor => {
                let mut endpoints = subscription.members;
                endpoints.dedup();
                trace!(instance, endpoints = endpoints.len(), "relaying indication");
                InboundOutcome::Indication { endpoints, indication }
            }
            _ => {
                self.counters.inc(Counter::StrayMessages);
                debug!(request_id = %indication.request_id, "indication for unknown subscription");
                InboundOutcome::Stray {
                    request_id: indication.request_id,
                }
            }
        }
    }

    fn persist(&self, fingerprint: &Fingerprint) {
        // Failures are counted by the registry; live state stays authoritative.
        if let Err(e) = self.registry.persist(fingerprint) {
            debug!(fingerprint = %fingerprint.short(), error = %e, "continuing without durable write");
        }
    }

    fn reply(&self, kind: TransactionKind, waiter: Waiter, outcome: RequestOutcome) {
        let counter = match (kind, outcome.is_success()) {
            (TransactionKind::Create, true) => Counter::SubRespToXapp,
            (TransactionKind::Create, false) => Counter::SubFailToXapp,
            (TransactionKind::Delete, true) => Counter::SubDelRespToXapp,
            (TransactionKind::Delete, false) => Counter::SubDelFailToXapp,
        };
        self.counters.inc(counter);
        if let Some(key) = completion_key(kind, &waiter) {
            self.completed.lock().put(key, outcome.clone());
        }
        debug!(requester = %waiter.requester, %kind, success = outcome.is_success(), "replying");
        waiter.reply(outcome);
    }

    fn reply_unknown(&self, instance_id: InstanceId, waiter: Waiter) {
        let err = SubmgrError::UnknownSubscription(instance_id);
        debug!(requester = %waiter.requester, error = %err, "rejecting delete");
        self.reply(
            TransactionKind::Delete,
            waiter,
            RequestOutcome::Failure {
                cause: FailureCause::UnknownSubscription,
            },
        );
    }

    /// Answer from the completion cache if the idempotency key has been
    /// seen; otherwise hand the waiter back.
    fn replay_completed(&self, kind: TransactionKind, waiter: Waiter) -> Option<Waiter> {
        let Some(key) = completion_key(kind, &waiter) else {
            return Some(waiter);
        };
        let cached = self.completed.lock().get(&key).cloned();
        match cached {
            Some(outcome) => {
                self.counters.inc(Counter::DuplicateRequests);
                debug!(requester = %waiter.requester, "answering retransmission from cache");
                waiter.reply(outcome);
                None
            }
            None => Some(waiter),
        }
    }
}

fn completion_key(kind: TransactionKind, waiter: &Waiter) -> Option<String> {
    waiter
        .idempotency_key
        .as_ref()
        .map(|key| format!("{}/{}/{}", kind, waiter.requester.endpoint, key))
}

fn expiry_counter(kind: TransactionKind) -> Counter {
    match kind {
        TransactionKind::Create => Counter::SubReqTimerExpiry,
        TransactionKind::Delete => Counter::SubDelReqTimerExpiry,
    }
}

/// Running timer-event worker. Dropping it stops the worker.
pub struct EventLoop {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::e2ap::{
        ActionDefinition, Cause, CauseGroup, SubscriptionDeleteResponse, SubscriptionFailure,
        SubscriptionResponse,
    };
    use crate::sdl::MemorySdl;
    use crate::transport::ChannelSender;
    use std::time::Duration;

    struct Harness {
        controller: Arc<Controller>,
        downstream: Receiver<RoutedMessage>,
    }

    fn harness(config: SubmgrConfig) -> Harness {
        let (sender, downstream) = ChannelSender::new();
        let controller = Controller::new(
            config,
            Arc::new(MemorySdl::new()),
            Arc::new(sender),
            Arc::new(Counters::new()),
        )
        .unwrap();
        Harness {
            controller,
            downstream,
        }
    }

    fn details() -> SubscriptionDetails {
        SubscriptionDetails {
            ran_function_id: 2,
            event_trigger: vec![0x01],
            actions: vec![ActionDefinition::report(1, vec![])],
        }
    }

    fn subscribe(controller: &Controller, endpoint: &str, key: Option<&str>) -> ResponseHandle {
        controller.subscribe(SubscribeRequest {
            requester: RequesterRef::new(endpoint, 1),
            target: "310-410/cell-7".parse().unwrap(),
            details: details(),
            idempotency_key: key.map(String::from),
        })
    }

    fn respond(controller: &Controller, request: &RoutedMessage) {
        let request_id = request.request_id;
        let reply = match request.decode().unwrap() {
            E2apMessage::SubscriptionRequest(req) => {
                E2apMessage::SubscriptionResponse(SubscriptionResponse {
                    request_id,
                    ran_function_id: req.details.ran_function_id,
                    target: req.target,
                    admitted: vec![1],
                    not_admitted: vec![],
                })
            }
            E2apMessage::SubscriptionDeleteRequest(req) => {
                E2apMessage::SubscriptionDeleteResponse(SubscriptionDeleteResponse {
                    request_id,
                    ran_function_id: req.ran_function_id,
                    target: req.target,
                })
            }
            other => panic!("unexpected downstream message {:?}", other),
        };
        let bytes = e2ap::pack(&reply).unwrap();
        assert!(matches!(
            controller.handle_e2_message(&bytes),
            InboundOutcome::Resolved { .. }
        ));
    }

    #[test]
    fn test_subscribe_then_response() {
        let h = harness(SubmgrConfig::default());
        let handle = subscribe(&h.controller, "a", None);
        let request = h.downstream.try_recv().unwrap();
        assert_eq!(request.mtype, 12010);
        assert!(handle.try_recv().is_err());

        respond(&h.controller, &request);
        let outcome = handle.try_recv().unwrap();
        assert_eq!(outcome.instance_id(), Some(request.request_id.instance));
        assert_eq!(h.controller.in_flight(), 0);
        assert_eq!(h.controller.counters().get(Counter::SubRespToXapp), 1);
    }

    #[test]
    fn test_failure_response_fans_out() {
        let h = harness(SubmgrConfig::default());
        let first = subscribe(&h.controller, "a", None);
        let second = subscribe(&h.controller, "b", None);
        let request = h.downstream.try_recv().unwrap();
        assert!(h.downstream.try_recv().is_err());

        let failure = E2apMessage::SubscriptionFailure(SubscriptionFailure {
            request_id: request.request_id,
            ran_function_id: 2,
            target: request.target.clone(),
            cause: Cause::new(CauseGroup::RicRequest, 1),
            not_admitted: vec![],
        });
        h.controller.handle_e2_message(&e2ap::pack(&failure).unwrap());

        for handle in [first, second] {
            assert!(matches!(
                handle.try_recv().unwrap(),
                RequestOutcome::Failure { cause: FailureCause::Rejected(_) }
            ));
        }
        assert!(h.controller.registry().is_empty());
        assert_eq!(h.controller.counters().get(Counter::SubFailToXapp), 2);
    }

    #[test]
    fn test_stray_and_undecodable_messages() {
        let h = harness(SubmgrConfig::default());
        let stray = E2apMessage::SubscriptionDeleteResponse(SubscriptionDeleteResponse {
            request_id: RequestId::new(123, 999),
            ran_function_id: 2,
            target: "310-410/cell-7".parse().unwrap(),
        });
        assert!(matches!(
            h.controller.handle_e2_message(&e2ap::pack(&stray).unwrap()),
            InboundOutcome::Stray { .. }
        ));
        assert!(matches!(
            h.controller.handle_e2_message(&[0, 8, 0]),
            InboundOutcome::Undecodable(DecodeError::Truncated { .. })
        ));
        assert_eq!(h.controller.counters().get(Counter::StrayMessages), 1);
        assert_eq!(h.controller.counters().get(Counter::DecodeFailures), 1);
    }

    #[test]
    fn test_unsubscribe_unknown_instance() {
        let h = harness(SubmgrConfig::default());
        let handle = h.controller.unsubscribe(UnsubscribeRequest {
            requester: RequesterRef::new("a", 2),
            instance_id: 42,
            idempotency_key: None,
        });
        assert_eq!(
            handle.try_recv().unwrap(),
            RequestOutcome::Failure {
                cause: FailureCause::UnknownSubscription
            }
        );
    }

    #[test]
    fn test_idempotency_key_replays_outcome() {
        let h = harness(SubmgrConfig::default());
        let handle = subscribe(&h.controller, "a", Some("k1"));
        let request = h.downstream.try_recv().unwrap();
        respond(&h.controller, &request);
        let first = handle.try_recv().unwrap();

        let again = subscribe(&h.controller, "a", Some("k1"));
        assert_eq!(again.try_recv().unwrap(), first);
        assert!(h.downstream.try_recv().is_err());
        assert_eq!(h.controller.counters().get(Counter::DuplicateRequests), 1);
    }

    #[test]
    fn test_keyless_requests_reach_downstream() {
        let h = harness(SubmgrConfig::default());
        let handle = subscribe(&h.controller, "a", None);
        let request = h.downstream.try_recv().unwrap();
        assert_eq!(h.controller.counters().get(Counter::SubReqToE2), 1);
        respond(&h.controller, &request);
        let instance_id = handle.try_recv().unwrap().instance_id().unwrap();

        let handle = h.controller.unsubscribe(UnsubscribeRequest {
            requester: RequesterRef::new("a", 2),
            instance_id,
            idempotency_key: None,
        });
        let delete = h.downstream.try_recv().unwrap();
        assert_eq!(delete.mtype, 12020);
        respond(&h.controller, &delete);
        assert!(handle.try_recv().unwrap().is_success());
        assert_eq!(h.controller.counters().get(Counter::SubDelReqToE2), 1);
        assert_eq!(h.controller.counters().get(Counter::DuplicateRequests), 0);
        assert!(h.controller.registry().is_empty());
    }

    #[test]
    fn test_idempotency_key_is_scoped_to_request_kind() {
        let h = harness(SubmgrConfig::default());
        let handle = subscribe(&h.controller, "a", Some("k1"));
        respond(&h.controller, &h.downstream.try_recv().unwrap());
        let instance_id = handle.try_recv().unwrap().instance_id().unwrap();

        let handle = h.controller.unsubscribe(UnsubscribeRequest {
            requester: RequesterRef::new("a", 2),
            instance_id,
            idempotency_key: Some("k1".into()),
        });
        let delete = h.downstream.try_recv().unwrap();
        assert_eq!(delete.mtype, 12020);
        assert!(handle.try_recv().is_err());
        respond(&h.controller, &delete);
        assert!(handle.try_recv().unwrap().is_success());
        assert!(h.controller.registry().is_empty());
        assert_eq!(h.controller.counters().get(Counter::DuplicateRequests), 0);
    }

    #[test]
    fn test_same_endpoint_subscribes_twice() {
        let h = harness(SubmgrConfig::default());
        let first = subscribe(&h.controller, "a", None);
        respond(&h.controller, &h.downstream.try_recv().unwrap());
        let instance_id = first.try_recv().unwrap().instance_id().unwrap();

        let second = h.controller.subscribe(SubscribeRequest {
            requester: RequesterRef::new("a", 2),
            target: "310-410/cell-7".parse().unwrap(),
            details: details(),
            idempotency_key: None,
        });
        assert_eq!(second.try_recv().unwrap().instance_id(), Some(instance_id));
        assert_eq!(h.controller.registry().list_all()[0].ref_count(), 2);

        let unsubscribe = |seq| {
            h.controller.unsubscribe(UnsubscribeRequest {
                requester: RequesterRef::new("a", seq),
                instance_id,
                idempotency_key: None,
            })
        };
        assert!(unsubscribe(3).try_recv().unwrap().is_success());
        assert!(h.downstream.try_recv().is_err());

        let last = unsubscribe(4);
        respond(&h.controller, &h.downstream.try_recv().unwrap());
        assert!(last.try_recv().unwrap().is_success());
        assert!(h.controller.registry().is_empty());
    }

    #[test]
    fn test_retry_then_expire_via_event_loop() {
        let config = SubmgrConfig {
            response_timeout_ms: 20,
            max_retries: 1,
            ..Default::default()
        };
        let h = harness(config);
        let _events = h.controller.start().unwrap();
        let handle = subscribe(&h.controller, "a", None);

        let outcome = handle.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            outcome,
            RequestOutcome::Failure {
                cause: FailureCause::Timeout { attempts: 2 }
            }
        );
        let sent: Vec<_> = h.downstream.try_iter().collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(h.controller.counters().get(Counter::SubReReqToE2), 1);
        assert!(h.controller.registry().is_empty());
    }
}
