//! Merging of functionally identical subscriptions.
//!
//! Requests are grouped by [`Fingerprint`]. A group owns one downstream
//! subscription; its members are the requester references sharing it,
//! counted per endpoint so one endpoint may hold several references. Only
//! one downstream operation per group is in flight at a time: requests that
//! race an in-flight operation either join its outcome or wait in the
//! group's queue until it completes.
//!
//! All decisions for one fingerprint are taken under that fingerprint's
//! slot lock. The engine stages registry changes in memory but performs no
//! I/O; the caller persists and sends after the decision is returned.

use super::manager::SubscriptionRegistry;
use super::types::Subscription;
use crate::e2ap::{E2apMessage, SubscriptionDeleteRequest, SubscriptionDetails, SubscriptionRequest};
use crate::identifier::Identifier;
use crate::transactions::{
    DuplicateDetector, FailureCause, Registration, RequestOutcome, Transaction, TransactionKind,
    Waiter,
};
use crate::transport::RoutedMessage;
use crate::types::{Fingerprint, InstanceId, RequestId, RequesterRef, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupPhase {
    /// Downstream create in flight.
    Creating,
    Active,
    /// Downstream delete in flight.
    Deleting,
}

/// A request parked until the group's in-flight operation completes.
#[derive(Debug)]
pub enum QueuedOp {
    Create {
        target: Identifier,
        details: SubscriptionDetails,
        waiter: Waiter,
    },
    Delete {
        instance_id: InstanceId,
        waiter: Waiter,
    },
}

#[derive(Debug)]
pub struct MergeGroup {
    pub fingerprint: Fingerprint,
    pub instance_id: InstanceId,
    pub target: Identifier,
    pub details: SubscriptionDetails,
    /// References held per endpoint.
    pub members: BTreeMap<String, usize>,
    pub phase: GroupPhase,
    /// Correlation id of the in-flight operation.
    pub transaction: Option<RequestId>,
    queued: VecDeque<QueuedOp>,
    pub created: Timestamp,
}

impl MergeGroup {
    pub fn ref_count(&self) -> usize {
        self.members.values().sum()
    }

    fn add_member(&mut self, endpoint: &str) {
        *self.members.entry(endpoint.to_owned()).or_insert(0) += 1;
    }

    /// Drop one reference held by `endpoint`. False if it holds none.
    fn remove_member(&mut self, endpoint: &str) -> bool {
        match self.members.get_mut(endpoint) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.members.remove(endpoint);
                true
            }
            None => false,
        }
    }

    fn record(&self, requestor_id: u32) -> Subscription {
        let mut record = Subscription::new(
            self.fingerprint,
            self.instance_id,
            requestor_id,
            self.target.clone(),
            self.details.clone(),
        );
        record.members = self
            .members
            .iter()
            .flat_map(|(endpoint, count)| std::iter::repeat(endpoint.clone()).take(*count))
            .collect();
        record.create_in_progress = self.phase == GroupPhase::Creating;
        record.delete_in_progress = self.phase == GroupPhase::Deleting;
        record.created = self.created;
        record
    }
}

/// Point-in-time view of a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSummary {
    pub instance_id: InstanceId,
    pub phase: GroupPhase,
    pub ref_count: usize,
    pub queued: usize,
}

#[derive(Debug)]
pub enum CreateDecision {
    /// New group: send the create downstream.
    Send(Transaction),
    /// Served by an active group; the requester now holds a reference.
    Merged {
        instance_id: InstanceId,
        waiter: Waiter,
    },
    /// Parked on the pending create.
    Joined {
        transaction: RequestId,
        retransmit: bool,
    },
    /// Waiting behind an in-flight delete.
    Queued,
    Rejected {
        waiter: Waiter,
        cause: FailureCause,
    },
}

#[derive(Debug)]
pub enum DeleteDecision {
    /// Last member left: send the delete downstream.
    Send(Transaction),
    /// Other members remain.
    Unmerged {
        instance_id: InstanceId,
        waiter: Waiter,
    },
    /// Retransmission of the delete already in flight.
    Joined { transaction: RequestId },
    /// Waiting behind an in-flight create.
    Queued,
    NotFound(Waiter),
    Rejected {
        waiter: Waiter,
        cause: FailureCause,
    },
}

/// Effects of completing a group's in-flight operation.
#[derive(Debug, Default)]
pub struct Resolution {
    pub instance_id: Option<InstanceId>,
    /// One outcome per waiting requester.
    pub replies: Vec<(Waiter, RequestOutcome)>,
    /// Parked requests to submit again, in arrival order.
    pub replay: Vec<QueuedOp>,
    pub torn_down: bool,
}

#[derive(Default)]
struct Slot {
    group: Option<MergeGroup>,
}

/// Single authority over fingerprint → group state.
pub struct MergeEngine {
    registry: Arc<SubscriptionRegistry>,
    detector: DuplicateDetector,
    requestor_id: u32,
    slots: Mutex<HashMap<Fingerprint, Arc<Mutex<Slot>>>>,
}

impl MergeEngine {
    pub fn new(registry: Arc<SubscriptionRegistry>, requestor_id: u32) -> Self {
        Self {
            registry,
            detector: DuplicateDetector::new(),
            requestor_id,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn detector(&self) -> &DuplicateDetector {
        &self.detector
    }

    /// Decide how to serve a create request.
    pub fn on_create(
        &self,
        fingerprint: Fingerprint,
        target: Identifier,
        details: SubscriptionDetails,
        waiter: Waiter,
    ) -> CreateDecision {
        self.with_slot(fingerprint, |slot| {
            let group = match slot.group.as_mut() {
                Some(group) => group,
                None => return self.start_group(slot, fingerprint, target, details, waiter),
            };

            match group.phase {
                GroupPhase::Active => {
                    group.add_member(&waiter.requester.endpoint);
                    self.registry.stage_upsert(group.record(self.requestor_id));
                    debug!(
                        instance = group.instance_id,
                        requester = %waiter.requester,
                        ref_count = group.ref_count(),
                        "merged into active subscription"
                    );
                    CreateDecision::Merged {
                        instance_id: group.instance_id,
                        waiter,
                    }
                }
                GroupPhase::Creating => {
                    let retransmit = self.detector.lookup(&fingerprint, &waiter.requester).is_some();
                    let candidate = group
                        .transaction
                        .unwrap_or_else(|| RequestId::new(self.requestor_id, group.instance_id));
                    let transaction = match self.detector.register(
                        fingerprint,
                        TransactionKind::Create,
                        candidate,
                        Some(waiter),
                    ) {
                        Registration::Joined(existing) => existing,
                        Registration::Leader => candidate,
                    };
                    CreateDecision::Joined {
                        transaction,
                        retransmit,
                    }
                }
                GroupPhase::Deleting => {
                    group.queued.push_back(QueuedOp::Create {
                        target,
                        details,
                        waiter,
                    });
                    CreateDecision::Queued
                }
            }
        })
    }

    /// Decide how to serve a delete request for `instance_id`, the
    /// instance of the group keyed by `fingerprint`.
    pub fn on_delete(
        &self,
        fingerprint: Fingerprint,
        instance_id: InstanceId,
        waiter: Waiter,
    ) -> DeleteDecision {
        self.with_slot(fingerprint, |slot| {
            let group = match slot.group.as_mut() {
                Some(group) if group.instance_id == instance_id => group,
                _ => return DeleteDecision::NotFound(waiter),
            };

            match group.phase {
                GroupPhase::Creating => {
                    group.queued.push_back(QueuedOp::Delete { instance_id, waiter });
                    DeleteDecision::Queued
                }
                GroupPhase::Deleting => {
                    if self.detector.lookup(&fingerprint, &waiter.requester).is_some() {
                        let candidate = RequestId::new(self.requestor_id, instance_id);
                        let transaction = match self.detector.register(
                            fingerprint,
                            TransactionKind::Delete,
                            candidate,
                            Some(waiter),
                        ) {
                            Registration::Joined(existing) => existing,
                            Registration::Leader => candidate,
                        };
                        DeleteDecision::Joined { transaction }
                    } else {
                        group.queued.push_back(QueuedOp::Delete { instance_id, waiter });
                        DeleteDecision::Queued
                    }
                }
                GroupPhase::Active => {
                    let endpoint = waiter.requester.endpoint.clone();
                    if !group.remove_member(&endpoint) {
                        return DeleteDecision::NotFound(waiter);
                    }
                    if !group.members.is_empty() {
                        self.registry.stage_upsert(group.record(self.requestor_id));
                        debug!(
                            instance = instance_id,
                            requester = %waiter.requester,
                            ref_count = group.ref_count(),
                            "unmerged from subscription"
                        );
                        return DeleteDecision::Unmerged { instance_id, waiter };
                    }

                    let routed = match delete_message(self.requestor_id, group) {
                        Ok(routed) => routed,
                        Err(cause) => {
                            group.add_member(&endpoint);
                            return DeleteDecision::Rejected { waiter, cause };
                        }
                    };
                    group.phase = GroupPhase::Deleting;
                    group.transaction = Some(routed.request_id);
                    let requester = waiter.requester.clone();
                    self.detector.register(
                        fingerprint,
                        TransactionKind::Delete,
                        routed.request_id,
                        Some(waiter),
                    );
                    self.registry.stage_upsert(group.record(self.requestor_id));
                    DeleteDecision::Send(Transaction::new(
                        fingerprint,
                        TransactionKind::Delete,
                        Some(requester),
                        routed,
                    ))
                }
            }
        })
    }

    /// Complete the in-flight create of `fingerprint`. On success every
    /// waiter becomes a member; on failure the group is torn down and every
    /// waiter receives the failure.
    pub fn on_create_resolved(
        &self,
        fingerprint: Fingerprint,
        result: Result<(), FailureCause>,
    ) -> Resolution {
        self.with_slot(fingerprint, |slot| {
            let waiters = self.detector.resolve(&fingerprint);
            let creating = matches!(&slot.group, Some(g) if g.phase == GroupPhase::Creating);
            if !creating {
                warn!(fingerprint = %fingerprint.short(), "create resolved for a group not creating");
                return orphaned(waiters);
            }

            match result {
                Ok(()) => {
                    let mut resolution = Resolution::default();
                    if let Some(group) = slot.group.as_mut() {
                        let distinct: BTreeSet<&RequesterRef> =
                            waiters.iter().map(|w| &w.requester).collect();
                        for requester in distinct {
                            group.add_member(&requester.endpoint);
                        }
                        group.phase = GroupPhase::Active;
                        group.transaction = None;
                        self.registry.stage_upsert(group.record(self.requestor_id));
                        info!(
                            instance = group.instance_id,
                            ref_count = group.ref_count(),
                            "subscription active"
                        );

                        let outcome = RequestOutcome::Success {
                            instance_id: group.instance_id,
                        };
                        resolution.instance_id = Some(group.instance_id);
                        resolution.replies = waiters.into_iter().map(|w| (w, outcome.clone())).collect();
                        resolution.replay = group.queued.drain(..).collect();
                    }
                    resolution
                }
                Err(cause) => self.tear_down(slot, waiters, RequestOutcome::Failure { cause }),
            }
        })
    }

    /// Complete the in-flight delete of `fingerprint`. The group is torn
    /// down whatever the result; `result` decides what the waiters hear.
    pub fn on_delete_resolved(
        &self,
        fingerprint: Fingerprint,
        result: Result<(), FailureCause>,
    ) -> Resolution {
        self.with_slot(fingerprint, |slot| {
            let waiters = self.detector.resolve(&fingerprint);
            let instance_id = match &slot.group {
                Some(g) if g.phase == GroupPhase::Deleting => g.instance_id,
                _ => {
                    warn!(fingerprint = %fingerprint.short(), "delete resolved for a group not deleting");
                    return orphaned(waiters);
                }
            };
            let outcome = match result {
                Ok(()) => RequestOutcome::Success { instance_id },
                Err(cause) => RequestOutcome::Failure { cause },
            };
            self.tear_down(slot, waiters, outcome)
        })
    }

    /// Rebuild groups from rehydrated records. Records left mid-create or
    /// mid-delete come back as deleting groups; the returned delete
    /// transactions clean them up downstream.
    pub fn restore(&self, records: &[Subscription]) -> Vec<Transaction> {
        let mut cleanups = Vec::new();
        for record in records {
            let fingerprint = record.fingerprint;
            let cleanup = self.with_slot(fingerprint, |slot| {
                let mut group = MergeGroup {
                    fingerprint,
                    instance_id: record.instance_id,
                    target: record.target.clone(),
                    details: record.details.clone(),
                    members: BTreeMap::new(),
                    phase: GroupPhase::Active,
                    transaction: None,
                    queued: VecDeque::new(),
                    created: record.created,
                };
                for endpoint in &record.members {
                    group.add_member(endpoint);
                }
                if !record.in_progress() {
                    slot.group = Some(group);
                    return None;
                }

                let routed = match delete_message(self.requestor_id, &group) {
                    Ok(routed) => routed,
                    Err(cause) => {
                        warn!(instance = record.instance_id, %cause, "dropping unrecoverable subscription");
                        self.registry.stage_remove(&fingerprint);
                        return None;
                    }
                };
                group.phase = GroupPhase::Deleting;
                group.transaction = Some(routed.request_id);
                self.detector
                    .register(fingerprint, TransactionKind::Delete, routed.request_id, None);
                self.registry.stage_upsert(group.record(self.requestor_id));
                slot.group = Some(group);
                Some(Transaction::new(fingerprint, TransactionKind::Delete, None, routed))
            });
            cleanups.extend(cleanup);
        }
        cleanups
    }

    pub fn group(&self, fingerprint: &Fingerprint) -> Option<GroupSummary> {
        let slot = self.slots.lock().get(fingerprint).cloned()?;
        let slot = slot.lock();
        slot.group.as_ref().map(|g| GroupSummary {
            instance_id: g.instance_id,
            phase: g.phase,
            ref_count: g.ref_count(),
            queued: g.queued.len(),
        })
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        let slots: Vec<_> = self.slots.lock().values().cloned().collect();
        slots.iter().filter(|s| s.lock().group.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn start_group(
        &self,
        slot: &mut Slot,
        fingerprint: Fingerprint,
        target: Identifier,
        details: SubscriptionDetails,
        waiter: Waiter,
    ) -> CreateDecision {
        let instance_id = match self.registry.allocate_instance() {
            Ok(id) => id,
            Err(e) => {
                return CreateDecision::Rejected {
                    waiter,
                    cause: FailureCause::Internal(e.to_string()),
                }
            }
        };
        let request_id = RequestId::new(self.requestor_id, instance_id);
        let message = E2apMessage::SubscriptionRequest(SubscriptionRequest {
            request_id,
            target: target.clone(),
            details: details.clone(),
        });
        let routed = match RoutedMessage::from_message(&message) {
            Ok(routed) => routed,
            Err(e) => {
                self.registry.release_instance(instance_id);
                return CreateDecision::Rejected {
                    waiter,
                    cause: FailureCause::Encode(e.to_string()),
                };
            }
        };

        let requester = waiter.requester.clone();
        if let Registration::Joined(stale) =
            self.detector
                .register(fingerprint, TransactionKind::Create, request_id, Some(waiter))
        {
            warn!(fingerprint = %fingerprint.short(), %stale, "pending decision outlived its group");
        }

        let group = MergeGroup {
            fingerprint,
            instance_id,
            target,
            details,
            members: BTreeMap::new(),
            phase: GroupPhase::Creating,
            transaction: Some(request_id),
            queued: VecDeque::new(),
            created: Timestamp::now(),
        };
        self.registry.stage_upsert(group.record(self.requestor_id));
        debug!(instance = instance_id, %requester, "new subscription group");
        slot.group = Some(group);

        CreateDecision::Send(Transaction::new(
            fingerprint,
            TransactionKind::Create,
            Some(requester),
            routed,
        ))
    }

    fn tear_down(&self, slot: &mut Slot, waiters: Vec<Waiter>, outcome: RequestOutcome) -> Resolution {
        let mut resolution = Resolution {
            torn_down: true,
            ..Default::default()
        };
        if let Some(mut group) = slot.group.take() {
            self.registry.stage_remove(&group.fingerprint);
            info!(instance = group.instance_id, success = outcome.is_success(), "subscription removed");
            resolution.instance_id = Some(group.instance_id);
            resolution.replay = group.queued.drain(..).collect();
        }
        resolution.replies = waiters.into_iter().map(|w| (w, outcome.clone())).collect();
        resolution
    }

    fn with_slot<R>(&self, fingerprint: Fingerprint, f: impl FnOnce(&mut Slot) -> R) -> R {
        let slot = Arc::clone(self.slots.lock().entry(fingerprint).or_default());
        let result = {
            let mut guard = slot.lock();
            f(&mut guard)
        };

        let mut slots = self.slots.lock();
        // Map plus our clone: no other caller holds the slot.
        if Arc::strong_count(&slot) == 2 {
            let empty = slot.try_lock().map_or(false, |s| s.group.is_none());
            if empty {
                slots.remove(&fingerprint);
            }
        }
        result
    }
}

fn delete_message(requestor_id: u32, group: &MergeGroup) -> Result<RoutedMessage, FailureCause> {
    let message = E2apMessage::SubscriptionDeleteRequest(SubscriptionDeleteRequest {
        request_id: RequestId::new(requestor_id, group.instance_id),
        ran_function_id: group.details.ran_function_id,
        target: group.target.clone(),
    });
    RoutedMessage::from_message(&message).map_err(|e| FailureCause::Encode(e.to_string()))
}

fn orphaned(waiters: Vec<Waiter>) -> Resolution {
    let outcome = RequestOutcome::Failure {
        cause: FailureCause::Internal("subscription state lost".into()),
    };
    Resolution {
        replies: waiters.into_iter().map(|w| (w, outcome.clone())).collect(),
        ..Default::default()
    }
}
