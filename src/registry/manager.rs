//! Subscription registry with write-through persistence.

use super::types::{RecoveryReport, Subscription, SCHEMA_VERSION};
use crate::config::SubmgrConfig;
use crate::error::{PersistenceOp, Result, SdlError, SubmgrError};
use crate::identifier::Identifier;
use crate::metrics::{Counter, Counters};
use crate::sdl::PersistenceGateway;
use crate::types::{Fingerprint, InstanceId, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Index {
    by_fingerprint: HashMap<Fingerprint, Subscription>,
    by_instance: HashMap<InstanceId, Fingerprint>,
    /// Allocated ids not yet backed by a record.
    reserved: HashSet<InstanceId>,
    next_instance: InstanceId,
}

impl Index {
    fn in_use(&self, id: InstanceId) -> bool {
        self.by_instance.contains_key(&id) || self.reserved.contains(&id)
    }
}

/// Authoritative record of every subscription.
///
/// Mutations land in memory first (`stage_*`), then [`persist`](Self::persist)
/// writes the key's current snapshot to the gateway. Memory stays
/// authoritative for the live path; a failed write is counted and returned
/// but not rolled back.
///
/// # Example
///
/// ```ignore
/// let registry = SubscriptionRegistry::new(&config, sdl, counters);
/// let report = registry.rehydrate()?;
/// registry.upsert(subscription)?;
/// ```
pub struct SubscriptionRegistry {
    index: RwLock<Index>,
    sdl: Arc<dyn PersistenceGateway>,
    counters: Arc<Counters>,
    /// Serializes gateway calls per key, so a later snapshot is never
    /// overwritten by an earlier one.
    persist_locks: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
    instance_min: InstanceId,
    instance_max: InstanceId,
}

impl SubscriptionRegistry {
    pub fn new(
        config: &SubmgrConfig,
        sdl: Arc<dyn PersistenceGateway>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            index: RwLock::new(Index {
                next_instance: config.instance_id_min,
                ..Default::default()
            }),
            sdl,
            counters,
            persist_locks: Mutex::new(HashMap::new()),
            instance_min: config.instance_id_min,
            instance_max: config.instance_id_max,
        }
    }

    /// Insert or replace a record and write it through.
    pub fn upsert(&self, subscription: Subscription) -> Result<()> {
        let fingerprint = subscription.fingerprint;
        self.stage_upsert(subscription);
        self.persist(&fingerprint)
    }

    /// Remove a record and write the removal through.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<Option<Subscription>> {
        let removed = self.stage_remove(fingerprint);
        self.persist(fingerprint)?;
        Ok(removed)
    }

    /// Update memory only. The creation time of an existing record is kept.
    pub fn stage_upsert(&self, mut subscription: Subscription) {
        let mut guard = self.index.write();
        let index = &mut *guard;
        if let Some(existing) = index.by_fingerprint.get(&subscription.fingerprint) {
            subscription.created = existing.created;
            if existing.instance_id != subscription.instance_id {
                index.by_instance.remove(&existing.instance_id);
            }
        }
        subscription.schema_version = SCHEMA_VERSION;
        subscription.members.sort();
        subscription.updated = Timestamp::now();
        subscription.seal();

        index.reserved.remove(&subscription.instance_id);
        index
            .by_instance
            .insert(subscription.instance_id, subscription.fingerprint);
        index
            .by_fingerprint
            .insert(subscription.fingerprint, subscription);
    }

    /// Remove from memory only; frees the instance id.
    pub fn stage_remove(&self, fingerprint: &Fingerprint) -> Option<Subscription> {
        let mut index = self.index.write();
        let removed = index.by_fingerprint.remove(fingerprint)?;
        index.by_instance.remove(&removed.instance_id);
        Some(removed)
    }

    /// Write the current snapshot of `fingerprint` to the gateway, or remove
    /// it there if the record is gone.
    pub fn persist(&self, fingerprint: &Fingerprint) -> Result<()> {
        let key_lock = {
            let mut locks = self.persist_locks.lock();
            Arc::clone(locks.entry(*fingerprint).or_default())
        };

        let result = {
            let _guard = key_lock.lock();
            let snapshot = self.index.read().by_fingerprint.get(fingerprint).cloned();
            let key = fingerprint.to_hex();
            match snapshot {
                Some(record) => serde_json::to_vec(&record)
                    .map_err(|e| SdlError::new(PersistenceOp::Write, e.to_string()))
                    .and_then(|blob| self.sdl.set(&key, &blob)),
                None => self.sdl.remove(&[key]),
            }
        };

        {
            let mut locks = self.persist_locks.lock();
            // Map plus our clone: nobody else is waiting on this key.
            if Arc::strong_count(&key_lock) == 2 {
                locks.remove(fingerprint);
            }
        }

        result.map_err(|e| {
            self.record_failure(&e);
            warn!(fingerprint = %fingerprint.short(), error = %e, "persistence failure");
            SubmgrError::Persistence(e)
        })
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Subscription> {
        self.index.read().by_fingerprint.get(fingerprint).cloned()
    }

    /// Every subscription toward `target`.
    pub fn get_by_identifier(&self, target: &Identifier) -> Vec<Subscription> {
        let index = self.index.read();
        let mut found: Vec<_> = index
            .by_fingerprint
            .values()
            .filter(|s| &s.target == target)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.instance_id);
        found
    }

    pub fn get_by_instance(&self, instance_id: InstanceId) -> Option<Subscription> {
        let index = self.index.read();
        let fingerprint = index.by_instance.get(&instance_id)?;
        index.by_fingerprint.get(fingerprint).cloned()
    }

    /// All records, ordered by instance id.
    pub fn list_all(&self) -> Vec<Subscription> {
        let mut all: Vec<_> = self.index.read().by_fingerprint.values().cloned().collect();
        all.sort_by_key(|s| s.instance_id);
        all
    }

    pub fn len(&self) -> usize {
        self.index.read().by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().by_fingerprint.is_empty()
    }

    /// Hand out a free instance id from the configured range. The id stays
    /// reserved until a record claims it or it is released.
    pub fn allocate_instance(&self) -> Result<InstanceId> {
        let mut index = self.index.write();
        let span = u64::from(self.instance_max - self.instance_min) + 1;
        let mut candidate = index.next_instance;
        for _ in 0..span {
            if candidate < self.instance_min || candidate > self.instance_max {
                candidate = self.instance_min;
            }
            if !index.in_use(candidate) {
                index.reserved.insert(candidate);
                index.next_instance = if candidate == self.instance_max {
                    self.instance_min
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
            candidate = if candidate == self.instance_max {
                self.instance_min
            } else {
                candidate + 1
            };
        }
        Err(SubmgrError::InstanceIdsExhausted)
    }

    /// Return a reserved id that never got a record.
    pub fn release_instance(&self, instance_id: InstanceId) {
        self.index.write().reserved.remove(&instance_id);
    }

    /// Load every persisted record into memory.
    ///
    /// Records that do not parse, carry an unknown schema version, fail the
    /// checksum or are stored under the wrong key are skipped and counted as
    /// corruption. Only a failure to read the store at all is an error.
    pub fn rehydrate(&self) -> Result<RecoveryReport> {
        let keys: Vec<String> = self.read_op(|sdl| sdl.get_all())?.into_iter().collect();
        let blobs = self.read_op(|sdl| sdl.get(&keys))?;

        let mut report = RecoveryReport::default();
        for key in keys {
            let blob = match blobs.get(&key) {
                Some(Some(blob)) => blob,
                _ => continue,
            };
            match parse_record(&key, blob) {
                Ok(record) => report.restored.push(record),
                Err(reason) => {
                    self.counters.inc(Counter::RegistryCorruption);
                    let err = SubmgrError::RegistryCorruption {
                        key: key.clone(),
                        reason,
                    };
                    warn!(error = %err, "skipping subscription record");
                    report.corrupted.push(key);
                }
            }
        }

        {
            let mut index = self.index.write();
            for record in &report.restored {
                if let Some(previous) = index.by_instance.insert(record.instance_id, record.fingerprint) {
                    debug!(instance = record.instance_id, previous = %previous.short(), "instance id reused by restored record");
                }
                index.by_fingerprint.insert(record.fingerprint, record.clone());
            }
        }

        report.restored.sort_by_key(|s| s.instance_id);
        info!(
            restored = report.restored.len(),
            corrupted = report.corrupted.len(),
            "registry rehydrated"
        );
        Ok(report)
    }

    fn read_op<T>(
        &self,
        op: impl FnOnce(&dyn PersistenceGateway) -> std::result::Result<T, SdlError>,
    ) -> Result<T> {
        op(self.sdl.as_ref()).map_err(|e| {
            self.record_failure(&e);
            warn!(error = %e, "persistence read failure");
            SubmgrError::Persistence(e)
        })
    }

    fn record_failure(&self, error: &SdlError) {
        let counter = match error.op {
            PersistenceOp::Write => Counter::SdlWriteFailure,
            PersistenceOp::Read => Counter::SdlReadFailure,
            PersistenceOp::Remove => Counter::SdlRemoveFailure,
        };
        self.counters.inc(counter);
    }
}

fn parse_record(key: &str, blob: &[u8]) -> std::result::Result<Subscription, String> {
    let doc: serde_json::Value = serde_json::from_slice(blob).map_err(|e| e.to_string())?;
    let version = doc.get("schema_version").and_then(|v| v.as_u64());
    if version != Some(u64::from(SCHEMA_VERSION)) {
        return Err(format!("unsupported schema version {:?}", version));
    }
    let record: Subscription = serde_json::from_value(doc).map_err(|e| e.to_string())?;
    if !record.verify() {
        return Err("checksum mismatch".into());
    }
    if record.key() != key {
        return Err(format!("stored under foreign key for {}", record.fingerprint.short()));
    }
    Ok(record)
}
