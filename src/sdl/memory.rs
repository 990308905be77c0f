//! In-memory persistence gateway.

use super::PersistenceGateway;
use crate::error::{PersistenceOp, SdlError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

/// Map-backed gateway. Failures can be switched on per operation class to
/// exercise degraded-durability paths.
#[derive(Default)]
pub struct MemorySdl {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemorySdl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent operations of the given class fail (or succeed again).
    pub fn set_failing(&self, op: PersistenceOp, failing: bool) {
        let flag = match op {
            PersistenceOp::Write => &self.fail_writes,
            PersistenceOp::Read => &self.fail_reads,
            PersistenceOp::Remove => &self.fail_removes,
        };
        flag.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn check(&self, op: PersistenceOp) -> Result<(), SdlError> {
        let flag = match op {
            PersistenceOp::Write => &self.fail_writes,
            PersistenceOp::Read => &self.fail_reads,
            PersistenceOp::Remove => &self.fail_removes,
        };
        if flag.load(Ordering::SeqCst) {
            return Err(SdlError::new(op, "injected failure"));
        }
        Ok(())
    }
}

impl PersistenceGateway for MemorySdl {
    fn set(&self, key: &str, blob: &[u8]) -> Result<(), SdlError> {
        self.check(PersistenceOp::Write)?;
        self.data.write().insert(key.to_string(), blob.to_vec());
        Ok(())
    }

    fn get(&self, keys: &[String]) -> Result<HashMap<String, Option<Vec<u8>>>, SdlError> {
        self.check(PersistenceOp::Read)?;
        let data = self.data.read();
        Ok(keys
            .iter()
            .map(|k| (k.clone(), data.get(k).cloned()))
            .collect())
    }

    fn get_all(&self) -> Result<BTreeSet<String>, SdlError> {
        self.check(PersistenceOp::Read)?;
        Ok(self.data.read().keys().cloned().collect())
    }

    fn remove(&self, keys: &[String]) -> Result<(), SdlError> {
        self.check(PersistenceOp::Remove)?;
        let mut data = self.data.write();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }

    fn remove_all(&self) -> Result<(), SdlError> {
        self.check(PersistenceOp::Remove)?;
        self.data.write().clear();
        Ok(())
    }
}
