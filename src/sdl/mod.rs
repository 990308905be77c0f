//! Persistence gateway for subscription records.
//!
//! The registry checkpoints every subscription record through a
//! [`PersistenceGateway`]: a flat key/value contract where the key is the
//! subscription fingerprint and the value an opaque blob. Two gateways ship
//! with the crate:
//! - [`MemorySdl`]: in-process map, with switchable failures for tests
//! - [`FileSdl`]: append-only, checksummed operation log on local disk

mod file;
mod memory;

pub use file::FileSdl;
pub use memory::MemorySdl;

use crate::error::SdlError;
use std::collections::{BTreeSet, HashMap};

/// Durable key/value store contract.
///
/// Each method fails with an [`SdlError`] tagged by operation class
/// (write, read, remove) so callers can account for them separately.
pub trait PersistenceGateway: Send + Sync {
    /// Store `blob` under `key`, replacing any previous value.
    fn set(&self, key: &str, blob: &[u8]) -> Result<(), SdlError>;

    /// Fetch values for `keys`; absent keys map to `None`.
    fn get(&self, keys: &[String]) -> Result<HashMap<String, Option<Vec<u8>>>, SdlError>;

    /// All stored keys.
    fn get_all(&self) -> Result<BTreeSet<String>, SdlError>;

    /// Remove `keys`; missing keys are ignored.
    fn remove(&self, keys: &[String]) -> Result<(), SdlError>;

    /// Remove every key.
    fn remove_all(&self) -> Result<(), SdlError>;
}
