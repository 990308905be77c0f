//! File-backed persistence gateway.
//!
//! Every mutation is appended to an operation log as a checksummed frame and
//! fsynced before the in-memory view changes, so an acknowledged write
//! survives a crash. On open the log is replayed; replay stops at the first
//! torn or corrupt frame and the file is cut back to the last good frame,
//! leaving exactly the durably committed state. A failed append is rolled
//! back to the last committed frame before anything else is written, so a
//! torn frame never ends up in front of later acknowledged writes.
//!
//! Frame layout: `[len u32 LE][MessagePack op][crc32 u32 LE]`.

use super::PersistenceGateway;
use crate::error::{PersistenceOp, Result, SdlError, SubmgrError};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the operation log.
const SDL_MAGIC: &[u8; 4] = b"SDL\0";

/// Current log format version.
const SDL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Rewrite the log once it holds this many superseded frames.
const DEFAULT_COMPACT_AFTER: u64 = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum SdlOp {
    Set { key: String, blob: Vec<u8> },
    Remove { keys: Vec<String> },
    Clear,
}

struct LogWriter {
    writer: BufWriter<File>,
    /// Frames in the log that no longer contribute to the live view.
    dead_frames: u64,
    /// File length up to the end of the last committed frame.
    committed_len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
}

/// Durable gateway storing all keys in one operation log.
pub struct FileSdl {
    path: PathBuf,
    _lock_file: File,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    log: Mutex<LogWriter>,
    compact_after: u64,
}

impl FileSdl {
    /// Open or create the gateway in directory `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_compaction(dir, DEFAULT_COMPACT_AFTER)
    }

    /// Like [`FileSdl::open`], compacting after `compact_after` superseded frames.
    pub fn open_with_compaction(dir: impl AsRef<Path>, compact_after: u64) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_file = Self::acquire_lock(dir)?;

        let path = dir.join("subscriptions.sdl");
        let (data, dead_frames) = if path.exists() {
            Self::replay(&path)?
        } else {
            Self::write_fresh(&path, &BTreeMap::new())?;
            (BTreeMap::new(), 0)
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        let committed_len = file.metadata()?.len();
        debug!(path = %path.display(), keys = data.len(), "sdl opened");

        Ok(Self {
            path,
            _lock_file: lock_file,
            data: RwLock::new(data),
            log: Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                dead_frames,
                committed_len,
                poisoned: false,
            }),
            compact_after: compact_after.max(1),
        })
    }

    /// Rewrite the log so it holds one frame per live key.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.log.lock();
        let data = self.data.read();
        self.compact_locked(&mut log, &data)
    }

    fn compact_locked(&self, log: &mut LogWriter, data: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        log.writer.flush()?;
        let tmp = self.path.with_extension("sdl.tmp");
        Self::write_fresh(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        log.committed_len = file.metadata()?.len();
        log.writer = BufWriter::new(file);
        log.dead_frames = 0;
        log.poisoned = false;
        debug!(keys = data.len(), "sdl log compacted");
        Ok(())
    }

    fn append(&self, op: SdlOp, class: PersistenceOp) -> std::result::Result<(), SdlError> {
        let mut log = self.log.lock();
        if log.poisoned {
            return Err(SdlError::new(class, "sdl log unusable after a failed append"));
        }
        let written = Self::write_frame(&mut log.writer, &op).and_then(|len| {
            log.writer.flush()?;
            log.writer.get_ref().sync_data()?;
            Ok(len)
        });
        match written {
            Ok(len) => log.committed_len += len,
            Err(e) => {
                if let Err(rollback) = self.rollback(&mut log) {
                    warn!(error = %rollback, "sdl rollback failed, refusing further writes");
                    log.poisoned = true;
                }
                return Err(SdlError::new(class, e.to_string()));
            }
        }

        let mut data = self.data.write();
        let superseded = apply(&mut data, op);
        log.dead_frames += superseded;

        if log.dead_frames >= self.compact_after {
            // The write above is already durable; a failed compaction only
            // leaves a longer log behind.
            if let Err(e) = self.compact_locked(&mut log, &data) {
                warn!(error = %e, "sdl compaction failed");
            }
        }
        Ok(())
    }

    /// Drop whatever a failed append left buffered or on disk.
    fn rollback(&self, log: &mut LogWriter) -> std::io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut log.writer, BufWriter::new(file));
        // `into_parts` hands back the buffer without flushing it.
        let _ = stale.into_parts();
        log.writer.get_ref().set_len(log.committed_len)?;
        log.writer.get_ref().sync_data()?;
        debug!(len = log.committed_len, "sdl log rolled back");
        Ok(())
    }

    fn write_fresh(path: &Path, data: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(SDL_MAGIC)?;
        writer.write_all(&[SDL_VERSION])?;
        for (key, blob) in data {
            Self::write_frame(
                &mut writer,
                &SdlOp::Set {
                    key: key.clone(),
                    blob: blob.clone(),
                },
            )?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn replay(path: &Path) -> Result<(BTreeMap<String, Vec<u8>>, u64)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut reader = BufReader::new(file.try_clone()?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SDL_MAGIC {
            return Err(SubmgrError::InvalidFormat("Invalid SDL magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SDL_VERSION {
            return Err(SubmgrError::InvalidFormat(format!(
                "Unsupported SDL version: {}",
                version[0]
            )));
        }

        let mut data = BTreeMap::new();
        let mut dead_frames = 0;
        let mut good_len = HEADER_LEN;
        while let Some((op, frame_len)) = Self::read_frame(&mut reader) {
            dead_frames += apply(&mut data, op);
            good_len += frame_len;
        }

        let file_len = file.metadata()?.len();
        if file_len > good_len {
            warn!(
                path = %path.display(),
                discarded = file_len - good_len,
                "discarding torn tail of sdl log"
            );
            file.set_len(good_len)?;
            file.sync_all()?;
        }

        Ok((data, dead_frames))
    }

    /// Write one frame, returning its on-disk size.
    fn write_frame(writer: &mut BufWriter<File>, op: &SdlOp) -> std::io::Result<u64> {
        let encoded = rmp_serde::to_vec(op)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok((4 + encoded.len() + 4) as u64)
    }

    /// Next intact frame and its on-disk size, or `None` at end of log or at
    /// the first damaged frame.
    fn read_frame(reader: &mut BufReader<File>) -> Option<(SdlOp, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).ok()?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return None;
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded).ok()?;
        let mut checksum = [0u8; 4];
        reader.read_exact(&mut checksum).ok()?;
        if u32::from_le_bytes(checksum) != crc32fast::hash(&encoded) {
            return None;
        }

        let op = rmp_serde::from_slice(&encoded).ok()?;
        Some((op, (4 + len + 4) as u64))
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SubmgrError::Locked)?;
        Ok(lock_file)
    }
}

/// Apply an operation, returning how many earlier frames it superseded.
fn apply(data: &mut BTreeMap<String, Vec<u8>>, op: SdlOp) -> u64 {
    match op {
        SdlOp::Set { key, blob } => u64::from(data.insert(key, blob).is_some()),
        SdlOp::Remove { keys } => {
            // The remove frame itself is dead weight too.
            1 + keys.iter().filter(|k| data.remove(*k).is_some()).count() as u64
        }
        SdlOp::Clear => {
            let n = data.len() as u64;
            data.clear();
            n + 1
        }
    }
}

impl PersistenceGateway for FileSdl {
    fn set(&self, key: &str, blob: &[u8]) -> std::result::Result<(), SdlError> {
        self.append(
            SdlOp::Set {
                key: key.to_string(),
                blob: blob.to_vec(),
            },
            PersistenceOp::Write,
        )
    }

    fn get(&self, keys: &[String]) -> std::result::Result<HashMap<String, Option<Vec<u8>>>, SdlError> {
        let data = self.data.read();
        Ok(keys
            .iter()
            .map(|k| (k.clone(), data.get(k).cloned()))
            .collect())
    }

    fn get_all(&self) -> std::result::Result<BTreeSet<String>, SdlError> {
        Ok(self.data.read().keys().cloned().collect())
    }

    fn remove(&self, keys: &[String]) -> std::result::Result<(), SdlError> {
        if keys.is_empty() {
            return Ok(());
        }
        self.append(
            SdlOp::Remove {
                keys: keys.to_vec(),
            },
            PersistenceOp::Remove,
        )
    }

    fn remove_all(&self) -> std::result::Result<(), SdlError> {
        self.append(SdlOp::Clear, PersistenceOp::Remove)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(sdl: &FileSdl) -> Vec<String> {
        sdl.get_all().unwrap().into_iter().collect()
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let sdl = FileSdl::open(dir.path()).unwrap();
            sdl.set("a", b"one").unwrap();
            sdl.set("b", b"two").unwrap();
            sdl.set("a", b"uno").unwrap();
            sdl.remove(&["b".to_string()]).unwrap();
        }

        let sdl = FileSdl::open(dir.path()).unwrap();
        assert_eq!(keys(&sdl), vec!["a"]);
        let got = sdl.get(&["a".to_string()]).unwrap();
        assert_eq!(got["a"], Some(b"uno".to_vec()));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _sdl = FileSdl::open(dir.path()).unwrap();
        assert!(matches!(FileSdl::open(dir.path()), Err(SubmgrError::Locked)));
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let sdl = FileSdl::open(dir.path()).unwrap();
            sdl.set("kept", b"1").unwrap();
        }

        // Simulate a crash mid-append: a length prefix with half a payload.
        let path = dir.path().join("subscriptions.sdl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[0xAB; 10]).unwrap();
        drop(file);

        {
            let sdl = FileSdl::open(dir.path()).unwrap();
            assert_eq!(keys(&sdl), vec!["kept"]);
            sdl.set("after", b"2").unwrap();
        }

        let sdl = FileSdl::open(dir.path()).unwrap();
        assert_eq!(keys(&sdl), vec!["after", "kept"]);
    }

    #[test]
    fn test_failed_append_does_not_hide_later_writes() {
        let dir = TempDir::new().unwrap();
        {
            let sdl = FileSdl::open(dir.path()).unwrap();
            sdl.set("before", b"1").unwrap();

            // A frame torn by a write error: part on disk, part still buffered.
            {
                let mut log = sdl.log.lock();
                log.writer.write_all(&100u32.to_le_bytes()).unwrap();
                log.writer.flush().unwrap();
                log.writer.write_all(&[0xAB; 10]).unwrap();
                sdl.rollback(&mut log).unwrap();
            }

            sdl.set("after", b"2").unwrap();
            sdl.remove(&["before".to_string()]).unwrap();
            sdl.set("last", b"3").unwrap();
        }

        let sdl = FileSdl::open(dir.path()).unwrap();
        assert_eq!(keys(&sdl), vec!["after", "last"]);
    }

    #[test]
    fn test_poisoned_log_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let sdl = FileSdl::open(dir.path()).unwrap();
        sdl.log.lock().poisoned = true;
        let err = sdl.set("a", b"1").unwrap_err();
        assert_eq!(err.op, PersistenceOp::Write);
        assert!(keys(&sdl).is_empty());

        sdl.compact().unwrap();
        sdl.set("a", b"1").unwrap();
        assert_eq!(keys(&sdl), vec!["a"]);
    }

    #[test]
    fn test_compaction_keeps_live_keys() {
        let dir = TempDir::new().unwrap();
        {
            let sdl = FileSdl::open_with_compaction(dir.path(), 4).unwrap();
            for i in 0..20u8 {
                sdl.set("hot", &[i]).unwrap();
            }
            sdl.set("cold", b"c").unwrap();
        }

        let size = fs::metadata(dir.path().join("subscriptions.sdl")).unwrap().len();
        assert!(size < 200, "log was not compacted: {} bytes", size);

        let sdl = FileSdl::open(dir.path()).unwrap();
        let got = sdl.get(&["hot".to_string(), "cold".to_string()]).unwrap();
        assert_eq!(got["hot"], Some(vec![19]));
        assert_eq!(got["cold"], Some(b"c".to_vec()));
    }

    #[test]
    fn test_remove_all() {
        let dir = TempDir::new().unwrap();
        {
            let sdl = FileSdl::open(dir.path()).unwrap();
            sdl.set("a", b"1").unwrap();
            sdl.remove_all().unwrap();
            sdl.set("b", b"2").unwrap();
        }
        let sdl = FileSdl::open(dir.path()).unwrap();
        assert_eq!(keys(&sdl), vec!["b"]);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("subscriptions.sdl"), b"NOPE\x01").unwrap();
        assert!(matches!(
            FileSdl::open(dir.path()),
            Err(SubmgrError::InvalidFormat(_))
        ));
    }
}
