//! [`JournalKv`]: an append-only, CRC32-checked, memory-mapped journal
//! implementing [`KvEnvironment`](super::KvEnvironment).
//!
//! Grounded on `sequencer::file_journal`'s segment-based event journal:
//! the same append/mmap/CRC32 mechanism, here recording `Put`/`Del`/
//! `Commit` records instead of sequencer events. A single growing segment
//! file replaces that design's multi-segment rotation scheme (noted in
//! `DESIGN.md`) — this crate's KV volumes (one per orderbook, the account
//! database, the header-hash map) are small compared to an order-intake
//! event stream, so rotation would add complexity without a matching
//! benefit.
//!
//! # On-disk entry format (little-endian)
//!
//! ```text
//! [4 bytes: entry_len][1 byte: tag][payload...][4 bytes: CRC32]
//! ```
//!
//! `entry_len` counts every byte after itself (`tag ‖ payload ‖ crc`). The
//! CRC32 covers `tag ‖ payload`. Three tags exist: `0` = Put(key, value),
//! `1` = Del(key), `2` = Commit(round_number). Mutations staged by a write
//! transaction are only visible to the environment once their `Commit`
//! record has been durably appended — a crash mid-transaction leaves a
//! trailing run of `Put`/`Del` records with no terminating `Commit`, which
//! replay discards.

use super::error::KvError;
use super::{KvEnvironment, KvReadTxn, KvWriteTxn};
use crc32fast::Hasher as Crc32;
use memmap2::{MmapMut, MmapOptions};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const TAG_PUT: u8 = 0;
const TAG_DEL: u8 = 1;
const TAG_COMMIT: u8 = 2;

const ENTRY_LEN_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

/// Initial / growth-increment segment size (16 MiB).
const SEGMENT_GROWTH: u64 = 16 * 1024 * 1024;

struct Segment {
    file: File,
    mmap: MmapMut,
    write_pos: usize,
    capacity: usize,
    path: PathBuf,
}

impl Segment {
    fn open_or_create(path: &Path) -> Result<Self, KvError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| KvError::Io {
                message: e.to_string(),
                path: Some(path.to_path_buf()),
            })?;
        let len = file.metadata()?.len();
        let capacity = len.max(SEGMENT_GROWTH);
        file.set_len(capacity)?;
        // SAFETY: `file` is exclusively owned by this `JournalKv` for the
        // lifetime of the mapping; no other process touches it.
        let mmap = unsafe {
            MmapOptions::new()
                .len(capacity as usize)
                .map_mut(&file)
                .map_err(|e| KvError::Io {
                    message: e.to_string(),
                    path: Some(path.to_path_buf()),
                })?
        };
        Ok(Segment {
            file,
            mmap,
            write_pos: 0,
            capacity: capacity as usize,
            path: path.to_path_buf(),
        })
    }

    fn grow(&mut self, at_least: usize) -> Result<(), KvError> {
        let mut new_capacity = self.capacity.max(1);
        while new_capacity < at_least {
            new_capacity += SEGMENT_GROWTH as usize;
        }
        self.file.set_len(new_capacity as u64)?;
        // SAFETY: see `open_or_create`.
        let mmap = unsafe {
            MmapOptions::new()
                .len(new_capacity)
                .map_mut(&self.file)
                .map_err(|e| KvError::Io {
                    message: e.to_string(),
                    path: Some(self.path.clone()),
                })?
        };
        self.mmap = mmap;
        self.capacity = new_capacity;
        Ok(())
    }

    fn append(&mut self, tag: u8, payload: &[u8]) -> Result<(), KvError> {
        let body_len = 1 + payload.len() + CRC_SIZE;
        let needed = self.write_pos + ENTRY_LEN_SIZE + body_len;
        if needed > self.capacity {
            self.grow(needed)?;
        }
        let mut hasher = Crc32::new();
        hasher.update(&[tag]);
        hasher.update(payload);
        let crc = hasher.finalize();

        let start = self.write_pos;
        let body_start = start + ENTRY_LEN_SIZE;
        self.mmap[start..start + ENTRY_LEN_SIZE]
            .copy_from_slice(&(body_len as u32).to_le_bytes());
        self.mmap[body_start] = tag;
        self.mmap[body_start + 1..body_start + 1 + payload.len()].copy_from_slice(payload);
        let crc_at = body_start + 1 + payload.len();
        self.mmap[crc_at..crc_at + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());

        self.write_pos += ENTRY_LEN_SIZE + body_len;
        Ok(())
    }

    fn flush(&self) -> Result<(), KvError> {
        self.mmap.flush_range(0, self.write_pos).map_err(|e| KvError::Io {
            message: e.to_string(),
            path: Some(self.path.clone()),
        })
    }
}

enum ReplayedEntry {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
    Commit(u64),
}

/// Scan `mmap[..capacity]` for valid entries, stopping at the first
/// malformed/corrupt/zero-length entry header (the boundary between
/// durably written data and either free space or a torn write).
fn replay(mmap: &[u8], capacity: usize) -> (usize, Vec<ReplayedEntry>) {
    let mut pos = 0usize;
    let mut out = Vec::new();
    while pos + ENTRY_LEN_SIZE <= capacity {
        let len_bytes: [u8; 4] = mmap[pos..pos + 4].try_into().unwrap();
        let body_len = u32::from_le_bytes(len_bytes) as usize;
        if body_len == 0 || body_len < 1 + CRC_SIZE {
            break;
        }
        let body_start = pos + ENTRY_LEN_SIZE;
        if body_start + body_len > capacity {
            break;
        }
        let tag = mmap[body_start];
        let payload = &mmap[body_start + 1..body_start + body_len - CRC_SIZE];
        let crc_at = body_start + body_len - CRC_SIZE;
        let stored_crc = u32::from_le_bytes(mmap[crc_at..crc_at + CRC_SIZE].try_into().unwrap());

        let mut hasher = Crc32::new();
        hasher.update(&[tag]);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            warn!(offset = pos, "journal: CRC mismatch, stopping replay");
            break;
        }

        let entry = match tag {
            TAG_PUT => {
                if payload.len() < 4 {
                    break;
                }
                let key_len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                if payload.len() < 4 + key_len + 4 {
                    break;
                }
                let key = payload[4..4 + key_len].to_vec();
                let val_len_at = 4 + key_len;
                let val_len =
                    u32::from_le_bytes(payload[val_len_at..val_len_at + 4].try_into().unwrap())
                        as usize;
                let val_start = val_len_at + 4;
                if payload.len() < val_start + val_len {
                    break;
                }
                let value = payload[val_start..val_start + val_len].to_vec();
                ReplayedEntry::Put(key, value)
            }
            TAG_DEL => {
                if payload.len() < 4 {
                    break;
                }
                let key_len = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                if payload.len() < 4 + key_len {
                    break;
                }
                ReplayedEntry::Del(payload[4..4 + key_len].to_vec())
            }
            TAG_COMMIT => {
                if payload.len() < 8 {
                    break;
                }
                ReplayedEntry::Commit(u64::from_be_bytes(payload[0..8].try_into().unwrap()))
            }
            _ => break,
        };
        out.push(entry);
        pos = body_start + body_len;
    }
    (pos, out)
}

/// A journal-backed [`KvEnvironment`]. One instance per subsystem
/// (account database, block-header hash map, or a single orderbook).
pub struct JournalKv {
    segment: Mutex<Segment>,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    persisted_round: AtomicU64,
}

impl JournalKv {
    /// Open (or create) the journal file `dir/data.journal`, replaying any
    /// previously committed entries into the in-memory index.
    pub fn open(dir: &Path) -> Result<Self, KvError> {
        std::fs::create_dir_all(dir).map_err(|e| KvError::Io {
            message: e.to_string(),
            path: Some(dir.to_path_buf()),
        })?;
        let path = dir.join("data.journal");
        let mut segment = Segment::open_or_create(&path)?;

        let (valid_len, entries) = replay(&segment.mmap[..segment.capacity], segment.capacity);
        segment.write_pos = valid_len;

        let mut index = BTreeMap::new();
        let mut staged: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        let mut persisted_round = 0u64;
        for entry in entries {
            match entry {
                ReplayedEntry::Put(k, v) => staged.push((k, Some(v))),
                ReplayedEntry::Del(k) => staged.push((k, None)),
                ReplayedEntry::Commit(round) => {
                    for (k, v) in staged.drain(..) {
                        match v {
                            Some(v) => {
                                index.insert(k, v);
                            }
                            None => {
                                index.remove(&k);
                            }
                        }
                    }
                    persisted_round = round;
                }
            }
        }
        if !staged.is_empty() {
            debug!(
                dropped = staged.len(),
                "journal: discarding uncommitted tail entries from prior crash"
            );
        }

        Ok(JournalKv {
            segment: Mutex::new(segment),
            index: RwLock::new(index),
            persisted_round: AtomicU64::new(persisted_round),
        })
    }
}

struct ReadTxn<'env> {
    env: &'env JournalKv,
}

impl KvReadTxn for ReadTxn<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.env.index.read().unwrap().get(key).cloned()
    }
}

enum StagedOp {
    Put(Vec<u8>),
    Del,
}

struct WriteTxn<'env> {
    env: &'env JournalKv,
    staged: BTreeMap<Vec<u8>, StagedOp>,
}

impl KvReadTxn for WriteTxn<'_> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.staged.get(key) {
            Some(StagedOp::Put(v)) => Some(v.clone()),
            Some(StagedOp::Del) => None,
            None => self.env.index.read().unwrap().get(key).cloned(),
        }
    }
}

impl KvWriteTxn for WriteTxn<'_> {
    fn put(&mut self, key: &[u8], value: Vec<u8>) {
        self.staged.insert(key.to_vec(), StagedOp::Put(value));
    }

    fn del(&mut self, key: &[u8]) {
        self.staged.insert(key.to_vec(), StagedOp::Del);
    }

    fn commit(self: Box<Self>, round_number: u64) -> Result<(), KvError> {
        let current = self.env.persisted_round.load(Ordering::Acquire);
        if round_number <= current {
            return Err(KvError::NonMonotonicRound {
                current,
                attempted: round_number,
            });
        }

        let mut segment = self.env.segment.lock().unwrap();
        for (key, op) in &self.staged {
            match op {
                StagedOp::Put(value) => {
                    let mut payload =
                        Vec::with_capacity(4 + key.len() + 4 + value.len());
                    payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                    payload.extend_from_slice(key);
                    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    payload.extend_from_slice(value);
                    segment.append(TAG_PUT, &payload)?;
                }
                StagedOp::Del => {
                    let mut payload = Vec::with_capacity(4 + key.len());
                    payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                    payload.extend_from_slice(key);
                    segment.append(TAG_DEL, &payload)?;
                }
            }
        }
        segment.append(TAG_COMMIT, &round_number.to_be_bytes())?;
        segment.flush()?;
        drop(segment);

        let mut index = self.env.index.write().unwrap();
        for (key, op) in self.staged {
            match op {
                StagedOp::Put(value) => {
                    index.insert(key, value);
                }
                StagedOp::Del => {
                    index.remove(&key);
                }
            }
        }
        drop(index);
        self.env.persisted_round.store(round_number, Ordering::Release);
        Ok(())
    }
}

impl KvEnvironment for JournalKv {
    fn begin_read(&self) -> Box<dyn KvReadTxn + '_> {
        Box::new(ReadTxn { env: self })
    }

    fn begin_write(&self) -> Box<dyn KvWriteTxn + '_> {
        Box::new(WriteTxn {
            env: self,
            staged: BTreeMap::new(),
        })
    }

    fn persisted_round(&self) -> u64 {
        self.persisted_round.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.index
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_commit_round_trip() {
        let dir = tempdir().unwrap();
        let env = JournalKv::open(dir.path()).unwrap();
        let mut txn = env.begin_write();
        txn.put(b"k1", b"v1".to_vec());
        txn.put(b"k2", b"v2".to_vec());
        txn.commit(1).unwrap();

        assert_eq!(env.persisted_round(), 1);
        let read = env.begin_read();
        assert_eq!(read.get(b"k1"), Some(b"v1".to_vec()));
        assert_eq!(read.get(b"k2"), Some(b"v2".to_vec()));
        assert_eq!(read.get(b"missing"), None);
    }

    #[test]
    fn delete_removes_key() {
        let dir = tempdir().unwrap();
        let env = JournalKv::open(dir.path()).unwrap();
        let mut txn = env.begin_write();
        txn.put(b"k1", b"v1".to_vec());
        txn.commit(1).unwrap();

        let mut txn2 = env.begin_write();
        txn2.del(b"k1");
        txn2.commit(2).unwrap();

        assert_eq!(env.begin_read().get(b"k1"), None);
    }

    #[test]
    fn reopen_replays_committed_state() {
        let dir = tempdir().unwrap();
        {
            let env = JournalKv::open(dir.path()).unwrap();
            let mut txn = env.begin_write();
            txn.put(b"k1", b"v1".to_vec());
            txn.commit(5).unwrap();
        }
        let reopened = JournalKv::open(dir.path()).unwrap();
        assert_eq!(reopened.persisted_round(), 5);
        assert_eq!(reopened.begin_read().get(b"k1"), Some(b"v1".to_vec()));
    }

    #[test]
    fn commit_rejects_non_monotonic_round() {
        let dir = tempdir().unwrap();
        let env = JournalKv::open(dir.path()).unwrap();
        let mut txn = env.begin_write();
        txn.put(b"k1", b"v1".to_vec());
        txn.commit(3).unwrap();

        let mut txn2 = env.begin_write();
        txn2.put(b"k2", b"v2".to_vec());
        assert!(matches!(
            txn2.commit(3),
            Err(KvError::NonMonotonicRound { .. })
        ));
    }
}
