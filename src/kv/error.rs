//! Error types for the KV persistence subsystem.
//!
//! [`KvError`] covers all failure modes of the append-only journal-backed
//! [`KvEnvironment`](super::KvEnvironment) implementations, including I/O
//! errors, corruption, and capacity issues. It is a leaf, single-source
//! error type, so it derives its `Display`/`Error` impls with `thiserror`
//! instead of the hand-rolled style `EngineError` uses for its structured,
//! cross-module variants.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur within the KV persistence subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    /// An I/O error occurred while reading or writing journal files.
    #[error("kv I/O error (path={path:?}): {message}")]
    Io {
        /// The underlying I/O error message.
        message: String,
        /// The file path involved, if known.
        path: Option<PathBuf>,
    },

    /// A journal entry failed CRC32 integrity verification.
    #[error(
        "corrupt journal entry at offset {offset}: expected CRC {expected_crc:#010x}, got {actual_crc:#010x}"
    )]
    CorruptEntry {
        /// The byte offset of the corrupt entry.
        offset: u64,
        /// The expected CRC32 checksum.
        expected_crc: u32,
        /// The actual CRC32 checksum computed from the entry bytes.
        actual_crc: u32,
    },

    /// The journal entry payload could not be deserialized.
    #[error("journal deserialization error at offset {offset}: {message}")]
    DeserializationError {
        /// The byte offset of the entry that failed to deserialize.
        offset: u64,
        /// The underlying deserialization error message.
        message: String,
    },

    /// A segment file is too small to hold the entry being appended.
    #[error("journal entry too large: {entry_bytes} bytes exceeds segment size {segment_size} bytes")]
    EntryTooLarge {
        /// The size of the serialized entry in bytes.
        entry_bytes: usize,
        /// The maximum segment size in bytes.
        segment_size: usize,
    },

    /// The environment's root directory does not exist or is not
    /// accessible.
    #[error("invalid kv environment directory: {}", path.display())]
    InvalidDirectory {
        /// The path that was expected to be a valid directory.
        path: PathBuf,
    },

    /// An internal mutex was poisoned (another thread panicked while
    /// holding the lock).
    #[error("kv environment internal mutex poisoned")]
    MutexPoisoned,

    /// The journal entry has an invalid header (truncated or malformed).
    #[error("invalid journal entry header at offset {offset}: {message}")]
    InvalidEntryHeader {
        /// Byte offset within the segment where the error occurred.
        offset: u64,
        /// Description of the header problem.
        message: String,
    },

    /// `commit_wtxn` was called with a round number that does not strictly
    /// follow the environment's current persisted round.
    #[error("commit_wtxn({attempted}) is not newer than persisted round {current}")]
    NonMonotonicRound {
        /// The environment's current persisted round.
        current: u64,
        /// The round number the caller tried to commit.
        attempted: u64,
    },
}

impl From<std::io::Error> for KvError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        KvError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}
