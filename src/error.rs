//! Crate-wide error types.

use std::fmt;

/// The five error kinds the settlement engine distinguishes.
///
/// Each kind carries a different recovery policy: `ProtocolInvalid` rolls a
/// block back and rejects it (non-fatal to the process); `Transient`
/// recovers by itself (tatonnement falls back to an unconstrained LP
/// solve); everything else is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Block fails validation against its own claimed commitments.
    ProtocolInvalid,
    /// A resource bound was exceeded (too many trie buffers, LP overflow).
    ResourceExhausted,
    /// On-disk state is inconsistent with its persisted-round marker.
    Corruption,
    /// An internal invariant was violated; indicates a bug, not bad input.
    InternalInvariant,
    /// A recoverable, expected condition (tatonnement timeout).
    Transient,
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineErrorKind::ProtocolInvalid => "protocol invalid",
            EngineErrorKind::ResourceExhausted => "resource exhausted",
            EngineErrorKind::Corruption => "corruption",
            EngineErrorKind::InternalInvariant => "internal invariant",
            EngineErrorKind::Transient => "transient",
        };
        f.write_str(s)
    }
}

/// Errors raised anywhere in the settlement engine.
#[derive(Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// A produced or received block fails a validation check.
    BlockValidation {
        /// What failed (hash mismatch, wrong block number, ...).
        reason: String,
        /// The block number under validation.
        block_number: u64,
    },

    /// A duplicate offer id was inserted into an orderbook trie.
    DuplicateOfferId {
        /// The offending offer id.
        offer_id: u64,
    },

    /// The recycling slab allocator has no free buffers left.
    SlabExhausted {
        /// How many buffers the slab was configured with.
        capacity: usize,
    },

    /// The LP feasibility solver could not express the block within its
    /// configured variable/constraint limits.
    LpOverflow {
        /// Number of assets that triggered the overflow.
        num_assets: usize,
    },

    /// A KV environment's persisted-round number disagrees with its
    /// contents.
    PersistedRoundMismatch {
        /// Name of the KV environment.
        environment: String,
        /// Round number recorded by the environment.
        persisted_round: u64,
        /// Round number implied by its contents.
        observed_round: u64,
    },

    /// A trie metadata aggregate failed its integrity check (e.g. went
    /// negative, or an internal node's children sum didn't match).
    MetadataIntegrity {
        /// Description of which aggregate and why.
        message: String,
    },

    /// Code asked for a child slot that does not exist.
    MissingChild {
        /// The prefix whose child was requested.
        prefix_len_bits: u16,
    },

    /// The minimum feasible tax rate required reducing the target by more
    /// than the one unit of slack the protocol permits.
    TaxRateInfeasible {
        /// The configured target tax rate.
        target: u8,
        /// The tax rate that would have been required.
        required: u8,
    },

    /// Tatonnement's grid search exhausted its timeout without finding a
    /// clearing price vector.
    TatonnementTimeout {
        /// Number of rounds run before timing out.
        rounds_run: u64,
    },

    /// Wraps a [`crate::kv::KvError`] from the persistence layer.
    Kv(crate::kv::KvError),
}

impl EngineError {
    /// Classify this error into one of the five engine-wide error kinds.
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            EngineError::BlockValidation { .. } | EngineError::DuplicateOfferId { .. } => {
                EngineErrorKind::ProtocolInvalid
            }
            EngineError::SlabExhausted { .. } | EngineError::LpOverflow { .. } => {
                EngineErrorKind::ResourceExhausted
            }
            EngineError::PersistedRoundMismatch { .. } | EngineError::Kv(_) => {
                EngineErrorKind::Corruption
            }
            EngineError::MetadataIntegrity { .. }
            | EngineError::MissingChild { .. }
            | EngineError::TaxRateInfeasible { .. } => EngineErrorKind::InternalInvariant,
            EngineError::TatonnementTimeout { .. } => EngineErrorKind::Transient,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::BlockValidation {
                reason,
                block_number,
            } => write!(f, "block {block_number} failed validation: {reason}"),
            EngineError::DuplicateOfferId { offer_id } => {
                write!(f, "duplicate offer id: {offer_id}")
            }
            EngineError::SlabExhausted { capacity } => {
                write!(f, "recycling slab exhausted (capacity {capacity})")
            }
            EngineError::LpOverflow { num_assets } => {
                write!(f, "LP instance overflowed with {num_assets} assets")
            }
            EngineError::PersistedRoundMismatch {
                environment,
                persisted_round,
                observed_round,
            } => write!(
                f,
                "{environment}: persisted round {persisted_round} disagrees with observed round {observed_round}"
            ),
            EngineError::MetadataIntegrity { message } => {
                write!(f, "metadata integrity violation: {message}")
            }
            EngineError::MissingChild { prefix_len_bits } => write!(
                f,
                "requested nonexistent child at prefix length {prefix_len_bits}"
            ),
            EngineError::TaxRateInfeasible { target, required } => write!(
                f,
                "tax rate {required} required, exceeding the one unit of slack below target {target}"
            ),
            EngineError::TatonnementTimeout { rounds_run } => {
                write!(f, "tatonnement timed out after {rounds_run} rounds")
            }
            EngineError::Kv(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<crate::kv::KvError> for EngineError {
    fn from(err: crate::kv::KvError) -> Self {
        EngineError::Kv(err)
    }
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;
