//! # Settlement Engine
//!
//! A decentralized-exchange settlement engine: per block, it ingests a
//! batch of limit sell offers and cancellations, computes a single
//! market-clearing price vector across every asset simultaneously via
//! iterative tâtonnement, cross-checks feasibility with a small linear
//! program, clears the offers that fit within the solved supply
//! activation, and commits the result crash-consistently with a
//! Merkle-hashable state tree.
//!
//! ## Components
//!
//! - [`trie`] — a concurrent, radix-16 Merkle-Patricia trie with
//!   fixed-length keys, pluggable metadata, lazy deletion, rollback, and
//!   parallel batch merge. The storage primitive every other module
//!   builds on.
//! - [`price`] — fixed-point `Price` (48-bit, radix 24) and
//!   `FractionalAsset` (128-bit, radix 10) arithmetic, with the
//!   overflow-safe wide-multiply routines the clearing algebra depends on.
//! - [`orderbook`] — a single `(sell, buy)` orderbook (committed and
//!   uncommitted offer tries, cumulative-endow index, demand/supply
//!   integration, clearing) and the [`orderbook::OrderbookManager`] that
//!   fans out across the full `N*(N-1)` orderbook set.
//! - [`lp`] — the per-block linear program that cross-checks tâtonnement
//!   and computes the final supply activation.
//! - [`tatonnement`] — the multi-threaded price-search oracle.
//! - [`modlog`] — the per-block account modification log.
//! - [`header_map`] — the block-number-to-block-hash index.
//! - [`kv`] — the KV persistence trait boundary plus a journal-backed
//!   implementation.
//! - [`block`] — the production/validation pipelines and autorollback
//!   discipline that tie everything above into one block's lifecycle.
//! - [`config`] — runtime tuning knobs (tâtonnement control parameters,
//!   worker-pool sizes, tolerances).
//! - [`error`] — the crate-wide error type and its five error kinds.
//!
//! Explicitly out of scope: consensus itself (only the thin
//! [`block::ConsensusCollaborator`] trait boundary is modeled), networking,
//! user-account balance arithmetic beyond reporting transfers, the
//! on-disk B-tree's internals (treated as an opaque [`kv::KvEnvironment`]),
//! CLI argument parsing, and experiment harnesses.

pub mod block;
pub mod config;
pub mod error;
pub mod header_map;
pub mod kv;
pub mod lp;
pub mod modlog;
pub mod orderbook;
pub mod price;
pub mod price_computation;
pub mod tatonnement;
pub mod trie;

pub use block::{AccountDatabase, Block, BlockInternalHashes, ConsensusCollaborator, Engine};
pub use config::EngineConfig;
pub use error::{EngineError, EngineErrorKind, EngineResult};
pub use header_map::BlockHeaderHashMap;
pub use kv::{JournalKv, KvEnvironment, KvReadTxn, KvWriteTxn};
pub use price::{FractionalAsset, Price};
